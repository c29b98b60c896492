use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Queue capacity and worker count are non-zero
/// - Stage timeout is non-zero
/// - Retry policy is well-formed
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.queue.capacity == 0 {
        return Err(ConfigError::ValidationError(
            "queue.capacity cannot be 0".to_string(),
        ));
    }

    if config.workers.count == 0 {
        return Err(ConfigError::ValidationError(
            "workers.count cannot be 0".to_string(),
        ));
    }

    if config.pipeline.stage_timeout_secs == 0 {
        return Err(ConfigError::ValidationError(
            "pipeline.stage_timeout_secs cannot be 0".to_string(),
        ));
    }

    let retry = &config.pipeline.retry;
    if retry.max_attempts == 0 {
        return Err(ConfigError::ValidationError(
            "pipeline.retry.max_attempts must be at least 1".to_string(),
        ));
    }
    if retry.backoff_multiplier < 1.0 {
        return Err(ConfigError::ValidationError(
            "pipeline.retry.backoff_multiplier must be >= 1.0".to_string(),
        ));
    }
    if retry.initial_delay_ms > retry.max_delay_ms {
        return Err(ConfigError::ValidationError(
            "pipeline.retry.initial_delay_ms cannot exceed max_delay_ms".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_zero_capacity_fails() {
        let mut config = Config::default();
        config.queue.capacity = 0;
        let result = validate_config(&config);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validate_zero_workers_fails() {
        let mut config = Config::default();
        config.workers.count = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_retry_policy() {
        let mut config = Config::default();
        config.pipeline.retry.max_attempts = 0;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.pipeline.retry.backoff_multiplier = 0.5;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.pipeline.retry.initial_delay_ms = 10_000;
        config.pipeline.retry.max_delay_ms = 1_000;
        assert!(validate_config(&config).is_err());
    }
}
