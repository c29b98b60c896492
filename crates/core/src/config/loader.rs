use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::Path;

use super::{types::Config, ConfigError};

/// Environment variable prefix for overrides, e.g. `VIDPIPE_QUEUE__CAPACITY=64`.
pub const ENV_PREFIX: &str = "VIDPIPE_";

/// Load configuration from file with environment variable overrides
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let config: Config = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    Ok(config)
}

/// Load configuration from TOML string (useful for testing)
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_from_str_valid() {
        let toml = r#"
[queue]
capacity = 32
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.queue.capacity, 32);
    }

    #[test]
    fn test_load_config_from_str_wrong_type() {
        let toml = r#"
[workers]
count = "many"
"#;
        let result = load_config_from_str(toml);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/vidpipe.toml"));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
[workers]
count = 6

[storage]
artifact_root = "/srv/vidpipe/artifacts"
"#
        )
        .unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.workers.count, 6);
        assert_eq!(config.queue.capacity, 256);
        assert_eq!(
            config.storage.artifact_root.to_str().unwrap(),
            "/srv/vidpipe/artifacts"
        );
    }

    #[test]
    fn test_env_overrides_nested_keys() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "[pipeline.retry]\nmax_attempts = 2").unwrap();

        std::env::set_var("VIDPIPE_PIPELINE__RETRY__MAX_ATTEMPTS", "7");
        let config = load_config(temp_file.path());
        std::env::remove_var("VIDPIPE_PIPELINE__RETRY__MAX_ATTEMPTS");

        assert_eq!(config.unwrap().pipeline.retry.max_attempts, 7);
    }
}
