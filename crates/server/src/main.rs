mod batch;
mod manifest;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vidpipe_core::{
    load_config, validate_config, Config, FfmpegEngine, FsArtifactStore, JobOrchestrator,
    LogFormat, OrchestratorConfig, SqliteJobStore,
};

use batch::run_batch;
use manifest::Manifest;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Config file used when `VIDPIPE_CONFIG` is not set.
const DEFAULT_CONFIG: &str = "config.toml";

/// Exit code when the batch ran but some job did not succeed.
const EXIT_INCOMPLETE: i32 = 2;

#[tokio::main]
async fn main() {
    match run().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(EXIT_INCOMPLETE),
        Err(e) => {
            error!("Fatal error: {:#}", e);
            eprintln!("vidpipe: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Returns whether every job in the batch succeeded.
async fn run() -> Result<bool> {
    let manifest_path = match std::env::args_os().nth(1) {
        Some(path) => PathBuf::from(path),
        None => bail!("usage: vidpipe <manifest.json>"),
    };

    let config = read_config()?;
    validate_config(&config).context("Configuration validation failed")?;
    init_logging(&config);

    info!(version = VERSION, "Starting vidpipe");
    info!("Database path: {:?}", config.database.path);
    info!("Artifact root: {:?}", config.storage.artifact_root);

    let manifest = Manifest::load(&manifest_path)?;

    let store = SqliteJobStore::new(&config.database.path).context("Failed to open job store")?;
    info!("Job store initialized");

    let engine = FfmpegEngine::new(config.engine.clone());
    let artifacts = FsArtifactStore::new(config.storage.artifact_root.clone());

    let orchestrator = JobOrchestrator::new(
        OrchestratorConfig::from(&config),
        Arc::new(store),
        Arc::new(engine),
        Arc::new(artifacts),
    );
    orchestrator.start().await;
    info!(
        workers = config.workers.count,
        queue_capacity = config.queue.capacity,
        "Orchestrator started"
    );

    let report = tokio::select! {
        report = run_batch(&orchestrator, &manifest) => Some(report),
        _ = shutdown_signal() => None,
    };

    info!("Shutting down...");
    orchestrator.shutdown().await;

    let Some(report) = report else {
        bail!("interrupted before the batch finished");
    };

    let json = serde_json::to_string_pretty(&report).context("Failed to encode report")?;
    println!("{}", json);
    Ok(report.all_succeeded())
}

/// Load the file named by `VIDPIPE_CONFIG`, or `config.toml` when present.
fn read_config() -> Result<Config> {
    if let Some(path) = std::env::var_os("VIDPIPE_CONFIG") {
        let path = PathBuf::from(path);
        return load_config(&path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }

    let path = PathBuf::from(DEFAULT_CONFIG);
    if path.exists() {
        load_config(&path).with_context(|| format!("Failed to load config from {:?}", path))
    } else {
        Ok(Config::default())
    }
}

/// Logs go to stderr so the report on stdout stays machine-readable.
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.logging.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
