use std::path::Path;
use std::process::Output;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

/// A config keeping every file inside `dir`.
fn config_in(dir: &Path, extra: &str) -> String {
    format!(
        r#"
[database]
path = "{db}"

[storage]
artifact_root = "{artifacts}"

[pipeline]
scratch_root = "{scratch}"

[logging]
level = "error"
{extra}
"#,
        db = dir.join("vidpipe.db").display(),
        artifacts = dir.join("artifacts").display(),
        scratch = dir.join("scratch").display(),
        extra = extra,
    )
}

/// Run the binary with the given config and arguments.
async fn run(config: Option<&Path>, args: &[&Path]) -> Output {
    let mut command = tokio::process::Command::new(env!("CARGO_BIN_EXE_vidpipe"));
    command.args(args).env("RUST_LOG", "error").kill_on_drop(true);
    match config {
        Some(path) => command.env("VIDPIPE_CONFIG", path),
        None => command.env_remove("VIDPIPE_CONFIG"),
    };
    timeout(Duration::from_secs(30), command.output())
        .await
        .expect("vidpipe did not exit")
        .expect("Failed to run vidpipe")
}

#[tokio::test]
async fn test_missing_manifest_argument() {
    let output = run(None, &[]).await;
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("usage"));
}

#[tokio::test]
async fn test_missing_config_file() {
    let dir = TempDir::new().unwrap();
    let manifest = dir.path().join("batch.json");
    std::fs::write(&manifest, "{}").unwrap();

    let output = run(Some(&dir.path().join("missing.toml")), &[&manifest]).await;
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to load config"));
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.toml");
    std::fs::write(&config, config_in(dir.path(), "[queue]\ncapacity = 0")).unwrap();
    let manifest = dir.path().join("batch.json");
    std::fs::write(&manifest, "{}").unwrap();

    let output = run(Some(&config), &[&manifest]).await;
    assert_eq!(output.status.code(), Some(1));
}

#[tokio::test]
async fn test_empty_manifest_prints_report() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.toml");
    std::fs::write(&config, config_in(dir.path(), "")).unwrap();
    let manifest = dir.path().join("batch.json");
    std::fs::write(&manifest, r#"{ "videos": [], "jobs": [] }"#).unwrap();

    let output = run(Some(&config), &[&manifest]).await;
    assert_eq!(output.status.code(), Some(0));

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["videos"], serde_json::json!([]));
    assert_eq!(report["jobs"], serde_json::json!([]));
    assert!(dir.path().join("vidpipe.db").exists());
}

#[tokio::test]
async fn test_malformed_manifest_rejected() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.toml");
    std::fs::write(&config, config_in(dir.path(), "")).unwrap();
    let manifest = dir.path().join("batch.json");
    std::fs::write(
        &manifest,
        r#"{ "jobs": [{ "name": "a", "input": { "video": "ghost" }, "stages": [] }] }"#,
    )
    .unwrap();

    let output = run(Some(&config), &[&manifest]).await;
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown video"));
}
