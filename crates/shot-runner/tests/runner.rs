//! Configuration to running queue, end to end with the mock workers.

use shot_core::{ArtifactStore, ConnectionTable, FileArtifactStore, ShotArtifact, ShotError, ShotId};
use shot_queue::ShotState;
use shot_runner::{build_manager, build_registry, check_shot, default_registry, ShotRunnerConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;

const RUNNER_TOML: &str = r#"
connection_table = "connection_table.json"

[application]
name = "test-runner"
log_level = "debug"
log_format = "compact"

[queue]
transition_timeout_ms = 2000
completion_timeout_ms = 2000
teardown_timeout_ms = 1000

[[devices]]
name = "fpga0"
kind = "mock_pseudoclock"
[devices.config]
run_duration_ms = 20

[[devices]]
name = "ttl1"
kind = "mock_device"
[devices.config]
programming_delay_ms = 5
[devices.config.final_values]
flag1 = 1.0

[[devices]]
name = "dds41"
kind = "mock_device"
"#;

fn sample_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("config")
}

/// Temp dir holding the sample connection table and `runner.toml`.
fn setup(runner_toml: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::copy(
        sample_dir().join("connection_table.json"),
        dir.path().join("connection_table.json"),
    )
    .unwrap();
    let config = dir.path().join("runner.toml");
    std::fs::write(&config, runner_toml).unwrap();
    (dir, config)
}

fn write_shot(dir: &Path, name: &str, table: ConnectionTable) -> PathBuf {
    let path = dir.join(name);
    let artifact = ShotArtifact::new(path.clone(), table)
        .with_instructions("fpga0", serde_json::json!({"instructions": [[0, 1], [20, 0]]}))
        .with_instructions("ttl1", serde_json::json!({"pulses": [1, 0]}))
        .with_instructions("dds41", serde_json::json!({"freq": [80.0], "final_values": {"freq": 80.0}}));
    std::fs::write(&path, serde_json::to_vec_pretty(&artifact).unwrap()).unwrap();
    path
}

#[test]
fn test_sample_configuration_is_valid() {
    let config = ShotRunnerConfig::load_from(sample_dir().join("shot_runner.toml")).unwrap();
    config.validate().unwrap();
    assert_eq!(config.devices.len(), 3);

    let table = ConnectionTable::from_json_file(&config.connection_table).unwrap();
    assert_eq!(
        table.master_pseudoclock().map(|d| d.name.as_str()),
        Some("fpga0")
    );
}

#[test]
fn test_default_registry_knows_the_mock_kinds() {
    assert_eq!(
        default_registry().kinds(),
        vec!["mock_device", "mock_pseudoclock"]
    );
}

#[tokio::test]
async fn test_sample_registry_starts_every_device() {
    let config = ShotRunnerConfig::load_from(sample_dir().join("shot_runner.toml")).unwrap();
    let registry = build_registry(&config).await.unwrap();
    assert_eq!(registry.len(), 3);
    assert!(registry.master("fpga0").is_some());
    assert!(registry.master("ttl1").is_none());
}

#[tokio::test]
async fn test_configured_queue_runs_a_shot_to_done() {
    let (dir, config_path) = setup(RUNNER_TOML);
    let config = ShotRunnerConfig::load_from(&config_path).unwrap();
    config.validate().unwrap();
    shot_runner::logging::init_from_config(&config).unwrap();

    let manager = build_manager(&config).await.unwrap();
    assert_eq!(manager.settings().transition_timeout_ms, 2000);

    let table = ConnectionTable::from_json_file(&config.connection_table).unwrap();
    let shot = write_shot(dir.path(), "scanA.h5", table);

    manager.start().unwrap();
    let admission = manager.admit(shot.clone()).await.unwrap();
    assert_eq!(admission.position, 1);

    tokio::time::timeout(Duration::from_secs(10), manager.wait_until_idle())
        .await
        .unwrap();
    manager.shutdown().await;

    let outcomes = manager.recent_outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].state, ShotState::Done, "{}", outcomes[0]);

    let stored = FileArtifactStore::new().load(&ShotId::from(shot)).await.unwrap();
    let results = stored.results.unwrap();
    assert_eq!(results.final_values["ttl1"]["flag1"], 1.0);
    assert_eq!(results.final_values["dds41"]["freq"], 80.0);
}

#[tokio::test]
async fn test_worker_outside_the_table_fails_startup() {
    let toml = format!("{RUNNER_TOML}\n[[devices]]\nname = \"ghost\"\nkind = \"mock_device\"\n");
    let (_dir, config_path) = setup(&toml);
    let config = ShotRunnerConfig::load_from(&config_path).unwrap();

    let err = build_manager(&config).await.unwrap_err();
    assert!(err.to_string().contains("ghost"), "{err:#}");
}

#[tokio::test]
async fn test_unknown_kind_names_the_device() {
    let toml = RUNNER_TOML.replace(
        "name = \"dds41\"\nkind = \"mock_device\"",
        "name = \"dds41\"\nkind = \"novatech_dds\"",
    );
    let (_dir, config_path) = setup(&toml);
    let config = ShotRunnerConfig::load_from(&config_path).unwrap();

    let err = build_manager(&config).await.unwrap_err();
    assert!(
        err.to_string().contains("Failed to start worker for device 'dds41'"),
        "{err:#}"
    );
}

#[tokio::test]
async fn test_check_shot_reports_table_mismatch() {
    let (dir, config_path) = setup(RUNNER_TOML);
    let config = ShotRunnerConfig::load_from(&config_path).unwrap();
    let active = ConnectionTable::from_json_file(&config.connection_table).unwrap();

    let ok = write_shot(dir.path(), "ok.h5", active.clone());
    assert_eq!(check_shot(&active, ok).await.unwrap().devices.len(), 3);

    let mut moved = active.clone();
    for device in &mut moved.devices {
        if device.name == "ttl1" {
            device.connection = Some("flag2".into());
        }
    }
    let stale = write_shot(dir.path(), "stale.h5", moved);
    match check_shot(&active, stale).await {
        Err(ShotError::ConnectionTableMismatch(diff)) => {
            assert_eq!(diff.changed, vec!["ttl1".to_string()]);
        }
        other => panic!("expected mismatch, got {other:?}"),
    }
}
