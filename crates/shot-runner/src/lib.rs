//! `shot-runner`
//!
//! Wires configuration, logging and the built-in worker factories into a
//! running [`QueueManager`].
//!
//! ```rust,ignore
//! let config = ShotRunnerConfig::load_from("config/shot_runner.toml")?;
//! config.validate()?;
//! let manager = build_manager(&config).await?;
//! manager.start()?;
//! manager.admit("/data/scanA.h5").await?;
//! ```

pub mod config;
pub mod logging;

pub use config::{ApplicationConfig, ConfigError, ShotRunnerConfig};
pub use logging::{OutputFormat, TracingConfig};

use anyhow::Context;
use shot_core::{validate, ArtifactStore, ConnectionTable, FileArtifactStore, ShotArtifact, ShotId, ShotResult};
use shot_driver_mock::{MockDeviceFactory, MockPseudoclockFactory};
use shot_hardware::WorkerRegistry;
use shot_queue::QueueManager;
use std::sync::Arc;
use tracing::info;

/// Registry with every built-in factory registered and no workers.
pub fn default_registry() -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    registry.register_factory(Box::new(MockDeviceFactory::default()));
    registry.register_factory(Box::new(MockPseudoclockFactory::default()));
    registry
}

/// Start a worker for every enabled device.
pub async fn build_registry(config: &ShotRunnerConfig) -> anyhow::Result<WorkerRegistry> {
    let mut registry = default_registry();
    for device in config.enabled_devices() {
        let name = device.name.clone();
        registry
            .spawn_device(device.clone())
            .await
            .with_context(|| format!("Failed to start worker for device '{}'", name))?;
    }
    Ok(registry)
}

/// Load the active table and the workers, then build the queue.
///
/// The queue is returned stopped; call [`QueueManager::start`].
pub async fn build_manager(config: &ShotRunnerConfig) -> anyhow::Result<QueueManager> {
    let table = ConnectionTable::from_json_file(&config.connection_table)?;
    let registry = build_registry(config).await?;
    info!(
        table = %config.connection_table.display(),
        devices = table.devices.len(),
        workers = registry.len(),
        "Hardware configuration loaded"
    );
    let manager = QueueManager::new(table, Arc::new(registry), config.queue.clone())?;
    Ok(manager)
}

/// Admission-time checks on one shot file without queueing it.
pub async fn check_shot(
    active: &ConnectionTable,
    shot: impl Into<ShotId>,
) -> ShotResult<ShotArtifact> {
    let artifact = FileArtifactStore::new().load(&shot.into()).await?;
    validate(active, &artifact.connection_table)?;
    Ok(artifact)
}
