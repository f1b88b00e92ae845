//! Worker Registry for Shot Devices
//!
//! Central registry that turns device configuration into live workers and hands
//! them out to the queue by name.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        WorkerRegistry                           │
//! │  ┌───────────────┐  ┌───────────────┐  ┌───────────────┐        │
//! │  │ fpga0 (pclk)  │  │ ttl1          │  │ dds41         │  ...   │
//! │  └───────────────┘  └───────────────┘  └───────────────┘        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    Capability Traits                            │
//! │           DeviceWorker | MasterClock                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    Worker Factories (by kind)                   │
//! │      mock_device | mock_pseudoclock | ...                       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let mut registry = WorkerRegistry::new();
//! registry.register_factory(Box::new(MockPseudoclockFactory::default()));
//! registry.register_factory(Box::new(MockDeviceFactory::default()));
//!
//! registry.spawn_device(DeviceConfig::new("fpga0", "mock_pseudoclock")).await?;
//! registry.spawn_device(DeviceConfig::new("ttl1", "mock_device")).await?;
//!
//! registry.check_against(&active_table)?;
//! ```

use serde::{Deserialize, Serialize};
use shot_core::capabilities::{DeviceWorker, MasterClock};
use shot_core::connection_table::ConnectionTable;
use shot_core::driver::{Capability, WorkerComponents, WorkerFactory};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while wiring workers to the configured topology.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No factory is registered for this kind tag
    #[error("Device '{device}' has kind '{kind}' but no worker factory handles that kind")]
    UnknownKind {
        /// Device name
        device: String,
        /// Unhandled kind tag
        kind: String,
    },

    /// Two devices with the same name
    #[error("Device '{0}' is already registered")]
    Duplicate(String),

    /// The factory refused the device configuration
    #[error("Configuration validation failed for device '{device}' ({kind}): {cause:#}")]
    InvalidConfig {
        /// Device name
        device: String,
        /// Kind tag
        kind: String,
        /// Factory-reported cause
        cause: anyhow::Error,
    },

    /// The factory failed to build the worker
    #[error("Failed to start worker for device '{device}': {cause:#}")]
    Build {
        /// Device name
        device: String,
        /// Factory-reported cause
        cause: anyhow::Error,
    },

    /// The factory advertises a capability it did not deliver
    #[error("Factory '{kind}' advertises {capability:?} but device '{device}' was built without it")]
    MissingCapability {
        /// Device name
        device: String,
        /// Kind tag
        kind: String,
        /// Capability that is missing
        capability: Capability,
    },

    /// Registry and active connection table disagree
    #[error("Worker registry does not match the connection table: {0}")]
    TopologyMismatch(String),
}

/// Configuration for one worker-backed device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name, must match a connection table node
    pub name: String,

    /// Kind tag, must match the node's kind and a registered factory
    pub kind: String,

    /// Disabled devices are skipped at startup
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Kind-specific settings passed to the factory
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

fn default_enabled() -> bool {
    true
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl DeviceConfig {
    /// Enabled device with empty kind settings.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            enabled: true,
            config: empty_table(),
        }
    }

    /// Replace the kind-specific settings.
    pub fn with_config(mut self, config: toml::Value) -> Self {
        self.config = config;
        self
    }
}

/// Summary of a registered worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Device name
    pub name: String,
    /// Kind tag
    pub kind: String,
    /// Capabilities present
    pub capabilities: Vec<Capability>,
}

struct RegisteredWorker {
    kind: String,
    components: WorkerComponents,
}

/// Kind-keyed factories plus one live worker per configured device.
///
/// Workers are long-lived: they are built once at startup and outlive every
/// shot. The queue only clones their `Arc` handles.
#[derive(Default)]
pub struct WorkerRegistry {
    factories: HashMap<&'static str, Box<dyn WorkerFactory>>,
    workers: HashMap<String, RegisteredWorker>,
}

impl WorkerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory; a later factory for the same kind replaces the earlier one.
    pub fn register_factory(&mut self, factory: Box<dyn WorkerFactory>) {
        debug!(kind = factory.kind(), name = factory.name(), "Registered worker factory");
        self.factories.insert(factory.kind(), factory);
    }

    /// Kinds with a registered factory.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Build and register the worker for one device.
    ///
    /// # Errors
    /// Returns error if:
    /// - The device name is already registered
    /// - No factory handles the kind
    /// - The factory rejects the configuration or fails to build
    /// - The built worker lacks a capability its factory advertises
    pub async fn spawn_device(&mut self, config: DeviceConfig) -> Result<(), RegistryError> {
        if self.workers.contains_key(&config.name) {
            return Err(RegistryError::Duplicate(config.name));
        }

        let factory = self
            .factories
            .get(config.kind.as_str())
            .ok_or_else(|| RegistryError::UnknownKind {
                device: config.name.clone(),
                kind: config.kind.clone(),
            })?;

        factory
            .validate(&config.config)
            .map_err(|cause| RegistryError::InvalidConfig {
                device: config.name.clone(),
                kind: config.kind.clone(),
                cause,
            })?;

        let advertised = factory.capabilities();
        let components = factory
            .build(config.name.clone(), config.config.clone())
            .await
            .map_err(|cause| RegistryError::Build {
                device: config.name.clone(),
                cause,
            })?;

        let present = components.capabilities();
        if let Some(missing) = advertised.iter().find(|c| !present.contains(c)) {
            return Err(RegistryError::MissingCapability {
                device: config.name,
                kind: config.kind,
                capability: *missing,
            });
        }

        info!(device = %config.name, kind = %config.kind, capabilities = ?present, "Worker started");
        self.workers.insert(
            config.name,
            RegisteredWorker {
                kind: config.kind,
                components,
            },
        );
        Ok(())
    }

    /// Register a worker that was built outside any factory.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        kind: impl Into<String>,
        components: WorkerComponents,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.workers.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.workers.insert(
            name,
            RegisteredWorker {
                kind: kind.into(),
                components,
            },
        );
        Ok(())
    }

    /// Check that every worker fits the active topology and that the master
    /// pseudoclock is trigger-capable.
    pub fn check_against(&self, table: &ConnectionTable) -> Result<(), RegistryError> {
        let mut names: Vec<_> = self.workers.keys().collect();
        names.sort();

        for name in names {
            let registered = &self.workers[name];
            let node = table.get(name).ok_or_else(|| {
                RegistryError::TopologyMismatch(format!(
                    "worker '{}' is not declared in the connection table",
                    name
                ))
            })?;
            if node.kind != registered.kind {
                return Err(RegistryError::TopologyMismatch(format!(
                    "worker '{}' has kind '{}' but the connection table declares '{}'",
                    name, registered.kind, node.kind
                )));
            }
        }

        let master = table.master_pseudoclock().ok_or_else(|| {
            RegistryError::TopologyMismatch(
                "connection table does not declare exactly one master pseudoclock".into(),
            )
        })?;
        match self.workers.get(&master.name) {
            None => Err(RegistryError::TopologyMismatch(format!(
                "master pseudoclock '{}' has no worker",
                master.name
            ))),
            Some(w) if w.components.master.is_none() => {
                Err(RegistryError::TopologyMismatch(format!(
                    "master pseudoclock '{}' ({}) cannot issue a start trigger",
                    master.name, w.kind
                )))
            }
            Some(_) => Ok(()),
        }
    }

    /// Worker handle for a device.
    pub fn worker(&self, name: &str) -> Option<Arc<dyn DeviceWorker>> {
        self.workers.get(name).map(|w| w.components.worker.clone())
    }

    /// Master-clock handle for a device.
    pub fn master(&self, name: &str) -> Option<Arc<dyn MasterClock>> {
        self.workers
            .get(name)
            .and_then(|w| w.components.master.clone())
    }

    /// True if a worker is registered under this name.
    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    /// All registered workers, sorted by name.
    pub fn list(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<_> = self
            .workers
            .iter()
            .map(|(name, w)| WorkerInfo {
                name: name.clone(),
                kind: w.kind.clone(),
                capabilities: w.components.capabilities(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Number of registered workers
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// True if no workers are registered
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
