//! Worker Factory and Component Types
//!
//! Device kinds are plugged in through [`WorkerFactory`]. A factory is keyed by
//! the `kind` tag carried in the connection table and is registered with the
//! worker registry at startup:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Composition Root (shot-runner)                 │
//! │  registry.register_factory(MockDeviceFactory);                  │
//! │  registry.register_factory(MockPseudoclockFactory);             │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         WorkerRegistry                          │
//! │  factories: HashMap<kind, Box<dyn WorkerFactory>>               │
//! │  workers:   HashMap<device name, WorkerComponents>              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A factory must deliver the full [`DeviceWorker`] contract for every device it
//! builds. Factories that declare [`Capability::MasterClock`] must also return
//! a [`MasterClock`] handle; the registry refuses the device otherwise, so a
//! missing implementation surfaces at configuration time rather than in the
//! middle of a shot.

use crate::capabilities::{DeviceWorker, MasterClock};
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Runtime capability flags for worker introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Buffered transition and teardown
    /// Corresponds to [`crate::capabilities::DeviceWorker`]
    Buffered,

    /// Start trigger and completion wait
    /// Corresponds to [`crate::capabilities::MasterClock`]
    MasterClock,
}

impl Capability {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Buffered => "Buffered",
            Self::MasterClock => "Master Clock",
        }
    }
}

/// Capability trait objects returned by a factory for one device.
#[derive(Clone)]
pub struct WorkerComponents {
    /// Buffered execution contract (always present)
    pub worker: Arc<dyn DeviceWorker>,

    /// Trigger/wait extension, only for pseudoclock-capable devices
    pub master: Option<Arc<dyn MasterClock>>,
}

impl WorkerComponents {
    /// Components for a device without trigger capability.
    pub fn new(worker: Arc<dyn DeviceWorker>) -> Self {
        Self {
            worker,
            master: None,
        }
    }

    /// Attach the master-clock extension.
    pub fn with_master(mut self, master: Arc<dyn MasterClock>) -> Self {
        self.master = Some(master);
        self
    }

    /// Capabilities actually present.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = vec![Capability::Buffered];
        if self.master.is_some() {
            caps.push(Capability::MasterClock);
        }
        caps
    }
}

impl std::fmt::Debug for WorkerComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerComponents")
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

/// Trait for factories that create device workers of one kind.
///
/// Factories are registered once at startup and live for the program's lifetime.
/// They must be `Send + Sync + 'static` because they may be called from any task.
pub trait WorkerFactory: Send + Sync + 'static {
    /// Kind tag matched against `DeviceNode::kind` and the `kind` config field.
    fn kind(&self) -> &'static str;

    /// Human-readable name for documentation and error messages.
    fn name(&self) -> &'static str;

    /// Capabilities every worker of this kind provides.
    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Buffered]
    }

    /// Validate configuration without instantiating.
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Async instantiation of the worker for device `name`.
    fn build(&self, name: String, config: toml::Value) -> BoxFuture<'static, Result<WorkerComponents>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_name() {
        assert_eq!(Capability::Buffered.name(), "Buffered");
        assert_eq!(Capability::MasterClock.name(), "Master Clock");
    }

    #[test]
    fn test_capability_serde() {
        let json = serde_json::to_string(&Capability::MasterClock).unwrap();
        assert_eq!(json, "\"master_clock\"");

        let cap: Capability = serde_json::from_str("\"buffered\"").unwrap();
        assert_eq!(cap, Capability::Buffered);
    }
}
