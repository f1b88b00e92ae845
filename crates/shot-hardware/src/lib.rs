//! Hardware wiring for the shot queue.
//!
//! Owns the [`WorkerRegistry`](registry::WorkerRegistry), which maps device
//! names from the connection table to live worker handles built by kind-keyed
//! factories.

pub mod registry;

pub use registry::{DeviceConfig, RegistryError, WorkerInfo, WorkerRegistry};
