//! `shot-core`
//!
//! Core types and traits for synchronized shot execution.
//!
//! This crate holds everything the queue and the device workers must agree
//! on: the connection table and its validator, the shot artifact and its store,
//! the worker capability traits, the factory contract for device kinds, and the
//! error taxonomy.
//!
//! ## Key Types
//!
//! - [`ConnectionTable`]: declared device topology, compared at admission
//! - [`ShotArtifact`]: compiled shot, identified by [`ShotId`]
//! - [`DeviceWorker`] / [`MasterClock`]: what every device exposes to the queue
//! - [`WorkerFactory`]: builds workers for one device kind
//! - [`ShotError`]: admission and execution failures

pub mod artifact;
pub mod capabilities;
pub mod connection_table;
pub mod driver;
pub mod error;

pub use artifact::{
    ArtifactStore, FileArtifactStore, FinalValues, ResultsWriter, ShotArtifact, ShotId,
    ShotResults,
};
pub use capabilities::{DeviceWorker, MasterClock, WaitOutcome};
pub use connection_table::{validate, ConnectionTable, DeviceNode};
pub use driver::{Capability, WorkerComponents, WorkerFactory};
pub use error::{ShotError, ShotResult, TableDiff, TableSource};
