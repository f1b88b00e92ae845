//! `shot-queue`
//!
//! Admission queue and execution loop for synchronized shots.
//!
//! A shot is admitted only if its embedded connection table matches the
//! active one. The loop then runs one shot at a time:
//!
//! 1. program every participating device to buffered, group by group in
//!    ascending `start_order`, with the devices of a group in parallel
//! 2. issue the master pseudoclock's start trigger exactly once
//! 3. wait for the end of the run
//! 4. return every transitioned device to manual, or abort it on failure
//!
//! ## Key Types
//!
//! - [`QueueManager`]: admission, control operations, event stream
//! - [`TransitionCoordinator`]: per-group fan-out with a full barrier
//! - [`MasterClockController`]: trigger-once and bounded wait
//! - [`ShotEvent`] / [`ShotOutcome`]: what observers see

pub mod coordinator;
mod execution;
pub mod manager;
pub mod master_clock;
pub mod queue;
pub mod settings;
pub mod state;
pub mod submitter;

pub use coordinator::{DeviceFailure, DeviceGroup, GroupResult, TransitionCoordinator};
pub use manager::{QueueManager, QueueManagerBuilder};
pub use master_clock::MasterClockController;
pub use queue::{QueueEntry, ShotQueue};
pub use settings::QueueSettings;
pub use state::{
    Admission, RepeatMode, ShotEvent, ShotExecutionState, ShotOutcome, ShotState, TeardownAction,
    TeardownFailure,
};
pub use submitter::{AnalysisSubmitter, LoggingAnalysisSubmitter};
