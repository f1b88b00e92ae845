//! Device Worker Capabilities
//!
//! This module defines the capability traits each device worker exposes to the
//! queue. Every device kind implements [`DeviceWorker`]; exactly one device per
//! connection table (the master pseudoclock) additionally implements
//! [`MasterClock`].
//!
//! - An analog output card implements: `DeviceWorker`
//! - A pulse-programming FPGA implements: `DeviceWorker + MasterClock`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE phase of the shot lifecycle
//!
//! The queue never inspects instruction tables itself; workers receive the
//! whole artifact and pick out their own table.
//!
//! # Example
//!
//! ```rust,ignore
//! struct PulseBlaster { /* ... */ }
//!
//! #[async_trait]
//! impl DeviceWorker for PulseBlaster {
//!     async fn transition_to_buffered(
//!         &self,
//!         shot: &ShotArtifact,
//!         timeout: Duration,
//!     ) -> Result<FinalValues> {
//!         let table = shot.instructions("pulseblaster_0").context("no instructions")?;
//!         self.program(table, timeout).await?;
//!         Ok(self.final_flags())
//!     }
//!
//!     async fn return_to_manual(&self) -> Result<()> { self.stop().await }
//!     async fn abort(&self) -> Result<()> { self.stop().await }
//! }
//!
//! #[async_trait]
//! impl MasterClock for PulseBlaster {
//!     async fn start_run(&self) -> Result<()> { self.write_start().await }
//!     async fn wait_done(&self, timeout: Duration) -> Result<WaitOutcome> {
//!         self.poll_status_until_stopped(timeout).await
//!     }
//! }
//! ```

use crate::artifact::{FinalValues, ShotArtifact};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Result of waiting for the run to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The device reported completion
    Done,
    /// The timeout elapsed first
    Timeout,
}

/// Capability: Buffered Execution
///
/// Every device taking part in a shot.
///
/// # Contract
/// - `transition_to_buffered` programs the device's full instruction sequence and
///   arms it for the external trigger. It returns the channel values the device
///   will hold once the sequence ends.
/// - `return_to_manual` is called after a clean run; the device leaves buffered
///   mode and resumes manual control.
/// - `abort` is called after a failed or cancelled shot on every device that had
///   already transitioned. It must be safe to call on an armed device.
/// - The queue calls each teardown method at most once per shot and never
///   retries.
#[async_trait]
pub trait DeviceWorker: Send + Sync {
    /// Program the device for this shot.
    ///
    /// # Arguments
    /// * `shot` - The artifact being run
    /// * `timeout` - Budget the queue will wait before declaring a timeout
    async fn transition_to_buffered(
        &self,
        shot: &ShotArtifact,
        timeout: Duration,
    ) -> Result<FinalValues>;

    /// Leave buffered mode after a clean run.
    async fn return_to_manual(&self) -> Result<()>;

    /// Abandon the current shot.
    async fn abort(&self) -> Result<()>;
}

/// Capability: Master Pseudoclock
///
/// The single device that issues the global start trigger.
///
/// # Contract
/// - `start_run` is invoked exactly once per shot, only after every device has
///   transitioned to buffered.
/// - `wait_done` blocks until the device reports the end of the sequence or the
///   timeout elapses; it is the only device call made while the shot runs.
#[async_trait]
pub trait MasterClock: Send + Sync {
    /// Issue the start trigger.
    async fn start_run(&self) -> Result<()>;

    /// Wait for the run to finish.
    async fn wait_done(&self, timeout: Duration) -> Result<WaitOutcome>;
}
