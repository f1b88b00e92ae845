//! Start trigger and completion wait for one shot.

use shot_core::{ConnectionTable, MasterClock, ShotError, ShotResult, WaitOutcome};
use shot_hardware::WorkerRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Per-shot handle on the master pseudoclock.
///
/// `trigger` reaches the device at most once; the controller is created fresh
/// for every shot.
pub struct MasterClockController {
    device: String,
    clock: Arc<dyn MasterClock>,
    triggered: AtomicBool,
}

impl MasterClockController {
    /// Controller for an explicit device.
    pub fn new(device: impl Into<String>, clock: Arc<dyn MasterClock>) -> Self {
        Self {
            device: device.into(),
            clock,
            triggered: AtomicBool::new(false),
        }
    }

    /// Controller for the master declared in `table`.
    ///
    /// # Errors
    /// `ShotPreparation` if the table has no unique master or its worker
    /// cannot trigger.
    pub fn resolve(table: &ConnectionTable, registry: &WorkerRegistry) -> ShotResult<Self> {
        let node = table.master_pseudoclock().ok_or_else(|| {
            ShotError::ShotPreparation("shot has no unique master pseudoclock".into())
        })?;
        let clock = registry.master(&node.name).ok_or_else(|| {
            ShotError::ShotPreparation(format!(
                "master pseudoclock '{}' has no trigger-capable worker",
                node.name
            ))
        })?;
        Ok(Self::new(node.name.clone(), clock))
    }

    /// Master device name.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// True once `trigger` has been called.
    pub fn has_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Issue the start trigger.
    ///
    /// # Errors
    /// `MasterTriggerFailure` if the device fails, or on any second call
    /// (which does not reach the device).
    pub async fn trigger(&self) -> ShotResult<()> {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return Err(ShotError::MasterTriggerFailure {
                device: self.device.clone(),
                message: "start trigger already issued for this shot".into(),
            });
        }
        info!(device = %self.device, "Issuing start trigger");
        self.clock
            .start_run()
            .await
            .map_err(|e| ShotError::MasterTriggerFailure {
                device: self.device.clone(),
                message: format!("{e:#}"),
            })
    }

    /// Wait for the end of the run, bounded by `timeout`.
    ///
    /// A device that overruns the bound is reported as [`WaitOutcome::Timeout`]
    /// even if it never answers.
    pub async fn wait(&self, timeout: Duration) -> ShotResult<WaitOutcome> {
        if !self.has_triggered() {
            return Err(ShotError::CompletionFailure {
                device: self.device.clone(),
                message: "wait requested before the start trigger".into(),
            });
        }
        debug!(device = %self.device, ?timeout, "Waiting for end of run");
        match tokio::time::timeout(timeout, self.clock.wait_done(timeout)).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(ShotError::CompletionFailure {
                device: self.device.clone(),
                message: format!("{e:#}"),
            }),
            Err(_elapsed) => Ok(WaitOutcome::Timeout),
        }
    }
}

impl std::fmt::Debug for MasterClockController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterClockController")
            .field("device", &self.device)
            .field("triggered", &self.has_triggered())
            .finish()
    }
}
