//! Mock master pseudoclock implementation.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use shot_core::capabilities::{DeviceWorker, MasterClock, WaitOutcome};
use shot_core::driver::{Capability, WorkerComponents, WorkerFactory};
use shot_core::{FinalValues, ShotArtifact};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::common::{CallGuard, CallKind, CallLog, MockBehavior, MockMode};
use crate::mock_device::{MockDevice, MockDeviceConfig};

// =============================================================================
// MockPseudoclockFactory - WorkerFactory implementation
// =============================================================================

/// Configuration for MockPseudoclock workers
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockPseudoclockConfig {
    /// Time spent programming the pulse sequence (default: 0)
    #[serde(default)]
    pub programming_delay_ms: u64,

    /// Time spent in either teardown call (default: 0)
    #[serde(default)]
    pub teardown_delay_ms: u64,

    /// Run length when the artifact carries no expected duration (default: 10)
    #[serde(default = "default_run_duration_ms")]
    pub run_duration_ms: u64,

    /// Fail every start trigger with this message
    #[serde(default)]
    pub fail_start: Option<String>,

    /// Timing mode (default: instant)
    #[serde(default)]
    pub mode: MockMode,

    /// Upper bound of the extra programming delay in realistic mode
    #[serde(default)]
    pub jitter_ms: u64,

    /// RNG seed for reproducible jitter
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_run_duration_ms() -> u64 {
    10
}

impl Default for MockPseudoclockConfig {
    fn default() -> Self {
        Self {
            programming_delay_ms: 0,
            teardown_delay_ms: 0,
            run_duration_ms: default_run_duration_ms(),
            fail_start: None,
            mode: MockMode::Instant,
            jitter_ms: 0,
            seed: None,
        }
    }
}

/// Factory for creating MockPseudoclock workers.
#[derive(Debug, Clone, Default)]
pub struct MockPseudoclockFactory {
    log: CallLog,
}

impl MockPseudoclockFactory {
    /// Factory writing into an existing call log.
    pub fn with_log(log: CallLog) -> Self {
        Self { log }
    }

    /// Log shared by the workers built so far.
    pub fn log(&self) -> &CallLog {
        &self.log
    }
}

/// Static capabilities for MockPseudoclock
static MOCK_PSEUDOCLOCK_CAPABILITIES: &[Capability] =
    &[Capability::Buffered, Capability::MasterClock];

impl WorkerFactory for MockPseudoclockFactory {
    fn kind(&self) -> &'static str {
        "mock_pseudoclock"
    }

    fn name(&self) -> &'static str {
        "Mock Pseudoclock"
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_PSEUDOCLOCK_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let _: MockPseudoclockConfig = config.clone().try_into()?;
        Ok(())
    }

    fn build(&self, name: String, config: toml::Value) -> BoxFuture<'static, Result<WorkerComponents>> {
        let log = self.log.clone();
        Box::pin(async move {
            let cfg: MockPseudoclockConfig = config.try_into()?;
            let clock = MockPseudoclock::from_config(name, log, cfg);
            Ok(clock.into_components())
        })
    }
}

// =============================================================================
// MockPseudoclock
// =============================================================================

#[derive(Debug, Default)]
struct ClockState {
    armed_duration: Option<Duration>,
    running: bool,
}

/// Simulated master pseudoclock.
///
/// The run lasts the artifact's `expected_duration_ms` when present,
/// otherwise the configured run duration. `wait_done` reports
/// [`WaitOutcome::Timeout`] when the run outlasts the caller's budget.
pub struct MockPseudoclock {
    device: MockDevice,
    start: MockBehavior,
    wait: MockBehavior,
    run_duration: Duration,
    state: Mutex<ClockState>,
}

impl MockPseudoclock {
    /// Pseudoclock with a 10 ms run that succeeds at everything.
    pub fn new(name: impl Into<String>, log: CallLog) -> Self {
        Self {
            device: MockDevice::new(name, log).allow_missing_instructions(),
            start: MockBehavior::Succeed,
            wait: MockBehavior::Succeed,
            run_duration: Duration::from_millis(default_run_duration_ms()),
            state: Mutex::new(ClockState::default()),
        }
    }

    /// Pseudoclock configured from its `[devices.config]` table.
    pub fn from_config(name: impl Into<String>, log: CallLog, cfg: MockPseudoclockConfig) -> Self {
        let device_cfg = MockDeviceConfig {
            programming_delay_ms: cfg.programming_delay_ms,
            teardown_delay_ms: cfg.teardown_delay_ms,
            mode: cfg.mode,
            jitter_ms: cfg.jitter_ms,
            seed: cfg.seed,
            ..MockDeviceConfig::default()
        };
        Self {
            device: MockDevice::from_config(name, log, device_cfg).allow_missing_instructions(),
            start: cfg.fail_start.map_or(MockBehavior::Succeed, MockBehavior::Fail),
            wait: MockBehavior::Succeed,
            run_duration: Duration::from_millis(cfg.run_duration_ms),
            state: Mutex::new(ClockState::default()),
        }
    }

    /// Script `transition_to_buffered`.
    pub fn with_transition(mut self, behavior: MockBehavior) -> Self {
        self.device = self.device.with_transition(behavior);
        self
    }

    /// Script `abort`.
    pub fn with_abort(mut self, behavior: MockBehavior) -> Self {
        self.device = self.device.with_abort(behavior);
        self
    }

    /// Script `return_to_manual`.
    pub fn with_return_to_manual(mut self, behavior: MockBehavior) -> Self {
        self.device = self.device.with_return_to_manual(behavior);
        self
    }

    /// Script `start_run`.
    pub fn with_start(mut self, behavior: MockBehavior) -> Self {
        self.start = behavior;
        self
    }

    /// Script `wait_done`.
    ///
    /// `Succeed` runs for the armed duration, `Delay(d)` runs for `d`.
    pub fn with_wait(mut self, behavior: MockBehavior) -> Self {
        self.wait = behavior;
        self
    }

    /// Run length for artifacts without an expected duration.
    pub fn with_run_duration(mut self, duration: Duration) -> Self {
        self.run_duration = duration;
        self
    }

    /// Wrap as registry components with the master extension attached.
    pub fn into_components(self) -> WorkerComponents {
        let clock = Arc::new(self);
        WorkerComponents::new(clock.clone()).with_master(clock)
    }

    fn name(&self) -> &str {
        self.device.name()
    }

    fn log(&self) -> &CallLog {
        self.device.log()
    }

    async fn wait_for_run(&self, timeout: Duration) -> Result<WaitOutcome> {
        let duration = {
            let state = self.state.lock();
            if !state.running {
                return Err(anyhow!("{}: wait_done called before start_run", self.name()));
            }
            state.armed_duration.unwrap_or(self.run_duration)
        };

        let duration = match &self.wait {
            MockBehavior::Succeed => duration,
            MockBehavior::Delay(d) => *d,
            other => {
                other.run(Duration::ZERO).await?;
                duration
            }
        };

        if duration > timeout {
            tokio::time::sleep(timeout).await;
            return Ok(WaitOutcome::Timeout);
        }
        tokio::time::sleep(duration).await;
        self.state.lock().running = false;
        Ok(WaitOutcome::Done)
    }
}

#[async_trait]
impl DeviceWorker for MockPseudoclock {
    async fn transition_to_buffered(
        &self,
        shot: &ShotArtifact,
        timeout: Duration,
    ) -> Result<FinalValues> {
        let values = self.device.transition_to_buffered(shot, timeout).await?;
        let mut state = self.state.lock();
        state.armed_duration = shot.expected_duration_ms.map(Duration::from_millis);
        state.running = false;
        Ok(values)
    }

    async fn return_to_manual(&self) -> Result<()> {
        *self.state.lock() = ClockState::default();
        self.device.return_to_manual().await
    }

    async fn abort(&self) -> Result<()> {
        *self.state.lock() = ClockState::default();
        self.device.abort().await
    }
}

#[async_trait]
impl MasterClock for MockPseudoclock {
    async fn start_run(&self) -> Result<()> {
        info!(device = %self.name(), "MockPseudoclock: start trigger");
        let guard = CallGuard::start(self.log(), self.name(), CallKind::StartRun);
        let result = self.start.run(Duration::ZERO).await;
        if result.is_ok() {
            self.state.lock().running = true;
        }
        guard.done(&result);
        result
    }

    async fn wait_done(&self, timeout: Duration) -> Result<WaitOutcome> {
        debug!(device = %self.name(), ?timeout, "MockPseudoclock: waiting for end of run");
        let guard = CallGuard::start(self.log(), self.name(), CallKind::WaitDone);
        let result = self.wait_for_run(timeout).await;
        guard.done(&result);
        result
    }
}
