//! Mock buffered device (analog/digital output card) implementation.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use shot_core::capabilities::DeviceWorker;
use shot_core::driver::{Capability, WorkerComponents, WorkerFactory};
use shot_core::{FinalValues, ShotArtifact};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::common::{CallGuard, CallKind, CallLog, MockBehavior, MockMode, MockRng};

// =============================================================================
// MockDeviceFactory - WorkerFactory implementation
// =============================================================================

/// Configuration for MockDevice workers
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockDeviceConfig {
    /// Time spent programming the instruction table (default: 0)
    #[serde(default)]
    pub programming_delay_ms: u64,

    /// Time spent in either teardown call (default: 0)
    #[serde(default)]
    pub teardown_delay_ms: u64,

    /// Channel values reported after the sequence
    #[serde(default)]
    pub final_values: FinalValues,

    /// Fail every transition with this message
    #[serde(default)]
    pub fail_transition: Option<String>,

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

/// Factory for creating MockDevice workers.
///
/// Every worker built by one factory shares the factory's [`CallLog`].
#[derive(Debug, Clone, Default)]
pub struct MockDeviceFactory {
    log: CallLog,
}

impl MockDeviceFactory {
    /// Factory writing into an existing call log.
    pub fn with_log(log: CallLog) -> Self {
        Self { log }
    }

    /// Log shared by the workers built so far.
    pub fn log(&self) -> &CallLog {
        &self.log
    }
}

/// Static capabilities for MockDevice
static MOCK_DEVICE_CAPABILITIES: &[Capability] = &[Capability::Buffered];

impl WorkerFactory for MockDeviceFactory {
    fn kind(&self) -> &'static str {
        "mock_device"
    }

    fn name(&self) -> &'static str {
        "Mock Buffered Device"
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_DEVICE_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let _: MockDeviceConfig = config.clone().try_into()?;
        Ok(())
    }

    fn build(&self, name: String, config: toml::Value) -> BoxFuture<'static, Result<WorkerComponents>> {
        let log = self.log.clone();
        Box::pin(async move {
            let cfg: MockDeviceConfig = config.try_into()?;
            let device = MockDevice::from_config(name, log, cfg);
            Ok(device.into_components())
        })
    }
}

// =============================================================================
// MockDevice
// =============================================================================

/// Simulated buffered output device.
///
/// - `transition_to_buffered` requires an instruction table for this device
///   in the artifact; an `"final_values"` object inside the table overrides
///   the configured final values.
/// - Each operation follows a scripted [`MockBehavior`].
pub struct MockDevice {
    name: String,
    log: CallLog,
    transition: MockBehavior,
    return_to_manual: MockBehavior,
    abort: MockBehavior,
    programming_delay: Duration,
    teardown_delay: Duration,
    final_values: FinalValues,
    require_instructions: bool,
    mode: MockMode,
    jitter: Duration,
    rng: MockRng,
}

impl MockDevice {
    /// Device that succeeds immediately at everything.
    pub fn new(name: impl Into<String>, log: CallLog) -> Self {
        Self {
            name: name.into(),
            log,
            transition: MockBehavior::Succeed,
            return_to_manual: MockBehavior::Succeed,
            abort: MockBehavior::Succeed,
            programming_delay: Duration::ZERO,
            teardown_delay: Duration::ZERO,
            final_values: FinalValues::new(),
            require_instructions: true,
            mode: MockMode::Instant,
            jitter: Duration::ZERO,
            rng: MockRng::default(),
        }
    }

    /// Device configured from its `[devices.config]` table.
    pub fn from_config(name: impl Into<String>, log: CallLog, cfg: MockDeviceConfig) -> Self {
        let mut device = Self::new(name, log);
        device.programming_delay = Duration::from_millis(cfg.programming_delay_ms);
        device.teardown_delay = Duration::from_millis(cfg.teardown_delay_ms);
        device.final_values = cfg.final_values;
        device.mode = cfg.mode;
        device.jitter = Duration::from_millis(cfg.jitter_ms);
        device.rng = MockRng::new(cfg.seed);
        if let Some(message) = cfg.fail_transition {
            device.transition = MockBehavior::Fail(message);
        }
        device
    }

    /// Script `transition_to_buffered`.
    pub fn with_transition(mut self, behavior: MockBehavior) -> Self {
        self.transition = behavior;
        self
    }

    /// Script `return_to_manual`.
    pub fn with_return_to_manual(mut self, behavior: MockBehavior) -> Self {
        self.return_to_manual = behavior;
        self
    }

    /// Script `abort`.
    pub fn with_abort(mut self, behavior: MockBehavior) -> Self {
        self.abort = behavior;
        self
    }

    /// Report `value` for `channel` after the sequence.
    pub fn with_final_value(mut self, channel: impl Into<String>, value: f64) -> Self {
        self.final_values.insert(channel.into(), value);
        self
    }

    /// Accept artifacts that carry no table for this device.
    pub(crate) fn allow_missing_instructions(mut self) -> Self {
        self.require_instructions = false;
        self
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call log this device writes to.
    pub fn log(&self) -> &CallLog {
        &self.log
    }

    /// Wrap as registry components.
    pub fn into_components(self) -> WorkerComponents {
        WorkerComponents::new(Arc::new(self))
    }

    fn programming_time(&self) -> Duration {
        match self.mode {
            MockMode::Instant => self.programming_delay,
            MockMode::Realistic => self.programming_delay + self.rng.jitter(self.jitter),
        }
    }

    fn final_values_for(&self, shot: &ShotArtifact) -> FinalValues {
        let mut values = self.final_values.clone();
        if let Some(overrides) = shot
            .instructions(&self.name)
            .and_then(|table| table.get("final_values"))
            .and_then(|v| v.as_object())
        {
            for (channel, value) in overrides {
                if let Some(v) = value.as_f64() {
                    values.insert(channel.clone(), v);
                }
            }
        }
        values
    }

    async fn run_op(&self, kind: CallKind, behavior: &MockBehavior, extra: Duration) -> Result<()> {
        let guard = CallGuard::start(&self.log, &self.name, kind);
        let result = behavior.run(extra).await;
        guard.done(&result);
        result
    }
}

#[async_trait]
impl DeviceWorker for MockDevice {
    async fn transition_to_buffered(
        &self,
        shot: &ShotArtifact,
        _timeout: Duration,
    ) -> Result<FinalValues> {
        debug!(device = %self.name, shot = %shot.id, "MockDevice: programming instruction table");
        if self.require_instructions && shot.instructions(&self.name).is_none() {
            let guard = CallGuard::start(&self.log, &self.name, CallKind::Transition);
            let result: Result<FinalValues> = Err(anyhow!(
                "no instruction table for {} in {}",
                self.name,
                shot.id
            ));
            guard.done(&result);
            return result;
        }
        self.run_op(CallKind::Transition, &self.transition, self.programming_time())
            .await?;
        Ok(self.final_values_for(shot))
    }

    async fn return_to_manual(&self) -> Result<()> {
        debug!(device = %self.name, "MockDevice: return to manual");
        self.run_op(CallKind::ReturnToManual, &self.return_to_manual, self.teardown_delay)
            .await
    }

    async fn abort(&self) -> Result<()> {
        debug!(device = %self.name, "MockDevice: abort");
        self.run_op(CallKind::Abort, &self.abort, self.teardown_delay)
            .await
    }
}
