//! Timeouts and behaviour switches for the queue.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::state::RepeatMode;

/// Queue settings, loaded from the `[queue]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Per-device budget for `transition_to_buffered`
    pub transition_timeout_ms: u64,
    /// Completion wait when the artifact declares no duration
    pub completion_timeout_ms: u64,
    /// Added to the artifact's expected duration
    pub completion_margin_ms: u64,
    /// Per-device budget for `return_to_manual` and `abort`
    pub teardown_timeout_ms: u64,
    /// Automatic re-admission of completed shots
    pub repeat_mode: RepeatMode,
    /// Start with the queue paused
    pub start_paused: bool,
    /// Number of outcomes kept for `recent_outcomes()`
    pub outcome_history: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            transition_timeout_ms: 10_000,
            completion_timeout_ms: 60_000,
            completion_margin_ms: 5_000,
            teardown_timeout_ms: 5_000,
            repeat_mode: RepeatMode::Off,
            start_paused: false,
            outcome_history: 100,
        }
    }
}

impl QueueSettings {
    /// Per-device transition budget.
    pub fn transition_timeout(&self) -> Duration {
        Duration::from_millis(self.transition_timeout_ms)
    }

    /// Per-device teardown budget.
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    /// Completion wait for a shot with the given expected duration.
    pub fn completion_timeout(&self, expected_duration_ms: Option<u64>) -> Duration {
        match expected_duration_ms {
            Some(ms) => Duration::from_millis(ms.saturating_add(self.completion_margin_ms)),
            None => Duration::from_millis(self.completion_timeout_ms),
        }
    }

    /// Check for zero timeouts.
    pub fn validate(&self) -> Result<(), String> {
        let timeouts = [
            ("transition_timeout_ms", self.transition_timeout_ms),
            ("completion_timeout_ms", self.completion_timeout_ms),
            ("teardown_timeout_ms", self.teardown_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(format!("queue.{} must be greater than zero", name));
            }
        }
        if self.outcome_history == 0 {
            return Err("queue.outcome_history must be greater than zero".into());
        }
        Ok(())
    }
}
