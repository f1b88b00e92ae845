//! Error taxonomy for shot admission and execution.
//!
//! `ShotError` is the single error type surfaced by the queue. Errors fall
//! into three categories:
//!
//! 1. **Admission errors** - `ConnectionTableMismatch`, `InvalidMasterCardinality`,
//!    `InvalidTopology`, `Artifact`
//!    - Returned synchronously from `admit()`
//!    - The queue is never touched
//!
//! 2. **Execution errors** - `DeviceTransitionTimeout`, `DeviceTransitionFailure`,
//!    `MasterTriggerFailure`, `CompletionTimeout`, `CompletionFailure`, `ShotPreparation`
//!    - Fatal to one shot, recorded on its execution state
//!    - The loop unwinds the shot and moves on to the next entry
//!
//! 3. **Configuration errors** - `Configuration`
//!    - Raised while wiring the registry against the active table
//!
//! `CancellationRequested` is not a failure: it drives the shot into
//! `Aborted` rather than `Error`. A duplicate shot is not an error at all; it is
//! reported through `Admission::cloned_from`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the shot error type.
pub type ShotResult<T> = std::result::Result<T, ShotError>;

/// Which of the two compared tables a validation error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableSource {
    /// The configured hardware topology
    Active,
    /// The snapshot compiled into the shot artifact
    Embedded,
}

impl fmt::Display for TableSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableSource::Active => write!(f, "active"),
            TableSource::Embedded => write!(f, "embedded"),
        }
    }
}

/// Structural difference between the active and embedded connection tables.
///
/// Names are sorted so that diffs compare deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDiff {
    /// Devices present in the active table but not in the shot
    pub added: Vec<String>,
    /// Devices present in the shot but missing from the active table
    pub removed: Vec<String>,
    /// Devices present in both whose structure or addressing differs
    pub changed: Vec<String>,
}

impl TableDiff {
    /// True when the two tables matched.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl fmt::Display for TableDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.added.is_empty() {
            parts.push(format!("added: [{}]", self.added.join(", ")));
        }
        if !self.removed.is_empty() {
            parts.push(format!("removed: [{}]", self.removed.join(", ")));
        }
        if !self.changed.is_empty() {
            parts.push(format!("changed: [{}]", self.changed.join(", ")));
        }
        write!(f, "{}", parts.join("; "))
    }
}

/// Primary error type for shot admission and execution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShotError {
    /// The shot was compiled against a different hardware topology.
    ///
    /// **Error Type**: Permanent for this artifact - recompile against the
    /// current connection table.
    #[error("Connection table mismatch ({0})")]
    ConnectionTableMismatch(TableDiff),

    /// A table declares zero or several master pseudoclocks.
    #[error("The {table} connection table declares {count} master pseudoclocks (expected exactly 1)")]
    InvalidMasterCardinality {
        /// Table that failed the check
        table: TableSource,
        /// Number of devices flagged as master
        count: usize,
    },

    /// A table is not a forest (dangling parent or cycle).
    #[error("Invalid connection table topology: {0}")]
    InvalidTopology(String),

    /// The artifact could not be read, cloned, or written.
    #[error("Artifact error: {0}")]
    Artifact(String),

    /// The shot's own instruction set cannot be mapped onto the registered workers.
    #[error("Shot preparation failed: {0}")]
    ShotPreparation(String),

    /// A device did not finish programming within the transition timeout.
    #[error("Device '{device}' timed out after {timeout:?} transitioning to buffered")]
    DeviceTransitionTimeout {
        /// Device name
        device: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// A device reported an error while transitioning to buffered.
    #[error("Device '{device}' failed to transition to buffered: {message}")]
    DeviceTransitionFailure {
        /// Device name
        device: String,
        /// Worker-reported cause
        message: String,
    },

    /// The master pseudoclock rejected the start trigger.
    #[error("Master pseudoclock '{device}' failed to start: {message}")]
    MasterTriggerFailure {
        /// Master device name
        device: String,
        /// Worker-reported cause
        message: String,
    },

    /// The run did not report completion within the wait timeout.
    #[error("Master pseudoclock '{device}' did not report completion within {timeout:?}")]
    CompletionTimeout {
        /// Master device name
        device: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The master pseudoclock reported an error while waiting for completion.
    #[error("Master pseudoclock '{device}' failed while running: {message}")]
    CompletionFailure {
        /// Master device name
        device: String,
        /// Worker-reported cause
        message: String,
    },

    /// An external abort was observed.
    #[error("Shot aborted by request")]
    CancellationRequested,

    /// Registry or configuration inconsistency detected at wiring time.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ShotError {
    /// True for the admission-time family of errors.
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            ShotError::ConnectionTableMismatch(_)
                | ShotError::InvalidMasterCardinality { .. }
                | ShotError::InvalidTopology(_)
                | ShotError::Artifact(_)
        )
    }

    /// True when the error ends a shot as `Aborted` rather than `Error`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ShotError::CancellationRequested)
    }

    /// Name of the device responsible for the error, if any.
    pub fn device(&self) -> Option<&str> {
        match self {
            ShotError::DeviceTransitionTimeout { device, .. }
            | ShotError::DeviceTransitionFailure { device, .. }
            | ShotError::MasterTriggerFailure { device, .. }
            | ShotError::CompletionTimeout { device, .. }
            | ShotError::CompletionFailure { device, .. } => Some(device),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_display() {
        let diff = TableDiff {
            added: vec![],
            removed: vec!["ttl1".into()],
            changed: vec!["dds41".into(), "fpga0".into()],
        };
        assert_eq!(diff.to_string(), "removed: [ttl1]; changed: [dds41, fpga0]");
        assert!(!diff.is_empty());
        assert!(TableDiff::default().is_empty());
    }

    #[test]
    fn test_error_classification() {
        let mismatch = ShotError::ConnectionTableMismatch(TableDiff::default());
        assert!(mismatch.is_admission_error());
        assert!(!mismatch.is_cancellation());

        let timeout = ShotError::DeviceTransitionTimeout {
            device: "dds41".into(),
            timeout: Duration::from_millis(50),
        };
        assert!(!timeout.is_admission_error());
        assert_eq!(timeout.device(), Some("dds41"));

        assert!(ShotError::CancellationRequested.is_cancellation());
        assert_eq!(ShotError::CancellationRequested.device(), None);
    }
}
