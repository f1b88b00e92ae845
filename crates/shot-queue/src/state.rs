//! Execution state, outcomes and notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shot_core::{FinalValues, ShotError, ShotId};
use std::collections::BTreeMap;
use std::fmt;

/// Per-shot execution state
///
/// ```text
/// Dequeued → Validating → TransitioningBuffered → Triggered → Running
///                │                 │                  │          │
///                └─────────────────┴──────┬───────────┴──────────┘
///                                         ▼
///                                     Unwinding → Done | Aborted | Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShotState {
    /// Taken from the head of the queue
    Dequeued,
    /// Artifact re-loaded, participants being resolved
    Validating,
    /// Device groups being programmed in start order
    TransitioningBuffered,
    /// Start trigger being issued
    Triggered,
    /// Waiting for the master pseudoclock
    Running,
    /// Devices being returned to manual or aborted
    Unwinding,
    /// Ran to completion
    Done,
    /// Cancelled on request
    Aborted,
    /// Failed
    Error,
}

impl ShotState {
    /// True for Done, Aborted and Error.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ShotState::Done | ShotState::Aborted | ShotState::Error)
    }
}

impl fmt::Display for ShotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShotState::Dequeued => "dequeued",
            ShotState::Validating => "validating",
            ShotState::TransitioningBuffered => "transitioning_buffered",
            ShotState::Triggered => "triggered",
            ShotState::Running => "running",
            ShotState::Unwinding => "unwinding",
            ShotState::Done => "done",
            ShotState::Aborted => "aborted",
            ShotState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Teardown call issued during unwinding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownAction {
    /// Clean exit after a completed run
    ReturnToManual,
    /// Exit after a failed or cancelled shot
    Abort,
}

impl fmt::Display for TeardownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownAction::ReturnToManual => write!(f, "return_to_manual"),
            TeardownAction::Abort => write!(f, "abort"),
        }
    }
}

/// A teardown call that failed or timed out. Never retried.
#[derive(Debug, Clone, PartialEq)]
pub struct TeardownFailure {
    /// Device name
    pub device: String,
    /// Call that failed
    pub action: TeardownAction,
    /// Cause
    pub message: String,
}

/// Live state of the shot in flight.
#[derive(Debug, Clone)]
pub struct ShotExecutionState {
    /// Unique identifier of this execution
    pub run_uid: String,
    /// Shot being executed
    pub shot: ShotId,
    /// Current state
    pub state: ShotState,
    /// Final values reported by transitioned devices
    pub final_values: BTreeMap<String, FinalValues>,
    /// Devices that reached buffered, in the order they were recorded
    pub transitioned: Vec<String>,
    /// First error that ended the happy path
    pub error: Option<ShotError>,
    /// Teardown calls that failed
    pub teardown_failures: Vec<TeardownFailure>,
    /// When the shot was dequeued
    pub started_at: DateTime<Utc>,
}

impl ShotExecutionState {
    /// Fresh state for a dequeued shot.
    pub fn new(run_uid: impl Into<String>, shot: ShotId) -> Self {
        Self {
            run_uid: run_uid.into(),
            shot,
            state: ShotState::Dequeued,
            final_values: BTreeMap::new(),
            transitioned: Vec::new(),
            error: None,
            teardown_failures: Vec::new(),
            started_at: Utc::now(),
        }
    }
}

/// Record of a finished shot.
#[derive(Debug, Clone)]
pub struct ShotOutcome {
    /// Unique identifier of the execution
    pub run_uid: String,
    /// Shot that ran
    pub shot: ShotId,
    /// Terminal state
    pub state: ShotState,
    /// Error that ended the shot, if any
    pub error: Option<ShotError>,
    /// Final values of every transitioned device
    pub final_values: BTreeMap<String, FinalValues>,
    /// Devices that reached buffered
    pub transitioned: Vec<String>,
    /// Teardown calls that failed
    pub teardown_failures: Vec<TeardownFailure>,
    /// When the shot was dequeued
    pub started_at: DateTime<Utc>,
    /// When the shot reached its terminal state
    pub finished_at: DateTime<Utc>,
}

impl ShotOutcome {
    pub(crate) fn from_state(state: ShotExecutionState) -> Self {
        Self {
            run_uid: state.run_uid,
            shot: state.shot,
            state: state.state,
            error: state.error,
            final_values: state.final_values,
            transitioned: state.transitioned,
            teardown_failures: state.teardown_failures,
            started_at: state.started_at,
            finished_at: Utc::now(),
        }
    }

    /// True if the shot ran to completion.
    pub fn is_done(&self) -> bool {
        self.state == ShotState::Done
    }
}

impl fmt::Display for ShotOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.shot, self.run_uid, self.state)?;
        if let Some(err) = &self.error {
            write!(f, ": {}", err)?;
        }
        if !self.teardown_failures.is_empty() {
            write!(f, " ({} teardown failures)", self.teardown_failures.len())?;
        }
        Ok(())
    }
}

/// Result of a successful `admit()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Identity under which the shot was queued
    pub id: ShotId,
    /// 1-based queue position at admission
    pub position: usize,
    /// Original shot when a stripped copy was queued instead
    pub cloned_from: Option<ShotId>,
}

/// Notification broadcast to queue observers.
#[derive(Debug, Clone)]
pub enum ShotEvent {
    /// A shot was added to the queue
    Admitted {
        /// Queued identity
        id: ShotId,
        /// 1-based position
        position: usize,
        /// Original when the shot was cloned
        cloned_from: Option<ShotId>,
    },
    /// The shot in flight changed state
    StateChanged {
        /// Execution identifier
        run_uid: String,
        /// Shot in flight
        shot: ShotId,
        /// New state
        state: ShotState,
    },
    /// A shot reached a terminal state
    Finished(ShotOutcome),
    /// The queue was paused (`true`) or resumed (`false`)
    QueuePaused(bool),
}

/// Automatic re-admission of completed shots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    /// Never repeat
    #[default]
    Off,
    /// Repeat a completed shot only if nothing else is queued
    Last,
    /// Repeat every completed shot
    All,
}
