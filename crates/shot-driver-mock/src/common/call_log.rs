//! Shared record of every call made to mock workers.
//!
//! Tests hand one [`CallLog`] to all mocks of a queue and afterwards assert on
//! ordering, overlap and call counts. Timestamps use [`tokio::time::Instant`]
//! so they stay meaningful under a paused test clock.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Worker operation recorded in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// `DeviceWorker::transition_to_buffered`
    Transition,
    /// `DeviceWorker::return_to_manual`
    ReturnToManual,
    /// `DeviceWorker::abort`
    Abort,
    /// `MasterClock::start_run`
    StartRun,
    /// `MasterClock::wait_done`
    WaitDone,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallKind::Transition => "transition_to_buffered",
            CallKind::ReturnToManual => "return_to_manual",
            CallKind::Abort => "abort",
            CallKind::StartRun => "start_run",
            CallKind::WaitDone => "wait_done",
        };
        f.write_str(s)
    }
}

/// One call, possibly still in flight
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// Device name
    pub device: String,
    /// Operation
    pub kind: CallKind,
    /// When the call entered the worker
    pub started: Instant,
    /// When the call returned; `None` while pending or if it was dropped
    pub finished: Option<Instant>,
    /// Whether it returned `Ok`
    pub ok: Option<bool>,
}

impl CallRecord {
    /// True if the two calls were in flight at the same time.
    pub fn overlaps(&self, other: &CallRecord) -> bool {
        let self_end = self.finished.unwrap_or_else(Instant::now);
        let other_end = other.finished.unwrap_or_else(Instant::now);
        self.started < other_end && other.started < self_end
    }
}

/// Cloneable handle to a shared call log
#[derive(Clone, Default)]
pub struct CallLog {
    inner: Arc<Mutex<Vec<CallRecord>>>,
}

impl CallLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin(&self, device: &str, kind: CallKind) -> usize {
        let mut records = self.inner.lock();
        records.push(CallRecord {
            device: device.to_string(),
            kind,
            started: Instant::now(),
            finished: None,
            ok: None,
        });
        records.len() - 1
    }

    pub(crate) fn finish(&self, index: usize, ok: bool) {
        if let Some(record) = self.inner.lock().get_mut(index) {
            record.finished = Some(Instant::now());
            record.ok = Some(ok);
        }
    }

    /// Snapshot of all records in call order.
    pub fn records(&self) -> Vec<CallRecord> {
        self.inner.lock().clone()
    }

    /// Number of calls of `kind` made to `device`.
    pub fn count(&self, device: &str, kind: CallKind) -> usize {
        self.inner
            .lock()
            .iter()
            .filter(|r| r.device == device && r.kind == kind)
            .count()
    }

    /// Number of calls of `kind` across all devices.
    pub fn total(&self, kind: CallKind) -> usize {
        self.inner.lock().iter().filter(|r| r.kind == kind).count()
    }

    /// Devices that received `kind`, in call order.
    pub fn devices_with(&self, kind: CallKind) -> Vec<String> {
        self.inner
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.device.clone())
            .collect()
    }

    /// First call of `kind` made to `device`.
    pub fn first(&self, device: &str, kind: CallKind) -> Option<CallRecord> {
        self.inner
            .lock()
            .iter()
            .find(|r| r.device == device && r.kind == kind)
            .cloned()
    }

    /// Drop all records.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl fmt::Debug for CallLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallLog")
            .field("calls", &self.inner.lock().len())
            .finish()
    }
}

/// Records a call on creation and marks it finished on [`CallGuard::done`].
///
/// If the future holding the guard is dropped the record stays unfinished,
/// which is how a cancelled or timed-out call shows up in the log.
pub(crate) struct CallGuard {
    log: CallLog,
    index: usize,
}

impl CallGuard {
    pub(crate) fn start(log: &CallLog, device: &str, kind: CallKind) -> Self {
        Self {
            log: log.clone(),
            index: log.begin(device, kind),
        }
    }

    pub(crate) fn done<T>(self, result: &anyhow::Result<T>) {
        self.log.finish(self.index, result.is_ok());
    }
}
