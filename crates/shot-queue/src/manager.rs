//! QueueManager - shot admission and the single-shot execution loop
//!
//! The manager owns the queue and the shot in flight. Admission runs on the
//! caller's task; execution runs on one dedicated loop task.
//!
//! # Loop
//!
//! ```text
//! ┌──────────┐  admit()/resume()  ┌──────────┐   terminal state   ┌──────────┐
//! │  Idle    │───────────────────▶│ Dequeued │──── ... ──────────▶│ Finished │
//! │ (Notify) │◀───────────────────┴──────────┘                    └────┬─────┘
//! └──────────┘          queue empty or paused                          │
//!      ▲                                                               │
//!      └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = QueueManager::new(active_table, Arc::new(registry), settings)?;
//! let mut events = manager.subscribe();
//! manager.start()?;
//!
//! let admission = manager.admit("shots/scanA.h5").await?;
//! println!("queued {} at position {}", admission.id, admission.position);
//!
//! while let Ok(event) = events.recv().await {
//!     if let ShotEvent::Finished(outcome) = event {
//!         println!("{}", outcome);
//!     }
//! }
//! ```

use parking_lot::{Mutex as SyncMutex, RwLock};
use shot_core::{
    validate, ArtifactStore, ConnectionTable, FileArtifactStore, ResultsWriter, ShotError, ShotId,
    ShotResult, TableSource,
};
use shot_hardware::WorkerRegistry;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::execution::ShotRun;
use crate::queue::{QueueEntry, ShotQueue};
use crate::settings::QueueSettings;
use crate::state::{Admission, RepeatMode, ShotEvent, ShotExecutionState, ShotOutcome};
use crate::submitter::{AnalysisSubmitter, LoggingAnalysisSubmitter};

const EVENT_CAPACITY: usize = 1024;

/// State shared between the manager handle and the loop task.
pub(crate) struct Shared {
    pub(crate) active_table: ConnectionTable,
    pub(crate) registry: Arc<WorkerRegistry>,
    pub(crate) store: Arc<dyn ArtifactStore>,
    pub(crate) results: Arc<dyn ResultsWriter>,
    pub(crate) submitter: Arc<dyn AnalysisSubmitter>,
    pub(crate) settings: QueueSettings,
    pub(crate) events: broadcast::Sender<ShotEvent>,
    pub(crate) current: RwLock<Option<ShotExecutionState>>,
    queue: Mutex<ShotQueue>,
    notify: Notify,
    paused: AtomicBool,
    active_cancel: SyncMutex<Option<CancellationToken>>,
    history: SyncMutex<VecDeque<ShotOutcome>>,
    shutdown: CancellationToken,
    handle: SyncMutex<Option<JoinHandle<()>>>,
}

impl Shared {
    async fn admit(&self, id: ShotId) -> ShotResult<Admission> {
        let loaded = match self.store.resolve(&id).await {
            Ok(id) => self.store.load(&id).await,
            Err(e) => Err(e),
        };
        let artifact = loaded.map_err(|e| {
            warn!(shot = %id, error = %e, "Shot rejected");
            e
        })?;
        let id = artifact.id.clone();
        if let Err(e) = validate(&self.active_table, &artifact.connection_table) {
            warn!(shot = %id, error = %e, "Shot rejected");
            return Err(e);
        }

        let mut queue = self.queue.lock().await;
        let duplicate = artifact.has_results() || queue.contains(&id) || self.is_in_flight(&id);
        let (id, cloned_from) = if duplicate {
            let copy_id = self.free_clone_id(&queue, &id).await?;
            self.store.write_clone(&artifact.stripped_copy(copy_id.clone())).await?;
            info!(shot = %id, copy = %copy_id, "Queueing a fresh copy of a queued, running or completed shot");
            (copy_id, Some(id))
        } else {
            (id, None)
        };
        let position = queue.push_back(QueueEntry::new(id.clone(), cloned_from.clone()))?;
        let _ = self.events.send(ShotEvent::Admitted {
            id: id.clone(),
            position,
            cloned_from: cloned_from.clone(),
        });
        drop(queue);

        info!(shot = %id, position, "Shot admitted");
        self.notify.notify_one();
        Ok(Admission {
            id,
            position,
            cloned_from,
        })
    }

    /// True if `id` has been dequeued and has not finished yet.
    fn is_in_flight(&self, id: &ShotId) -> bool {
        matches!(&*self.current.read(), Some(state) if &state.shot == id)
    }

    /// First numbered copy of `id` that is neither queued nor in the store.
    async fn free_clone_id(&self, queue: &ShotQueue, id: &ShotId) -> ShotResult<ShotId> {
        for candidate in queue.clone_candidates(id) {
            if !self.store.exists(&candidate).await {
                return Ok(candidate);
            }
        }
        Err(ShotError::Artifact(format!("No free copy name for {}", id)))
    }

    /// Wait for the next runnable entry. The execution state and cancel token
    /// are installed under the queue lock so observers never see a popped
    /// entry without an active shot.
    async fn next_shot(&self) -> Option<(ShotExecutionState, CancellationToken)> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            if !self.paused.load(Ordering::SeqCst) {
                let mut queue = self.queue.lock().await;
                if let Some(entry) = queue.pop_front() {
                    let state = ShotExecutionState::new(Uuid::new_v4().to_string(), entry.shot);
                    let cancel = self.shutdown.child_token();
                    *self.current.write() = Some(state.clone());
                    *self.active_cancel.lock() = Some(cancel.clone());
                    return Some((state, cancel));
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    async fn complete(&self, outcome: ShotOutcome) {
        *self.active_cancel.lock() = None;
        {
            let mut history = self.history.lock();
            history.push_back(outcome.clone());
            while history.len() > self.settings.outcome_history {
                history.pop_front();
            }
        }

        if outcome.is_done() {
            self.repeat(&outcome.shot).await;
        }

        *self.current.write() = None;
        let _ = self.events.send(ShotEvent::Finished(outcome));
    }

    async fn repeat(&self, shot: &ShotId) {
        let readmit = match self.settings.repeat_mode {
            RepeatMode::Off => false,
            RepeatMode::All => true,
            RepeatMode::Last => self.queue.lock().await.is_empty(),
        };
        if !readmit {
            return;
        }
        match self.admit(shot.clone()).await {
            Ok(admission) => info!(shot = %shot, copy = %admission.id, "Repeating shot"),
            Err(e) => warn!(shot = %shot, error = %e, "Failed to repeat shot"),
        }
    }
}

async fn run_loop(shared: Arc<Shared>) {
    info!("Shot queue loop started");
    while let Some((state, cancel)) = shared.next_shot().await {
        let span = info_span!("shot", run_uid = %state.run_uid, shot = %state.shot);
        let outcome = ShotRun::new(&shared, state, cancel)
            .execute()
            .instrument(span)
            .await;
        shared.complete(outcome).await;
    }
    info!("Shot queue loop stopped");
}

/// Builder for [`QueueManager`].
pub struct QueueManagerBuilder {
    active_table: ConnectionTable,
    registry: Arc<WorkerRegistry>,
    settings: QueueSettings,
    store: Arc<dyn ArtifactStore>,
    results: Arc<dyn ResultsWriter>,
    submitter: Arc<dyn AnalysisSubmitter>,
}

impl QueueManagerBuilder {
    /// Timeouts and behaviour switches.
    pub fn settings(mut self, settings: QueueSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Artifact loading and cloning.
    pub fn store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = store;
        self
    }

    /// Post-run results writer.
    pub fn results_writer(mut self, results: Arc<dyn ResultsWriter>) -> Self {
        self.results = results;
        self
    }

    /// Analysis hand-off.
    pub fn submitter(mut self, submitter: Arc<dyn AnalysisSubmitter>) -> Self {
        self.submitter = submitter;
        self
    }

    /// Check the configuration and build the manager. The loop is not started.
    ///
    /// # Errors
    /// - `Configuration` for invalid settings or a registry that does not fit
    ///   the active table
    /// - `InvalidMasterCardinality` / `InvalidTopology` for a malformed table
    pub fn build(self) -> ShotResult<QueueManager> {
        self.settings.validate().map_err(ShotError::Configuration)?;
        self.active_table.check(TableSource::Active)?;
        self.registry
            .check_against(&self.active_table)
            .map_err(|e| ShotError::Configuration(e.to_string()))?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let paused = self.settings.start_paused;
        Ok(QueueManager {
            shared: Arc::new(Shared {
                active_table: self.active_table,
                registry: self.registry,
                store: self.store,
                results: self.results,
                submitter: self.submitter,
                settings: self.settings,
                events,
                current: RwLock::new(None),
                queue: Mutex::new(ShotQueue::new()),
                notify: Notify::new(),
                paused: AtomicBool::new(paused),
                active_cancel: SyncMutex::new(None),
                history: SyncMutex::new(VecDeque::new()),
                shutdown: CancellationToken::new(),
                handle: SyncMutex::new(None),
            }),
        })
    }
}

/// Shot queue with a single-shot execution loop.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct QueueManager {
    shared: Arc<Shared>,
}

impl QueueManager {
    /// Manager with JSON file artifacts and the logging analysis submitter.
    pub fn new(
        active_table: ConnectionTable,
        registry: Arc<WorkerRegistry>,
        settings: QueueSettings,
    ) -> ShotResult<Self> {
        Self::builder(active_table, registry).settings(settings).build()
    }

    /// Builder with default collaborators.
    pub fn builder(active_table: ConnectionTable, registry: Arc<WorkerRegistry>) -> QueueManagerBuilder {
        let files = Arc::new(FileArtifactStore::new());
        QueueManagerBuilder {
            active_table,
            registry,
            settings: QueueSettings::default(),
            store: files.clone(),
            results: files,
            submitter: Arc::new(LoggingAnalysisSubmitter),
        }
    }

    /// Active connection table shots are validated against.
    pub fn active_table(&self) -> &ConnectionTable {
        &self.shared.active_table
    }

    /// Queue settings.
    pub fn settings(&self) -> &QueueSettings {
        &self.shared.settings
    }

    /// Subscribe to queue notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ShotEvent> {
        self.shared.events.subscribe()
    }

    /// Validate a shot and append it to the queue.
    ///
    /// A shot that already carries results, or whose identity is already
    /// queued, is queued as a stripped numbered copy. No device is contacted.
    ///
    /// # Errors
    /// - `Artifact` if the file cannot be loaded or the copy cannot be written
    /// - `ConnectionTableMismatch` with the diff against the active table
    /// - `InvalidMasterCardinality` / `InvalidTopology` for a malformed
    ///   embedded table
    pub async fn admit(&self, path: impl Into<ShotId>) -> ShotResult<Admission> {
        self.shared.admit(path.into()).await
    }

    /// Spawn the execution loop.
    ///
    /// # Errors
    /// `Configuration` if the loop was already started or the manager was shut down.
    pub fn start(&self) -> ShotResult<()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(ShotError::Configuration("queue has been shut down".into()));
        }
        let mut handle = self.shared.handle.lock();
        if handle.is_some() {
            return Err(ShotError::Configuration("queue loop already started".into()));
        }
        *handle = Some(tokio::spawn(run_loop(self.shared.clone())));
        Ok(())
    }

    /// Stop the loop, aborting the shot in flight, and wait for it to exit.
    pub async fn shutdown(&self) {
        info!("Shutting down shot queue");
        self.shared.shutdown.cancel();
        let handle = self.shared.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Queue loop ended abnormally");
            }
        }
    }

    /// Stop dequeuing. The shot in flight is unaffected.
    pub fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            info!("Queue paused");
            let _ = self.shared.events.send(ShotEvent::QueuePaused(true));
        }
    }

    /// Resume dequeuing.
    pub fn resume(&self) {
        if self.shared.paused.swap(false, Ordering::SeqCst) {
            info!("Queue resumed");
            let _ = self.shared.events.send(ShotEvent::QueuePaused(false));
            self.shared.notify.notify_one();
        }
    }

    /// True while dequeuing is paused.
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Request cancellation of the shot in flight.
    ///
    /// Returns `false` if no shot is active. The shot observes the request at
    /// the next group boundary, before the trigger, or during the wait.
    pub fn abort_current(&self) -> bool {
        match self.shared.active_cancel.lock().as_ref() {
            Some(token) => {
                info!("Abort requested for the shot in flight");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove a pending entry. Returns `false` if it was not queued.
    pub async fn remove(&self, id: &ShotId) -> bool {
        let removed = self.shared.queue.lock().await.remove(id).is_some();
        if removed {
            info!(shot = %id, "Shot removed from queue");
        }
        removed
    }

    /// Drop every pending entry.
    pub async fn clear(&self) -> usize {
        let n = self.shared.queue.lock().await.clear();
        info!(count = n, "Queue cleared");
        n
    }

    /// Copy of the pending entries, head first.
    pub async fn snapshot(&self) -> Vec<QueueEntry> {
        self.shared.queue.lock().await.snapshot()
    }

    /// Number of pending entries.
    pub async fn len(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    /// True if nothing is pending.
    pub async fn is_empty(&self) -> bool {
        self.shared.queue.lock().await.is_empty()
    }

    /// Snapshot of the shot in flight.
    pub fn current(&self) -> Option<ShotExecutionState> {
        self.shared.current.read().clone()
    }

    /// Most recent outcomes, oldest first.
    pub fn recent_outcomes(&self) -> Vec<ShotOutcome> {
        self.shared.history.lock().iter().cloned().collect()
    }

    /// True when nothing is queued and no shot is in flight.
    pub async fn is_idle(&self) -> bool {
        let queue = self.shared.queue.lock().await;
        queue.is_empty() && self.shared.current.read().is_none()
    }

    /// Wait until the queue has drained and the last shot has finished.
    ///
    /// Never returns while the queue is paused with entries pending.
    pub async fn wait_until_idle(&self) {
        let mut events = self.subscribe();
        loop {
            if self.is_idle().await {
                return;
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("devices", &self.shared.registry.len())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}
