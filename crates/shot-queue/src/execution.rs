//! Execution of one dequeued shot, from validation to its terminal state.

use chrono::Utc;
use shot_core::{validate, ShotArtifact, ShotError, ShotResult, ShotResults, WaitOutcome};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::{DeviceGroup, TransitionCoordinator};
use crate::manager::Shared;
use crate::master_clock::MasterClockController;
use crate::state::{ShotEvent, ShotExecutionState, ShotOutcome, ShotState};

/// Everything resolved during Validating.
struct PreparedShot {
    artifact: Arc<ShotArtifact>,
    groups: Vec<DeviceGroup>,
    coordinator: TransitionCoordinator,
    master: MasterClockController,
}

/// Drives one shot through the state machine.
pub(crate) struct ShotRun<'a> {
    shared: &'a Shared,
    state: ShotExecutionState,
    cancel: CancellationToken,
}

impl<'a> ShotRun<'a> {
    pub(crate) fn new(shared: &'a Shared, state: ShotExecutionState, cancel: CancellationToken) -> Self {
        let run = Self {
            shared,
            state,
            cancel,
        };
        run.announce();
        run
    }

    /// Run to a terminal state. Every device that reached buffered receives
    /// exactly one teardown call before this returns.
    pub(crate) async fn execute(mut self) -> ShotOutcome {
        info!("Shot dequeued");
        let prepared = match self.prepare().await {
            Ok(prepared) => prepared,
            Err(e) => return self.finish(Err(e)).await,
        };

        let result = self.drive(&prepared).await;
        self.unwind(&prepared, result.is_ok()).await;
        self.finish(result).await
    }

    async fn prepare(&mut self) -> ShotResult<PreparedShot> {
        self.set_state(ShotState::Validating);

        let artifact = self.shared.store.load(&self.state.shot).await?;
        if artifact.has_results() {
            return Err(ShotError::ShotPreparation(format!(
                "{} already carries results",
                self.state.shot
            )));
        }
        validate(&self.shared.active_table, &artifact.connection_table)?;

        let table = &artifact.connection_table;
        let registry = &self.shared.registry;
        let master = MasterClockController::resolve(table, registry)?;

        let mut participants = BTreeSet::new();
        for device in artifact.devices.keys() {
            if !table.contains(device) {
                return Err(ShotError::ShotPreparation(format!(
                    "instructions for '{}', which is not in the connection table",
                    device
                )));
            }
            if !registry.contains(device) {
                return Err(ShotError::ShotPreparation(format!(
                    "no worker registered for '{}'",
                    device
                )));
            }
            participants.insert(device.clone());
        }
        participants.insert(master.device().to_string());
        let participants: Vec<String> = participants.into_iter().collect();

        let workers: HashMap<_, _> = participants
            .iter()
            .filter_map(|name| registry.worker(name).map(|w| (name.clone(), w)))
            .collect();
        let groups = DeviceGroup::by_start_order(table, &participants);
        debug!(devices = ?participants, groups = groups.len(), "Resolved participating devices");

        Ok(PreparedShot {
            groups,
            coordinator: TransitionCoordinator::new(workers, self.shared.settings.teardown_timeout()),
            master,
            artifact: Arc::new(artifact),
        })
    }

    async fn drive(&mut self, prepared: &PreparedShot) -> ShotResult<()> {
        self.set_state(ShotState::TransitioningBuffered);
        let timeout = self.shared.settings.transition_timeout();

        for group in &prepared.groups {
            self.check_cancelled()?;
            let result = prepared
                .coordinator
                .run_group(group, &prepared.artifact, timeout)
                .await;
            for (device, values) in result.succeeded {
                self.state.transitioned.push(device.clone());
                self.state.final_values.insert(device, values);
            }
            self.publish();
            if let Some(failure) = result.failed.into_iter().next() {
                return Err(failure.error);
            }
        }

        self.check_cancelled()?;
        self.set_state(ShotState::Triggered);
        prepared.master.trigger().await?;

        self.set_state(ShotState::Running);
        let timeout = self
            .shared
            .settings
            .completion_timeout(prepared.artifact.expected_duration_ms);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ShotError::CancellationRequested),
            outcome = prepared.master.wait(timeout) => match outcome? {
                WaitOutcome::Done => Ok(()),
                WaitOutcome::Timeout => Err(ShotError::CompletionTimeout {
                    device: prepared.master.device().to_string(),
                    timeout,
                }),
            },
        }
    }

    async fn unwind(&mut self, prepared: &PreparedShot, success: bool) {
        self.set_state(ShotState::Unwinding);
        let devices = self.state.transitioned.clone();
        let failures = if success {
            let mut failures = Vec::new();
            for group in DeviceGroup::by_stop_order(&prepared.artifact.connection_table, &devices) {
                failures.extend(prepared.coordinator.return_to_manual(&group.devices).await);
            }
            failures
        } else {
            prepared.coordinator.abort(&devices).await
        };
        self.state.teardown_failures = failures;
    }

    async fn finish(mut self, result: ShotResult<()>) -> ShotOutcome {
        let result = match result {
            Ok(()) => self.write_results().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.set_state(ShotState::Done);
                info!(devices = self.state.transitioned.len(), "Shot complete");
                if let Err(e) = self.shared.submitter.submit(&self.state.shot).await {
                    warn!(error = %e, "Analysis submission failed");
                }
            }
            Err(e) if e.is_cancellation() => {
                warn!("Shot aborted");
                self.state.error = Some(e);
                self.set_state(ShotState::Aborted);
            }
            Err(e) => {
                error!(error = %e, "Shot failed");
                self.state.error = Some(e);
                self.set_state(ShotState::Error);
            }
        }
        ShotOutcome::from_state(self.state)
    }

    async fn write_results(&self) -> ShotResult<()> {
        let results = ShotResults {
            run_uid: self.state.run_uid.clone(),
            completed_at: Utc::now(),
            final_values: self.state.final_values.clone(),
        };
        self.shared.results.append_results(&self.state.shot, &results).await
    }

    fn check_cancelled(&self) -> ShotResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ShotError::CancellationRequested);
        }
        Ok(())
    }

    fn set_state(&mut self, state: ShotState) {
        debug!(state = %state, "Shot state changed");
        self.state.state = state;
        self.announce();
    }

    fn announce(&self) {
        self.publish();
        let _ = self.shared.events.send(ShotEvent::StateChanged {
            run_uid: self.state.run_uid.clone(),
            shot: self.state.shot.clone(),
            state: self.state.state,
        });
    }

    fn publish(&self) {
        *self.shared.current.write() = Some(self.state.clone());
    }
}
