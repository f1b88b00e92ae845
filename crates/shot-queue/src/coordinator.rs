//! Ordered-group transition and teardown fan-out.
//!
//! Groups run strictly one after another; the devices inside a group are
//! called concurrently, one task per device, and the group returns only once
//! every device has answered, failed, or timed out. A failing device does not
//! cancel its siblings.

use futures::FutureExt;
use shot_core::{ConnectionTable, DeviceNode, DeviceWorker, FinalValues, ShotArtifact, ShotError};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::state::{TeardownAction, TeardownFailure};

/// Devices sharing one order value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceGroup {
    /// Shared `start_order` (or `stop_order` for teardown groups)
    pub order: i32,
    /// Device names, sorted
    pub devices: Vec<String>,
}

impl DeviceGroup {
    /// Partition `devices` by `start_order`, ascending.
    pub fn by_start_order(table: &ConnectionTable, devices: &[String]) -> Vec<DeviceGroup> {
        Self::partition(table, devices, |node| node.start_order)
    }

    /// Partition `devices` by `stop_order`, ascending.
    pub fn by_stop_order(table: &ConnectionTable, devices: &[String]) -> Vec<DeviceGroup> {
        Self::partition(table, devices, |node| node.stop_order)
    }

    fn partition(
        table: &ConnectionTable,
        devices: &[String],
        order: impl Fn(&DeviceNode) -> i32,
    ) -> Vec<DeviceGroup> {
        let mut groups: BTreeMap<i32, Vec<String>> = BTreeMap::new();
        for name in devices {
            let key = table.get(name).map(&order).unwrap_or_default();
            groups.entry(key).or_default().push(name.clone());
        }
        groups
            .into_iter()
            .map(|(order, mut devices)| {
                devices.sort();
                devices.dedup();
                DeviceGroup { order, devices }
            })
            .collect()
    }
}

/// One device that did not reach buffered.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFailure {
    /// Device name
    pub device: String,
    /// `DeviceTransitionTimeout` or `DeviceTransitionFailure`
    pub error: ShotError,
}

/// Outcome of one group, sorted by device name.
#[derive(Debug, Clone, Default)]
pub struct GroupResult {
    /// Devices that reached buffered, with their final values
    pub succeeded: Vec<(String, FinalValues)>,
    /// Devices that failed or timed out
    pub failed: Vec<DeviceFailure>,
}

impl GroupResult {
    /// True if every device reached buffered.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Fans worker calls out over the devices of one shot.
#[derive(Clone)]
pub struct TransitionCoordinator {
    workers: HashMap<String, Arc<dyn DeviceWorker>>,
    teardown_timeout: Duration,
}

impl TransitionCoordinator {
    /// Coordinator over the given worker handles.
    pub fn new(workers: HashMap<String, Arc<dyn DeviceWorker>>, teardown_timeout: Duration) -> Self {
        Self {
            workers,
            teardown_timeout,
        }
    }

    /// Transition every device of `group` to buffered and wait for all of them.
    pub async fn run_group(
        &self,
        group: &DeviceGroup,
        shot: &Arc<ShotArtifact>,
        timeout: Duration,
    ) -> GroupResult {
        info!(order = group.order, devices = ?group.devices, "Transitioning device group");

        let mut result = GroupResult::default();
        let mut set = JoinSet::new();

        for device in &group.devices {
            let Some(worker) = self.workers.get(device).cloned() else {
                result.failed.push(DeviceFailure {
                    device: device.clone(),
                    error: ShotError::DeviceTransitionFailure {
                        device: device.clone(),
                        message: "no worker for device".into(),
                    },
                });
                continue;
            };
            let shot = shot.clone();
            let device = device.clone();
            set.spawn(async move {
                let call = AssertUnwindSafe(worker.transition_to_buffered(&shot, timeout)).catch_unwind();
                let outcome = match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(Ok(values))) => Ok(values),
                    Ok(Ok(Err(e))) => Err(ShotError::DeviceTransitionFailure {
                        device: device.clone(),
                        message: format!("{e:#}"),
                    }),
                    Ok(Err(_panic)) => Err(ShotError::DeviceTransitionFailure {
                        device: device.clone(),
                        message: "worker panicked".into(),
                    }),
                    Err(_elapsed) => Err(ShotError::DeviceTransitionTimeout {
                        device: device.clone(),
                        timeout,
                    }),
                };
                (device, outcome)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((device, Ok(values))) => {
                    debug!(device = %device, "Device reached buffered");
                    result.succeeded.push((device, values));
                }
                Ok((device, Err(error))) => {
                    warn!(device = %device, error = %error, "Device failed to reach buffered");
                    result.failed.push(DeviceFailure { device, error });
                }
                Err(e) => warn!(error = %e, "Transition task ended unexpectedly"),
            }
        }

        // Any device without an answer lost its task
        for device in &group.devices {
            let answered = result.succeeded.iter().any(|(d, _)| d == device)
                || result.failed.iter().any(|f| &f.device == device);
            if !answered {
                result.failed.push(DeviceFailure {
                    device: device.clone(),
                    error: ShotError::DeviceTransitionFailure {
                        device: device.clone(),
                        message: "transition task ended without a result".into(),
                    },
                });
            }
        }

        result.succeeded.sort_by(|a, b| a.0.cmp(&b.0));
        result.failed.sort_by(|a, b| a.device.cmp(&b.device));
        result
    }

    /// Return `devices` to manual; best-effort.
    pub async fn return_to_manual(&self, devices: &[String]) -> Vec<TeardownFailure> {
        self.teardown(devices, TeardownAction::ReturnToManual).await
    }

    /// Abort `devices`; best-effort.
    pub async fn abort(&self, devices: &[String]) -> Vec<TeardownFailure> {
        self.teardown(devices, TeardownAction::Abort).await
    }

    async fn teardown(&self, devices: &[String], action: TeardownAction) -> Vec<TeardownFailure> {
        if devices.is_empty() {
            return Vec::new();
        }
        info!(action = %action, devices = ?devices, "Tearing down devices");

        let mut failures = Vec::new();
        let mut set = JoinSet::new();
        let timeout = self.teardown_timeout;

        for device in devices {
            let Some(worker) = self.workers.get(device).cloned() else {
                failures.push(TeardownFailure {
                    device: device.clone(),
                    action,
                    message: "no worker for device".into(),
                });
                continue;
            };
            let device = device.clone();
            set.spawn(async move {
                let call = async {
                    match action {
                        TeardownAction::ReturnToManual => worker.return_to_manual().await,
                        TeardownAction::Abort => worker.abort().await,
                    }
                };
                let message = match tokio::time::timeout(timeout, AssertUnwindSafe(call).catch_unwind()).await {
                    Ok(Ok(Ok(()))) => None,
                    Ok(Ok(Err(e))) => Some(format!("{e:#}")),
                    Ok(Err(_panic)) => Some("worker panicked".to_string()),
                    Err(_elapsed) => Some(format!("timed out after {:?}", timeout)),
                };
                (device, message)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, None)) => {}
                Ok((device, Some(message))) => {
                    warn!(device = %device, action = %action, error = %message, "Teardown failed");
                    failures.push(TeardownFailure {
                        device,
                        action,
                        message,
                    });
                }
                Err(e) => warn!(action = %action, error = %e, "Teardown task ended unexpectedly"),
            }
        }

        failures.sort_by(|a, b| a.device.cmp(&b.device));
        failures
    }
}

impl std::fmt::Debug for TransitionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut devices: Vec<_> = self.workers.keys().collect();
        devices.sort();
        f.debug_struct("TransitionCoordinator")
            .field("devices", &devices)
            .field("teardown_timeout", &self.teardown_timeout)
            .finish()
    }
}
