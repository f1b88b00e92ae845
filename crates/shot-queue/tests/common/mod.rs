//! Shared fixtures: the fpga0/ttl1/dds41 lab table, mock workers and
//! artifact files in a temporary directory.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use shot_core::{ConnectionTable, DeviceNode, ShotArtifact, ShotId};
use shot_driver_mock::{CallLog, MockDevice, MockPseudoclock};
use shot_hardware::WorkerRegistry;
use shot_queue::{
    AnalysisSubmitter, QueueManager, QueueSettings, ShotEvent, ShotOutcome,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub fn lab_table() -> ConnectionTable {
    ConnectionTable::new(vec![
        DeviceNode::new("fpga0", "mock_pseudoclock")
            .with_address("serial", "FT2232-01")
            .master(),
        DeviceNode::new("ttl1", "mock_device")
            .with_parent("fpga0", "flag1")
            .with_address("board", 1)
            .with_start_order(1),
        DeviceNode::new("dds41", "mock_device")
            .with_parent("fpga0", "clock1")
            .with_address("channel", 41)
            .with_start_order(1),
    ])
}

pub fn lab_shot(path: impl Into<ShotId>) -> ShotArtifact {
    ShotArtifact::new(path, lab_table())
        .with_instructions("fpga0", serde_json::json!({"instructions": [[0, 1], [10, 0]]}))
        .with_instructions(
            "ttl1",
            serde_json::json!({"pulses": [1, 0, 1], "final_values": {"flag1": 0.0}}),
        )
        .with_instructions(
            "dds41",
            serde_json::json!({"freq": [80.0, 81.5], "final_values": {"freq": 81.5}}),
        )
        .with_global("detuning_mhz", serde_json::json!(-12.5))
}

pub struct Workers {
    pub fpga0: MockPseudoclock,
    pub ttl1: MockDevice,
    pub dds41: MockDevice,
}

impl Workers {
    pub fn new(log: &CallLog) -> Self {
        Self {
            fpga0: MockPseudoclock::new("fpga0", log.clone()),
            ttl1: MockDevice::new("ttl1", log.clone()),
            dds41: MockDevice::new("dds41", log.clone()),
        }
    }

    pub fn into_registry(self) -> Arc<WorkerRegistry> {
        let mut registry = WorkerRegistry::new();
        registry
            .insert("fpga0", "mock_pseudoclock", self.fpga0.into_components())
            .unwrap();
        registry
            .insert("ttl1", "mock_device", self.ttl1.into_components())
            .unwrap();
        registry
            .insert("dds41", "mock_device", self.dds41.into_components())
            .unwrap();
        Arc::new(registry)
    }
}

/// Submitter that remembers what it was given.
#[derive(Default)]
pub struct RecordingSubmitter {
    pub submitted: Mutex<Vec<ShotId>>,
}

#[async_trait]
impl AnalysisSubmitter for RecordingSubmitter {
    async fn submit(&self, shot: &ShotId) -> anyhow::Result<()> {
        self.submitted.lock().push(shot.clone());
        Ok(())
    }
}

pub struct Harness {
    pub dir: TempDir,
    /// Canonical form of `dir`; admitted identities are canonical paths.
    pub root: PathBuf,
    pub log: CallLog,
    pub manager: QueueManager,
    pub submitter: Arc<RecordingSubmitter>,
}

impl Harness {
    pub fn new(workers: Workers, log: CallLog, settings: QueueSettings) -> Self {
        let submitter = Arc::new(RecordingSubmitter::default());
        let manager = QueueManager::builder(lab_table(), workers.into_registry())
            .settings(settings)
            .submitter(submitter.clone())
            .build()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        Self {
            dir,
            root,
            log,
            manager,
            submitter,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Write `artifact` to `name` and return its path.
    pub fn write(&self, name: &str, artifact: ShotArtifact) -> PathBuf {
        let path = self.path(name);
        write_artifact(&path, &artifact);
        path
    }

    /// Write the standard lab shot to `name`.
    pub fn write_lab_shot(&self, name: &str) -> PathBuf {
        let path = self.path(name);
        write_artifact(&path, &lab_shot(path.clone()));
        path
    }
}

pub fn write_artifact(path: &Path, artifact: &ShotArtifact) {
    std::fs::write(path, serde_json::to_vec_pretty(artifact).unwrap()).unwrap();
}

pub fn fast_settings() -> QueueSettings {
    QueueSettings {
        transition_timeout_ms: 500,
        completion_timeout_ms: 2_000,
        completion_margin_ms: 100,
        teardown_timeout_ms: 200,
        ..Default::default()
    }
}

/// Next `Finished` event, failing the test after a minute of (test) time.
pub async fn next_outcome(events: &mut broadcast::Receiver<ShotEvent>) -> ShotOutcome {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match events.recv().await {
                Ok(ShotEvent::Finished(outcome)) => return outcome,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await
    .expect("no shot finished in time")
}

/// Consume events until the shot in flight reaches `state`.
pub async fn wait_for_state(events: &mut broadcast::Receiver<ShotEvent>, state: shot_queue::ShotState) {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match events.recv().await {
                Ok(ShotEvent::StateChanged { state: s, .. }) if s == state => return,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await
    .expect("state not reached in time")
}
