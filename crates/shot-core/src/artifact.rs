//! Shot artifacts and their file-backed store.
//!
//! A shot artifact is the compiled description of one experiment run: the
//! connection table it was compiled against, one instruction table per device,
//! the global parameters, and, once it has been run, a results marker.
//!
//! The queue only ever reads artifacts, with two exceptions delegated to the
//! store: writing a stripped copy when a duplicate is admitted, and appending
//! results after a clean run.

use crate::connection_table::ConnectionTable;
use crate::error::{ShotError, ShotResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Last known output value of every channel of one device.
pub type FinalValues = BTreeMap<String, f64>;

/// Identity of a shot: the path of its artifact file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShotId(PathBuf);

impl ShotId {
    /// Wrap an artifact path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Artifact path.
    pub fn path(&self) -> &Path {
        &self.0
    }

    /// File name component, e.g. `scanA.h5`.
    pub fn file_name(&self) -> &str {
        self.0
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// Identity of the `n`th numbered copy of this shot.
    ///
    /// Any existing `_repNNNNN` suffix is stripped first, so copies of copies
    /// stay in the same numbering family: `scanA_rep00001.h5` → `scanA_rep00002.h5`.
    pub fn repeat(&self, n: u32) -> ShotId {
        let stem = self
            .0
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let base = strip_repeat_suffix(stem);
        let file_name = match self.0.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{base}_rep{n:05}.{ext}"),
            None => format!("{base}_rep{n:05}"),
        };
        ShotId(self.0.with_file_name(file_name))
    }
}

impl fmt::Display for ShotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<&str> for ShotId {
    fn from(s: &str) -> Self {
        ShotId::new(s)
    }
}

impl From<PathBuf> for ShotId {
    fn from(p: PathBuf) -> Self {
        ShotId(p)
    }
}

fn strip_repeat_suffix(stem: &str) -> &str {
    if let Some(idx) = stem.rfind("_rep") {
        let digits = &stem[idx + 4..];
        if digits.len() == 5 && digits.bytes().all(|b| b.is_ascii_digit()) {
            return &stem[..idx];
        }
    }
    stem
}

/// Results marker appended to an artifact after a clean run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotResults {
    /// Run identifier assigned by the queue
    pub run_uid: String,
    /// Completion time
    pub completed_at: DateTime<Utc>,
    /// Final output state of every participating device
    pub final_values: BTreeMap<String, FinalValues>,
}

/// Compiled description of one shot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotArtifact {
    /// Identity; not stored in the file, restored from the path on load
    #[serde(skip, default = "ShotArtifact::unbound_id")]
    pub id: ShotId,

    /// Topology the shot was compiled against
    pub connection_table: ConnectionTable,

    /// Buffered instruction table per device
    #[serde(default)]
    pub devices: BTreeMap<String, serde_json::Value>,

    /// Global parameters of the sequence
    #[serde(default)]
    pub globals: BTreeMap<String, serde_json::Value>,

    /// Nominal run length, used to bound the completion wait
    #[serde(default)]
    pub expected_duration_ms: Option<u64>,

    /// Present once the shot has been run
    #[serde(default)]
    pub results: Option<ShotResults>,
}

impl ShotArtifact {
    fn unbound_id() -> ShotId {
        ShotId::new("")
    }

    /// Build an artifact with no instructions.
    pub fn new(id: impl Into<ShotId>, connection_table: ConnectionTable) -> Self {
        Self {
            id: id.into(),
            connection_table,
            devices: BTreeMap::new(),
            globals: BTreeMap::new(),
            expected_duration_ms: None,
            results: None,
        }
    }

    /// Add an instruction table for a device.
    pub fn with_instructions(mut self, device: impl Into<String>, table: serde_json::Value) -> Self {
        self.devices.insert(device.into(), table);
        self
    }

    /// Set a global parameter.
    pub fn with_global(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.globals.insert(name.into(), value);
        self
    }

    /// Set the nominal run length.
    pub fn with_expected_duration_ms(mut self, ms: u64) -> Self {
        self.expected_duration_ms = Some(ms);
        self
    }

    /// True if this artifact has already been run.
    pub fn has_results(&self) -> bool {
        self.results.is_some()
    }

    /// Instruction table for one device.
    pub fn instructions(&self, device: &str) -> Option<&serde_json::Value> {
        self.devices.get(device)
    }

    /// Copy under a new identity with results stripped.
    pub fn stripped_copy(&self, id: ShotId) -> ShotArtifact {
        ShotArtifact {
            id,
            results: None,
            ..self.clone()
        }
    }
}

/// Read/clone access to artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Canonical identity for `id`, so that two spellings of one artifact
    /// compare equal.
    async fn resolve(&self, id: &ShotId) -> ShotResult<ShotId>;

    /// Load an artifact; the returned value carries `id`.
    async fn load(&self, id: &ShotId) -> ShotResult<ShotArtifact>;

    /// True if an artifact already exists under this identity.
    async fn exists(&self, id: &ShotId) -> bool;

    /// Persist `artifact` under its own `id`. Must not overwrite.
    async fn write_clone(&self, artifact: &ShotArtifact) -> ShotResult<()>;
}

/// External writer for post-run results.
#[async_trait]
pub trait ResultsWriter: Send + Sync {
    /// Append final values and the results marker to an artifact.
    async fn append_results(&self, id: &ShotId, results: &ShotResults) -> ShotResult<()>;
}

/// JSON-on-disk artifact store on `tokio::fs`.
///
/// Each artifact is one JSON document; the file extension is not interpreted.
#[derive(Debug, Clone, Default)]
pub struct FileArtifactStore;

impl FileArtifactStore {
    /// Create a store.
    pub fn new() -> Self {
        Self
    }

    async fn write(&self, artifact: &ShotArtifact, create_new: bool) -> ShotResult<()> {
        let json = serde_json::to_vec_pretty(artifact)
            .map_err(|e| ShotError::Artifact(format!("Failed to encode {}: {}", artifact.id, e)))?;

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true);
        if create_new {
            options.create_new(true);
        } else {
            options.create(true).truncate(true);
        }

        let write_err =
            |e: std::io::Error| ShotError::Artifact(format!("Failed to write {}: {}", artifact.id, e));
        let mut file = options
            .open(artifact.id.path())
            .await
            .map_err(|e| ShotError::Artifact(format!("Failed to open {}: {}", artifact.id, e)))?;
        file.write_all(&json).await.map_err(write_err)?;
        file.flush().await.map_err(write_err)
    }
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn resolve(&self, id: &ShotId) -> ShotResult<ShotId> {
        tokio::fs::canonicalize(id.path())
            .await
            .map(ShotId::from)
            .map_err(|e| ShotError::Artifact(format!("Failed to resolve {}: {}", id, e)))
    }

    async fn load(&self, id: &ShotId) -> ShotResult<ShotArtifact> {
        let text = tokio::fs::read_to_string(id.path())
            .await
            .map_err(|e| ShotError::Artifact(format!("Failed to read {}: {}", id, e)))?;
        let mut artifact: ShotArtifact = serde_json::from_str(&text)
            .map_err(|e| ShotError::Artifact(format!("Failed to parse {}: {}", id, e)))?;
        artifact.id = id.clone();
        debug!(shot = %id, devices = artifact.devices.len(), "Loaded shot artifact");
        Ok(artifact)
    }

    async fn exists(&self, id: &ShotId) -> bool {
        tokio::fs::try_exists(id.path()).await.unwrap_or(false)
    }

    async fn write_clone(&self, artifact: &ShotArtifact) -> ShotResult<()> {
        self.write(artifact, true).await
    }
}

#[async_trait]
impl ResultsWriter for FileArtifactStore {
    async fn append_results(&self, id: &ShotId, results: &ShotResults) -> ShotResult<()> {
        let mut artifact = self.load(id).await?;
        artifact.results = Some(results.clone());
        self.write(&artifact, false).await
    }
}
