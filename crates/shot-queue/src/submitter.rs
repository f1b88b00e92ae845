//! Hand-off of completed shots to analysis.

use async_trait::async_trait;
use shot_core::ShotId;
use tracing::info;

/// Downstream consumer notified once per completed shot.
///
/// The queue logs a failed submission and carries on; nothing it returns
/// changes the shot's outcome.
#[async_trait]
pub trait AnalysisSubmitter: Send + Sync {
    /// Submit a completed shot.
    async fn submit(&self, shot: &ShotId) -> anyhow::Result<()>;
}

/// Default submitter: records the hand-off in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingAnalysisSubmitter;

#[async_trait]
impl AnalysisSubmitter for LoggingAnalysisSubmitter {
    async fn submit(&self, shot: &ShotId) -> anyhow::Result<()> {
        info!(shot = %shot, "Shot ready for analysis");
        Ok(())
    }
}
