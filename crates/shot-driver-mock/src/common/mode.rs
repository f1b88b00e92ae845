//! Operational modes for mock devices.
//!
//! - **Instant**: only the configured delays, deterministic, for unit tests
//! - **Realistic**: configured delays plus seeded jitter, for integration runs

use serde::Deserialize;

/// Operational modes for mock devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockMode {
    /// Configured delays only - for unit tests
    #[default]
    Instant,
    /// Configured delays plus jitter - for integration runs
    Realistic,
}
