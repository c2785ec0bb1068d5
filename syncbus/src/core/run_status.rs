//! Busy/idle status and stale-busy detection.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Idle,
    Busy,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Idle => "IDLE",
            RunStatus::Busy => "BUSY",
        }
    }
}

/// Note left behind when a crashed run's BUSY state was cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleRecovery {
    pub recovered_at: DateTime<Utc>,
    /// `updated_at` of the abandoned BUSY state.
    pub stale_since: DateTime<Utc>,
    /// Step the crashed run was in, if it recorded one.
    pub step: Option<String>,
    pub pid: Option<u32>,
}

/// A BUSY state is stale once it has not been touched for `threshold`.
///
/// Timestamps in the future (clock skew between hosts) count as fresh.
pub fn is_stale(
    status: RunStatus,
    updated_at: DateTime<Utc>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> bool {
    status == RunStatus::Busy && now.signed_duration_since(updated_at) > threshold
}
