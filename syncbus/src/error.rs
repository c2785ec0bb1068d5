//! Cycle-level error taxonomy.
//!
//! Per-thread failures never show up here; they are reported as
//! [`ThreadOutcome`](crate::core::types::ThreadOutcome)s in the cycle summary.

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CycleError {
    /// The inbox could not be enumerated or read.
    #[error("inbox unavailable: {0:#}")]
    SourceUnavailable(#[source] anyhow::Error),

    /// A packet, pointer or directive could not be published.
    #[error("write failed: {0:#}")]
    WriteFailure(#[source] anyhow::Error),

    /// Another invocation holds a fresh BUSY state.
    #[error("another cycle is running (step {step:?}, busy since {since})")]
    AlreadyBusy {
        step: Option<String>,
        since: DateTime<Utc>,
    },

    /// The run-state file could not be read or written.
    #[error("run state unavailable: {0:#}")]
    StateUnavailable(#[source] anyhow::Error),
}

impl CycleError {
    /// Stable snake_case tag for logs and the cycle audit trail.
    pub fn kind(&self) -> &'static str {
        match self {
            CycleError::SourceUnavailable(_) => "source_unavailable",
            CycleError::WriteFailure(_) => "write_failure",
            CycleError::AlreadyBusy { .. } => "already_busy",
            CycleError::StateUnavailable(_) => "state_unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn display_includes_context_chain() {
        let err = CycleError::SourceUnavailable(anyhow!("permission denied").context("read inbox"));
        assert_eq!(
            err.to_string(),
            "inbox unavailable: read inbox: permission denied"
        );
        assert_eq!(err.kind(), "source_unavailable");
    }
}
