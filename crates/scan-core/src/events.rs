//! Session progress events.
//!
//! The orchestrator broadcasts one [`ScanEvent`] per observable state
//! change; presentation layers subscribe via a `tokio::sync::broadcast`
//! channel and render progress however they like. Events are fire-and-forget:
//! a lagging or absent subscriber never blocks the scan.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session accepted, not yet started.
    Pending,
    /// Working through scan points.
    Running,
    /// Paused between points; resumable.
    Paused,
    /// All points processed and none failed.
    Completed,
    /// Session stopped on an unrecoverable error or abort-on-error policy.
    Failed,
    /// Session stopped by an abort request.
    Aborted,
}

impl SessionStatus {
    /// Whether the session has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Aborted
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Aborted => "aborted",
        };
        write!(f, "{}", label)
    }
}

/// Progress event emitted by the scan orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    /// The session moved to a new lifecycle state.
    SessionStatusChanged {
        /// New status.
        status: SessionStatus,
    },
    /// Work on a scan point began.
    PointStarted {
        /// Zero-based index into the point sequence.
        index: usize,
    },
    /// A scan point finished successfully.
    PointCompleted {
        /// Zero-based index into the point sequence.
        index: usize,
        /// Whether the point needed its single retry.
        retried: bool,
    },
    /// A scan point failed after its retry and was recorded as failed.
    PointFailed {
        /// Zero-based index into the point sequence.
        index: usize,
        /// Human-readable error detail.
        error: String,
    },
    /// The capture coordinator downgraded from high-resolution to standard
    /// mode after repeated transient pipeline errors.
    ResolutionDowngraded {
        /// Transient errors observed before the downgrade.
        transient_errors: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Aborted.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
    }

    #[test]
    fn events_serialize_tagged() {
        let ev = ScanEvent::PointCompleted {
            index: 3,
            retried: true,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"event\":\"point_completed\""));
        assert!(json.contains("\"index\":3"));
    }
}
