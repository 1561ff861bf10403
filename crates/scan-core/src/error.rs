//! Error types shared across the scanner stack.
//!
//! [`ScanError`] is the single error enum used by the motion protocol,
//! capture coordination, and scan orchestration layers. Every variant
//! carries enough context (axis name, attempt count, elapsed time) to be
//! actionable without re-running the operation that produced it.
//!
//! Rough categories:
//!
//! - **Link faults** (`Connection`, `Unresponsive`, `Io`): the serial link
//!   is gone or silent. The in-flight operation fails and callers must
//!   reconnect explicitly; nothing auto-reconnects underneath them.
//! - **Protocol faults** (`Protocol`, `UnlockFailed`, `HomingTimeout`):
//!   the firmware answered wrongly, or a documented attempt/time budget was
//!   exhausted. Never retried beyond the budgets stated on each operation.
//! - **Pre-flight faults** (`OutOfBounds`, `Config`): caught before any
//!   command frame is written to the wire.
//! - **Session outcomes** (`Capture`, `PartialScan`, `Aborted`): recorded by
//!   the orchestrator; point-level failures do not crash the session unless
//!   abort-on-error is configured.

use std::time::Duration;
use thiserror::Error;

use crate::position::Axis;

/// Convenience alias for results using the scanner error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Primary error type for the scanner stack.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The serial transport could not be opened, or the link dropped
    /// mid-operation. Requires an explicit reconnect.
    #[error("connection error: {0}")]
    Connection(String),

    /// The firmware sent a malformed or unmatched response frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The unlock handshake was attempted the documented number of times
    /// without a valid acknowledgment.
    #[error("unlock failed after {attempts} attempts")]
    UnlockFailed {
        /// Number of unlock frames sent before giving up.
        attempts: u32,
    },

    /// The homing cycle did not report completion within the per-axis
    /// time budget.
    #[error("homing did not complete within {budget:?} (elapsed {elapsed:?})")]
    HomingTimeout {
        /// Wall time spent waiting for the completion marker.
        elapsed: Duration,
        /// Configured budget (per-axis allowance times axis count).
        budget: Duration,
    },

    /// The device produced no traffic of any kind for longer than the
    /// silence budget. Distinct from [`ScanError::HomingTimeout`]: a device
    /// that keeps streaming status reports but never finishes is slow, one
    /// that goes quiet is gone.
    #[error("device unresponsive: no traffic for {silence:?}")]
    Unresponsive {
        /// How long the line was silent before we gave up.
        silence: Duration,
    },

    /// A target position violates the configured bounds for an axis.
    /// Raised before any command is issued.
    #[error("axis {axis} target {value} outside bounds [{min}, {max}]")]
    OutOfBounds {
        /// The offending axis.
        axis: Axis,
        /// Requested target value.
        value: f64,
        /// Configured lower bound.
        min: f64,
        /// Configured upper bound.
        max: f64,
    },

    /// A camera capture attempt failed.
    #[error("capture error on camera '{camera}' ({}): {message}", if *.transient { "transient" } else { "fatal" })]
    Capture {
        /// Identifier of the camera that failed.
        camera: String,
        /// Transient errors (ISP/buffer contention) are retried once;
        /// fatal errors are not.
        transient: bool,
        /// Device-reported detail.
        message: String,
    },

    /// The illumination driver rejected a pattern or failed to switch off.
    #[error("illumination error: {0}")]
    Lighting(String),

    /// A new session was requested while another is running or paused.
    #[error("a scan session is already active")]
    SessionActive,

    /// One or more scan points failed but the session ran to the end.
    #[error("scan completed with {failed} of {total} points failed")]
    PartialScan {
        /// Points whose final record is a failure.
        failed: usize,
        /// Total points in the session.
        total: usize,
    },

    /// The session was aborted by the caller.
    #[error("scan aborted")]
    Aborted,

    /// Configuration parsed but failed semantic validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying I/O failure on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScanError {
    /// Whether the session-level policy may retry the operation that
    /// produced this error. Link faults and pre-flight faults are not
    /// retryable at point level; transient capture errors are.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScanError::Capture {
                transient: true,
                ..
            }
        )
    }

    /// Whether this error means the serial link itself is gone or silent.
    ///
    /// Link faults are fatal to a running session: no point-level retry,
    /// and the orchestrator finishes the session as failed.
    pub fn is_link_fault(&self) -> bool {
        matches!(
            self,
            ScanError::Connection(_) | ScanError::Unresponsive { .. } | ScanError::Io(_)
        )
    }
}
