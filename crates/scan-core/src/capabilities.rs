//! Capability traits for scanner hardware.
//!
//! Each trait is the fixed seam between the orchestration layers and one
//! kind of device. Real drivers and simulated variants implement the same
//! contract and are selected once at configuration time; nothing in the
//! stack probes for optional methods at runtime.
//!
//! Each capability trait:
//! - Is async (`#[async_trait]`)
//! - Is thread-safe (`Send + Sync`)
//! - Uses `&self` with interior mutability for state

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::ScanResult;
use crate::position::{ConnectionState, HomingState, Position};

// =============================================================================
// Motion
// =============================================================================

/// Capability: the motion-control firmware session.
///
/// Implemented by the serial protocol driver and by the simulated controller
/// used in tests. The orchestrator borrows this for the duration of a scan
/// session without taking ownership of the underlying transport.
///
/// # Contract
/// - All commands are serialized through the implementation's command gate;
///   exactly one command frame is in flight at any time.
/// - `move_to` returns only after arrival is confirmed by the firmware.
/// - Connection loss fails the in-flight operation and leaves the
///   implementation in an error state; callers reconnect explicitly.
#[async_trait]
pub trait MotionController: Send + Sync {
    /// Run the unlock handshake that clears the firmware alarm/lock state.
    ///
    /// Bounded retries with fixed gaps; see the implementation for the exact
    /// budget. Must succeed before [`MotionController::home`] is permitted.
    async fn unlock(&self) -> ScanResult<()>;

    /// Run the homing cycle, driving all axes to the reference position.
    ///
    /// Completion is detected exclusively by the firmware's homing-done
    /// diagnostic marker; transient idle reports never complete homing.
    async fn home(&self) -> ScanResult<()>;

    /// Move all four axes to `target` with a single combined command frame
    /// and wait for arrival confirmation.
    ///
    /// Bounds are validated before anything is written to the wire.
    async fn move_to(&self, target: Position) -> ScanResult<()>;

    /// Last position parsed from a firmware status report.
    ///
    /// Not guaranteed fresh until a report has been received after the last
    /// move; `None` before the first report.
    async fn position(&self) -> Option<Position>;

    /// Current connection state snapshot.
    async fn connection_state(&self) -> ConnectionState;

    /// Current homing state snapshot.
    async fn homing_state(&self) -> HomingState;

    /// Halt any in-flight motion immediately.
    ///
    /// Used by abort handling after a cancelled move; leaves homing state
    /// untouched.
    async fn halt(&self) -> ScanResult<()>;
}

// =============================================================================
// Frame capture
// =============================================================================

/// Classification of a single capture attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Frame acquired.
    Success,
    /// Buffer/ISP contention; retryable once after a buffer flush.
    TransientError,
    /// Device failure; not retried.
    FatalError,
}

/// Why a capture attempt failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CaptureFailure {
    /// ISP or buffer contention. The coordinator flushes buffers and
    /// retries exactly once.
    #[error("transient capture failure: {0}")]
    Transient(String),
    /// Device failure. Propagated without retry.
    #[error("fatal capture failure: {0}")]
    Fatal(String),
}

impl CaptureFailure {
    /// Outcome classification for this failure.
    pub fn outcome(&self) -> CaptureOutcome {
        match self {
            CaptureFailure::Transient(_) => CaptureOutcome::TransientError,
            CaptureFailure::Fatal(_) => CaptureOutcome::FatalError,
        }
    }
}

/// One acquired frame, owned by the capture coordinator until it is handed
/// to the external storage collaborator.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    /// Identifier of the camera that produced the frame.
    pub camera: String,
    /// Acquisition timestamp.
    pub timestamp: DateTime<Utc>,
    /// Attempt classification (always `Success` for stored results).
    pub outcome: CaptureOutcome,
    /// Opaque frame buffer handle.
    pub data: Bytes,
}

/// Capability: one camera source.
///
/// The two scanner cameras share a contended image-processing pipeline, so
/// the coordinator never captures from two sources simultaneously.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Stable camera identifier used in results and error messages.
    fn id(&self) -> &str;

    /// Acquire a single frame.
    ///
    /// `high_res` selects the extended-resolution mode, which needs a longer
    /// settle delay between the two sources.
    async fn capture(&self, high_res: bool) -> Result<CaptureResult, CaptureFailure>;

    /// Release any buffers held in the shared pipeline.
    ///
    /// Called by the coordinator between a transient failure and its single
    /// retry.
    async fn flush_buffers(&self) -> anyhow::Result<()>;
}

// =============================================================================
// Illumination
// =============================================================================

/// A named lighting pattern applied while capturing a scan point.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LightPattern {
    /// Pattern name, for progress reporting.
    pub name: String,
    /// Requested duty cycle in `[0, 1]`. Requests above the configured
    /// thermal cap are clamped, not rejected.
    pub brightness: f64,
    /// How long the pattern stays applied.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Which LED zones participate.
    pub zones: Vec<u8>,
}

impl LightPattern {
    /// Full-brightness pattern on the given zones.
    pub fn full(name: impl Into<String>, zones: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            brightness: 1.0,
            duration: Duration::from_millis(250),
            zones,
        }
    }
}

/// Capability: the illumination driver.
///
/// Implementations only ever see already-clamped brightness values; the
/// thermal duty-cycle cap is enforced by the illumination gate in front of
/// this trait.
#[async_trait]
pub trait Illuminator: Send + Sync {
    /// Apply a lighting pattern.
    async fn apply(&self, pattern: &LightPattern) -> anyhow::Result<()>;

    /// Turn every zone off.
    ///
    /// Must be safe to call redundantly; this is the guaranteed-release path
    /// on every exit from a capture step.
    async fn all_off(&self) -> anyhow::Result<()>;
}
