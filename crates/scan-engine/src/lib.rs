//! Scan session orchestration.
//!
//! [`ScanEngine`] drives a configured motion controller, dual-camera
//! capture coordinator, and illumination gate through an ordered list of
//! scan points, with pause/resume, abort, per-point retry, and a broadcast
//! progress stream.

pub mod orchestrator;
pub mod session;

pub use orchestrator::ScanEngine;
pub use session::{PointOutcome, PointRecord, ScanPoint, ScanSession, SessionSummary};
