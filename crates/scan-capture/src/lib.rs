//! Dual-camera capture coordination and illumination gating.
//!
//! - [`dual`]: sequential acquisition from two camera sources sharing a
//!   contended image-processing pipeline, with transient-error retry and
//!   automatic high-resolution downgrade
//! - [`lighting`]: duty-cycle-capped lighting patterns with scoped,
//!   guaranteed-off release
//! - [`mock`]: simulated camera sources and illuminator for tests

pub mod dual;
pub mod lighting;
pub mod mock;

pub use dual::DualCaptureCoordinator;
pub use lighting::{IlluminationGate, LightingGuard};
