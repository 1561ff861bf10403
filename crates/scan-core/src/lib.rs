//! Core types and traits for the scanbench motion/capture stack.
//!
//! This crate holds everything the higher layers agree on without knowing
//! about each other:
//!
//! - [`error`]: the [`ScanError`](error::ScanError) taxonomy shared by every
//!   component
//! - [`position`]: the 4-axis position model and per-axis bounds checking
//! - [`capabilities`]: async trait seams for motion, frame capture, and
//!   illumination hardware (real and mock variants implement the same
//!   contract, selected once at configuration time)
//! - [`config`]: TOML + environment configuration loading and validation
//! - [`events`]: session progress events broadcast to presentation layers
//! - [`transport`] (feature `serial`): shared async serial port plumbing
//!   used by the protocol driver crate

pub mod capabilities;
pub mod config;
pub mod error;
pub mod events;
pub mod position;

#[cfg(feature = "serial")]
pub mod transport;

pub use capabilities::{
    CaptureFailure, CaptureOutcome, CaptureResult, FrameSource, Illuminator, LightPattern,
    MotionController,
};
pub use config::ScannerConfig;
pub use error::{ScanError, ScanResult};
pub use events::{ScanEvent, SessionStatus};
pub use position::{Axis, AxisLimits, ConnectionState, HomingState, Position};
