//! GRBL-class motion controller protocol driver.
//!
//! This crate owns the command/response session with the motion firmware:
//!
//! - [`frame`]: command framing and response/status-report parsing
//! - [`gate`]: the command gate serializing every outgoing frame
//! - [`controller`]: the protocol state machine (connect, unlock, home,
//!   combined 4-axis moves, arrival confirmation)
//! - [`mock`]: a simulated controller implementing the same
//!   [`MotionController`](scan_core::MotionController) contract, selected at
//!   configuration time instead of the serial driver

pub mod controller;
pub mod frame;
pub mod gate;
pub mod mock;

pub use controller::GrblController;
pub use gate::CommandGate;
pub use mock::MockScannerController;
