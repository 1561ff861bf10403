//! Wire-level framing and parsing for the motion firmware protocol.
//!
//! Protocol overview:
//! - Format: ASCII command/response, line-delimited
//! - Commands: `$X` (unlock), `$H` (home), `G90 G0 X.. Y.. Z.. A..` (one
//!   combined move frame for all four axes)
//! - `?` is a real-time status query; the firmware answers with a report
//!   line `<State|MPos:x,y,z,a|...>`
//! - Acknowledgment: a bare `ok` line; failures are `error:N` / `ALARM:N`
//! - Homing completion is announced only by a diagnostic message containing
//!   [`HOMING_DONE_MARKER`]; an idle status report during homing means
//!   nothing and must be ignored

use scan_core::position::Position;

/// Unlock frame clearing the firmware alarm/lock state.
pub const UNLOCK_FRAME: &str = "$X";

/// Homing cycle frame.
pub const HOME_FRAME: &str = "$H";

/// Real-time status query byte (no line terminator required).
pub const STATUS_QUERY: u8 = b'?';

/// Real-time soft-reset byte; halts motion and clears the planner.
pub const SOFT_RESET: u8 = 0x18;

/// Acknowledgment token terminating a successful command.
pub const ACK_TOKEN: &str = "ok";

/// Idle machine-state token inside status reports.
pub const IDLE_TOKEN: &str = "Idle";

/// Diagnostic substring that alone signals homing completion.
///
/// A bare idle status is never accepted as a completion signal; the
/// firmware reports idle mid-cycle between axes.
pub const HOMING_DONE_MARKER: &str = "MSG:DBG: Homing done";

/// Machine state token from a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// Stationary, ready for commands.
    Idle,
    /// Executing motion.
    Run,
    /// Homing cycle in progress.
    Home,
    /// Alarm/lock state; unlock required.
    Alarm,
    /// Any other reported state (Jog, Hold, Door, ...).
    Other,
}

impl MachineState {
    fn parse(token: &str) -> MachineState {
        // Status states may carry a sub-code, e.g. "Hold:0".
        match token.split(':').next().unwrap_or(token) {
            "Idle" => MachineState::Idle,
            "Run" => MachineState::Run,
            "Home" => MachineState::Home,
            "Alarm" => MachineState::Alarm,
            _ => MachineState::Other,
        }
    }
}

/// A parsed `<State|MPos:...>` status report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusReport {
    /// Reported machine state.
    pub state: MachineState,
    /// Reported machine position, if the report carried an `MPos:` field.
    pub position: Option<Position>,
}

/// Build the combined move frame for all four axes.
///
/// One frame per target, never one frame per axis: multi-axis repositioning
/// over four round-trips adds enough latency to trip response timeouts.
pub fn build_move_frame(target: &Position) -> String {
    format!(
        "G90 G0 X{:.3} Y{:.3} Z{:.3} A{:.3}",
        target.x, target.y, target.z, target.a
    )
}

/// Whether a received line is the bare acknowledgment.
pub fn is_ack(line: &str) -> bool {
    line.trim() == ACK_TOKEN
}

/// Extract the failure detail if the line is an `error:`/`ALARM:` response.
pub fn parse_fault(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.starts_with("error:") || trimmed.starts_with("ALARM:") {
        Some(trimmed)
    } else {
        None
    }
}

/// Whether incoming traffic carries the homing completion marker.
pub fn is_homing_done(line: &str) -> bool {
    line.contains(HOMING_DONE_MARKER)
}

/// Parse a status report line, if the line is one.
///
/// Returns `None` for anything that is not a `<...>` report. A report with
/// an unparsable `MPos:` field still yields the state with no position.
pub fn parse_status_report(line: &str) -> Option<StatusReport> {
    let trimmed = line.trim();
    let body = trimmed.strip_prefix('<')?.strip_suffix('>')?;

    let mut fields = body.split('|');
    let state = MachineState::parse(fields.next()?);

    let position = fields
        .find_map(|f| f.strip_prefix("MPos:"))
        .and_then(parse_mpos);

    Some(StatusReport { state, position })
}

fn parse_mpos(coords: &str) -> Option<Position> {
    let mut values = coords.split(',').map(|v| v.trim().parse::<f64>());
    let x = values.next()?.ok()?;
    let y = values.next()?.ok()?;
    let z = values.next()?.ok()?;
    let a = values.next()?.ok()?;
    Some(Position::new(x, y, z, a))
}
