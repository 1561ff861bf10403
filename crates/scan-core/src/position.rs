//! 4-axis position model and state enums for the motion layer.
//!
//! The mechanism has three linear axes (X, Y, Z) and one rotational axis
//! (A). Any axis may be configured *continuous* by omitting its bounds, in
//! which case it accepts any signed, multi-turn value. By default the
//! rotary A axis is continuous.
//!
//! Bounds are checked with [`AxisLimits::validate`] before a single command
//! frame is written to the wire; a violating target never reaches the
//! firmware.

use serde::{Deserialize, Serialize};

use crate::error::{ScanError, ScanResult};

/// One of the four independently addressable motion degrees of freedom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// Linear X axis.
    X,
    /// Linear Y axis.
    Y,
    /// Linear Z axis.
    Z,
    /// Rotational A axis (continuous by default).
    A,
}

impl Axis {
    /// All axes in command-frame order.
    pub const ALL: [Axis; 4] = [Axis::X, Axis::Y, Axis::Z, Axis::A];

    /// Single-letter label used in command frames and error messages.
    pub fn letter(&self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::A => 'A',
        }
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// A target or reported position on all four axes.
///
/// Linear values are in millimetres, the A axis in degrees. Multi-turn and
/// negative values are meaningful on a continuous axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Linear X coordinate (mm).
    pub x: f64,
    /// Linear Y coordinate (mm).
    pub y: f64,
    /// Linear Z coordinate (mm).
    pub z: f64,
    /// Rotational A coordinate (degrees).
    pub a: f64,
}

impl Position {
    /// Construct a position from the four axis coordinates.
    pub fn new(x: f64, y: f64, z: f64, a: f64) -> Self {
        Self { x, y, z, a }
    }

    /// All-zero position (the machine origin after homing).
    pub fn origin() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0)
    }

    /// Coordinate along a single axis.
    pub fn axis(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
            Axis::A => self.a,
        }
    }

    /// Whether every coordinate is within `tolerance` of `other`.
    ///
    /// Used for arrival confirmation: firmware position reports are quantized,
    /// so exact equality is never the right check.
    pub fn approx_eq(&self, other: &Position, tolerance: f64) -> bool {
        Axis::ALL
            .iter()
            .all(|&ax| (self.axis(ax) - other.axis(ax)).abs() <= tolerance)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "X{:.3} Y{:.3} Z{:.3} A{:.3}",
            self.x, self.y, self.z, self.a
        )
    }
}

/// Travel bounds for a single axis.
///
/// Either bound may be omitted; an axis with no bounds at all is
/// *continuous* and accepts any signed value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisBounds {
    /// Minimum allowed coordinate, if bounded below.
    pub min: Option<f64>,
    /// Maximum allowed coordinate, if bounded above.
    pub max: Option<f64>,
}

impl AxisBounds {
    /// Bounded on both sides.
    pub fn range(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    /// No bounds: the axis is continuous.
    pub fn continuous() -> Self {
        Self::default()
    }

    /// Whether this axis has no configured bounds.
    pub fn is_continuous(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }
}

/// Per-axis travel bounds for the whole mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisLimits {
    /// Bounds for the linear X axis.
    #[serde(default)]
    pub x: AxisBounds,
    /// Bounds for the linear Y axis.
    #[serde(default)]
    pub y: AxisBounds,
    /// Bounds for the linear Z axis.
    #[serde(default)]
    pub z: AxisBounds,
    /// Bounds for the rotational A axis.
    #[serde(default)]
    pub a: AxisBounds,
}

impl Default for AxisLimits {
    /// 200 mm of travel on each linear axis, continuous rotary axis.
    fn default() -> Self {
        Self {
            x: AxisBounds::range(0.0, 200.0),
            y: AxisBounds::range(0.0, 200.0),
            z: AxisBounds::range(0.0, 200.0),
            a: AxisBounds::continuous(),
        }
    }
}

impl AxisLimits {
    /// Bounds for a single axis.
    pub fn bounds(&self, axis: Axis) -> AxisBounds {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
            Axis::A => self.a,
        }
    }

    /// Check a target position against the configured bounds.
    ///
    /// Returns the first violation found, naming the offending axis. A
    /// continuous axis accepts any value, including negative and multi-turn
    /// targets.
    pub fn validate(&self, position: &Position) -> ScanResult<()> {
        for axis in Axis::ALL {
            let bounds = self.bounds(axis);
            let value = position.axis(axis);

            if let Some(min) = bounds.min {
                if value < min {
                    return Err(ScanError::OutOfBounds {
                        axis,
                        value,
                        min,
                        max: bounds.max.unwrap_or(f64::INFINITY),
                    });
                }
            }
            if let Some(max) = bounds.max {
                if value > max {
                    return Err(ScanError::OutOfBounds {
                        axis,
                        value,
                        min: bounds.min.unwrap_or(f64::NEG_INFINITY),
                        max,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Connection state of the motion link.
///
/// Owned exclusively by the protocol state machine; transitions only
/// through connect/disconnect or a detected link fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport open.
    Disconnected,
    /// Transport opening / readability probe in progress.
    Connecting,
    /// Transport open and confirmed readable.
    Connected,
    /// A link fault was detected; an explicit reconnect is required.
    Error,
}

/// Progress of the unlock/home recovery sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HomingState {
    /// Nothing in progress; homing has not completed since (re)connect.
    Idle,
    /// Unlock handshake in progress.
    Unlocking,
    /// Homing cycle running; completion only on the firmware marker.
    Homing,
    /// Homing completed and the machine origin is established.
    Homed,
    /// Unlock or homing failed; the firmware is in an alarm/lock state.
    Alarm,
}

impl std::fmt::Display for HomingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            HomingState::Idle => "idle",
            HomingState::Unlocking => "unlocking",
            HomingState::Homing => "homing",
            HomingState::Homed => "homed",
            HomingState::Alarm => "alarm",
        };
        write!(f, "{}", label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_within_bounds_validates() {
        let limits = AxisLimits::default();
        let pos = Position::new(10.0, 50.0, 199.9, 0.0);
        assert!(limits.validate(&pos).is_ok());
    }

    #[test]
    fn target_beyond_max_fails_naming_axis() {
        let limits = AxisLimits::default();
        let pos = Position::new(250.0, 0.0, 0.0, 0.0);
        match limits.validate(&pos) {
            Err(ScanError::OutOfBounds {
                axis, value, max, ..
            }) => {
                assert_eq!(axis, Axis::X);
                assert_eq!(value, 250.0);
                assert_eq!(max, 200.0);
            }
            other => panic!("expected OutOfBounds, got {:?}", other),
        }
    }

    #[test]
    fn continuous_axis_accepts_multi_turn_and_negative() {
        let limits = AxisLimits::default();
        assert!(limits.validate(&Position::new(0.0, 0.0, 0.0, 720.0)).is_ok());
        assert!(limits
            .validate(&Position::new(0.0, 0.0, 0.0, -270.0))
            .is_ok());
    }

    #[test]
    fn bounded_rotary_axis_rejects_out_of_range() {
        let limits = AxisLimits {
            a: AxisBounds::range(0.0, 360.0),
            ..AxisLimits::default()
        };
        match limits.validate(&Position::new(0.0, 0.0, 0.0, 720.0)) {
            Err(ScanError::OutOfBounds { axis, .. }) => assert_eq!(axis, Axis::A),
            other => panic!("expected OutOfBounds, got {:?}", other),
        }
    }

    #[test]
    fn below_min_fails() {
        let limits = AxisLimits::default();
        match limits.validate(&Position::new(0.0, -0.5, 0.0, 0.0)) {
            Err(ScanError::OutOfBounds { axis, min, .. }) => {
                assert_eq!(axis, Axis::Y);
                assert_eq!(min, 0.0);
            }
            other => panic!("expected OutOfBounds, got {:?}", other),
        }
    }

    #[test]
    fn approx_eq_within_tolerance() {
        let a = Position::new(1.0, 2.0, 3.0, 90.0);
        let b = Position::new(1.004, 1.996, 3.0, 90.002);
        assert!(a.approx_eq(&b, 0.01));
        assert!(!a.approx_eq(&b, 0.001));
    }
}
