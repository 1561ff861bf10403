//! Scanner configuration loading and validation.
//!
//! Configuration comes from a TOML file merged with `SCAN_`-prefixed
//! environment overrides (figment). Values that parse but are logically
//! wrong (a duty cycle above 1.0, inverted axis bounds, a zero baud rate)
//! are caught by [`ScannerConfig::validate`] before any hardware is touched.
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud = 115200
//! command_timeout = "5s"
//!
//! [limits.x]
//! min = 0.0
//! max = 200.0
//!
//! # Omit bounds entirely for a continuous axis:
//! [limits.a]
//!
//! [capture]
//! high_res = true
//!
//! [lighting]
//! max_duty_cycle = 0.89
//!
//! [scan]
//! abort_on_error = false
//! ```

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ScanError, ScanResult};
use crate::position::{Axis, AxisLimits};

/// Serial link parameters for the motion controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM3").
    pub port: String,
    /// Baud rate.
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Per-command response timeout.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
}

fn default_baud() -> u32 {
    115_200
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: default_baud(),
            command_timeout: default_command_timeout(),
        }
    }
}

/// Camera capture parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Start the session in high-resolution mode.
    #[serde(default)]
    pub high_res: bool,
    /// Settle delay between the two sequential captures, standard mode.
    #[serde(default = "default_settle_delay", with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Settle delay between captures in high-resolution mode.
    #[serde(default = "default_high_res_settle_delay", with = "humantime_serde")]
    pub high_res_settle_delay: Duration,
    /// Tolerance for cross-camera timestamp alignment, used by downstream
    /// consumers pairing the two frames of one point.
    #[serde(default = "default_sync_tolerance", with = "humantime_serde")]
    pub sync_tolerance: Duration,
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_high_res_settle_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_sync_tolerance() -> Duration {
    Duration::from_millis(50)
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            high_res: false,
            settle_delay: default_settle_delay(),
            high_res_settle_delay: default_high_res_settle_delay(),
            sync_tolerance: default_sync_tolerance(),
        }
    }
}

/// Illumination safety parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LightingConfig {
    /// Maximum LED duty cycle. Requests above this are clamped, not
    /// rejected; the cap exists to prevent thermal damage.
    #[serde(default = "default_max_duty_cycle")]
    pub max_duty_cycle: f64,
}

fn default_max_duty_cycle() -> f64 {
    0.89
}

impl Default for LightingConfig {
    fn default() -> Self {
        Self {
            max_duty_cycle: default_max_duty_cycle(),
        }
    }
}

/// Session-level scan policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanPolicy {
    /// Fail the whole session on the first point that exhausts its retry,
    /// instead of recording the failure and continuing.
    #[serde(default)]
    pub abort_on_error: bool,
    /// Positional tolerance for arrival confirmation.
    #[serde(default = "default_arrival_tolerance")]
    pub arrival_tolerance: f64,
    /// How long to wait for arrival confirmation after a move command.
    #[serde(default = "default_arrival_timeout", with = "humantime_serde")]
    pub arrival_timeout: Duration,
}

fn default_arrival_tolerance() -> f64 {
    0.01
}

fn default_arrival_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            abort_on_error: false,
            arrival_tolerance: default_arrival_tolerance(),
            arrival_timeout: default_arrival_timeout(),
        }
    }
}

/// Top-level scanner configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Serial link parameters.
    #[serde(default)]
    pub serial: SerialConfig,
    /// Per-axis travel bounds.
    #[serde(default)]
    pub limits: AxisLimits,
    /// Camera capture parameters.
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Illumination safety parameters.
    #[serde(default)]
    pub lighting: LightingConfig,
    /// Session-level scan policy.
    #[serde(default)]
    pub scan: ScanPolicy,
}

impl ScannerConfig {
    /// Load configuration from a TOML file, with `SCAN_`-prefixed
    /// environment variables overriding file values
    /// (e.g. `SCAN_SERIAL__PORT=/dev/ttyACM0`).
    pub fn load(path: impl AsRef<Path>) -> ScanResult<Self> {
        let config: ScannerConfig = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SCAN_").split("__"))
            .extract()
            .map_err(|e| ScanError::Config(e.to_string()))?;
        config.validate()?;
        tracing::debug!(port = %config.serial.port, baud = config.serial.baud, "Loaded scanner configuration");
        Ok(config)
    }

    /// Semantic validation beyond what serde checks.
    pub fn validate(&self) -> ScanResult<()> {
        if self.serial.baud == 0 {
            return Err(ScanError::Config("serial.baud must be nonzero".into()));
        }
        if !(0.0..=1.0).contains(&self.lighting.max_duty_cycle)
            || self.lighting.max_duty_cycle == 0.0
        {
            return Err(ScanError::Config(format!(
                "lighting.max_duty_cycle must be in (0, 1], got {}",
                self.lighting.max_duty_cycle
            )));
        }
        for axis in Axis::ALL {
            let bounds = self.limits.bounds(axis);
            if let (Some(min), Some(max)) = (bounds.min, bounds.max) {
                if min >= max {
                    return Err(ScanError::Config(format!(
                        "limits.{}: min {} must be below max {}",
                        axis.letter().to_ascii_lowercase(),
                        min,
                        max
                    )));
                }
            }
        }
        if self.scan.arrival_tolerance <= 0.0 {
            return Err(ScanError::Config(
                "scan.arrival_tolerance must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Settle delay for the active capture mode.
    pub fn settle_delay(&self, high_res: bool) -> Duration {
        if high_res {
            self.capture.high_res_settle_delay
        } else {
            self.capture.settle_delay
        }
    }
}
