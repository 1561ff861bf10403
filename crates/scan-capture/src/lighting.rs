//! Duty-cycle-capped illumination with guaranteed-off release.
//!
//! [`IlluminationGate`] sits in front of the raw [`Illuminator`] and
//! enforces the thermal duty-cycle cap: a requested brightness above the
//! cap is clamped down, never rejected. Applying a pattern yields a
//! [`LightingGuard`]; the lights go off when the guard is released, and
//! the guard's `Drop` impl schedules the off command even when the holding
//! future is cancelled mid-capture.

use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

use scan_core::capabilities::{Illuminator, LightPattern};

/// Enforces the thermal duty-cycle cap in front of the illumination driver.
pub struct IlluminationGate {
    illuminator: Arc<dyn Illuminator>,
    max_duty_cycle: f64,
}

impl IlluminationGate {
    pub fn new(illuminator: Arc<dyn Illuminator>, max_duty_cycle: f64) -> Self {
        Self {
            illuminator,
            max_duty_cycle,
        }
    }

    /// Clamp a pattern's brightness to the thermal cap.
    fn clamp(&self, pattern: &LightPattern) -> LightPattern {
        let mut clamped = pattern.clone();
        if clamped.brightness > self.max_duty_cycle {
            warn!(
                pattern = %pattern.name,
                requested = pattern.brightness,
                cap = self.max_duty_cycle,
                "Brightness above thermal duty-cycle cap, clamping"
            );
            clamped.brightness = self.max_duty_cycle;
        }
        clamped
    }

    /// Apply a pattern and hand back the guard that turns it off.
    ///
    /// If the driver rejects the pattern the gate issues an `all_off`
    /// before returning the error, so a partially applied pattern never
    /// stays lit.
    #[instrument(skip(self, pattern), fields(pattern = %pattern.name), err)]
    pub async fn apply(&self, pattern: &LightPattern) -> anyhow::Result<LightingGuard> {
        let clamped = self.clamp(pattern);
        if let Err(e) = self.illuminator.apply(&clamped).await {
            if let Err(off_err) = self.illuminator.all_off().await {
                error!(%off_err, "Failed to force lights off after apply error");
            }
            return Err(e);
        }
        debug!(brightness = clamped.brightness, "Pattern applied");
        Ok(LightingGuard {
            illuminator: self.illuminator.clone(),
            released: false,
        })
    }
}

/// Scoped handle over an applied lighting pattern.
///
/// Prefer [`LightingGuard::release`], which awaits the off command and
/// surfaces its error. Dropping the guard without releasing it spawns the
/// off command on the current runtime instead, covering cancellation paths
/// where no one is left to await it.
#[must_use = "lights stay on until the guard is released or dropped"]
pub struct LightingGuard {
    illuminator: Arc<dyn Illuminator>,
    released: bool,
}

impl LightingGuard {
    /// Turn every zone off and consume the guard.
    pub async fn release(mut self) -> anyhow::Result<()> {
        self.released = true;
        self.illuminator.all_off().await
    }
}

impl Drop for LightingGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let illuminator = self.illuminator.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = illuminator.all_off().await {
                        error!(%e, "Failed to force lights off on guard drop");
                    }
                });
            }
            Err(_) => {
                error!("Lighting guard dropped outside a runtime; lights may stay on");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockIlluminator;
    use std::time::Duration;

    #[tokio::test]
    async fn brightness_above_cap_is_clamped_not_rejected() {
        let illuminator = Arc::new(MockIlluminator::new());
        let gate = IlluminationGate::new(illuminator.clone(), 0.89);

        let guard = gate
            .apply(&LightPattern::full("ring", vec![0, 1]))
            .await
            .unwrap();

        let applied = illuminator.applied().await;
        assert_eq!(applied.len(), 1);
        assert!((applied[0].brightness - 0.89).abs() < 1e-9);
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn brightness_below_cap_passes_unchanged() {
        let illuminator = Arc::new(MockIlluminator::new());
        let gate = IlluminationGate::new(illuminator.clone(), 0.89);

        let pattern = LightPattern {
            name: "dim".into(),
            brightness: 0.4,
            duration: Duration::from_millis(100),
            zones: vec![2],
        };
        let guard = gate.apply(&pattern).await.unwrap();

        let applied = illuminator.applied().await;
        assert!((applied[0].brightness - 0.4).abs() < 1e-9);
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn release_turns_lights_off() {
        let illuminator = Arc::new(MockIlluminator::new());
        let gate = IlluminationGate::new(illuminator.clone(), 0.89);

        let guard = gate
            .apply(&LightPattern::full("ring", vec![0]))
            .await
            .unwrap();
        assert!(illuminator.is_on());

        guard.release().await.unwrap();
        assert!(!illuminator.is_on());
        assert_eq!(illuminator.off_calls(), 1);
    }

    #[tokio::test]
    async fn dropped_guard_still_forces_lights_off() {
        let illuminator = Arc::new(MockIlluminator::new());
        let gate = IlluminationGate::new(illuminator.clone(), 0.89);

        {
            let _guard = gate
                .apply(&LightPattern::full("ring", vec![0]))
                .await
                .unwrap();
            assert!(illuminator.is_on());
        }

        // The drop path spawns the off command; give it a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!illuminator.is_on());
    }

    #[tokio::test]
    async fn apply_failure_forces_lights_off() {
        let illuminator = Arc::new(MockIlluminator::new().with_apply_failures(1));
        let gate = IlluminationGate::new(illuminator.clone(), 0.89);

        assert!(gate.apply(&LightPattern::full("ring", vec![0])).await.is_err());
        assert_eq!(illuminator.off_calls(), 1);
        assert!(!illuminator.is_on());
    }
}
