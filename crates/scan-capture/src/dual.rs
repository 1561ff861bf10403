//! Sequential dual-camera acquisition.
//!
//! The two camera sources share one image-signal-processor pipeline, so
//! they are never captured simultaneously: camera A completes, the
//! coordinator waits out the settle delay (200 ms standard, 500 ms
//! high-resolution), then camera B runs. A transient pipeline error gets
//! exactly one retry, preceded by an explicit buffer flush; a fatal error
//! propagates untouched.
//!
//! High-resolution mode is optimistic: after [`DOWNGRADE_THRESHOLD`]
//! transient errors within one session the coordinator drops to standard
//! resolution for the remaining points and reports the downgrade as an
//! observable event.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use scan_core::capabilities::{CaptureFailure, CaptureResult, FrameSource};
use scan_core::config::CaptureConfig;
use scan_core::error::{ScanError, ScanResult};
use scan_core::events::ScanEvent;

/// Transient pipeline errors tolerated in high-resolution mode before the
/// session downgrades to standard resolution.
pub const DOWNGRADE_THRESHOLD: u32 = 2;

/// Orchestrates sequential acquisition from the two scanner cameras.
pub struct DualCaptureCoordinator {
    primary: Arc<dyn FrameSource>,
    secondary: Arc<dyn FrameSource>,
    settle_delay: Duration,
    high_res_settle_delay: Duration,
    high_res: AtomicBool,
    transient_errors: AtomicU32,
    events: Option<broadcast::Sender<ScanEvent>>,
}

impl DualCaptureCoordinator {
    /// Build a coordinator over the two sources. Capture of `primary`
    /// always precedes capture of `secondary` within a point.
    pub fn new(
        primary: Arc<dyn FrameSource>,
        secondary: Arc<dyn FrameSource>,
        config: &CaptureConfig,
    ) -> Self {
        Self {
            primary,
            secondary,
            settle_delay: config.settle_delay,
            high_res_settle_delay: config.high_res_settle_delay,
            high_res: AtomicBool::new(config.high_res),
            transient_errors: AtomicU32::new(0),
            events: None,
        }
    }

    /// Report downgrades on the given progress channel.
    pub fn with_events(mut self, events: broadcast::Sender<ScanEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Whether the coordinator is currently in high-resolution mode.
    pub fn high_res(&self) -> bool {
        self.high_res.load(Ordering::SeqCst)
    }

    /// Settle delay for the current mode.
    fn current_settle_delay(&self) -> Duration {
        if self.high_res() {
            self.high_res_settle_delay
        } else {
            self.settle_delay
        }
    }

    /// Acquire one frame from each camera, strictly in order.
    #[instrument(skip(self), err)]
    pub async fn capture_pair(&self) -> ScanResult<Vec<CaptureResult>> {
        let mut results = Vec::with_capacity(2);

        results.push(self.capture_one(self.primary.as_ref()).await?);
        sleep(self.current_settle_delay()).await;
        results.push(self.capture_one(self.secondary.as_ref()).await?);

        Ok(results)
    }

    /// One capture attempt plus its single transient retry.
    async fn capture_one(&self, source: &dyn FrameSource) -> ScanResult<CaptureResult> {
        let high_res = self.high_res();
        match source.capture(high_res).await {
            Ok(result) => Ok(result),
            Err(CaptureFailure::Fatal(message)) => Err(ScanError::Capture {
                camera: source.id().to_string(),
                transient: false,
                message,
            }),
            Err(CaptureFailure::Transient(message)) => {
                warn!(camera = source.id(), %message, "Transient capture error, flushing and retrying");
                self.note_transient();

                source.flush_buffers().await.map_err(|e| ScanError::Capture {
                    camera: source.id().to_string(),
                    transient: false,
                    message: format!("buffer flush before retry failed: {e}"),
                })?;

                // The downgrade may have happened above; retry in the mode
                // that is now active.
                match source.capture(self.high_res()).await {
                    Ok(result) => {
                        debug!(camera = source.id(), "Retry succeeded");
                        Ok(result)
                    }
                    Err(failure) => {
                        if matches!(failure, CaptureFailure::Transient(_)) {
                            self.note_transient();
                        }
                        Err(ScanError::Capture {
                            camera: source.id().to_string(),
                            transient: matches!(failure, CaptureFailure::Transient(_)),
                            message: failure.to_string(),
                        })
                    }
                }
            }
        }
    }

    fn note_transient(&self) {
        let total = self.transient_errors.fetch_add(1, Ordering::SeqCst) + 1;
        if total >= DOWNGRADE_THRESHOLD && self.high_res.swap(false, Ordering::SeqCst) {
            warn!(
                transient_errors = total,
                "Repeated pipeline contention in high-resolution mode; downgrading to standard resolution"
            );
            if let Some(events) = &self.events {
                let _ = events.send(ScanEvent::ResolutionDowngraded {
                    transient_errors: total,
                });
            }
        }
    }
}
