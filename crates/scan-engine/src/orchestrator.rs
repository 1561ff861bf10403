//! Scan session state machine.
//!
//! The engine works through a session's points one at a time: move all
//! four axes, hold the lighting pattern, capture from both cameras, record
//! the outcome. Progress is reported on a broadcast channel; a lagging or
//! absent subscriber never blocks the scan.
//!
//! # State machine
//!
//! ```text
//! ┌─────────┐   run()    ┌─────────┐
//! │ Pending │───────────▶│ Running │◀──────┐
//! └─────────┘            └────┬────┘       │ resume()
//!                             │ pause()    │
//!                             ▼            │
//!                        ┌────────┐────────┘
//!                        │ Paused │
//!                        └────────┘
//!
//! Running/Paused ──▶ Completed | Failed | Aborted
//! ```
//!
//! Pause takes effect between points. Abort is honored between points and
//! at every await boundary inside a point: the in-flight move or capture
//! future is dropped, queued motion is halted, and the lighting guard's
//! release path turns the LEDs off.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, instrument, warn};

use scan_capture::{DualCaptureCoordinator, IlluminationGate};
use scan_core::capabilities::{CaptureResult, FrameSource, Illuminator, MotionController};
use scan_core::config::{ScanPolicy, ScannerConfig};
use scan_core::error::{ScanError, ScanResult};
use scan_core::events::{ScanEvent, SessionStatus};
use scan_core::position::{ConnectionState, HomingState};

use crate::session::{PointOutcome, PointRecord, ScanPoint, ScanSession, SessionSummary};

/// How often the pause wait loop re-checks for resume or abort.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Orchestrates scan sessions over the motion, capture, and lighting stacks.
pub struct ScanEngine {
    motion: Arc<dyn MotionController>,
    capture: DualCaptureCoordinator,
    lighting: IlluminationGate,
    policy: ScanPolicy,

    status: RwLock<SessionStatus>,
    pause_requested: RwLock<bool>,
    abort_tx: watch::Sender<bool>,
    abort_rx: watch::Receiver<bool>,

    /// Held for the duration of `run`; a second concurrent run fails fast.
    run_lock: Mutex<()>,
    /// Finished sessions, oldest first. Read-only once pushed.
    sessions: Mutex<Vec<ScanSession>>,

    events: broadcast::Sender<ScanEvent>,
}

impl ScanEngine {
    /// Wire up an engine over the given devices and configuration.
    pub fn new(
        motion: Arc<dyn MotionController>,
        primary: Arc<dyn FrameSource>,
        secondary: Arc<dyn FrameSource>,
        illuminator: Arc<dyn Illuminator>,
        config: &ScannerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        let (abort_tx, abort_rx) = watch::channel(false);

        let capture = DualCaptureCoordinator::new(primary, secondary, &config.capture)
            .with_events(events.clone());
        let lighting = IlluminationGate::new(illuminator, config.lighting.max_duty_cycle);

        Self {
            motion,
            capture,
            lighting,
            policy: config.scan.clone(),
            status: RwLock::new(SessionStatus::Pending),
            pause_requested: RwLock::new(false),
            abort_tx,
            abort_rx,
            run_lock: Mutex::new(()),
            sessions: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Subscribe to the progress event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Current session status snapshot.
    pub async fn status(&self) -> SessionStatus {
        *self.status.read().await
    }

    /// Copies of all finished sessions, oldest first.
    pub async fn sessions(&self) -> Vec<ScanSession> {
        self.sessions.lock().await.clone()
    }

    /// Summary of the most recently finished session.
    pub async fn last_summary(&self) -> Option<SessionSummary> {
        self.sessions.lock().await.last().map(ScanSession::summary)
    }

    /// Last known machine position.
    pub async fn position(&self) -> Option<scan_core::position::Position> {
        self.motion.position().await
    }

    /// Motion link state snapshot.
    pub async fn connection_state(&self) -> ConnectionState {
        self.motion.connection_state().await
    }

    /// Homing state snapshot.
    pub async fn homing_state(&self) -> HomingState {
        self.motion.homing_state().await
    }

    /// Request a pause at the next point boundary.
    pub async fn pause(&self) -> anyhow::Result<()> {
        let status = *self.status.read().await;
        if status != SessionStatus::Running {
            anyhow::bail!("cannot pause: session is {}", status);
        }
        info!("Pause requested");
        *self.pause_requested.write().await = true;
        Ok(())
    }

    /// Resume a paused session.
    pub async fn resume(&self) -> anyhow::Result<()> {
        let status = *self.status.read().await;
        if status != SessionStatus::Paused {
            anyhow::bail!("cannot resume: session is {}", status);
        }
        info!("Resuming from pause");
        *self.pause_requested.write().await = false;
        self.set_status(SessionStatus::Running).await;
        Ok(())
    }

    /// Abort the session. Takes effect at the next await boundary.
    pub async fn abort(&self) -> anyhow::Result<()> {
        let status = *self.status.read().await;
        if !matches!(status, SessionStatus::Running | SessionStatus::Paused) {
            anyhow::bail!("cannot abort: session is {}", status);
        }
        info!("Abort requested");
        *self.pause_requested.write().await = false;
        self.abort_tx.send_replace(true);
        Ok(())
    }

    /// Execute a scan session over `points`.
    ///
    /// Returns the summary on full success. A session that runs to the end
    /// with failed points returns [`ScanError::PartialScan`]; the per-point
    /// records stay available via [`ScanEngine::sessions`].
    #[instrument(skip(self, points), fields(points = points.len()))]
    pub async fn run(&self, points: Vec<ScanPoint>) -> ScanResult<SessionSummary> {
        let _running = self
            .run_lock
            .try_lock()
            .map_err(|_| ScanError::SessionActive)?;

        *self.pause_requested.write().await = false;
        self.abort_tx.send_replace(false);

        let mut session = ScanSession::new(points);
        self.set_status(SessionStatus::Running).await;

        if let Err(e) = self.prepare().await {
            warn!(error = %e, "Session preparation failed");
            let status = if matches!(e, ScanError::Aborted) {
                SessionStatus::Aborted
            } else {
                SessionStatus::Failed
            };
            self.finish(session, status).await;
            return Err(e);
        }

        let total = session.points.len();
        for index in 0..total {
            if *self.abort_rx.borrow() {
                let summary = self.finish(session, SessionStatus::Aborted).await;
                debug!(completed = summary.completed, "Session aborted between points");
                return Err(ScanError::Aborted);
            }

            if *self.pause_requested.read().await {
                self.set_status(SessionStatus::Paused).await;
                loop {
                    sleep(PAUSE_POLL_INTERVAL).await;
                    if *self.abort_rx.borrow() {
                        self.finish(session, SessionStatus::Aborted).await;
                        return Err(ScanError::Aborted);
                    }
                    if *self.status.read().await == SessionStatus::Running {
                        break;
                    }
                }
            }

            let _ = self.events.send(ScanEvent::PointStarted { index });
            let point = session.points[index].clone();

            match self.execute_point(&point).await {
                Ok((captures, retried)) => {
                    session.records.push(PointRecord {
                        index,
                        target: point.position,
                        captures,
                        outcome: PointOutcome::Completed { retried },
                    });
                    let _ = self.events.send(ScanEvent::PointCompleted { index, retried });
                }
                Err(ScanError::Aborted) => {
                    if let Err(e) = self.motion.halt().await {
                        warn!(error = %e, "Halt after abort failed");
                    }
                    self.finish(session, SessionStatus::Aborted).await;
                    return Err(ScanError::Aborted);
                }
                Err(e) => {
                    warn!(index, error = %e, "Point failed after retry");
                    session.records.push(PointRecord {
                        index,
                        target: point.position,
                        captures: Vec::new(),
                        outcome: PointOutcome::Failed {
                            error: e.to_string(),
                        },
                    });
                    let _ = self.events.send(ScanEvent::PointFailed {
                        index,
                        error: e.to_string(),
                    });
                    // A dead or silent link cannot carry the rest of the
                    // session; fail immediately instead of limping through
                    // the remaining points.
                    if e.is_link_fault() || self.policy.abort_on_error {
                        self.finish(session, SessionStatus::Failed).await;
                        return Err(e);
                    }
                }
            }
        }

        let summary = self.finish(session, SessionStatus::Completed).await;
        info!(
            completed = summary.completed,
            failed = summary.failed,
            "Session complete"
        );
        if summary.failed > 0 {
            return Err(ScanError::PartialScan {
                failed: summary.failed,
                total,
            });
        }
        Ok(summary)
    }

    /// Ensure the controller is connected and homed before the first move.
    async fn prepare(&self) -> ScanResult<()> {
        if self.motion.connection_state().await != ConnectionState::Connected {
            return Err(ScanError::Connection(
                "motion controller is not connected".into(),
            ));
        }
        if self.motion.homing_state().await != HomingState::Homed {
            self.abortable(self.motion.unlock()).await?;
            self.abortable(self.motion.home()).await?;
        }
        Ok(())
    }

    /// One point with its single retry. Bounds violations, aborts, and
    /// link faults are never retried.
    async fn execute_point(&self, point: &ScanPoint) -> ScanResult<(Vec<CaptureResult>, bool)> {
        match self.attempt_point(point).await {
            Ok(captures) => Ok((captures, false)),
            Err(e @ (ScanError::Aborted | ScanError::OutOfBounds { .. })) => Err(e),
            Err(e) if e.is_link_fault() => Err(e),
            Err(first) => {
                debug!(error = %first, "Point attempt failed, retrying once");
                let captures = self.attempt_point(point).await?;
                Ok((captures, true))
            }
        }
    }

    /// Move, light, capture. The lighting guard is released on every exit
    /// path, including abort cancellation.
    async fn attempt_point(&self, point: &ScanPoint) -> ScanResult<Vec<CaptureResult>> {
        self.abortable(self.motion.move_to(point.position)).await?;

        let guard = self
            .abortable(async {
                self.lighting
                    .apply(&point.pattern)
                    .await
                    .map_err(|e| ScanError::Lighting(e.to_string()))
            })
            .await?;

        let captured = self.abortable(self.capture.capture_pair()).await;
        match captured {
            Ok(captures) => {
                guard
                    .release()
                    .await
                    .map_err(|e| ScanError::Lighting(e.to_string()))?;
                Ok(captures)
            }
            Err(e) => {
                if let Err(off) = guard.release().await {
                    warn!(error = %off, "Failed to turn lights off after capture error");
                }
                Err(e)
            }
        }
    }

    /// Race a step against the abort signal. Losing drops the step future.
    async fn abortable<T>(&self, fut: impl Future<Output = ScanResult<T>>) -> ScanResult<T> {
        let mut abort = self.abort_rx.clone();
        if *abort.borrow_and_update() {
            return Err(ScanError::Aborted);
        }
        tokio::select! {
            res = fut => res,
            _ = abort.changed() => Err(ScanError::Aborted),
        }
    }

    async fn finish(&self, mut session: ScanSession, status: SessionStatus) -> SessionSummary {
        session.status = status;
        self.set_status(status).await;
        let summary = session.summary();
        self.sessions.lock().await.push(session);
        summary
    }

    async fn set_status(&self, status: SessionStatus) {
        *self.status.write().await = status;
        let _ = self.events.send(ScanEvent::SessionStatusChanged { status });
    }
}
