//! Simulated camera sources and illuminator.
//!
//! These implement the same capability traits as the real drivers, so the
//! orchestrator and coordinator run unchanged against them. Failures are
//! scripted up front and consumed in order.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use scan_core::capabilities::{
    CaptureFailure, CaptureOutcome, CaptureResult, FrameSource, Illuminator, LightPattern,
};

/// Shared capture log for asserting cross-source ordering in tests.
pub type CaptureLog = Arc<Mutex<Vec<(String, Instant)>>>;

/// Simulated camera source.
pub struct MockFrameSource {
    id: String,
    frame_delay: Duration,
    /// Failures returned by upcoming capture attempts, in order.
    scripted_failures: Mutex<VecDeque<CaptureFailure>>,
    capture_attempts: AtomicU32,
    flush_count: AtomicU32,
    log: Option<CaptureLog>,
}

impl MockFrameSource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            frame_delay: Duration::from_millis(1),
            scripted_failures: Mutex::new(VecDeque::new()),
            capture_attempts: AtomicU32::new(0),
            flush_count: AtomicU32::new(0),
            log: None,
        }
    }

    /// Fail upcoming capture attempts with the given errors, in order.
    pub fn with_scripted_failures(mut self, failures: Vec<CaptureFailure>) -> Self {
        self.scripted_failures.get_mut().extend(failures);
        self
    }

    /// Record successful captures into a log shared across sources.
    pub fn with_shared_log(mut self, log: CaptureLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Total capture attempts, including failed ones.
    pub fn capture_attempts(&self) -> u32 {
        self.capture_attempts.load(Ordering::SeqCst)
    }

    /// How many times the shared pipeline buffers were flushed.
    pub fn flush_count(&self) -> u32 {
        self.flush_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSource for MockFrameSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn capture(&self, high_res: bool) -> Result<CaptureResult, CaptureFailure> {
        self.capture_attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(failure) = self.scripted_failures.lock().await.pop_front() {
            return Err(failure);
        }

        sleep(self.frame_delay).await;
        if let Some(log) = &self.log {
            log.lock().await.push((self.id.clone(), Instant::now()));
        }

        let payload = if high_res { vec![0u8; 64] } else { vec![0u8; 16] };
        Ok(CaptureResult {
            camera: self.id.clone(),
            timestamp: Utc::now(),
            outcome: CaptureOutcome::Success,
            data: Bytes::from(payload),
        })
    }

    async fn flush_buffers(&self) -> anyhow::Result<()> {
        self.flush_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Simulated illumination driver.
pub struct MockIlluminator {
    applied: Mutex<Vec<LightPattern>>,
    /// Upcoming `apply` calls to reject.
    apply_failures: AtomicU32,
    off_calls: AtomicU32,
    is_on: AtomicBool,
}

impl MockIlluminator {
    pub fn new() -> Self {
        Self {
            applied: Mutex::new(Vec::new()),
            apply_failures: AtomicU32::new(0),
            off_calls: AtomicU32::new(0),
            is_on: AtomicBool::new(false),
        }
    }

    /// Reject the next `n` apply calls.
    pub fn with_apply_failures(self, n: u32) -> Self {
        self.apply_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Every pattern successfully applied, in order, with brightness as the
    /// driver saw it (already clamped).
    pub async fn applied(&self) -> Vec<LightPattern> {
        self.applied.lock().await.clone()
    }

    pub fn off_calls(&self) -> u32 {
        self.off_calls.load(Ordering::SeqCst)
    }

    pub fn is_on(&self) -> bool {
        self.is_on.load(Ordering::SeqCst)
    }
}

impl Default for MockIlluminator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Illuminator for MockIlluminator {
    async fn apply(&self, pattern: &LightPattern) -> anyhow::Result<()> {
        if self
            .apply_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("simulated illumination fault");
        }
        self.is_on.store(true, Ordering::SeqCst);
        self.applied.lock().await.push(pattern.clone());
        Ok(())
    }

    async fn all_off(&self) -> anyhow::Result<()> {
        self.off_calls.fetch_add(1, Ordering::SeqCst);
        self.is_on.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_failures_consume_in_order() {
        let source = MockFrameSource::new("cam").with_scripted_failures(vec![
            CaptureFailure::Transient("busy".into()),
            CaptureFailure::Fatal("gone".into()),
        ]);

        assert!(matches!(
            source.capture(false).await,
            Err(CaptureFailure::Transient(_))
        ));
        assert!(matches!(
            source.capture(false).await,
            Err(CaptureFailure::Fatal(_))
        ));
        assert!(source.capture(false).await.is_ok());
        assert_eq!(source.capture_attempts(), 3);
    }

    #[tokio::test]
    async fn illuminator_tracks_on_off_state() {
        let illuminator = MockIlluminator::new();
        illuminator
            .apply(&LightPattern::full("ring", vec![0]))
            .await
            .unwrap();
        assert!(illuminator.is_on());
        illuminator.all_off().await.unwrap();
        assert!(!illuminator.is_on());
        assert_eq!(illuminator.off_calls(), 1);
    }
}
