//! Simulated motion controller for testing without hardware.
//!
//! [`MockScannerController`] implements the same [`MotionController`]
//! contract as the serial driver; the composition root picks one or the
//! other once at configuration time. No attribute probing and no runtime
//! type-punning: both variants answer the full interface.
//!
//! Failure injection is scripted up front: a number of unlock attempts to
//! reject, a number of upcoming moves to fail. All waits use
//! `tokio::time::sleep`, so paused-clock tests run instantly.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::debug;

use scan_core::capabilities::MotionController;
use scan_core::error::{ScanError, ScanResult};
use scan_core::position::{AxisLimits, ConnectionState, HomingState, Position};

/// Simulated 4-axis motion controller.
pub struct MockScannerController {
    limits: AxisLimits,
    move_delay: Duration,
    position: RwLock<Option<Position>>,
    connection: RwLock<ConnectionState>,
    homing: RwLock<HomingState>,
    /// Unlock attempts left to reject before acknowledging.
    unlock_rejections: AtomicU32,
    /// Upcoming `move_to` calls to fail with a protocol error.
    move_failures: AtomicU32,
    /// Completed-move count after which the link counts as dead.
    link_cut_after: AtomicU32,
    move_attempts: AtomicU32,
    moves: Mutex<Vec<Position>>,
    halts: AtomicU32,
}

impl MockScannerController {
    /// Connected, homed-capable mock with the given bounds.
    pub fn new(limits: AxisLimits) -> Self {
        Self {
            limits,
            move_delay: Duration::from_millis(5),
            position: RwLock::new(None),
            connection: RwLock::new(ConnectionState::Connected),
            homing: RwLock::new(HomingState::Idle),
            unlock_rejections: AtomicU32::new(0),
            move_failures: AtomicU32::new(0),
            link_cut_after: AtomicU32::new(u32::MAX),
            move_attempts: AtomicU32::new(0),
            moves: Mutex::new(Vec::new()),
            halts: AtomicU32::new(0),
        }
    }

    /// Set the simulated per-move travel time.
    pub fn with_move_delay(mut self, delay: Duration) -> Self {
        self.move_delay = delay;
        self
    }

    /// Reject the next `n` unlock attempts before acknowledging.
    pub fn with_unlock_rejections(self, n: u32) -> Self {
        self.unlock_rejections.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` move commands with a protocol error.
    pub fn fail_next_moves(&self, n: u32) {
        self.move_failures.store(n, Ordering::SeqCst);
    }

    /// Drop the link once `n` moves have completed: every later move fails
    /// with a connection error and the link state goes to `Error`.
    pub fn sever_link_after_moves(&self, n: u32) {
        self.link_cut_after.store(n, Ordering::SeqCst);
    }

    /// Every position successfully moved to, in order.
    pub async fn moves(&self) -> Vec<Position> {
        self.moves.lock().await.clone()
    }

    /// Total `move_to` calls that passed bounds validation, including
    /// failed ones.
    pub fn move_attempts(&self) -> u32 {
        self.move_attempts.load(Ordering::SeqCst)
    }

    /// How many times motion was halted.
    pub fn halt_count(&self) -> u32 {
        self.halts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MotionController for MockScannerController {
    async fn unlock(&self) -> ScanResult<()> {
        *self.homing.write().await = HomingState::Unlocking;
        if self.unlock_rejections.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            n.checked_sub(1)
        }).is_ok()
        {
            *self.homing.write().await = HomingState::Alarm;
            return Err(ScanError::Protocol("simulated unlock rejection".into()));
        }
        *self.homing.write().await = HomingState::Idle;
        debug!("mock unlock acknowledged");
        Ok(())
    }

    async fn home(&self) -> ScanResult<()> {
        *self.homing.write().await = HomingState::Homing;
        sleep(self.move_delay).await;
        *self.homing.write().await = HomingState::Homed;
        *self.position.write().await = Some(Position::origin());
        debug!("mock homing complete");
        Ok(())
    }

    async fn move_to(&self, target: Position) -> ScanResult<()> {
        self.limits.validate(&target)?;
        self.move_attempts.fetch_add(1, Ordering::SeqCst);

        if self.moves.lock().await.len() as u32 >= self.link_cut_after.load(Ordering::SeqCst) {
            *self.connection.write().await = ConnectionState::Error;
            return Err(ScanError::Connection("simulated link drop".into()));
        }

        if self
            .move_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ScanError::Protocol("simulated motion fault".into()));
        }

        sleep(self.move_delay).await;
        *self.position.write().await = Some(target);
        self.moves.lock().await.push(target);
        debug!(target = %target, "mock move complete");
        Ok(())
    }

    async fn position(&self) -> Option<Position> {
        *self.position.read().await
    }

    async fn connection_state(&self) -> ConnectionState {
        *self.connection.read().await
    }

    async fn homing_state(&self) -> HomingState {
        *self.homing.read().await
    }

    async fn halt(&self) -> ScanResult<()> {
        self.halts.fetch_add(1, Ordering::SeqCst);
        *self.homing.write().await = HomingState::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scan_core::position::Axis;

    #[tokio::test]
    async fn move_records_and_updates_position() {
        let mock = MockScannerController::new(AxisLimits::default())
            .with_move_delay(Duration::from_millis(1));
        let target = Position::new(5.0, 5.0, 5.0, 180.0);

        mock.move_to(target).await.unwrap();
        assert_eq!(mock.position().await, Some(target));
        assert_eq!(mock.moves().await, vec![target]);
    }

    #[tokio::test]
    async fn respects_axis_limits() {
        let mock = MockScannerController::new(AxisLimits::default());
        match mock.move_to(Position::new(500.0, 0.0, 0.0, 0.0)).await {
            Err(ScanError::OutOfBounds { axis, .. }) => assert_eq!(axis, Axis::X),
            other => panic!("expected OutOfBounds, got {:?}", other),
        }
        assert!(mock.moves().await.is_empty());
    }

    #[tokio::test]
    async fn scripted_unlock_rejections_then_success() {
        let mock = MockScannerController::new(AxisLimits::default()).with_unlock_rejections(2);
        assert!(mock.unlock().await.is_err());
        assert!(mock.unlock().await.is_err());
        assert!(mock.unlock().await.is_ok());
        assert_eq!(mock.homing_state().await, HomingState::Idle);
    }

    #[tokio::test]
    async fn scripted_move_failures_consume() {
        let mock = MockScannerController::new(AxisLimits::default());
        mock.fail_next_moves(1);
        let target = Position::origin();
        assert!(mock.move_to(target).await.is_err());
        assert!(mock.move_to(target).await.is_ok());
    }

    #[tokio::test]
    async fn severed_link_fails_moves_and_flags_error_state() {
        let mock = MockScannerController::new(AxisLimits::default())
            .with_move_delay(Duration::from_millis(1));
        mock.sever_link_after_moves(1);

        let target = Position::new(5.0, 5.0, 5.0, 0.0);
        mock.move_to(target).await.unwrap();
        match mock.move_to(target).await {
            Err(ScanError::Connection(_)) => {}
            other => panic!("expected Connection error, got {:?}", other),
        }
        assert_eq!(mock.connection_state().await, ConnectionState::Error);
        assert_eq!(mock.moves().await.len(), 1);
    }

    #[tokio::test]
    async fn homing_establishes_origin() {
        let mock = MockScannerController::new(AxisLimits::default());
        mock.home().await.unwrap();
        assert_eq!(mock.homing_state().await, HomingState::Homed);
        assert_eq!(mock.position().await, Some(Position::origin()));
    }
}
