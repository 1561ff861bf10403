//! Protocol state machine for the GRBL-class motion firmware.
//!
//! [`GrblController`] owns the serial handle and the command gate, tracks
//! connection and homing state, and implements the unlock → home → move
//! recovery ladder. All outgoing frames pass through the gate; nothing else
//! may touch the port.
//!
//! Timing contract (see each method):
//! - unlock: ≤3 attempts, 2.0 s response window each, 0.5 s gap between
//!   attempts, 1.0 s settle after success
//! - homing: 30 s budget per axis (120 s total) racing a 30 s
//!   total-silence budget; completion only on the firmware debug marker
//! - commands: per-command timeout from configuration
//!
//! Failures never auto-reconnect; the caller decides when to rebuild the
//! link, at which point the gate is reset as well.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, instrument, warn};

use scan_core::capabilities::MotionController;
use scan_core::config::{ScanPolicy, ScannerConfig, SerialConfig};
use scan_core::error::{ScanError, ScanResult};
use scan_core::position::{Axis, AxisLimits, ConnectionState, HomingState, Position};
use scan_core::transport::{drain_serial_buffer, open_serial_async, wrap_shared, SharedPort};

use crate::frame::{
    build_move_frame, is_ack, is_homing_done, parse_fault, parse_status_report, MachineState,
    StatusReport, HOME_FRAME, IDLE_TOKEN, SOFT_RESET, STATUS_QUERY, UNLOCK_FRAME,
};
use crate::gate::CommandGate;

/// Unlock frames sent before giving up.
const UNLOCK_ATTEMPTS: u32 = 3;
/// Response window per unlock attempt.
const UNLOCK_RESPONSE_WINDOW: Duration = Duration::from_millis(2000);
/// Gap between unlock attempts.
const UNLOCK_RETRY_GAP: Duration = Duration::from_millis(500);
/// Settle period after a successful unlock before the firmware will take
/// a homing command reliably.
const UNLOCK_SETTLE: Duration = Duration::from_millis(1000);

/// Homing time allowance per axis.
const HOMING_AXIS_BUDGET: Duration = Duration::from_secs(30);
/// Maximum tolerated silence during homing before the device counts as gone.
const HOMING_SILENCE_BUDGET: Duration = Duration::from_secs(30);

/// Poll interval while waiting for arrival confirmation.
const ARRIVAL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Drain window for the reset banner and stale reports on connect.
const CONNECT_DRAIN_MS: u64 = 200;

/// Serial protocol driver for the motion controller.
///
/// Owns the transport exclusively; the scan orchestrator borrows it through
/// the [`MotionController`] trait for the duration of a session.
pub struct GrblController {
    serial: SerialConfig,
    limits: AxisLimits,
    policy: ScanPolicy,
    gate: CommandGate,
    port: RwLock<Option<SharedPort>>,
    connection: RwLock<ConnectionState>,
    homing: RwLock<HomingState>,
    last_position: RwLock<Option<Position>>,
}

impl GrblController {
    /// Build a disconnected controller from configuration.
    ///
    /// Call [`GrblController::connect`] before issuing any command.
    pub fn new(config: &ScannerConfig) -> Self {
        Self {
            serial: config.serial.clone(),
            limits: config.limits,
            policy: config.scan.clone(),
            gate: CommandGate::new(),
            port: RwLock::new(None),
            connection: RwLock::new(ConnectionState::Disconnected),
            homing: RwLock::new(HomingState::Idle),
            last_position: RwLock::new(None),
        }
    }

    /// Open the transport and confirm the firmware is talking.
    ///
    /// The reset banner and any queued status reports are drained first,
    /// then a status query must produce at least one line within the
    /// command timeout. `Connected` is only set after that readability
    /// probe passes. Reconnecting resets the command gate and homing state.
    #[instrument(skip(self), fields(port = %self.serial.port), err)]
    pub async fn connect(&self) -> ScanResult<()> {
        *self.connection.write().await = ConnectionState::Connecting;

        let stream = open_serial_async(&self.serial.port, self.serial.baud, "motion controller")
            .await
            .map_err(|e| {
                // Open failure: nothing was ever established.
                ScanError::Connection(e.to_string())
            });
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                *self.connection.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        let shared = wrap_shared(Box::new(stream));
        {
            let mut guard = shared.lock().await;
            let discarded = drain_serial_buffer(guard.get_mut(), CONNECT_DRAIN_MS).await;
            if discarded > 0 {
                debug!(discarded, "Drained stale bytes on connect");
            }
        }

        *self.port.write().await = Some(shared);
        self.gate.reset();
        *self.homing.write().await = HomingState::Idle;
        *self.last_position.write().await = None;

        match self.query_status().await {
            Ok(report) => {
                *self.connection.write().await = ConnectionState::Connected;
                info!(state = ?report.state, "Motion controller connected");
                Ok(())
            }
            Err(e) => {
                *self.port.write().await = None;
                *self.connection.write().await = ConnectionState::Disconnected;
                Err(ScanError::Connection(format!(
                    "no response to readability probe: {e}"
                )))
            }
        }
    }

    /// Close the transport and reset the gate.
    pub async fn disconnect(&self) {
        *self.port.write().await = None;
        self.gate.reset();
        *self.connection.write().await = ConnectionState::Disconnected;
        *self.homing.write().await = HomingState::Idle;
        *self.last_position.write().await = None;
        info!("Motion controller disconnected");
    }

    async fn shared_port(&self) -> ScanResult<SharedPort> {
        self.port
            .read()
            .await
            .clone()
            .ok_or_else(|| ScanError::Connection("not connected".into()))
    }

    /// Record a link fault: the in-flight operation fails and the state
    /// machine leaves `Connected` until the caller reconnects.
    async fn link_fault(&self, context: impl Into<String>) -> ScanError {
        *self.connection.write().await = ConnectionState::Error;
        ScanError::Connection(context.into())
    }

    /// Every received line goes through here so status reports update the
    /// cached position no matter which operation was in flight.
    async fn record_line(&self, line: &str) {
        if let Some(report) = parse_status_report(line) {
            if let Some(pos) = report.position {
                *self.last_position.write().await = Some(pos);
            }
        }
    }

    /// Send one command frame and await its acknowledgment.
    ///
    /// Acquires the command gate, writes the frame, and reads lines until
    /// the `ok` acknowledgment, a fault response, or the timeout. Status
    /// reports received along the way are parsed and cached.
    #[instrument(skip(self), err)]
    pub async fn send(&self, frame: &str, response_timeout: Duration) -> ScanResult<String> {
        let _permit = self.gate.acquire().await;
        self.send_locked(frame, response_timeout).await
    }

    async fn send_locked(&self, frame: &str, response_timeout: Duration) -> ScanResult<String> {
        let port = self.shared_port().await?;
        let mut guard = port.lock().await;

        let wire = format!("{}\n", frame);
        if let Err(e) = guard.get_mut().write_all(wire.as_bytes()).await {
            return Err(self.link_fault(format!("write failed: {e}")).await);
        }
        if let Err(e) = guard.get_mut().flush().await {
            return Err(self.link_fault(format!("flush failed: {e}")).await);
        }

        let deadline = Instant::now() + response_timeout;
        let mut transcript = String::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ScanError::Protocol(format!(
                    "no acknowledgment for '{}' within {:?}",
                    frame, response_timeout
                )));
            }

            let mut line = String::new();
            match timeout(remaining, guard.read_line(&mut line)).await {
                Err(_) => {
                    return Err(ScanError::Protocol(format!(
                        "no acknowledgment for '{}' within {:?}",
                        frame, response_timeout
                    )));
                }
                Ok(Ok(0)) => {
                    return Err(self.link_fault("link closed mid-command").await);
                }
                Ok(Err(e)) => {
                    return Err(self.link_fault(format!("read failed: {e}")).await);
                }
                Ok(Ok(_)) => {
                    self.record_line(&line).await;
                    if let Some(fault) = parse_fault(&line) {
                        return Err(ScanError::Protocol(format!(
                            "'{}' rejected: {}",
                            frame, fault
                        )));
                    }
                    transcript.push_str(&line);
                    if is_ack(&line) {
                        return Ok(transcript);
                    }
                }
            }
        }
    }

    /// Query one status report.
    pub async fn query_status(&self) -> ScanResult<StatusReport> {
        let _permit = self.gate.acquire().await;
        let port = self.shared_port().await?;
        let mut guard = port.lock().await;

        if let Err(e) = guard.get_mut().write_all(&[STATUS_QUERY]).await {
            return Err(self.link_fault(format!("status query write failed: {e}")).await);
        }
        if let Err(e) = guard.get_mut().flush().await {
            return Err(self.link_fault(format!("status query flush failed: {e}")).await);
        }

        let deadline = Instant::now() + self.serial.command_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ScanError::Protocol(format!(
                    "no status report within {:?}",
                    self.serial.command_timeout
                )));
            }

            let mut line = String::new();
            match timeout(remaining, guard.read_line(&mut line)).await {
                Err(_) => {
                    return Err(ScanError::Protocol(format!(
                        "no status report within {:?}",
                        self.serial.command_timeout
                    )));
                }
                Ok(Ok(0)) => return Err(self.link_fault("link closed during status query").await),
                Ok(Err(e)) => {
                    return Err(self.link_fault(format!("status read failed: {e}")).await)
                }
                Ok(Ok(_)) => {
                    self.record_line(&line).await;
                    if let Some(report) = parse_status_report(&line) {
                        return Ok(report);
                    }
                    // Stray acks and messages between query and report are fine.
                }
            }
        }
    }

    /// One unlock handshake: frame plus status query, then watch the window
    /// for both the acknowledgment token and an idle-status token.
    async fn unlock_attempt(&self) -> ScanResult<()> {
        let _permit = self.gate.acquire().await;
        let port = self.shared_port().await?;
        let mut guard = port.lock().await;

        let wire = format!("{}\n", UNLOCK_FRAME);
        if let Err(e) = guard.get_mut().write_all(wire.as_bytes()).await {
            return Err(self.link_fault(format!("unlock write failed: {e}")).await);
        }
        if let Err(e) = guard.get_mut().write_all(&[STATUS_QUERY]).await {
            return Err(self.link_fault(format!("unlock write failed: {e}")).await);
        }
        if let Err(e) = guard.get_mut().flush().await {
            return Err(self.link_fault(format!("unlock flush failed: {e}")).await);
        }

        let deadline = Instant::now() + UNLOCK_RESPONSE_WINDOW;
        let mut saw_ack = false;
        let mut saw_idle = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ScanError::Protocol(format!(
                    "unlock not acknowledged within {:?}",
                    UNLOCK_RESPONSE_WINDOW
                )));
            }

            let mut line = String::new();
            match timeout(remaining, guard.read_line(&mut line)).await {
                Err(_) => {
                    return Err(ScanError::Protocol(format!(
                        "unlock not acknowledged within {:?}",
                        UNLOCK_RESPONSE_WINDOW
                    )));
                }
                Ok(Ok(0)) => return Err(self.link_fault("link closed during unlock").await),
                Ok(Err(e)) => {
                    return Err(self.link_fault(format!("unlock read failed: {e}")).await)
                }
                Ok(Ok(_)) => {
                    self.record_line(&line).await;
                    if let Some(fault) = parse_fault(&line) {
                        return Err(ScanError::Protocol(format!("unlock rejected: {}", fault)));
                    }
                    if is_ack(&line) {
                        saw_ack = true;
                    }
                    if line.contains(IDLE_TOKEN) {
                        saw_idle = true;
                    }
                    if saw_ack && saw_idle {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// The homing cycle proper: write the frame, then race the per-axis
    /// budget against the silence budget while scanning incoming traffic
    /// for the completion marker.
    async fn homing_cycle(&self, budget: Duration) -> ScanResult<()> {
        let _permit = self.gate.acquire().await;
        let port = self.shared_port().await?;
        let mut guard = port.lock().await;

        let wire = format!("{}\n", HOME_FRAME);
        if let Err(e) = guard.get_mut().write_all(wire.as_bytes()).await {
            return Err(self.link_fault(format!("homing write failed: {e}")).await);
        }
        if let Err(e) = guard.get_mut().flush().await {
            return Err(self.link_fault(format!("homing flush failed: {e}")).await);
        }

        let start = Instant::now();
        loop {
            let elapsed = start.elapsed();
            if elapsed >= budget {
                return Err(ScanError::HomingTimeout { elapsed, budget });
            }

            // Whichever budget has less left decides what a timeout means.
            let silence_window = HOMING_SILENCE_BUDGET.min(budget - elapsed);
            let mut line = String::new();
            match timeout(silence_window, guard.read_line(&mut line)).await {
                Err(_) => {
                    return if silence_window < HOMING_SILENCE_BUDGET {
                        Err(ScanError::HomingTimeout {
                            elapsed: start.elapsed(),
                            budget,
                        })
                    } else {
                        Err(ScanError::Unresponsive {
                            silence: HOMING_SILENCE_BUDGET,
                        })
                    };
                }
                Ok(Ok(0)) => return Err(self.link_fault("link closed during homing").await),
                Ok(Err(e)) => {
                    return Err(self.link_fault(format!("homing read failed: {e}")).await)
                }
                Ok(Ok(_)) => {
                    self.record_line(&line).await;
                    if is_homing_done(&line) {
                        return Ok(());
                    }
                    // A bare idle report or stray "ok" is not completion;
                    // only the marker is.
                    debug!(line = %line.trim(), "homing traffic");
                }
            }
        }
    }

    /// Wait until the firmware reports idle at the target position.
    async fn await_arrival(&self, target: Position) -> ScanResult<()> {
        let deadline = Instant::now() + self.policy.arrival_timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(ScanError::Protocol(format!(
                    "arrival at {} not confirmed within {:?}",
                    target, self.policy.arrival_timeout
                )));
            }

            let report = self.query_status().await?;
            if report.state == MachineState::Idle {
                if let Some(pos) = report.position {
                    if pos.approx_eq(&target, self.policy.arrival_tolerance) {
                        return Ok(());
                    }
                }
            }

            sleep(ARRIVAL_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl MotionController for GrblController {
    /// Clear the firmware alarm/lock state.
    ///
    /// Up to 3 attempts with a 2.0 s response window each and a 0.5 s gap
    /// between attempts; success requires both the acknowledgment and an
    /// idle-status token, followed by a 1.0 s settle period.
    #[instrument(skip(self), err)]
    async fn unlock(&self) -> ScanResult<()> {
        *self.homing.write().await = HomingState::Unlocking;

        for attempt in 1..=UNLOCK_ATTEMPTS {
            match self.unlock_attempt().await {
                Ok(()) => {
                    sleep(UNLOCK_SETTLE).await;
                    *self.homing.write().await = HomingState::Idle;
                    info!(attempt, "Unlock acknowledged");
                    return Ok(());
                }
                Err(e @ ScanError::Connection(_)) => {
                    // A dead link is not something more attempts fix.
                    *self.homing.write().await = HomingState::Alarm;
                    return Err(e);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Unlock attempt failed");
                    if attempt < UNLOCK_ATTEMPTS {
                        sleep(UNLOCK_RETRY_GAP).await;
                    }
                }
            }
        }

        *self.homing.write().await = HomingState::Alarm;
        Err(ScanError::UnlockFailed {
            attempts: UNLOCK_ATTEMPTS,
        })
    }

    /// Run the homing cycle.
    ///
    /// Budget: 30 s per axis (120 s for the 4-axis mechanism), racing a
    /// 30 s total-silence budget. Completion is recognized exclusively by
    /// the firmware debug marker; neither timeout is retried automatically.
    #[instrument(skip(self), err)]
    async fn home(&self) -> ScanResult<()> {
        {
            let homing = *self.homing.read().await;
            if homing == HomingState::Alarm {
                return Err(ScanError::Protocol(
                    "cannot home from alarm state; unlock first".into(),
                ));
            }
        }

        *self.homing.write().await = HomingState::Homing;
        let budget = HOMING_AXIS_BUDGET * Axis::ALL.len() as u32;

        match self.homing_cycle(budget).await {
            Ok(()) => {
                *self.homing.write().await = HomingState::Homed;
                info!("Homing complete");
                Ok(())
            }
            Err(e) => {
                *self.homing.write().await = HomingState::Alarm;
                Err(e)
            }
        }
    }

    /// Move all axes to `target` with one combined frame, then confirm
    /// arrival by polling status until the firmware is idle at the target.
    #[instrument(skip(self), fields(target = %target), err)]
    async fn move_to(&self, target: Position) -> ScanResult<()> {
        self.limits.validate(&target)?;

        let frame = build_move_frame(&target);
        self.send(&frame, self.serial.command_timeout).await?;
        self.await_arrival(target).await
    }

    async fn position(&self) -> Option<Position> {
        *self.last_position.read().await
    }

    async fn connection_state(&self) -> ConnectionState {
        *self.connection.read().await
    }

    async fn homing_state(&self) -> HomingState {
        *self.homing.read().await
    }

    /// Soft-reset the firmware, halting any in-flight motion. The machine
    /// origin is lost, so homing state drops back to idle.
    #[instrument(skip(self), err)]
    async fn halt(&self) -> ScanResult<()> {
        let _permit = self.gate.acquire().await;
        let port = self.shared_port().await?;
        let mut guard = port.lock().await;

        if let Err(e) = guard.get_mut().write_all(&[SOFT_RESET]).await {
            return Err(self.link_fault(format!("soft reset write failed: {e}")).await);
        }
        if let Err(e) = guard.get_mut().flush().await {
            return Err(self.link_fault(format!("soft reset flush failed: {e}")).await);
        }

        *self.homing.write().await = HomingState::Idle;
        warn!("Soft reset issued; re-homing required");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scan_core::config::ScannerConfig;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::sync::Mutex as TokioMutex;

    fn test_config() -> ScannerConfig {
        let mut config = ScannerConfig::default();
        config.serial.command_timeout = Duration::from_millis(500);
        config.scan.arrival_timeout = Duration::from_secs(5);
        config
    }

    fn controller_with(device: DuplexStream, config: &ScannerConfig) -> GrblController {
        let port = wrap_shared(Box::new(device));
        let controller = GrblController::new(config);
        *controller.port.try_write().unwrap() = Some(port);
        *controller.connection.try_write().unwrap() = ConnectionState::Connected;
        controller
    }

    /// Read one "command" from the host side: a full line, or a standalone
    /// status query byte.
    async fn read_command(port: &mut DuplexStream) -> Option<String> {
        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match port.read(&mut byte).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
            match byte[0] {
                b'?' if line.is_empty() => return Some("?".to_string()),
                b'\n' => return Some(String::from_utf8_lossy(&line).into_owned()),
                b'\r' => {}
                0x18 if line.is_empty() => return Some("\u{18}".to_string()),
                other => line.push(other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unlock_succeeds_on_third_attempt_with_documented_timing() {
        let (mut firmware, device) = tokio::io::duplex(1024);
        let controller = Arc::new(controller_with(device, &test_config()));

        let attempts = Arc::new(TokioMutex::new(0u32));
        let attempts_fw = attempts.clone();
        tokio::spawn(async move {
            while let Some(cmd) = read_command(&mut firmware).await {
                if cmd == UNLOCK_FRAME {
                    let mut n = attempts_fw.lock().await;
                    *n += 1;
                    if *n == 3 {
                        firmware.write_all(b"ok\r\n").await.unwrap();
                        firmware
                            .write_all(b"<Idle|MPos:0.000,0.000,0.000,0.000>\r\n")
                            .await
                            .unwrap();
                    }
                    // Attempts 1 and 2: the device stays mute.
                }
            }
        });

        let start = Instant::now();
        controller.unlock().await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(*attempts.lock().await, 3);
        // Two full 2.0s windows, two 0.5s gaps, prompt third ack, 1.0s settle.
        assert!(elapsed >= Duration::from_secs(6), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(6500), "elapsed {:?}", elapsed);
        assert_eq!(controller.homing_state().await, HomingState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn unlock_exhausts_exactly_three_attempts() {
        let (mut firmware, device) = tokio::io::duplex(1024);
        let controller = controller_with(device, &test_config());

        let attempts = Arc::new(TokioMutex::new(0u32));
        let attempts_fw = attempts.clone();
        tokio::spawn(async move {
            while let Some(cmd) = read_command(&mut firmware).await {
                if cmd == UNLOCK_FRAME {
                    *attempts_fw.lock().await += 1;
                }
            }
        });

        match controller.unlock().await {
            Err(ScanError::UnlockFailed { attempts: n }) => assert_eq!(n, 3),
            other => panic!("expected UnlockFailed, got {:?}", other),
        }
        assert_eq!(*attempts.lock().await, 3);
        assert_eq!(controller.homing_state().await, HomingState::Alarm);
    }

    #[tokio::test(start_paused = true)]
    async fn homing_completes_only_on_marker() {
        let (mut firmware, device) = tokio::io::duplex(1024);
        let controller = controller_with(device, &test_config());

        tokio::spawn(async move {
            while let Some(cmd) = read_command(&mut firmware).await {
                if cmd == HOME_FRAME {
                    // False friends first: ack and a bare idle report.
                    firmware.write_all(b"ok\r\n").await.unwrap();
                    firmware
                        .write_all(b"<Idle|MPos:0.000,0.000,0.000,0.000>\r\n")
                        .await
                        .unwrap();
                    sleep(Duration::from_secs(3)).await;
                    firmware
                        .write_all(b"[MSG:DBG: Homing done]\r\n")
                        .await
                        .unwrap();
                }
            }
        });

        let start = Instant::now();
        controller.home().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(controller.homing_state().await, HomingState::Homed);
    }

    #[tokio::test(start_paused = true)]
    async fn bare_idle_reports_never_complete_homing() {
        let (mut firmware, device) = tokio::io::duplex(1024);
        let controller = controller_with(device, &test_config());

        tokio::spawn(async move {
            if let Some(cmd) = read_command(&mut firmware).await {
                if cmd == HOME_FRAME {
                    // Keep announcing idle forever; the cycle never finished.
                    for _ in 0..20 {
                        firmware
                            .write_all(b"<Idle|MPos:0.000,0.000,0.000,0.000>\r\n")
                            .await
                            .unwrap();
                        firmware.write_all(b"ok\r\n").await.unwrap();
                        sleep(Duration::from_secs(10)).await;
                    }
                }
            }
        });

        let start = Instant::now();
        match controller.home().await {
            Err(ScanError::HomingTimeout { budget, .. }) => {
                assert_eq!(budget, Duration::from_secs(120));
            }
            other => panic!("expected HomingTimeout, got {:?}", other),
        }
        assert!(start.elapsed() >= Duration::from_secs(120));
        assert_eq!(controller.homing_state().await, HomingState::Alarm);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_is_unresponsive_after_30s() {
        let (mut firmware, device) = tokio::io::duplex(1024);
        let controller = controller_with(device, &test_config());

        tokio::spawn(async move {
            // Swallow the homing frame, then go completely quiet.
            let _ = read_command(&mut firmware).await;
            std::future::pending::<()>().await;
        });

        let start = Instant::now();
        match controller.home().await {
            Err(ScanError::Unresponsive { silence }) => {
                assert_eq!(silence, Duration::from_secs(30));
            }
            other => panic!("expected Unresponsive, got {:?}", other),
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30) && elapsed < Duration::from_secs(35));
    }

    #[tokio::test]
    async fn move_issues_one_combined_frame_and_confirms_arrival() {
        let (mut firmware, device) = tokio::io::duplex(1024);
        let controller = controller_with(device, &test_config());

        let frames = Arc::new(TokioMutex::new(Vec::new()));
        let frames_fw = frames.clone();
        tokio::spawn(async move {
            while let Some(cmd) = read_command(&mut firmware).await {
                if cmd == "?" {
                    firmware
                        .write_all(b"<Idle|MPos:10.000,20.000,5.000,90.000>\r\n")
                        .await
                        .unwrap();
                } else {
                    frames_fw.lock().await.push(cmd);
                    firmware.write_all(b"ok\r\n").await.unwrap();
                }
            }
        });

        let target = Position::new(10.0, 20.0, 5.0, 90.0);
        controller.move_to(target).await.unwrap();

        let frames = frames.lock().await;
        assert_eq!(frames.len(), 1, "expected one combined frame: {:?}", frames);
        let frame = &frames[0];
        assert!(frame.contains("X10.000"));
        assert!(frame.contains("Y20.000"));
        assert!(frame.contains("Z5.000"));
        assert!(frame.contains("A90.000"));

        // Arrival polling cached the reported position.
        assert_eq!(controller.position().await, Some(target));
    }

    #[tokio::test]
    async fn out_of_bounds_target_issues_zero_commands() {
        let (mut firmware, device) = tokio::io::duplex(1024);
        let controller = controller_with(device, &test_config());

        let bytes_seen = Arc::new(TokioMutex::new(0usize));
        let bytes_fw = bytes_seen.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok(n) = firmware.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                *bytes_fw.lock().await += n;
            }
        });

        match controller.move_to(Position::new(250.0, 0.0, 0.0, 0.0)).await {
            Err(ScanError::OutOfBounds { axis, .. }) => assert_eq!(axis, Axis::X),
            other => panic!("expected OutOfBounds, got {:?}", other),
        }

        sleep(Duration::from_millis(50)).await;
        assert_eq!(*bytes_seen.lock().await, 0);
    }

    #[tokio::test]
    async fn concurrent_sends_hit_the_wire_in_submission_order() {
        let (mut firmware, device) = tokio::io::duplex(4096);
        let controller = Arc::new(controller_with(device, &test_config()));

        let frames = Arc::new(TokioMutex::new(Vec::new()));
        let frames_fw = frames.clone();
        tokio::spawn(async move {
            while let Some(cmd) = read_command(&mut firmware).await {
                frames_fw.lock().await.push(cmd);
                firmware.write_all(b"ok\r\n").await.unwrap();
            }
        });

        let mut handles = Vec::new();
        for i in 0..6 {
            let controller = controller.clone();
            handles.push(tokio::spawn(async move {
                controller
                    .send(&format!("G4 P0.00{}", i), Duration::from_secs(1))
                    .await
            }));
            // Stagger so submission order is well defined.
            sleep(Duration::from_millis(10)).await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let frames = frames.lock().await;
        let expected: Vec<String> = (0..6).map(|i| format!("G4 P0.00{}", i)).collect();
        assert_eq!(*frames, expected);
    }

    #[tokio::test]
    async fn link_loss_mid_command_fails_and_flags_error_state() {
        let (mut firmware, device) = tokio::io::duplex(1024);
        let controller = controller_with(device, &test_config());

        tokio::spawn(async move {
            // Take the frame, then hang up without answering.
            let _ = read_command(&mut firmware).await;
            drop(firmware);
        });

        match controller.send("G4 P0", Duration::from_secs(1)).await {
            Err(ScanError::Connection(_)) => {}
            other => panic!("expected Connection error, got {:?}", other),
        }
        assert_eq!(
            controller.connection_state().await,
            ConnectionState::Error
        );
    }

    #[tokio::test]
    async fn status_query_parses_report_and_caches_position() {
        let (mut firmware, device) = tokio::io::duplex(1024);
        let controller = controller_with(device, &test_config());

        tokio::spawn(async move {
            while let Some(cmd) = read_command(&mut firmware).await {
                if cmd == "?" {
                    firmware
                        .write_all(b"<Run|MPos:1.500,0.000,0.000,45.000>\r\n")
                        .await
                        .unwrap();
                }
            }
        });

        let report = controller.query_status().await.unwrap();
        assert_eq!(report.state, MachineState::Run);
        assert_eq!(
            controller.position().await,
            Some(Position::new(1.5, 0.0, 0.0, 45.0))
        );
    }
}
