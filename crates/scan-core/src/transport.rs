//! Async serial transport shared by the protocol driver.
//!
//! Byte-level open/close/read/write only; no protocol knowledge lives here.
//! Ports are type-erased behind [`SerialPortIO`] so a
//! `tokio::io::DuplexStream` stands in for real hardware in tests, and
//! wrapped in a `BufReader` because the motion firmware speaks a
//! line-delimited textual protocol.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::sync::Mutex;

/// Trait alias for anything usable as an async serial port: the real
/// `tokio_serial::SerialStream`, a `DuplexStream` in tests, or any mock
/// implementing the async I/O traits.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Thread-safe shared serial port with buffered line reading.
///
/// This is the only handle the protocol state machine keeps; exclusive
/// access is mediated by the command gate sitting in front of it.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

/// Wrap a type-erased port for shared buffered access.
pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

/// Open a serial port asynchronously.
///
/// Opening goes through `spawn_blocking` because the underlying syscalls can
/// stall on flaky USB adapters. Standard settings: 8N1, no flow control.
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!(
                "Failed to open {} serial port: {}",
                device_name_owned, port_path_owned
            ))
    })
    .await
    .map_err(|e| anyhow::anyhow!("spawn_blocking for serial port opening failed: {e}"))?
}

/// Drain stale bytes from a serial port.
///
/// Reads and discards until no more data arrives within `timeout_ms`.
/// Motion firmware greets with a banner on reset and may hold queued status
/// reports; draining before the first command keeps response matching clean.
///
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn shared_port_reads_lines_from_duplex() {
        let (mut firmware, host) = tokio::io::duplex(64);
        let port: SharedPort = wrap_shared(Box::new(host));

        firmware.write_all(b"ok\r\n").await.unwrap();

        let mut guard = port.lock().await;
        let mut line = String::new();
        guard.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim(), "ok");
    }

    #[tokio::test]
    async fn drain_discards_reset_banner() {
        let (mut firmware, mut host) = tokio::io::duplex(256);
        firmware
            .write_all(b"Grbl 1.1h ['$' for help]\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let discarded = drain_serial_buffer(&mut host, 50).await;
        assert_eq!(discarded, 26);
    }

    #[tokio::test]
    async fn shared_port_clones_share_the_stream() {
        let (mut firmware, host) = tokio::io::duplex(64);
        let port: SharedPort = wrap_shared(Box::new(host));
        let clone = port.clone();

        firmware.write_all(b"<Idle|MPos:0,0,0,0>\r\n").await.unwrap();

        let mut guard = clone.lock().await;
        let mut line = String::new();
        guard.read_line(&mut line).await.unwrap();
        assert!(line.contains("Idle"));
    }
}
