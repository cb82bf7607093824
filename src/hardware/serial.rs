//! Serial port plumbing for dongle-attached sensors.
//!
//! # Types
//!
//! - [`SerialPortIO`]: trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: type-erased boxed serial port
//!
//! # Utilities
//!
//! - [`open_serial_async`]: open a port with spawn_blocking (feature `tokio_serial`)
//! - [`drain_serial_buffer`]: discard stale bytes
//! - [`read_burst`]: collect an unframed, multi-line reply

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::Instant;

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control.
///
/// # Errors
///
/// Returns an error if the port cannot be opened or spawn_blocking fails.
#[cfg(feature = "tokio_serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    timeout: Duration,
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
            .timeout(timeout)
            .open_native_async()
            .context(format!(
                "Failed to open {} serial port: {}",
                device_name_owned, port_path_owned
            ))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards until nothing arrives within `timeout`. Returns the
/// number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin + ?Sized>(
    port: &mut R,
    timeout: Duration,
) -> usize {
    let mut discard = [0u8; 256];
    let mut total = 0usize;

    loop {
        match tokio::time::timeout(timeout, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    total
}

/// Timing of a [`read_burst`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstTiming {
    /// Hard limit on the whole burst.
    pub window: Duration,
    /// Silence that ends the burst early...
    pub idle: Duration,
    /// ...but only within this margin of the window's end.
    pub tail: Duration,
    /// Poll granularity.
    pub poll: Duration,
}

impl Default for BurstTiming {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(400),
            idle: Duration::from_millis(100),
            tail: Duration::from_millis(200),
            poll: Duration::from_millis(10),
        }
    }
}

/// Collect everything a dongle prints in response to one command.
///
/// Dongle firmwares print a variable number of lines with no end marker, so
/// the reply is whatever arrives within `timing.window`. Once the window is
/// nearly over (`timing.tail`) a silence of `timing.idle` ends the burst
/// early. Read errors end the burst with whatever was collected.
pub async fn read_burst<R: AsyncRead + Unpin + ?Sized>(
    port: &mut R,
    timing: BurstTiming,
) -> Vec<u8> {
    let started = Instant::now();
    let deadline = started + timing.window;
    let mut last_data = started;
    let mut out = Vec::new();
    let mut chunk = [0u8; 256];

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let wait = timing.poll.min(deadline - now);
        match tokio::time::timeout(wait, port.read(&mut chunk)).await {
            Ok(Ok(n)) if n > 0 => {
                out.extend_from_slice(&chunk[..n]);
                last_data = Instant::now();
                continue;
            }
            Ok(Err(_)) => break,
            // EOF returns immediately, so pace it like a timed-out poll.
            Ok(Ok(_)) => tokio::time::sleep(wait).await,
            Err(_) => {}
        }

        let now = Instant::now();
        if now.duration_since(last_data) > timing.idle && now + timing.tail > deadline {
            break;
        }
    }

    out
}
