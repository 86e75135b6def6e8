// Serial port adapter: open, timed reads, reconnect backoff, discovery.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_serial::{
    DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialPortType, SerialStream, StopBits,
};
use tracing::debug;

/// Base delay before the first reconnect attempt.
pub const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Ceiling for the doubling reconnect delay.
pub const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Substrings that mark a USB serial device as a likely NFC tool.
const NFC_KEYWORDS: [&str; 5] = ["nfc", "pn532", "acr122", "proxmark", "chameleon"];

/// Error raised by the serial adapter.
#[derive(Debug, Error)]
pub enum SerialError {
    /// Opening the device failed.
    #[error("failed to open serial port '{port}': {source}")]
    Open {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },
    /// Enumerating system ports failed.
    #[error("failed to enumerate serial ports: {0}")]
    Enumerate(#[source] tokio_serial::Error),
    /// I/O failure on an open port.
    #[error("serial i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Seam between the pipelines and the operating system's serial devices.
///
/// The production opener hands out [`SerialStream`]s; tests substitute
/// in-memory duplex ports.
pub trait PortOpener: Send + Sync + 'static {
    type Port: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Opens `name` at `baud`, 8N1, no flow control.
    fn open(&self, name: &str, baud: u32) -> Result<Self::Port, SerialError>;
}

/// [`PortOpener`] backed by the operating system's serial devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    type Port = SerialStream;

    fn open(&self, name: &str, baud: u32) -> Result<Self::Port, SerialError> {
        tokio_serial::new(name, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|source| SerialError::Open {
                port: name.to_string(),
                source,
            })
    }
}

/// Outcome of a timed serial read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes landed in the buffer.
    Data(usize),
    /// Nothing arrived within the budget.
    TimedOut,
    /// The peer closed the stream.
    Closed,
}

/// Reads into `buf` with a per-call timeout. A zero-byte read is reported
/// as [`ReadOutcome::Closed`] so callers can start reconnecting.
pub async fn read_some<T>(
    port: &mut T,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<ReadOutcome, io::Error>
where
    T: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, port.read(buf)).await {
        Ok(Ok(0)) => Ok(ReadOutcome::Closed),
        Ok(Ok(n)) => Ok(ReadOutcome::Data(n)),
        Ok(Err(err)) => Err(err),
        Err(_elapsed) => Ok(ReadOutcome::TimedOut),
    }
}

/// Doubling reconnect delay with a fixed cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            next: base,
        }
    }

    /// The delay to sleep before the next attempt; doubles up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.cap);
        delay
    }

    /// Returns to the base delay after a successful reconnect.
    pub fn reset(&mut self) {
        self.next = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BACKOFF_BASE, BACKOFF_CAP)
    }
}

/// Lists serial ports whose USB descriptors look like NFC hardware.
pub fn find_candidate_ports() -> Result<Vec<String>, SerialError> {
    let ports = tokio_serial::available_ports().map_err(SerialError::Enumerate)?;
    let mut candidates = Vec::new();
    for info in ports {
        if let SerialPortType::UsbPort(usb) = &info.port_type {
            let descriptor = format!(
                "{} {}",
                usb.product.as_deref().unwrap_or(""),
                usb.manufacturer.as_deref().unwrap_or("")
            )
            .to_ascii_lowercase();
            if NFC_KEYWORDS.iter().any(|kw| descriptor.contains(kw)) {
                debug!(port = %info.port_name, "nfc candidate port");
                candidates.push(info.port_name);
            }
        }
    }
    Ok(candidates)
}
