// Public relay surface: directions, error taxonomy, event stream types.

use std::collections::BTreeMap;
use std::fmt;

use crate::apdu::{Fingerprint, FramingFault};
use crate::latency::LatencyStats;

/// Direction of an APDU flow through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Reader commands travelling towards the card side.
    ClientToHost,
    /// Card responses travelling back to the reader.
    HostToClient,
}

impl Direction {
    /// The opposite flow.
    pub const fn opposite(self) -> Direction {
        match self {
            Direction::ClientToHost => Direction::HostToClient,
            Direction::HostToClient => Direction::ClientToHost,
        }
    }

    /// Numeric index used by per-direction tables.
    pub const fn as_index(self) -> usize {
        match self {
            Direction::ClientToHost => 0,
            Direction::HostToClient => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToHost => "client_to_host",
            Direction::HostToClient => "host_to_client",
        }
    }

    /// Both flows in index order.
    pub const fn all() -> [Direction; 2] {
        [Direction::ClientToHost, Direction::HostToClient]
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coordinator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// An unrecoverable pipeline fault; requires restart.
    Faulted,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RelayState::Stopped => "stopped",
            RelayState::Starting => "starting",
            RelayState::Running => "running",
            RelayState::Stopping => "stopping",
            RelayState::Faulted => "faulted",
        };
        f.write_str(label)
    }
}

/// Error classification used by counters, events, and the fatal handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// A ring had no room; backpressure applied.
    BufferFull,
    /// A frame or fragment failed framing; bytes drained.
    Malformed,
    /// A serial read exceeded its budget.
    Timeout,
    /// Serial I/O failed; reconnect in progress.
    Io,
    /// A port is gone while the adapter retries.
    PortUnavailable,
    /// A command or response without its counterpart.
    Orphaned,
    /// A sample above the latency threshold.
    HighLatency,
    /// Bytes abandoned at the shutdown deadline.
    ShutdownDropped,
    /// Repeated unrecoverable failure.
    Fatal,
}

impl ErrorKind {
    /// Every kind, in counter order.
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::BufferFull,
        ErrorKind::Malformed,
        ErrorKind::Timeout,
        ErrorKind::Io,
        ErrorKind::PortUnavailable,
        ErrorKind::Orphaned,
        ErrorKind::HighLatency,
        ErrorKind::ShutdownDropped,
        ErrorKind::Fatal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BufferFull => "buffer_full",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Io => "io_error",
            ErrorKind::PortUnavailable => "port_unavailable",
            ErrorKind::Orphaned => "orphaned",
            ErrorKind::HighLatency => "high_latency",
            ErrorKind::ShutdownDropped => "shutdown_dropped",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte and frame throughput since start.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Throughput {
    pub bytes_per_sec: f64,
    pub frames_per_sec: f64,
}

/// Fill level of one pipeline's rings, as fractions of capacity.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BufferUsage {
    pub rx: f64,
    pub tx: f64,
}

/// Immutable statistics record, produced on demand and on metric ticks.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Monotonic emission sequence number.
    pub seq: u64,
    pub uptime_ns: u64,
    /// Command frames forwarded client to host.
    pub frames: u64,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub errors: BTreeMap<ErrorKind, u64>,
    pub latency: LatencyStats,
    pub throughput: Throughput,
    /// Ring fill ratios indexed by [`Direction::as_index`].
    pub buffer_usage: [BufferUsage; 2],
}

/// Events delivered through [`MetricStream`](crate::publish::MetricStream).
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Periodic or on-demand statistics record.
    Snapshot(Snapshot),
    /// A sample exceeded the configured latency threshold.
    HighLatency {
        sample_ns: u64,
        direction: Direction,
        fingerprint: Fingerprint,
    },
    /// A frame or fragment failed framing.
    FramingError {
        kind: FramingFault,
        direction: Direction,
    },
    /// A serial port vanished; reconnection with backoff is underway.
    PortUnavailable { direction: Direction },
    /// The coordinator restarted after a fault.
    Restarted { reason: String },
}
