// Cardport public library surface.

pub mod config;

pub mod ring;

pub mod apdu;

pub mod api;

pub mod latency;

pub mod serial;

pub mod metrics;

pub mod publish;

pub mod relay;

mod pipeline;

pub use config::{ConfigError, RelayConfig};

pub use ring::{spsc, RingConsumer, RingError, RingProducer, RingView};

pub use apdu::{
    build_response, parse_command, parse_response, xor_checksum, ApduCase, ApduError, ApduFrame,
    Fingerprint, FrameStatus, Framer, FramingFault, ResponseFrame, MAX_COMMAND_LEN,
    MAX_RESPONSE_LEN,
};

pub use api::{
    BufferUsage, Direction, ErrorKind, RelayEvent, RelayState, Snapshot, Throughput,
};

pub use latency::{LatencyMeter, LatencySample, LatencyStats, StopOutcome};

pub use serial::{
    find_candidate_ports, read_some, Backoff, PortOpener, ReadOutcome, SerialError, SystemPorts,
    BACKOFF_BASE, BACKOFF_CAP,
};

pub use metrics::{Metrics, MetricsError};

pub use publish::{MetricStream, MetricsPublisher, SUBSCRIBER_QUEUE};

pub use relay::{Relay, RelayError};
