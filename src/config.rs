// Configuration schema for the relay.

use std::{
    env, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

/// Why a configuration could not be loaded or accepted.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The named file was unreadable.
    #[error("cannot read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The contents were not well-formed TOML for this schema.
    #[error("bad config syntax: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value failed a range or consistency check.
    #[error("{0}")]
    Invalid(String),
}

/// Relay configuration. The two port names are required; every other
/// option has a default tuned for 921 600 baud operation.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// OS-native name of the reader-side serial port.
    pub client_port: String,
    /// OS-native name of the card-side serial port.
    pub host_port: String,
    /// Baud rate applied to both ports (8N1, no flow control).
    #[serde(default = "defaults::baud_rate")]
    pub baud_rate: u32,
    /// Capacity of each pipeline ring in bytes; powers of two recommended.
    #[serde(default = "defaults::buffer_capacity")]
    pub buffer_capacity: usize,
    /// Per-call serial read budget.
    #[serde(default = "defaults::read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Inter-byte gap that flushes ambiguous short frames.
    #[serde(default = "defaults::inter_byte_idle_ms")]
    pub inter_byte_idle_ms: u64,
    /// Number of samples the latency window retains.
    #[serde(default = "defaults::latency_window_size")]
    pub latency_window_size: usize,
    /// High-water latency threshold in nanoseconds.
    #[serde(default = "defaults::latency_threshold_ns")]
    pub latency_threshold_ns: u64,
    /// Interval between periodic snapshot emissions.
    #[serde(default = "defaults::metric_tick_ms")]
    pub metric_tick_ms: u64,
    /// Additional attempts for a failed frame forward.
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
    /// Restart the relay after a fatal pipeline error.
    #[serde(default)]
    pub auto_restart: bool,
    /// Deadline for draining in-flight frames on stop.
    #[serde(default = "defaults::shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Verify the advisory trailing XOR checksum on each frame.
    #[serde(default)]
    pub verify_checksum: bool,
    /// Reject frames whose header violates the ISO 7816-4 profile.
    #[serde(default = "defaults::validate_headers")]
    pub validate_headers: bool,
}

mod defaults {
    pub fn baud_rate() -> u32 {
        921_600
    }
    pub fn buffer_capacity() -> usize {
        4096
    }
    pub fn read_timeout_ms() -> u64 {
        1
    }
    pub fn inter_byte_idle_ms() -> u64 {
        2
    }
    pub fn latency_window_size() -> usize {
        100
    }
    pub fn latency_threshold_ns() -> u64 {
        5_000_000
    }
    pub fn metric_tick_ms() -> u64 {
        100
    }
    pub fn max_retries() -> u32 {
        1
    }
    pub fn shutdown_timeout_ms() -> u64 {
        500
    }
    pub fn validate_headers() -> bool {
        true
    }
}

impl RelayConfig {
    /// Creates a configuration with default tunables for the given ports.
    pub fn new(client_port: impl Into<String>, host_port: impl Into<String>) -> Self {
        Self {
            client_port: client_port.into(),
            host_port: host_port.into(),
            baud_rate: defaults::baud_rate(),
            buffer_capacity: defaults::buffer_capacity(),
            read_timeout_ms: defaults::read_timeout_ms(),
            inter_byte_idle_ms: defaults::inter_byte_idle_ms(),
            latency_window_size: defaults::latency_window_size(),
            latency_threshold_ns: defaults::latency_threshold_ns(),
            metric_tick_ms: defaults::metric_tick_ms(),
            max_retries: defaults::max_retries(),
            auto_restart: false,
            shutdown_timeout_ms: defaults::shutdown_timeout_ms(),
            verify_checksum: false,
            validate_headers: defaults::validate_headers(),
        }
    }

    /// Reads the file named by the `CARDPORT_CONFIG` environment
    /// variable. There is no fallback: port names cannot be guessed.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("CARDPORT_CONFIG").map_err(|_| {
            ConfigError::Invalid("CARDPORT_CONFIG is not set and no ports were given".into())
        })?;
        Self::from_path(path)
    }

    /// Reads a TOML file into a validated configuration.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => text.parse(),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Checks every tunable against its allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn require(ok: bool, what: &str) -> Result<(), ConfigError> {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::Invalid(what.to_string()))
            }
        }
        require(!self.client_port.is_empty(), "client_port must be set")?;
        require(!self.host_port.is_empty(), "host_port must be set")?;
        require(
            self.client_port != self.host_port,
            "client_port and host_port must differ",
        )?;
        require(self.baud_rate > 0, "baud_rate must be > 0")?;
        require(
            self.buffer_capacity >= 16,
            "buffer_capacity must be at least 16 bytes",
        )?;
        require(self.read_timeout_ms > 0, "read_timeout_ms must be > 0")?;
        require(
            self.inter_byte_idle_ms > 0,
            "inter_byte_idle_ms must be > 0",
        )?;
        require(
            self.latency_window_size > 0,
            "latency_window_size must be > 0",
        )?;
        require(self.metric_tick_ms > 0, "metric_tick_ms must be > 0")?;
        require(
            self.shutdown_timeout_ms > 0,
            "shutdown_timeout_ms must be > 0",
        )?;
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.inter_byte_idle_ms)
    }

    pub fn metric_tick(&self) -> Duration {
        Duration::from_millis(self.metric_tick_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl FromStr for RelayConfig {
    type Err = ConfigError;

    /// Parses TOML text and validates the result in one step.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let config: RelayConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}
