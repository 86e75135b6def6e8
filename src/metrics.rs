// metrics.rs - Prometheus registry for relay counters and gauges
use std::collections::BTreeMap;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Registry};
use thiserror::Error;

use crate::api::{Direction, ErrorKind};

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub frames_forwarded: IntCounterVec,
    pub bytes_rx_total: IntCounter,
    pub bytes_tx_total: IntCounter,
    pub errors_total: IntCounterVec,
    pub exchange_latency_seconds: Histogram,
    pub ring_depth: IntGaugeVec,
    pub reconnects_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("cardport".into()), None)?;

        macro_rules! register_counter {
            ($name:expr, $help:expr) => {{
                let counter = IntCounter::new($name, $help)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_counter_vec {
            ($name:expr, $help:expr, $labels:expr) => {{
                let counter = IntCounterVec::new(prometheus::Opts::new($name, $help), $labels)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_gauge_vec {
            ($name:expr, $help:expr, $labels:expr) => {{
                let gauge = IntGaugeVec::new(prometheus::Opts::new($name, $help), $labels)?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            }};
        }

        let frames_forwarded = register_counter_vec!(
            "frames_forwarded_total",
            "Complete APDU frames forwarded per direction",
            &["direction"]
        );
        let bytes_rx_total =
            register_counter!("bytes_rx_total", "Bytes read from both serial ports");
        let bytes_tx_total =
            register_counter!("bytes_tx_total", "Bytes written to both serial ports");
        let errors_total = register_counter_vec!(
            "errors_total",
            "Errors and recoverable events by kind",
            &["kind"]
        );
        let latency_opts = HistogramOpts::new(
            "exchange_latency_seconds",
            "Command to response round-trip latency",
        )
        .buckets(vec![
            0.0005, 0.001, 0.002, 0.005, 0.010, 0.025, 0.050, 0.100,
        ]);
        let exchange_latency_seconds = Histogram::with_opts(latency_opts)?;
        registry.register(Box::new(exchange_latency_seconds.clone()))?;
        let ring_depth = register_gauge_vec!(
            "ring_depth_bytes",
            "Unread bytes per pipeline ring",
            &["direction", "ring"]
        );
        let reconnects_total =
            register_counter!("reconnects_total", "Serial port reconnect attempts");

        Ok(Self {
            registry,
            frames_forwarded,
            bytes_rx_total,
            bytes_tx_total,
            errors_total,
            exchange_latency_seconds,
            ring_depth,
            reconnects_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Bumps the counter for one error kind.
    pub fn record_error(&self, kind: ErrorKind) {
        self.errors_total.with_label_values(&[kind.as_str()]).inc();
    }

    /// Current error counters keyed by kind.
    pub fn errors_by_kind(&self) -> BTreeMap<ErrorKind, u64> {
        ErrorKind::ALL
            .iter()
            .map(|kind| {
                (
                    *kind,
                    self.errors_total.with_label_values(&[kind.as_str()]).get(),
                )
            })
            .collect()
    }

    /// Frames forwarded in one direction.
    pub fn frames(&self, direction: Direction) -> u64 {
        self.frames_forwarded
            .with_label_values(&[direction.as_str()])
            .get()
    }

    /// Updates the depth gauge for one ring.
    pub fn set_ring_depth(&self, direction: Direction, ring: &str, depth: usize) {
        self.ring_depth
            .with_label_values(&[direction.as_str(), ring])
            .set(depth as i64);
    }

    /// Reads back the depth gauge for one ring.
    pub fn ring_depth(&self, direction: Direction, ring: &str) -> i64 {
        self.ring_depth
            .with_label_values(&[direction.as_str(), ring])
            .get()
    }
}
