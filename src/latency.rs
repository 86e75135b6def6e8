// Round-trip latency metering with a sliding sample window.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use crate::api::Direction;
use crate::apdu::Fingerprint;

/// One measured command/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySample {
    pub started_at_ns: u64,
    pub ended_at_ns: u64,
    pub direction: Direction,
    pub fingerprint: Fingerprint,
}

impl LatencySample {
    pub fn duration_ns(&self) -> u64 {
        self.ended_at_ns - self.started_at_ns
    }
}

/// Statistics over the current sample window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LatencyStats {
    pub count: usize,
    pub mean_ns: f64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub std_dev_ns: f64,
    pub p50_ns: u64,
    pub p95_ns: u64,
    pub p99_ns: u64,
}

/// Outcome of closing out a pending exchange.
#[derive(Debug, Clone, Copy)]
pub enum StopOutcome {
    /// The pending command was matched; the threshold flag marks a
    /// high-latency breach.
    Sample {
        sample: LatencySample,
        breached: bool,
    },
    /// No command was pending in that direction.
    Orphan,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    fingerprint: Fingerprint,
    started_at_ns: u64,
    le_hint: Option<u32>,
}

#[derive(Debug, Default)]
struct Inner {
    window: VecDeque<LatencySample>,
    pending: [Option<Pending>; 2],
    orphaned: u64,
}

/// Pairs command-start with response-stop timestamps and keeps the most
/// recent `window_size` samples.
///
/// One pending slot exists per direction; a new command overwrites an
/// unanswered one and counts it as orphaned. All timestamps come from a
/// single monotonic epoch so `ended >= started` always holds.
#[derive(Debug)]
pub struct LatencyMeter {
    epoch: Instant,
    window_size: usize,
    threshold_ns: u64,
    inner: Mutex<Inner>,
}

impl LatencyMeter {
    pub fn new(window_size: usize, threshold_ns: u64) -> Self {
        Self {
            epoch: Instant::now(),
            window_size: window_size.max(1),
            threshold_ns,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Nanoseconds since the meter's epoch.
    pub fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Records a forwarded command awaiting its response. Returns `true`
    /// when an unanswered command was overwritten (now orphaned).
    pub fn start(&self, direction: Direction, fingerprint: Fingerprint, le_hint: Option<u32>) -> bool {
        let now = self.now_ns();
        let mut inner = self.inner.lock().unwrap();
        let slot = &mut inner.pending[direction.as_index()];
        let orphaned = slot.is_some();
        *slot = Some(Pending {
            fingerprint,
            started_at_ns: now,
            le_hint,
        });
        if orphaned {
            inner.orphaned += 1;
        }
        orphaned
    }

    /// The Le of the command currently awaiting a response, if any.
    pub fn expected_le(&self, direction: Direction) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        inner.pending[direction.as_index()].and_then(|p| p.le_hint)
    }

    /// Closes the pending exchange in `direction` with the arrival of its
    /// response, inserting a sample into the window.
    pub fn stop(&self, direction: Direction) -> StopOutcome {
        let now = self.now_ns();
        let mut inner = self.inner.lock().unwrap();
        let Some(pending) = inner.pending[direction.as_index()].take() else {
            inner.orphaned += 1;
            return StopOutcome::Orphan;
        };
        let sample = LatencySample {
            started_at_ns: pending.started_at_ns,
            ended_at_ns: now.max(pending.started_at_ns),
            direction,
            fingerprint: pending.fingerprint,
        };
        if inner.window.len() == self.window_size {
            inner.window.pop_front();
        }
        inner.window.push_back(sample);
        StopOutcome::Sample {
            sample,
            breached: sample.duration_ns() > self.threshold_ns,
        }
    }

    /// Commands overwritten or responses without a pending command.
    pub fn orphaned(&self) -> u64 {
        self.inner.lock().unwrap().orphaned
    }

    /// Statistics over the current window. Percentiles use the
    /// nearest-rank method over a sorted copy.
    pub fn snapshot(&self) -> LatencyStats {
        let durations: Vec<u64> = {
            let inner = self.inner.lock().unwrap();
            inner.window.iter().map(|s| s.duration_ns()).collect()
        };
        if durations.is_empty() {
            return LatencyStats::default();
        }

        let count = durations.len();
        let min_ns = durations.iter().copied().min().unwrap_or(0);
        let max_ns = durations.iter().copied().max().unwrap_or(0);
        let mean_ns = durations.iter().map(|&d| d as f64).sum::<f64>() / count as f64;
        let std_dev_ns = if count > 1 {
            let var = durations
                .iter()
                .map(|&d| {
                    let diff = d as f64 - mean_ns;
                    diff * diff
                })
                .sum::<f64>()
                / (count - 1) as f64;
            var.sqrt()
        } else {
            0.0
        };

        let mut sorted = durations;
        sorted.sort_unstable();
        let rank = |q: f64| {
            let idx = (q * count as f64).ceil() as usize;
            sorted[idx.clamp(1, count) - 1]
        };

        LatencyStats {
            count,
            mean_ns,
            min_ns,
            max_ns,
            std_dev_ns,
            p50_ns: rank(0.50),
            p95_ns: rank(0.95),
            p99_ns: rank(0.99),
        }
    }

    /// Drops all samples and pending exchanges.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.window.clear();
        inner.pending = [None, None];
        inner.orphaned = 0;
    }
}
