// Bounded fan-out of relay events to external subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::api::RelayEvent;

/// Per-subscriber queue depth; a subscriber lagging further than this
/// loses the oldest records.
pub const SUBSCRIBER_QUEUE: usize = 64;

/// Broadcast hub for [`RelayEvent`] records.
///
/// Cheap to clone; every clone feeds the same subscribers. Snapshot
/// sequence numbers are allocated here so emission order matches `seq`
/// order.
#[derive(Debug, Clone)]
pub struct MetricsPublisher {
    tx: broadcast::Sender<RelayEvent>,
    seq: Arc<AtomicU64>,
}

impl MetricsPublisher {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(SUBSCRIBER_QUEUE);
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Allocates the next snapshot sequence number.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Delivers an event to all current subscribers. Events emitted with
    /// no subscriber attached are discarded.
    pub fn emit(&self, event: RelayEvent) {
        if self.tx.send(event).is_err() {
            trace!("relay event dropped: no subscribers");
        }
    }

    /// Opens a new subscription starting at the current stream position.
    pub fn subscribe(&self) -> MetricStream {
        MetricStream {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for MetricsPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// A lazy sequence of relay events consumed at the subscriber's pace.
///
/// Slow consumers do not block the relay: once more than
/// [`SUBSCRIBER_QUEUE`] records pile up, the oldest are discarded and
/// surface in [`dropped`](MetricStream::dropped).
pub struct MetricStream {
    rx: broadcast::Receiver<RelayEvent>,
    dropped: u64,
}

impl MetricStream {
    /// Waits for the next event. Returns `None` once the relay shuts the
    /// stream down.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](MetricStream::recv).
    pub fn try_recv(&mut self) -> Option<RelayEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(_) => return None,
            }
        }
    }

    /// Records lost to the drop-oldest policy so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
