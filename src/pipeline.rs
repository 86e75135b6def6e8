// One pipeline per port side: serial read, frame, hand off, serial write.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::api::{Direction, ErrorKind, RelayEvent};
use crate::apdu::{parse_command, Fingerprint, FrameStatus, Framer, FramingFault};
use crate::latency::{LatencyMeter, StopOutcome};
use crate::metrics::Metrics;
use crate::publish::MetricsPublisher;
use crate::ring::{RingConsumer, RingProducer};
use crate::serial::{read_some, Backoff, PortOpener, ReadOutcome};

/// Consecutive write failures tolerated before the pipeline surfaces a
/// fatal error to the coordinator.
const MAX_ERROR_BURST: u32 = 4;

/// Serial read chunk and ring-to-ring copy unit.
const CHUNK: usize = 1024;

/// Pause applied when neither reading nor forwarding can advance.
const STALL_PAUSE: Duration = Duration::from_micros(100);

/// What the bytes being framed on this side are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FramerRole {
    /// Reader side: frames are APDU commands.
    Commands,
    /// Card side: frames are APDU responses.
    Responses,
}

/// Boundary record shipped alongside forwarded bytes so the draining side
/// can act on whole frames.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameMeta {
    pub len: usize,
    pub kind: FrameKind,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum FrameKind {
    Command {
        fingerprint: Fingerprint,
        le: Option<u32>,
    },
    Response,
}

/// Terminal pipeline outcome reported to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipelineExit {
    Stopped,
    Fatal(ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Idle,
    Reading,
    Forwarding,
    Blocked,
    Draining,
    Error,
    Stopped,
}

impl PipelineState {
    fn as_str(self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Reading => "reading",
            PipelineState::Forwarding => "forwarding",
            PipelineState::Blocked => "blocked",
            PipelineState::Draining => "draining",
            PipelineState::Error => "error",
            PipelineState::Stopped => "stopped",
        }
    }
}

/// Why `pump_tx` gave up.
enum TxFailure {
    /// The port is gone; reconnect and resume.
    Reconnect,
    /// Too many consecutive failures; stop the pipeline.
    Fatal,
}

/// A frame recognized in the rx ring, being copied into the outbound ring.
#[derive(Debug)]
struct PendingForward {
    len: usize,
    offset: usize,
    kind: FrameKind,
    reported_full: bool,
}

/// The frame currently leaving through the serial port.
#[derive(Debug)]
struct InflightWrite {
    meta: FrameMeta,
    written: usize,
}

enum FrameDecision {
    None,
    Complete {
        len: usize,
        kind: FrameKind,
        integrity_fault: Option<FramingFault>,
    },
    Malformed(FramingFault),
}

/// Ring ends and boundary channels wiring one pipeline into the pair.
pub(crate) struct PipelineWiring {
    pub rx_prod: RingProducer,
    pub rx_cons: RingConsumer,
    pub fwd: RingProducer,
    pub fwd_meta: mpsc::UnboundedSender<FrameMeta>,
    pub tx: RingConsumer,
    pub tx_meta: mpsc::UnboundedReceiver<FrameMeta>,
}

/// Shared collaborators handed down from the coordinator.
pub(crate) struct PipelineDeps<P: PortOpener> {
    pub opener: Arc<P>,
    pub meter: Arc<LatencyMeter>,
    pub metrics: Arc<Metrics>,
    pub publisher: MetricsPublisher,
    pub shutdown: watch::Receiver<bool>,
}

/// Per-pipeline tunables derived from the relay configuration.
pub(crate) struct PipelineTuning {
    pub framer: Framer,
    pub read_timeout: Duration,
    pub idle_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_retries: u32,
}

pub(crate) struct Pipeline<P: PortOpener> {
    /// The flow this side's framer feeds: the client pipeline forwards
    /// commands client->host, the host pipeline responses host->client.
    side: Direction,
    role: FramerRole,
    port_name: String,
    baud: u32,
    opener: Arc<P>,
    port: Option<P::Port>,
    framer: Framer,
    rx_prod: RingProducer,
    rx_cons: RingConsumer,
    fwd: RingProducer,
    fwd_meta: mpsc::UnboundedSender<FrameMeta>,
    tx: RingConsumer,
    tx_meta: mpsc::UnboundedReceiver<FrameMeta>,
    meter: Arc<LatencyMeter>,
    metrics: Arc<Metrics>,
    publisher: MetricsPublisher,
    shutdown: watch::Receiver<bool>,
    read_timeout: Duration,
    idle_timeout: Duration,
    shutdown_timeout: Duration,
    max_retries: u32,
    state: PipelineState,
    scratch: Vec<u8>,
    frame_scratch: Vec<u8>,
    last_byte_at: Option<Instant>,
    pending_forward: Option<PendingForward>,
    inflight_write: Option<InflightWrite>,
    backoff: Backoff,
    write_error_burst: u32,
    stall_counted: bool,
}

impl<P: PortOpener> Pipeline<P> {
    pub(crate) fn new(
        side: Direction,
        role: FramerRole,
        port_name: String,
        baud: u32,
        port: P::Port,
        wiring: PipelineWiring,
        deps: PipelineDeps<P>,
        tuning: PipelineTuning,
    ) -> Self {
        Self {
            side,
            role,
            port_name,
            baud,
            opener: deps.opener,
            port: Some(port),
            framer: tuning.framer,
            rx_prod: wiring.rx_prod,
            rx_cons: wiring.rx_cons,
            fwd: wiring.fwd,
            fwd_meta: wiring.fwd_meta,
            tx: wiring.tx,
            tx_meta: wiring.tx_meta,
            meter: deps.meter,
            metrics: deps.metrics,
            publisher: deps.publisher,
            shutdown: deps.shutdown,
            read_timeout: tuning.read_timeout,
            idle_timeout: tuning.idle_timeout,
            shutdown_timeout: tuning.shutdown_timeout,
            max_retries: tuning.max_retries,
            state: PipelineState::Idle,
            scratch: vec![0u8; CHUNK],
            frame_scratch: Vec::new(),
            last_byte_at: None,
            pending_forward: None,
            inflight_write: None,
            backoff: Backoff::default(),
            write_error_burst: 0,
            stall_counted: false,
        }
    }

    fn set_state(&mut self, next: PipelineState) {
        if next != self.state {
            trace!(
                side = %self.side,
                from = self.state.as_str(),
                to = next.as_str(),
                "pipeline state"
            );
            self.state = next;
        }
    }

    /// Drives the pipeline until shutdown or a fatal error.
    pub(crate) async fn run(mut self) -> PipelineExit {
        info!(side = %self.side, port = %self.port_name, "pipeline started");
        loop {
            if *self.shutdown.borrow() {
                return self.shutdown_flush().await;
            }
            if self.port.is_none() {
                match self.reconnect().await {
                    Ok(()) => continue,
                    Err(exit) => return exit,
                }
            }

            let mut progressed = false;

            // Backpressure: reads stop while the outbound ring is choked
            // or the rx ring has no room.
            let blocked = self.forward_is_blocked();
            let rx_free = self.rx_prod.free();
            if !blocked && rx_free > 0 {
                match self.read_serial(rx_free).await {
                    Ok(advanced) => progressed |= advanced,
                    Err(()) => continue,
                }
            }

            // Frame and forward until the buffered bytes run dry or the
            // outbound ring chokes; back-to-back APDUs must not wait a
            // read-timeout each.
            loop {
                let mut advanced = false;
                if self.pending_forward.is_none() {
                    advanced |= self.frame_step();
                }
                advanced |= self.pump_forward();
                progressed |= advanced;
                if !advanced || self.pending_forward.is_some() {
                    break;
                }
            }

            match self.pump_tx().await {
                Ok(advanced) => progressed |= advanced,
                Err(TxFailure::Reconnect) => continue,
                Err(TxFailure::Fatal) => {
                    self.set_state(PipelineState::Stopped);
                    return PipelineExit::Fatal(ErrorKind::Io);
                }
            }

            self.update_depth_gauges();

            if !progressed && (blocked || rx_free == 0) {
                tokio::time::sleep(STALL_PAUSE).await;
            }
        }
    }

    fn forward_is_blocked(&self) -> bool {
        self.pending_forward.is_some() && self.fwd.free() == 0
    }

    /// Reads from the serial port into the rx ring. `Err(())` means the
    /// port was lost and the caller should restart the loop.
    async fn read_serial(&mut self, rx_free: usize) -> Result<bool, ()> {
        let want = rx_free.min(CHUNK);
        let outcome = {
            let Some(port) = self.port.as_mut() else {
                return Ok(false);
            };
            read_some(port, &mut self.scratch[..want], self.read_timeout).await
        };
        match outcome {
            Ok(ReadOutcome::Data(n)) => {
                self.set_state(PipelineState::Reading);
                if self.rx_prod.write(&self.scratch[..n]).is_err() {
                    // Unreachable: the read was capped at the free space.
                    self.metrics.record_error(ErrorKind::BufferFull);
                }
                self.metrics.bytes_rx_total.inc_by(n as u64);
                self.last_byte_at = Some(Instant::now());
                self.stall_counted = false;
                Ok(true)
            }
            Ok(ReadOutcome::TimedOut) => {
                // Quiet links time out constantly; only a stall in the
                // middle of a buffered frame is worth counting.
                if self.rx_cons.available() > 0 && !self.stall_counted {
                    self.metrics.record_error(ErrorKind::Timeout);
                    self.stall_counted = true;
                }
                Ok(false)
            }
            Ok(ReadOutcome::Closed) => {
                warn!(side = %self.side, port = %self.port_name, "serial port closed");
                self.begin_reconnect();
                Err(())
            }
            Err(err) => {
                warn!(side = %self.side, port = %self.port_name, error = %err, "serial read failed");
                self.begin_reconnect();
                Err(())
            }
        }
    }

    /// Judges the bytes at the head of the rx ring and opens a forward,
    /// or drains malformed input. Returns `true` when bytes were framed
    /// or drained.
    fn frame_step(&mut self) -> bool {
        let idle = self
            .last_byte_at
            .map(|t| t.elapsed() >= self.idle_timeout)
            .unwrap_or(false);

        let decision = {
            let view = self.rx_cons.peek(self.rx_cons.capacity());
            if view.is_empty() {
                return false;
            }
            let buf: &[u8] = match view.contiguous() {
                Some(slice) => slice,
                None => {
                    self.frame_scratch.resize(view.len(), 0);
                    view.copy_to(&mut self.frame_scratch);
                    &self.frame_scratch
                }
            };
            let status = match self.role {
                FramerRole::Commands => self.framer.command_status(buf, idle),
                FramerRole::Responses => {
                    let expected = self.meter.expected_le(self.side.opposite());
                    self.framer.response_status(buf, expected, idle)
                }
            };
            match status {
                FrameStatus::NeedMore => FrameDecision::None,
                FrameStatus::Malformed(fault) => FrameDecision::Malformed(fault),
                FrameStatus::Complete(len) => {
                    let frame = &buf[..len];
                    let integrity_fault = self.framer.check_integrity(frame).err();
                    let body = &frame[..len - self.framer.trailer_len()];
                    let kind = match self.role {
                        FramerRole::Commands => match parse_command(body) {
                            Ok(apdu) => FrameKind::Command {
                                fingerprint: apdu.fingerprint(),
                                le: apdu.le,
                            },
                            Err(_) => FrameKind::Command {
                                fingerprint: Fingerprint::of(
                                    frame[0], frame[1], frame[2], frame[3],
                                ),
                                le: None,
                            },
                        },
                        FramerRole::Responses => FrameKind::Response,
                    };
                    FrameDecision::Complete {
                        len,
                        kind,
                        integrity_fault,
                    }
                }
            }
        };

        match decision {
            FrameDecision::None => false,
            FrameDecision::Complete {
                len,
                kind,
                integrity_fault,
            } => {
                if let Some(fault) = integrity_fault {
                    // Counted but forwarded verbatim: the relay stays
                    // transparent even towards corrupt frames.
                    self.note_malformed(fault);
                }
                if let FrameKind::Response = kind {
                    self.close_exchange();
                }
                self.set_state(PipelineState::Forwarding);
                self.pending_forward = Some(PendingForward {
                    len,
                    offset: 0,
                    kind,
                    reported_full: false,
                });
                true
            }
            FrameDecision::Malformed(fault) => {
                self.set_state(PipelineState::Draining);
                self.note_malformed(fault);
                if idle {
                    // Everything buffered belongs before the gap.
                    self.rx_cons.reset();
                } else {
                    self.rx_cons.peek(1);
                    self.rx_cons.commit(1);
                }
                self.set_state(PipelineState::Reading);
                true
            }
        }
    }

    fn note_malformed(&mut self, fault: FramingFault) {
        self.metrics.record_error(ErrorKind::Malformed);
        self.publisher.emit(RelayEvent::FramingError {
            kind: fault,
            direction: self.side,
        });
        debug!(side = %self.side, fault = %fault, "framing fault");
    }

    /// Stops the latency timer for the exchange this response answers.
    fn close_exchange(&mut self) {
        let command_direction = self.side.opposite();
        match self.meter.stop(command_direction) {
            StopOutcome::Sample { sample, breached } => {
                self.metrics
                    .exchange_latency_seconds
                    .observe(sample.duration_ns() as f64 / 1e9);
                if breached {
                    self.metrics.record_error(ErrorKind::HighLatency);
                    self.publisher.emit(RelayEvent::HighLatency {
                        sample_ns: sample.duration_ns(),
                        direction: sample.direction,
                        fingerprint: sample.fingerprint,
                    });
                }
            }
            StopOutcome::Orphan => {
                self.metrics.record_error(ErrorKind::Orphaned);
            }
        }
    }

    /// Copies the recognized frame from the rx ring into the outbound
    /// ring, possibly across several calls under backpressure.
    fn pump_forward(&mut self) -> bool {
        if self.pending_forward.is_none() {
            return false;
        }
        let mut progressed = false;
        let mut report_full = false;
        let mut blocked = false;
        loop {
            let (len, offset) = match self.pending_forward.as_ref() {
                Some(pf) => (pf.len, pf.offset),
                None => break,
            };
            let remaining = len - offset;
            if remaining == 0 {
                break;
            }
            let free = self.fwd.free();
            if free == 0 {
                if let Some(pf) = self.pending_forward.as_mut() {
                    if !pf.reported_full {
                        pf.reported_full = true;
                        report_full = true;
                    }
                }
                blocked = true;
                break;
            }
            let n = remaining.min(free).min(CHUNK);
            let copied = {
                let view = self.rx_cons.peek(len);
                view.copy_range(offset, &mut self.scratch[..n])
            };
            if copied == 0 {
                break;
            }
            if self.fwd.write(&self.scratch[..copied]).is_err() {
                // Raced nothing: this task is the only producer. Treat as
                // a full ring and retry next round.
                blocked = true;
                break;
            }
            if let Some(pf) = self.pending_forward.as_mut() {
                pf.offset += copied;
            }
            progressed = true;
        }

        if report_full {
            self.metrics.record_error(ErrorKind::BufferFull);
            debug!(side = %self.side, "outbound ring full, backpressure");
        }
        if blocked {
            self.set_state(PipelineState::Blocked);
            return progressed;
        }

        if let Some(pf) = self.pending_forward.take() {
            if pf.offset == pf.len {
                self.rx_cons.peek(pf.len);
                self.rx_cons.commit(pf.len);
                let _ = self.fwd_meta.send(FrameMeta {
                    len: pf.len,
                    kind: pf.kind,
                });
                self.set_state(PipelineState::Idle);
            } else {
                self.pending_forward = Some(pf);
            }
        }
        progressed
    }

    /// Writes outbound ring bytes to the serial port, firing per-frame
    /// accounting as frame boundaries complete.
    async fn pump_tx(&mut self) -> Result<bool, TxFailure> {
        let mut progressed = false;
        loop {
            let available = self.tx.available();
            if available == 0 {
                break;
            }
            let n = {
                let view = self.tx.peek(CHUNK.min(available));
                view.copy_to(&mut self.scratch)
            };
            if n == 0 {
                break;
            }
            match self.write_with_retry(n).await {
                Ok(()) => {
                    self.tx.commit(n);
                    self.metrics.bytes_tx_total.inc_by(n as u64);
                    self.write_error_burst = 0;
                    self.note_written(n);
                    progressed = true;
                }
                Err(err) => {
                    warn!(
                        side = %self.side,
                        port = %self.port_name,
                        error = %err,
                        "serial write failed after retry"
                    );
                    self.write_error_burst += 1;
                    if self.write_error_burst >= MAX_ERROR_BURST {
                        return Err(TxFailure::Fatal);
                    }
                    self.begin_reconnect();
                    return Err(TxFailure::Reconnect);
                }
            }
        }
        Ok(progressed)
    }

    /// One write plus `max_retries` immediate retries. The exchange is
    /// time-critical, so there is no backoff between attempts.
    async fn write_with_retry(&mut self, n: usize) -> Result<(), std::io::Error> {
        let max_retries = self.max_retries;
        let side = self.side;
        let Some(port) = self.port.as_mut() else {
            return Err(std::io::Error::from(std::io::ErrorKind::NotConnected));
        };
        let mut attempt = 0;
        loop {
            match port.write_all(&self.scratch[..n]).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < max_retries => {
                    attempt += 1;
                    warn!(side = %side, error = %err, "retrying failed write");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Advances frame-boundary accounting after `n` bytes left the port.
    fn note_written(&mut self, mut n: usize) {
        while n > 0 {
            if self.inflight_write.is_none() {
                match self.tx_meta.try_recv() {
                    Ok(meta) => self.inflight_write = Some(InflightWrite { meta, written: 0 }),
                    Err(_) => return,
                }
            }
            let Some(iw) = self.inflight_write.as_mut() else {
                return;
            };
            let take = n.min(iw.meta.len - iw.written);
            iw.written += take;
            n -= take;
            if iw.written < iw.meta.len {
                return;
            }
            let kind = iw.meta.kind;
            self.inflight_write = None;
            let flow = self.side.opposite();
            self.metrics
                .frames_forwarded
                .with_label_values(&[flow.as_str()])
                .inc();
            if let FrameKind::Command { fingerprint, le } = kind {
                // The command's last byte just left for the card; the
                // round-trip clock starts here.
                if self.meter.start(flow, fingerprint, le) {
                    self.metrics.record_error(ErrorKind::Orphaned);
                }
            }
        }
    }

    fn update_depth_gauges(&self) {
        self.metrics
            .set_ring_depth(self.side, "rx", self.rx_cons.available());
        self.metrics
            .set_ring_depth(self.side.opposite(), "tx", self.tx.available());
    }

    fn begin_reconnect(&mut self) {
        self.port = None;
        self.set_state(PipelineState::Error);
        self.metrics.record_error(ErrorKind::Io);
        self.metrics.record_error(ErrorKind::PortUnavailable);
        self.publisher
            .emit(RelayEvent::PortUnavailable { direction: self.side });
    }

    /// Re-opens the port with doubling delays until it comes back or the
    /// relay shuts down.
    async fn reconnect(&mut self) -> Result<(), PipelineExit> {
        loop {
            if *self.shutdown.borrow() {
                return Err(self.shutdown_drop_remaining());
            }
            let delay = self.backoff.next_delay();
            tokio::select! {
                _ = self.shutdown.changed() => continue,
                _ = tokio::time::sleep(delay) => {}
            }
            self.metrics.reconnects_total.inc();
            match self.opener.open(&self.port_name, self.baud) {
                Ok(port) => {
                    info!(side = %self.side, port = %self.port_name, "serial port reopened");
                    self.port = Some(port);
                    self.backoff.reset();
                    self.set_state(PipelineState::Idle);
                    return Ok(());
                }
                Err(err) => {
                    debug!(side = %self.side, error = %err, "reopen failed, backing off");
                }
            }
        }
    }

    /// Completes in-flight forwarding within the shutdown deadline, then
    /// stops. Frames still queued past the deadline count as dropped.
    async fn shutdown_flush(mut self) -> PipelineExit {
        let deadline = self.shutdown_timeout;
        let flush = tokio::time::timeout(deadline, async {
            loop {
                let forward_done = match self.pending_forward.as_ref() {
                    Some(pf) => pf.offset == pf.len,
                    None => true,
                };
                if forward_done && self.tx.available() == 0 {
                    break;
                }
                self.pump_forward();
                if self.pump_tx().await.is_err() {
                    break;
                }
                tokio::time::sleep(STALL_PAUSE).await;
            }
        })
        .await;
        if flush.is_err() {
            debug!(side = %self.side, "shutdown deadline expired with frames in flight");
        }
        let exit = self.shutdown_drop_remaining();
        info!(side = %self.side, "pipeline stopped");
        exit
    }

    /// Counts every undelivered frame as dropped and stops.
    fn shutdown_drop_remaining(&mut self) -> PipelineExit {
        let mut dropped = 0u64;
        if self.inflight_write.is_some() {
            dropped += 1;
        }
        while self.tx_meta.try_recv().is_ok() {
            dropped += 1;
        }
        if self.pending_forward.is_some() {
            dropped += 1;
        }
        for _ in 0..dropped {
            self.metrics.record_error(ErrorKind::ShutdownDropped);
        }
        self.set_state(PipelineState::Stopped);
        PipelineExit::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::sync::{mpsc, watch};

    use crate::apdu::{build_response, xor_checksum};
    use crate::ring::spsc;
    use crate::serial::SerialError;

    const SELECT_AID: &[u8] = &[
        0x00, 0xA4, 0x04, 0x00, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x04, 0x10, 0x10, 0x00,
    ];

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Opener whose ports never come back; reconnects always fail.
    #[derive(Clone, Copy, Default)]
    struct NoReopen;

    impl PortOpener for NoReopen {
        type Port = DuplexStream;

        fn open(&self, name: &str, _baud: u32) -> Result<Self::Port, SerialError> {
            Err(SerialError::Open {
                port: name.to_string(),
                source: tokio_serial::Error::new(tokio_serial::ErrorKind::NoDevice, "gone"),
            })
        }
    }

    struct Harness {
        port_far: DuplexStream,
        fwd_cons: crate::ring::RingConsumer,
        fwd_meta_rx: mpsc::UnboundedReceiver<FrameMeta>,
        meter: Arc<LatencyMeter>,
        metrics: Arc<Metrics>,
        stop: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<PipelineExit>,
        _tx_prod: crate::ring::RingProducer,
        _tx_meta_tx: mpsc::UnboundedSender<FrameMeta>,
    }

    /// Spawns one pipeline over an in-memory port with direct access to
    /// its outbound ring.
    fn spawn_harness(
        side: Direction,
        role: FramerRole,
        framer: Framer,
        rx_cap: usize,
        fwd_cap: usize,
    ) -> Harness {
        let (near, far) = duplex(256 * 1024);
        let (rx_prod, rx_cons) = spsc(rx_cap);
        let (fwd_prod, fwd_cons) = spsc(fwd_cap);
        let (tx_prod, tx_cons) = spsc(64);
        let (fwd_meta_tx, fwd_meta_rx) = mpsc::unbounded_channel();
        let (tx_meta_tx, tx_meta_rx) = mpsc::unbounded_channel();
        let meter = Arc::new(LatencyMeter::new(100, u64::MAX));
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let (stop_tx, stop_rx) = watch::channel(false);

        let pipeline = Pipeline::<NoReopen>::new(
            side,
            role,
            "mem".into(),
            921_600,
            near,
            PipelineWiring {
                rx_prod,
                rx_cons,
                fwd: fwd_prod,
                fwd_meta: fwd_meta_tx,
                tx: tx_cons,
                tx_meta: tx_meta_rx,
            },
            PipelineDeps {
                opener: Arc::new(NoReopen),
                meter: Arc::clone(&meter),
                metrics: Arc::clone(&metrics),
                publisher: MetricsPublisher::new(),
                shutdown: stop_rx,
            },
            PipelineTuning {
                framer,
                read_timeout: ms(1),
                idle_timeout: ms(2),
                shutdown_timeout: ms(200),
                max_retries: 1,
            },
        );
        Harness {
            port_far: far,
            fwd_cons,
            fwd_meta_rx,
            meter,
            metrics,
            stop: stop_tx,
            handle: tokio::spawn(pipeline.run()),
            _tx_prod: tx_prod,
            _tx_meta_tx: tx_meta_tx,
        }
    }

    #[tokio::test]
    async fn large_frame_streams_through_small_outbound_ring() {
        let mut h = spawn_harness(
            Direction::HostToClient,
            FramerRole::Responses,
            Framer::new(true, false),
            256,
            64,
        );
        // A command expecting 126 bytes is pending, so the 128-byte
        // response completes without waiting for idle.
        h.meter
            .start(Direction::ClientToHost, Fingerprint(0x00A40400), Some(126));

        let response = build_response(&[0x42; 126], 0x90, 0x00);
        h.port_far.write_all(&response).await.unwrap();

        // Drain the 64-byte outbound ring piecemeal; every byte must come
        // through exactly once, in order.
        let mut got = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while got.len() < response.len() {
            assert!(
                Instant::now() < deadline,
                "forwarding stalled at {} bytes",
                got.len()
            );
            let n = {
                let view = h.fwd_cons.peek(64);
                let mut chunk = vec![0u8; view.len()];
                view.copy_to(&mut chunk);
                got.extend_from_slice(&chunk);
                chunk.len()
            };
            if n == 0 {
                tokio::time::sleep(ms(1)).await;
                continue;
            }
            h.fwd_cons.commit(n);
        }
        assert_eq!(got, response);

        // Boundary metadata arrives once the whole frame is enqueued.
        let meta = tokio::time::timeout(ms(500), async {
            loop {
                if let Ok(meta) = h.fwd_meta_rx.try_recv() {
                    break meta;
                }
                tokio::time::sleep(ms(1)).await;
            }
        })
        .await
        .expect("frame meta");
        assert_eq!(meta.len, response.len());

        // The ring choked at least once and the exchange was timed.
        assert!(h.metrics.errors_by_kind()[&ErrorKind::BufferFull] >= 1);
        assert_eq!(h.meter.snapshot().count, 1);

        h.stop.send(true).unwrap();
        assert_eq!(h.handle.await.unwrap(), PipelineExit::Stopped);
    }

    #[tokio::test]
    async fn checksum_mismatch_is_counted_but_forwarded_verbatim() {
        let mut h = spawn_harness(
            Direction::ClientToHost,
            FramerRole::Commands,
            Framer::new(true, true),
            256,
            256,
        );

        let mut frame = SELECT_AID.to_vec();
        frame.push(xor_checksum(SELECT_AID) ^ 0x5A);
        h.port_far.write_all(&frame).await.unwrap();

        let mut got = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while got.len() < frame.len() {
            assert!(Instant::now() < deadline, "frame not forwarded");
            let n = {
                let view = h.fwd_cons.peek(256);
                let mut chunk = vec![0u8; view.len()];
                view.copy_to(&mut chunk);
                got.extend_from_slice(&chunk);
                chunk.len()
            };
            if n == 0 {
                tokio::time::sleep(ms(1)).await;
                continue;
            }
            h.fwd_cons.commit(n);
        }
        assert_eq!(got, frame);
        assert_eq!(h.metrics.errors_by_kind()[&ErrorKind::Malformed], 1);

        h.stop.send(true).unwrap();
        assert_eq!(h.handle.await.unwrap(), PipelineExit::Stopped);
    }

    #[tokio::test]
    async fn shutdown_counts_undrained_frames_as_dropped() {
        let mut h = spawn_harness(
            Direction::ClientToHost,
            FramerRole::Commands,
            Framer::new(true, false),
            256,
            8,
        );

        // A 13-byte frame cannot finish entering the 8-byte outbound ring
        // while nobody drains it.
        h.port_far.write_all(SELECT_AID).await.unwrap();
        tokio::time::sleep(ms(20)).await;

        h.stop.send(true).unwrap();
        assert_eq!(h.handle.await.unwrap(), PipelineExit::Stopped);
        assert!(h.metrics.errors_by_kind()[&ErrorKind::ShutdownDropped] >= 1);
        let _ = &h.fwd_cons;
        let _ = &h.fwd_meta_rx;
    }
}
