// Relay coordinator: owns the pipeline pair, publishes metrics, manages
// lifecycle and restart.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::api::{BufferUsage, Direction, ErrorKind, RelayEvent, RelayState, Snapshot, Throughput};
use crate::apdu::Framer;
use crate::config::{ConfigError, RelayConfig};
use crate::latency::LatencyMeter;
use crate::metrics::{Metrics, MetricsError};
use crate::pipeline::{
    FramerRole, Pipeline, PipelineDeps, PipelineExit, PipelineTuning, PipelineWiring,
};
use crate::publish::{MetricStream, MetricsPublisher};
use crate::ring::spsc;
use crate::serial::{PortOpener, SerialError, SystemPorts};

/// Full restarts attempted per fault episode when `auto_restart` is set.
const RESTART_CEILING: u32 = 3;

/// Margin added to the pipeline shutdown deadline before tasks are
/// aborted outright.
const JOIN_GRACE: Duration = Duration::from_millis(200);

/// Error surfaced by the coordinator's control operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// `start` was called while the relay is not stopped.
    #[error("relay already running")]
    AlreadyRunning,
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Opening a serial port failed.
    #[error(transparent)]
    Serial(#[from] SerialError),
    /// Metrics registry construction failed.
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

type ErrorHandler = Box<dyn Fn(ErrorKind) + Send + Sync + 'static>;

/// State shared between the public handle, the supervisor, and the
/// snapshot ticker.
struct SharedState {
    metrics: Arc<Metrics>,
    meter: Arc<LatencyMeter>,
    publisher: MetricsPublisher,
    state: Mutex<RelayState>,
    started_at: Mutex<Option<Instant>>,
    error_handler: Mutex<Option<ErrorHandler>>,
    /// Effective per-ring capacity after power-of-two rounding.
    ring_capacity: usize,
}

impl SharedState {
    fn set_state(&self, next: RelayState) {
        let mut state = self.state.lock().unwrap();
        let prev = *state;
        if prev != next {
            debug!(from = %prev, to = %next, "relay state");
            *state = next;
        }
    }

    fn uptime_ns(&self) -> u64 {
        self.started_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed().as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// One spawned pipeline pair with its generation-local stop signal.
struct Generation {
    stop: watch::Sender<bool>,
    client: JoinHandle<PipelineExit>,
    host: JoinHandle<PipelineExit>,
}

/// Bidirectional APDU relay between two serial ports.
///
/// `start` opens both ports and spawns the pipeline pair plus the metric
/// ticker; `stop` drains in-flight frames within the shutdown deadline.
/// Subscribers receive the typed event stream; `stats` builds a snapshot
/// on demand.
pub struct Relay<P: PortOpener = SystemPorts> {
    config: RelayConfig,
    opener: Arc<P>,
    shared: Arc<SharedState>,
    master_stop: Option<watch::Sender<bool>>,
    supervisor: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl Relay<SystemPorts> {
    /// Creates a relay over the operating system's serial ports.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        Self::with_opener(config, SystemPorts)
    }
}

impl<P: PortOpener> Relay<P> {
    /// Creates a relay with a custom port opener.
    pub fn with_opener(config: RelayConfig, opener: P) -> Result<Self, RelayError> {
        config.validate()?;
        let metrics = Arc::new(Metrics::new()?);
        let meter = Arc::new(LatencyMeter::new(
            config.latency_window_size,
            config.latency_threshold_ns,
        ));
        let shared = Arc::new(SharedState {
            metrics,
            meter,
            publisher: MetricsPublisher::new(),
            state: Mutex::new(RelayState::Stopped),
            started_at: Mutex::new(None),
            error_handler: Mutex::new(None),
            ring_capacity: config.buffer_capacity.next_power_of_two(),
        });
        Ok(Self {
            config,
            opener: Arc::new(opener),
            shared,
            master_stop: None,
            supervisor: None,
            ticker: None,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RelayState {
        *self.shared.state.lock().unwrap()
    }

    /// Time since the last successful `start`.
    pub fn uptime(&self) -> Duration {
        Duration::from_nanos(self.shared.uptime_ns())
    }

    /// Registers the callback invoked once per unrecoverable fault.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(ErrorKind) + Send + Sync + 'static,
    {
        *self.shared.error_handler.lock().unwrap() = Some(Box::new(handler));
    }

    /// Opens a subscription to the relay event stream.
    pub fn subscribe(&self) -> MetricStream {
        self.shared.publisher.subscribe()
    }

    /// Builds a statistics snapshot on demand.
    pub fn stats(&self) -> Snapshot {
        build_snapshot(&self.shared)
    }

    /// Opens both ports and brings the relay up.
    pub async fn start(&mut self) -> Result<(), RelayError> {
        {
            let state = self.shared.state.lock().unwrap();
            if !matches!(*state, RelayState::Stopped | RelayState::Faulted) {
                return Err(RelayError::AlreadyRunning);
            }
        }
        self.shared.set_state(RelayState::Starting);
        self.shared.meter.reset();

        let generation = match spawn_generation(&self.config, &self.opener, &self.shared) {
            Ok(generation) => generation,
            Err(err) => {
                self.shared.set_state(RelayState::Stopped);
                return Err(err);
            }
        };

        let (master_tx, master_rx) = watch::channel(false);
        *self.shared.started_at.lock().unwrap() = Some(Instant::now());

        self.ticker = Some(tokio::spawn(run_ticker(
            Arc::clone(&self.shared),
            self.config.metric_tick(),
            master_rx.clone(),
        )));
        self.supervisor = Some(tokio::spawn(supervise(
            self.config.clone(),
            Arc::clone(&self.opener),
            Arc::clone(&self.shared),
            master_rx,
            generation,
        )));
        self.master_stop = Some(master_tx);

        self.shared.set_state(RelayState::Running);
        info!(
            client = %self.config.client_port,
            host = %self.config.host_port,
            baud = self.config.baud_rate,
            "relay started"
        );
        Ok(())
    }

    /// Stops both pipelines, draining in-flight frames within the
    /// shutdown deadline.
    pub async fn stop(&mut self) -> Result<(), RelayError> {
        {
            let state = self.shared.state.lock().unwrap();
            if matches!(*state, RelayState::Stopped | RelayState::Stopping) {
                return Ok(());
            }
        }
        self.shared.set_state(RelayState::Stopping);
        if let Some(master) = self.master_stop.take() {
            let _ = master.send(true);
        }
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.await;
        }
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.await;
        }
        self.shared.set_state(RelayState::Stopped);
        info!("relay stopped");
        Ok(())
    }
}

/// Opens both ports and spawns a pipeline pair wired back to back.
fn spawn_generation<P: PortOpener>(
    config: &RelayConfig,
    opener: &Arc<P>,
    shared: &Arc<SharedState>,
) -> Result<Generation, RelayError> {
    let client_port = opener.open(&config.client_port, config.baud_rate)?;
    let host_port = opener.open(&config.host_port, config.baud_rate)?;

    let cap = config.buffer_capacity;
    let (client_rx_prod, client_rx_cons) = spsc(cap);
    let (host_rx_prod, host_rx_cons) = spsc(cap);
    // Cross-wired outbound rings: each pipeline produces into the ring
    // the opposite side drains to its port.
    let (host_tx_prod, host_tx_cons) = spsc(cap);
    let (client_tx_prod, client_tx_cons) = spsc(cap);
    let (host_meta_tx, host_meta_rx) = mpsc::unbounded_channel();
    let (client_meta_tx, client_meta_rx) = mpsc::unbounded_channel();

    let (stop_tx, stop_rx) = watch::channel(false);

    let tuning = || PipelineTuning {
        framer: Framer::new(config.validate_headers, config.verify_checksum),
        read_timeout: config.read_timeout(),
        idle_timeout: config.idle_timeout(),
        shutdown_timeout: config.shutdown_timeout(),
        max_retries: config.max_retries,
    };
    let deps = || PipelineDeps {
        opener: Arc::clone(opener),
        meter: Arc::clone(&shared.meter),
        metrics: Arc::clone(&shared.metrics),
        publisher: shared.publisher.clone(),
        shutdown: stop_rx.clone(),
    };

    let client = Pipeline::new(
        Direction::ClientToHost,
        FramerRole::Commands,
        config.client_port.clone(),
        config.baud_rate,
        client_port,
        PipelineWiring {
            rx_prod: client_rx_prod,
            rx_cons: client_rx_cons,
            fwd: host_tx_prod,
            fwd_meta: host_meta_tx,
            tx: client_tx_cons,
            tx_meta: client_meta_rx,
        },
        deps(),
        tuning(),
    );
    let host = Pipeline::new(
        Direction::HostToClient,
        FramerRole::Responses,
        config.host_port.clone(),
        config.baud_rate,
        host_port,
        PipelineWiring {
            rx_prod: host_rx_prod,
            rx_cons: host_rx_cons,
            fwd: client_tx_prod,
            fwd_meta: client_meta_tx,
            tx: host_tx_cons,
            tx_meta: host_meta_rx,
        },
        deps(),
        tuning(),
    );

    Ok(Generation {
        stop: stop_tx,
        client: tokio::spawn(client.run()),
        host: tokio::spawn(host.run()),
    })
}

/// Watches the pipeline pair: drains it on stop, restarts it on fault.
async fn supervise<P: PortOpener>(
    config: RelayConfig,
    opener: Arc<P>,
    shared: Arc<SharedState>,
    mut master: watch::Receiver<bool>,
    generation: Generation,
) {
    let deadline = config.shutdown_timeout() + JOIN_GRACE;
    let mut restarts: u32 = 0;
    let mut current = generation;

    loop {
        let Generation {
            stop,
            mut client,
            mut host,
        } = current;

        enum Outcome {
            Stop,
            ClientExit(Result<PipelineExit, tokio::task::JoinError>),
            HostExit(Result<PipelineExit, tokio::task::JoinError>),
        }

        let outcome = tokio::select! {
            _ = master.changed() => Outcome::Stop,
            res = &mut client => Outcome::ClientExit(res),
            res = &mut host => Outcome::HostExit(res),
        };

        let (result, other) = match outcome {
            Outcome::Stop => {
                let _ = stop.send(true);
                join_pair(client, host, deadline).await;
                shared.set_state(RelayState::Stopped);
                return;
            }
            Outcome::ClientExit(result) => (result, host),
            Outcome::HostExit(result) => (result, client),
        };

        let kind = match result {
            Ok(PipelineExit::Fatal(kind)) => kind,
            Ok(PipelineExit::Stopped) => ErrorKind::Fatal,
            Err(join_err) => {
                error!(error = %join_err, "pipeline task failed");
                ErrorKind::Fatal
            }
        };
        let _ = stop.send(true);
        join_one(other, deadline).await;

        shared.metrics.record_error(ErrorKind::Fatal);
        shared.set_state(RelayState::Faulted);
        if let Some(handler) = shared.error_handler.lock().unwrap().as_ref() {
            handler(kind);
        }

        if !config.auto_restart || restarts >= RESTART_CEILING {
            error!(%kind, restarts, "relay faulted");
            return;
        }
        restarts += 1;
        match spawn_generation(&config, &opener, &shared) {
            Ok(next) => {
                let reason = format!("pipeline fault: {kind}");
                warn!(%reason, attempt = restarts, "relay restarted");
                shared.publisher.emit(RelayEvent::Restarted { reason });
                shared.set_state(RelayState::Running);
                current = next;
            }
            Err(err) => {
                error!(error = %err, "restart failed; relay stays faulted");
                return;
            }
        }
    }
}

async fn join_pair(
    mut client: JoinHandle<PipelineExit>,
    mut host: JoinHandle<PipelineExit>,
    deadline: Duration,
) {
    let drained = tokio::time::timeout(deadline, async {
        let _ = (&mut client).await;
        let _ = (&mut host).await;
    })
    .await;
    if drained.is_err() {
        warn!("pipelines exceeded the shutdown deadline; aborting");
        client.abort();
        host.abort();
    }
}

async fn join_one(mut handle: JoinHandle<PipelineExit>, deadline: Duration) {
    if tokio::time::timeout(deadline, &mut handle).await.is_err() {
        handle.abort();
    }
}

/// Emits a snapshot on every metric tick until the relay stops.
async fn run_ticker(
    shared: Arc<SharedState>,
    tick: Duration,
    mut master: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = master.changed() => return,
            _ = interval.tick() => {
                let snapshot = build_snapshot(&shared);
                shared.publisher.emit(RelayEvent::Snapshot(snapshot));
            }
        }
    }
}

fn build_snapshot(shared: &SharedState) -> Snapshot {
    let uptime_ns = shared.uptime_ns();
    let bytes_rx = shared.metrics.bytes_rx_total.get();
    let bytes_tx = shared.metrics.bytes_tx_total.get();
    let frames_c2h = shared.metrics.frames(Direction::ClientToHost);
    let frames_h2c = shared.metrics.frames(Direction::HostToClient);

    let secs = uptime_ns as f64 / 1e9;
    let throughput = if secs > 0.0 {
        Throughput {
            bytes_per_sec: (bytes_rx + bytes_tx) as f64 / secs,
            frames_per_sec: (frames_c2h + frames_h2c) as f64 / secs,
        }
    } else {
        Throughput::default()
    };

    let cap = shared.ring_capacity as f64;
    let usage = |direction: Direction| BufferUsage {
        rx: shared.metrics.ring_depth(direction, "rx") as f64 / cap,
        tx: shared.metrics.ring_depth(direction, "tx") as f64 / cap,
    };

    Snapshot {
        seq: shared.publisher.next_seq(),
        uptime_ns,
        frames: frames_c2h,
        bytes_rx,
        bytes_tx,
        errors: shared.metrics.errors_by_kind(),
        latency: shared.meter.snapshot(),
        throughput,
        buffer_usage: [
            usage(Direction::ClientToHost),
            usage(Direction::HostToClient),
        ],
    }
}
