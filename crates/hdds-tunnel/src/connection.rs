// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One established tunnel transport.
//!
//! A [`TunnelConnection`] splits its TCP stream and runs up to three tasks:
//!
//! ```text
//!   supervisor pump --+                      +--> reader --> inbound payloads
//!   heartbeat ticker -+--> write queue --> writer          \-> heartbeat monitor
//!   pong replies -----+        (FIFO)                       (pings/pongs)
//! ```
//!
//! When the inbound consumer falls behind, Data frames wait in a bounded
//! hold inside the reader while Ping/Pong keep being read and answered. Only
//! a full hold stops reading the socket.
//!
//! The connection never reconnects. The first read/write error, peer close or
//! anomaly escalation is reported once through [`ConnectionSignals::closed`];
//! what happens next is the supervisor's decision.

use crate::codec::{Decode, Frame, FrameCodec, DATA_HEADER_SIZE};
use crate::config::{HeartbeatConfig, LimitsConfig, TcpOptions};
use crate::error::{ProtocolAnomaly, TransportError};
use crate::heartbeat::{HeartbeatMonitor, PongOutcome};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// Socket read size.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Queued frames are coalesced into one write up to this size.
const WRITE_BATCH_BYTES: usize = 64 * 1024;

/// Supervisor-issued identifier of a physical connection.
pub type ConnectionId = u64;

/// Data frame handed to the layer above the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPayload {
    pub domain_id: u32,
    pub payload: Vec<u8>,
}

/// Heartbeat health changes reported to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    /// The missed-ping streak reached the threshold.
    Lost { missed: u32 },
    /// A pong arrived after a reported loss.
    Restored { rtt: Duration },
}

/// Per-connection settings, derived from the endpoint configuration.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub max_frame_size: u32,
    pub write_queue: usize,
    /// Bytes of Data held while the inbound consumer is behind
    pub inbound_hold_bytes: usize,
    pub anomaly_threshold: usize,
    pub anomaly_window: Duration,
    pub flush_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub nodelay: bool,
    /// Idle time before TCP keep-alive probes (None = disabled)
    pub keepalive: Option<Duration>,
}

impl ConnectionOptions {
    pub fn new(heartbeat: &HeartbeatConfig, limits: &LimitsConfig, tcp: &TcpOptions) -> Self {
        Self {
            max_frame_size: limits.max_frame_size,
            write_queue: limits.write_queue,
            inbound_hold_bytes: limits.inbound_hold_bytes,
            anomaly_threshold: limits.anomaly_threshold,
            anomaly_window: limits.anomaly_window(),
            flush_timeout: limits.flush_timeout(),
            heartbeat_interval: heartbeat.interval(),
            nodelay: tcp.nodelay,
            keepalive: tcp.keepalive.then(|| tcp.keepalive_interval()),
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::new(
            &HeartbeatConfig::default(),
            &LimitsConfig::default(),
            &TcpOptions::default(),
        )
    }
}

/// Sliding-window protocol anomaly counter.
///
/// A single malformed frame is dropped and forgotten; `threshold` anomalies
/// within `window` mean the stream is most likely desynchronized.
#[derive(Debug)]
pub struct AnomalyTracker {
    threshold: usize,
    window: Duration,
    recent: VecDeque<Instant>,
    total: u64,
}

impl AnomalyTracker {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            recent: VecDeque::new(),
            total: 0,
        }
    }

    /// Record one anomaly; returns true when the threshold is reached.
    pub fn record(&mut self, now: Instant) -> bool {
        self.total += 1;
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        self.recent.push_back(now);
        self.recent.len() >= self.threshold
    }

    /// Anomalies inside the current window.
    pub fn recent(&self) -> usize {
        self.recent.len()
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Traffic counters of one connection.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub frames_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub bytes_received: AtomicU64,
}

/// Snapshot of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStatsSnapshot {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
}

impl ConnectionStats {
    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Shared view of a connection's counters that outlives the connection.
#[derive(Debug, Clone)]
pub struct ConnectionCounters {
    stats: Arc<ConnectionStats>,
    anomalies: Arc<Mutex<AnomalyTracker>>,
}

impl ConnectionCounters {
    pub fn traffic(&self) -> ConnectionStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn anomalies(&self) -> u64 {
        self.anomalies.lock().total()
    }
}

/// Local flow-control state shared by the connection tasks.
#[derive(Debug, Default)]
struct FlowState {
    /// Start of the socket write in progress
    write_started: Mutex<Option<Instant>>,
    /// Reader stopped pulling from the socket (hold full)
    read_paused: AtomicBool,
}

impl FlowState {
    /// Whether replies may be stuck on this side: our writes are not
    /// leaving, or we are not reading.
    fn stalled(&self, period: Duration) -> bool {
        if self.read_paused.load(Ordering::Relaxed) {
            return true;
        }
        self.write_started
            .lock()
            .is_some_and(|since| since.elapsed() >= period)
    }
}

/// Delivers the terminal failure to the supervisor at most once.
struct FailureSignal {
    tx: Mutex<Option<oneshot::Sender<TransportError>>>,
}

impl FailureSignal {
    fn raise(&self, err: TransportError) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(err);
        }
    }
}

/// Channels the supervisor listens on.
pub struct ConnectionSignals {
    /// Resolves once with the reason the connection failed.
    pub closed: oneshot::Receiver<TransportError>,
    /// Heartbeat liveness changes.
    pub events: mpsc::Receiver<LivenessEvent>,
}

/// An established tunnel transport and its tasks.
pub struct TunnelConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    established_at: Instant,
    writer_tx: mpsc::Sender<Frame>,
    drain_tx: Option<oneshot::Sender<()>>,
    anomalies: Arc<Mutex<AnomalyTracker>>,
    stats: Arc<ConnectionStats>,
    failure: Arc<FailureSignal>,
    flush_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    ticker: Option<JoinHandle<()>>,
}

impl TunnelConnection {
    /// Take ownership of `stream` and start the connection tasks.
    ///
    /// `monitor` must already be reset for this connection. Data frames are
    /// pushed into `inbound`; a full inbound queue stalls the reader (and
    /// with it the peer, through TCP flow control).
    pub fn spawn(
        id: ConnectionId,
        stream: TcpStream,
        options: &ConnectionOptions,
        monitor: Arc<Mutex<HeartbeatMonitor>>,
        inbound: mpsc::Sender<InboundPayload>,
    ) -> Result<(Self, ConnectionSignals), TransportError> {
        let peer_addr = stream.peer_addr().map_err(TransportError::SocketSetup)?;
        configure_socket(&stream, options).map_err(TransportError::SocketSetup)?;
        let (read_half, write_half) = stream.into_split();

        let (writer_tx, writer_rx) = mpsc::channel(options.write_queue);
        let (drain_tx, drain_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::channel(8);

        let failure = Arc::new(FailureSignal {
            tx: Mutex::new(Some(closed_tx)),
        });
        let stats = Arc::new(ConnectionStats::default());
        let anomalies = Arc::new(Mutex::new(AnomalyTracker::new(
            options.anomaly_threshold,
            options.anomaly_window,
        )));
        let flow = Arc::new(FlowState::default());

        let writer = tokio::spawn(write_loop(
            id,
            write_half,
            writer_rx,
            drain_rx,
            stats.clone(),
            failure.clone(),
            flow.clone(),
        ));

        let probes = monitor.lock().probes();
        let ticker = probes.then(|| {
            tokio::spawn(tick_loop(
                id,
                options.heartbeat_interval,
                monitor.clone(),
                writer_tx.clone(),
                events_tx.clone(),
                flow.clone(),
            ))
        });

        let reader = tokio::spawn(
            Reader {
                id,
                half: read_half,
                codec: FrameCodec::new(options.max_frame_size),
                monitor,
                writer_tx: writer_tx.clone(),
                inbound,
                events: events_tx,
                anomalies: anomalies.clone(),
                stats: stats.clone(),
                failure: failure.clone(),
                flow,
                held: VecDeque::new(),
                held_bytes: 0,
                hold_limit: options.inbound_hold_bytes.max(1),
            }
            .run(),
        );

        debug!(connection = id, %peer_addr, "tunnel connection started");

        Ok((
            Self {
                id,
                peer_addr,
                established_at: Instant::now(),
                writer_tx,
                drain_tx: Some(drain_tx),
                anomalies,
                stats,
                failure,
                flush_timeout: options.flush_timeout,
                reader,
                writer,
                ticker,
            },
            ConnectionSignals {
                closed: closed_rx,
                events: events_rx,
            },
        ))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Time since the transport was handed to this connection.
    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }

    /// Write queue shared by every producer of this connection.
    pub fn sender(&self) -> &mpsc::Sender<Frame> {
        &self.writer_tx
    }

    pub fn stats(&self) -> ConnectionStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn counters(&self) -> ConnectionCounters {
        ConnectionCounters {
            stats: self.stats.clone(),
            anomalies: self.anomalies.clone(),
        }
    }

    /// Anomalies recorded by this connection (codec and reported ones).
    pub fn anomalies(&self) -> u64 {
        self.anomalies.lock().total()
    }

    /// Count an anomaly detected above the connection (e.g. a domain
    /// mismatch). Fails the connection when the threshold is reached.
    pub fn record_anomaly(&self, anomaly: &ProtocolAnomaly) -> bool {
        let (escalate, count) = {
            let mut tracker = self.anomalies.lock();
            let escalate = tracker.record(Instant::now());
            (escalate, tracker.recent())
        };
        if escalate {
            warn!(connection = self.id, %anomaly, count, "anomaly threshold reached");
            self.failure
                .raise(TransportError::AnomalyThreshold { count });
        }
        escalate
    }

    /// Clean close: stop reading, write out what is queued, shut down the
    /// write half. Bounded by the flush timeout.
    pub async fn close(mut self) {
        self.reader.abort();
        if let Some(ticker) = &self.ticker {
            ticker.abort();
        }
        if let Some(drain) = self.drain_tx.take() {
            let _ = drain.send(());
        }
        match tokio::time::timeout(self.flush_timeout, &mut self.writer).await {
            Ok(_) => debug!(connection = self.id, "tunnel connection closed"),
            Err(_) => warn!(
                connection = self.id,
                "flush did not finish within {:?}, dropping queued frames", self.flush_timeout
            ),
        }
    }

    /// Forced close: outstanding reads and writes are cancelled and queued
    /// frames are lost. Returns once every task has stopped, so nothing of
    /// this connection touches the heartbeat monitor afterwards.
    pub async fn abort(mut self) {
        self.reader.abort();
        self.writer.abort();
        if let Some(ticker) = &self.ticker {
            ticker.abort();
        }
        let _ = (&mut self.reader).await;
        let _ = (&mut self.writer).await;
        if let Some(ticker) = self.ticker.as_mut() {
            let _ = ticker.await;
        }
        debug!(connection = self.id, "tunnel connection aborted");
    }
}

impl Drop for TunnelConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
        if let Some(ticker) = &self.ticker {
            ticker.abort();
        }
    }
}

fn configure_socket(stream: &TcpStream, options: &ConnectionOptions) -> std::io::Result<()> {
    stream.set_nodelay(options.nodelay)?;
    if let Some(idle) = options.keepalive {
        let keepalive = socket2::TcpKeepalive::new().with_time(idle);
        socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}

async fn write_loop(
    id: ConnectionId,
    mut half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Frame>,
    mut drain: oneshot::Receiver<()>,
    stats: Arc<ConnectionStats>,
    failure: Arc<FailureSignal>,
    flow: Arc<FlowState>,
) {
    let mut buf = Vec::with_capacity(WRITE_BATCH_BYTES);
    let mut draining = false;

    loop {
        let frame = tokio::select! {
            frame = rx.recv() => frame,
            _ = &mut drain, if !draining => {
                // No new frames; what is already queued still goes out
                rx.close();
                draining = true;
                continue;
            }
        };
        let Some(frame) = frame else { break };

        buf.clear();
        FrameCodec::encode_into(&frame, &mut buf);
        let mut frames = 1u64;
        while buf.len() < WRITE_BATCH_BYTES {
            match rx.try_recv() {
                Ok(next) => {
                    FrameCodec::encode_into(&next, &mut buf);
                    frames += 1;
                }
                Err(_) => break,
            }
        }

        *flow.write_started.lock() = Some(Instant::now());
        let written = half.write_all(&buf).await;
        *flow.write_started.lock() = None;
        if let Err(e) = written {
            failure.raise(TransportError::Write(e));
            return;
        }
        trace!(connection = id, frames, bytes = buf.len(), "wrote frames");
        stats.frames_sent.fetch_add(frames, Ordering::Relaxed);
        stats
            .bytes_sent
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
    }

    if let Err(e) = half.shutdown().await {
        debug!(connection = id, "shutdown of write half failed: {}", e);
    }
}

async fn tick_loop(
    id: ConnectionId,
    period: Duration,
    monitor: Arc<Mutex<HeartbeatMonitor>>,
    writer_tx: mpsc::Sender<Frame>,
    events: mpsc::Sender<LivenessEvent>,
    flow: Arc<FlowState>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        // Missing replies are our own backlog, not a dead peer
        if flow.stalled(period) {
            trace!(connection = id, "local flow stalled, heartbeat tick skipped");
            continue;
        }
        let (outcome, missed) = {
            let mut monitor = monitor.lock();
            let outcome = monitor.on_tick(Instant::now());
            (outcome, monitor.missed_streak())
        };

        if outcome.liveness_failed {
            warn!(connection = id, missed, "heartbeat replies missing");
            if events.send(LivenessEvent::Lost { missed }).await.is_err() {
                return;
            }
        }
        if let Some(ping) = outcome.ping {
            // Blocks while the write queue is full
            if writer_tx.send(ping).await.is_err() {
                return;
            }
        }
    }
}

struct Reader {
    id: ConnectionId,
    half: OwnedReadHalf,
    codec: FrameCodec,
    monitor: Arc<Mutex<HeartbeatMonitor>>,
    writer_tx: mpsc::Sender<Frame>,
    inbound: mpsc::Sender<InboundPayload>,
    events: mpsc::Sender<LivenessEvent>,
    anomalies: Arc<Mutex<AnomalyTracker>>,
    stats: Arc<ConnectionStats>,
    failure: Arc<FailureSignal>,
    flow: Arc<FlowState>,
    /// Data not yet accepted by `inbound`, in arrival order
    held: VecDeque<InboundPayload>,
    held_bytes: usize,
    hold_limit: usize,
}

impl Reader {
    async fn run(mut self) {
        if let Err(e) = self.pump().await {
            self.failure.raise(e);
        }
    }

    async fn pump(&mut self) -> Result<(), TransportError> {
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let paused = self.held_bytes >= self.hold_limit;
            let was_paused = self.flow.read_paused.swap(paused, Ordering::Relaxed);
            if paused && !was_paused {
                debug!(
                    connection = self.id,
                    held = self.held.len(),
                    "inbound hold full, reading paused"
                );
            }

            tokio::select! {
                permit = self.inbound.clone().reserve_owned(), if !self.held.is_empty() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(payload) = self.held.pop_front() {
                                self.held_bytes -= held_cost(&payload);
                                permit.send(payload);
                            }
                        }
                        Err(_) => return Err(TransportError::ConsumerClosed),
                    }
                    self.release_held()?;
                }
                read = self.half.read(&mut chunk), if !paused => {
                    let n = match read {
                        Ok(0) => return Err(TransportError::PeerClosed),
                        Ok(n) => n,
                        Err(e) => return Err(TransportError::Read(e)),
                    };
                    self.stats
                        .bytes_received
                        .fetch_add(n as u64, Ordering::Relaxed);
                    self.codec.feed(&chunk[..n]);
                    self.decode_buffered().await?;
                }
            }
        }
    }

    async fn decode_buffered(&mut self) -> Result<(), TransportError> {
        loop {
            match self.codec.next_frame() {
                Decode::Complete { frame, .. } => self.dispatch(frame).await?,
                Decode::NeedMoreData => return Ok(()),
                Decode::Corrupt(anomaly) => {
                    let (escalate, count) = {
                        let mut tracker = self.anomalies.lock();
                        (tracker.record(Instant::now()), tracker.recent())
                    };
                    warn!(connection = self.id, %anomaly, "dropping corrupt frame");
                    if escalate {
                        return Err(TransportError::AnomalyThreshold { count });
                    }
                }
            }
        }
    }

    /// Hand held frames to the consumer while it has room.
    fn release_held(&mut self) -> Result<(), TransportError> {
        while let Some(payload) = self.held.pop_front() {
            let cost = held_cost(&payload);
            match self.inbound.try_send(payload) {
                Ok(()) => self.held_bytes -= cost,
                Err(mpsc::error::TrySendError::Full(payload)) => {
                    self.held.push_front(payload);
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(TransportError::ConsumerClosed);
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        match frame {
            Frame::Ping { sequence } => {
                let reply = self.monitor.lock().on_ping(sequence);
                match reply {
                    Some(pong) => {
                        if self.writer_tx.send(pong).await.is_err() {
                            // The writer already reported its failure
                            return Err(TransportError::Write(std::io::Error::from(
                                std::io::ErrorKind::BrokenPipe,
                            )));
                        }
                    }
                    None => trace!(connection = self.id, sequence, "ping ignored"),
                }
            }
            Frame::Pong { sequence } => {
                let outcome = self.monitor.lock().on_pong(sequence, Instant::now());
                match outcome {
                    PongOutcome::Matched { sample, restored } => {
                        trace!(connection = self.id, sequence, rtt = ?sample.rtt, "pong");
                        if restored {
                            let _ = self
                                .events
                                .send(LivenessEvent::Restored { rtt: sample.rtt })
                                .await;
                        }
                    }
                    PongOutcome::Stale => {
                        debug!(connection = self.id, sequence, "stale pong ignored");
                    }
                }
            }
            Frame::Data { domain_id, payload } => {
                trace!(connection = self.id, domain_id, len = payload.len(), "data");
                let payload = InboundPayload { domain_id, payload };
                self.held_bytes += held_cost(&payload);
                self.held.push_back(payload);
                self.release_held()?;
                if !self.held.is_empty() {
                    trace!(
                        connection = self.id,
                        held = self.held.len(),
                        "consumer behind, holding data"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Hold accounting for one Data frame, header included so empty payloads
/// still count.
fn held_cost(payload: &InboundPayload) -> usize {
    payload.payload.len() + DATA_HEADER_SIZE
}
