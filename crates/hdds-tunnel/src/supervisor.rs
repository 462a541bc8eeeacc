// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection supervisor.
//!
//! Owns the [`ConnectionState`] of one logical link and keeps exactly one
//! [`TunnelConnection`] alive for it:
//!
//! ```text
//!  Disconnected -> Connecting -> Connected <-> Degraded
//!                      ^            |            |
//!                      +-- failure -+-- grace ---+
//!  Connected/Degraded -> Closing -> Disconnected   (shutdown)
//! ```
//!
//! Outgoing frames go through an outbox that survives reconnects. The run
//! loop moves them into the current connection's write queue only when it
//! has room, so a stalled peer never blocks the state machine.

use crate::backoff::Backoff;
use crate::codec::Frame;
use crate::config::{HeartbeatConfig, LimitsConfig, ReconnectConfig, TcpOptions};
use crate::connection::{
    ConnectionCounters, ConnectionId, ConnectionOptions, ConnectionSignals, ConnectionStatsSnapshot,
    InboundPayload, LivenessEvent, TunnelConnection,
};
use crate::error::{ProtocolAnomaly, TransportError, TunnelError};
use crate::heartbeat::{HeartbeatMonitor, HeartbeatRole, HeartbeatStats};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Process-wide connection id source; ids are never reused.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a supervised link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport and not trying to get one
    #[default]
    Disconnected,

    /// Accepting or dialing (including the backoff wait)
    Connecting,

    /// Transport up and heartbeat healthy
    Connected,

    /// Transport up but heartbeat replies are missing
    Degraded,

    /// Flushing queued frames before shutdown
    Closing,
}

impl ConnectionState {
    /// Whether a transport is currently carrying traffic.
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Closing => write!(f, "CLOSING"),
        }
    }
}

/// State published to observers together with the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub connection_id: Option<ConnectionId>,
}

/// How the physical transport is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkRole {
    /// Accept inbound connections on `bind`.
    Server { bind: SocketAddr },
    /// Dial `target` (`host:port`).
    Client { target: String },
}

/// Everything a supervisor needs to know about its link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub role: LinkRole,
    pub heartbeat_role: HeartbeatRole,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
    pub limits: LimitsConfig,
    pub tcp: TcpOptions,
}

impl LinkConfig {
    /// Link with default tuning.
    pub fn new(role: LinkRole, heartbeat_role: HeartbeatRole) -> Self {
        Self {
            role,
            heartbeat_role,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            limits: LimitsConfig::default(),
            tcp: TcpOptions::default(),
        }
    }
}

/// Read-only health view of a link.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub state: ConnectionState,
    pub connection_id: Option<ConnectionId>,
    pub peer_addr: Option<SocketAddr>,
    pub connected_for: Option<Duration>,
    pub heartbeat: HeartbeatStats,
    /// Connections established after the first one
    pub reconnects: u64,
    /// Protocol anomalies over the supervisor lifetime
    pub anomalies: u64,
    /// Traffic of the current connection
    pub traffic: ConnectionStatsSnapshot,
    /// Delay before the latest reconnect attempt
    pub retry_delay: Option<Duration>,
}

enum Command {
    DropConnection(ConnectionId),
    Anomaly {
        connection: ConnectionId,
        anomaly: ProtocolAnomaly,
    },
}

struct ActiveLink {
    peer_addr: SocketAddr,
    since: Instant,
    counters: ConnectionCounters,
}

/// State shared between the run loop and its handles.
struct Shared {
    local_addr: Option<SocketAddr>,
    max_frame_size: u32,
    monitor: Arc<Mutex<HeartbeatMonitor>>,
    link: Mutex<Option<ActiveLink>>,
    reconnects: AtomicU64,
    retired_anomalies: AtomicU64,
    retry_delay: Mutex<Option<Duration>>,
}

/// Entry point; see [`ConnectionSupervisor::start`].
pub struct ConnectionSupervisor;

impl ConnectionSupervisor {
    /// Start supervising a link.
    ///
    /// A Server link binds its listen address here, so an unusable address
    /// or invalid tuning is reported immediately. Everything that fails
    /// later is retried. Data frames received on the link are pushed into
    /// `inbound`.
    pub async fn start(
        name: impl Into<String>,
        config: LinkConfig,
        inbound: mpsc::Sender<InboundPayload>,
    ) -> Result<SupervisorHandle, TunnelError> {
        config.heartbeat.validate()?;
        config.reconnect.validate()?;
        config.limits.validate()?;
        let name: Arc<str> = Arc::from(name.into());

        let listener = match &config.role {
            LinkRole::Server { bind } => {
                let listener = TcpListener::bind(*bind)
                    .await
                    .map_err(|source| TunnelError::Bind {
                        addr: *bind,
                        source,
                    })?;
                Some(listener)
            }
            LinkRole::Client { .. } => None,
        };
        let local_addr = match &listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };
        if let Some(addr) = local_addr {
            info!("[{}] listening on {}", name, addr);
        }

        let shared = Arc::new(Shared {
            local_addr,
            max_frame_size: config.limits.max_frame_size,
            monitor: Arc::new(Mutex::new(HeartbeatMonitor::new(
                config.heartbeat_role,
                config.heartbeat.miss_threshold,
                config.heartbeat.history_len,
            ))),
            link: Mutex::new(None),
            reconnects: AtomicU64::new(0),
            retired_anomalies: AtomicU64::new(0),
            retry_delay: Mutex::new(None),
        });

        let (outbox_tx, outbox_rx) = mpsc::channel(config.limits.outbox);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(LinkStatus::default());
        let (stop_tx, stop_rx) = watch::channel(false);

        let supervisor = Supervisor {
            name: name.clone(),
            options: ConnectionOptions::new(&config.heartbeat, &config.limits, &config.tcp),
            backoff: Backoff::new(config.reconnect.min_backoff(), config.reconnect.max_backoff()),
            retry_delay: None,
            config,
            listener,
            status: status_tx,
            stop: stop_rx,
            commands: commands_rx,
            outbox: outbox_rx,
            pending: None,
            inbound,
            shared: shared.clone(),
        };
        let task = tokio::spawn(supervisor.run());

        Ok(SupervisorHandle {
            name,
            outbox: outbox_tx,
            commands: commands_tx,
            status: status_rx,
            stop: Arc::new(stop_tx),
            task: Arc::new(Mutex::new(Some(task))),
            shared,
        })
    }
}

/// Cloneable control surface of a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    name: Arc<str>,
    outbox: mpsc::Sender<Frame>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<LinkStatus>,
    stop: Arc<watch::Sender<bool>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    shared: Arc<Shared>,
}

impl SupervisorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a frame without waiting. Frames queued while the link is down
    /// are sent once it is back.
    pub fn try_submit(&self, frame: Frame) -> Result<(), TunnelError> {
        self.check_submit(&frame)?;
        self.outbox.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TunnelError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TunnelError::Stopped,
        })
    }

    /// Queue a frame, waiting for outbox room.
    pub async fn submit(&self, frame: Frame) -> Result<(), TunnelError> {
        self.check_submit(&frame)?;
        self.outbox
            .send(frame)
            .await
            .map_err(|_| TunnelError::Stopped)
    }

    fn check_submit(&self, frame: &Frame) -> Result<(), TunnelError> {
        if *self.stop.borrow() {
            return Err(TunnelError::Stopped);
        }
        let max = self.shared.max_frame_size;
        if frame.payload_len() > max as usize {
            return Err(TunnelError::PayloadTooLarge {
                len: frame.payload_len(),
                max,
            });
        }
        Ok(())
    }

    /// Force-close the current connection, if any. The link then goes back
    /// to connecting.
    pub fn drop_connection(&self) {
        if let Some(id) = self.status.borrow().connection_id {
            self.drop_connection_id(id);
        }
    }

    /// Force-close connection `id` if it is still the current one.
    pub fn drop_connection_id(&self, id: ConnectionId) {
        let _ = self.commands.send(Command::DropConnection(id));
    }

    /// Report an anomaly detected above the connection layer. Counts against
    /// the current connection's anomaly threshold.
    pub fn report_anomaly(&self, anomaly: ProtocolAnomaly) {
        if let Some(connection) = self.status.borrow().connection_id {
            let _ = self.commands.send(Command::Anomaly {
                connection,
                anomaly,
            });
        }
    }

    /// Stop the link, flushing queued frames first. Calling it again (or on
    /// a stopped supervisor) does nothing.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("[{}] supervisor task ended abnormally: {}", self.name, e);
            }
        }
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    /// Bound listen address (Server role only).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    /// Largest payload a Data frame on this link may carry.
    pub fn max_frame_size(&self) -> u32 {
        self.shared.max_frame_size
    }

    pub fn health(&self) -> HealthSnapshot {
        let status = self.status();
        let heartbeat = self.shared.monitor.lock().snapshot();
        let retired = self.shared.retired_anomalies.load(Ordering::Relaxed);

        let link = self.shared.link.lock();
        let (peer_addr, connected_for, current_anomalies, traffic) = match link.as_ref() {
            Some(link) => (
                Some(link.peer_addr),
                Some(link.since.elapsed()),
                link.counters.anomalies(),
                link.counters.traffic(),
            ),
            None => (None, None, 0, ConnectionStatsSnapshot::default()),
        };

        HealthSnapshot {
            state: status.state,
            connection_id: status.connection_id,
            peer_addr,
            connected_for,
            heartbeat,
            reconnects: self.shared.reconnects.load(Ordering::Relaxed),
            anomalies: retired + current_anomalies,
            traffic,
            retry_delay: *self.shared.retry_delay.lock(),
        }
    }
}

/// Why the serve loop gave up the current connection.
enum ServeExit {
    Failed(TransportError),
    Dropped,
    Replaced(TcpStream, SocketAddr),
    Stopped,
}

struct Supervisor {
    name: Arc<str>,
    config: LinkConfig,
    options: ConnectionOptions,
    listener: Option<TcpListener>,
    backoff: Backoff,
    /// Delay to wait before the next dial (Client role)
    retry_delay: Option<Duration>,
    status: watch::Sender<LinkStatus>,
    stop: watch::Receiver<bool>,
    commands: mpsc::UnboundedReceiver<Command>,
    outbox: mpsc::Receiver<Frame>,
    /// Taken from the outbox, not yet accepted by a write queue
    pending: Option<Frame>,
    inbound: mpsc::Sender<InboundPayload>,
    shared: Arc<Shared>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut stop = self.stop.clone();
        let mut carried: Option<(TcpStream, SocketAddr)> = None;
        let mut established: u64 = 0;

        loop {
            let (stream, peer_addr) = match carried.take() {
                Some(accepted) => accepted,
                None => {
                    self.publish(ConnectionState::Connecting, None);
                    tokio::select! {
                        biased;
                        _ = wait_stop(&mut stop) => break,
                        accepted = self.establish() => accepted,
                    }
                }
            };

            let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
            self.shared.monitor.lock().reset();
            let spawned = TunnelConnection::spawn(
                id,
                stream,
                &self.options,
                self.shared.monitor.clone(),
                self.inbound.clone(),
            );
            let (conn, mut signals) = match spawned {
                Ok(spawned) => spawned,
                Err(e) => {
                    warn!("[{}] cannot set up connection to {}: {}", self.name, peer_addr, e);
                    self.schedule_retry();
                    continue;
                }
            };

            established += 1;
            if established > 1 {
                self.shared.reconnects.fetch_add(1, Ordering::Relaxed);
            }
            *self.shared.link.lock() = Some(ActiveLink {
                peer_addr,
                since: Instant::now(),
                counters: conn.counters(),
            });
            info!("[{}] connected to {} (connection {})", self.name, peer_addr, id);
            self.publish(ConnectionState::Connected, Some(id));

            let exit = self.serve(&conn, &mut signals, &mut stop).await;

            if conn.age() >= self.config.reconnect.stable_after() {
                self.backoff.reset();
            }
            self.shared
                .retired_anomalies
                .fetch_add(conn.anomalies(), Ordering::Relaxed);

            match exit {
                ServeExit::Stopped => {
                    self.publish(ConnectionState::Closing, Some(id));
                    self.flush_into(&conn);
                    conn.close().await;
                    *self.shared.link.lock() = None;
                    break;
                }
                ServeExit::Failed(TransportError::ConsumerClosed) => {
                    warn!("[{}] inbound consumer gone, stopping link", self.name);
                    conn.abort().await;
                    *self.shared.link.lock() = None;
                    break;
                }
                ServeExit::Failed(e) => {
                    warn!("[{}] connection {} to {} failed: {}", self.name, id, peer_addr, e);
                    conn.abort().await;
                    self.schedule_retry();
                }
                ServeExit::Dropped => {
                    info!("[{}] connection {} to {} dropped", self.name, id, peer_addr);
                    conn.abort().await;
                    self.schedule_retry();
                }
                ServeExit::Replaced(stream, new_peer) => {
                    info!(
                        "[{}] connection {} from {} replaced by {}",
                        self.name, id, peer_addr, new_peer
                    );
                    conn.abort().await;
                    carried = Some((stream, new_peer));
                }
            }
            *self.shared.link.lock() = None;
        }

        self.publish(ConnectionState::Disconnected, None);
        debug!("[{}] supervisor stopped", self.name);
    }

    /// Obtain a transport, retrying until one is up.
    async fn establish(&mut self) -> (TcpStream, SocketAddr) {
        loop {
            if let Some(delay) = self.retry_delay.take() {
                debug!("[{}] retrying in {:?}", self.name, delay);
                tokio::time::sleep(delay).await;
            }

            let attempt = match (&self.config.role, &self.listener) {
                (LinkRole::Server { .. }, Some(listener)) => {
                    listener.accept().await.map_err(TransportError::Accept)
                }
                (LinkRole::Client { target }, _) => {
                    dial(target, self.config.reconnect.connect_timeout()).await
                }
                (LinkRole::Server { bind }, None) => {
                    // start() always binds a listener for the server role
                    warn!("[{}] no listener for {}", self.name, bind);
                    std::future::pending().await
                }
            };

            match attempt {
                Ok(accepted) => return accepted,
                Err(e) => {
                    warn!("[{}] {}", self.name, e);
                    let delay = self.backoff.next_delay();
                    self.set_retry_delay(delay);
                }
            }
        }
    }

    async fn serve(
        &mut self,
        conn: &TunnelConnection,
        signals: &mut ConnectionSignals,
        stop: &mut watch::Receiver<bool>,
    ) -> ServeExit {
        // Commands aimed at earlier connections are stale
        while self.commands.try_recv().is_ok() {}

        let grace = self.config.heartbeat.grace();
        let mut grace_deadline = tokio::time::Instant::now();
        let mut degraded = false;

        loop {
            tokio::select! {
                biased;

                _ = wait_stop(stop) => return ServeExit::Stopped,

                failure = &mut signals.closed => {
                    return ServeExit::Failed(failure.unwrap_or(TransportError::PeerClosed));
                }

                Some(command) = self.commands.recv() => match command {
                    Command::DropConnection(id) if id == conn.id() => return ServeExit::Dropped,
                    Command::Anomaly { connection, anomaly } if connection == conn.id() => {
                        conn.record_anomaly(&anomaly);
                    }
                    _ => {}
                },

                Some(event) = signals.events.recv() => match event {
                    LivenessEvent::Lost { missed } => {
                        if !degraded {
                            warn!(
                                "[{}] {} heartbeats missed, degraded for up to {:?}",
                                self.name, missed, grace
                            );
                            degraded = true;
                            grace_deadline = tokio::time::Instant::now() + grace;
                            self.publish(ConnectionState::Degraded, Some(conn.id()));
                        }
                    }
                    LivenessEvent::Restored { rtt } => {
                        if degraded {
                            info!("[{}] heartbeat restored (rtt {:?})", self.name, rtt);
                            degraded = false;
                            self.publish(ConnectionState::Connected, Some(conn.id()));
                        }
                    }
                },

                _ = tokio::time::sleep_until(grace_deadline), if degraded => {
                    return ServeExit::Failed(TransportError::LivenessTimeout(grace));
                }

                accepted = accept_on(self.listener.as_ref()) => match accepted {
                    Ok((stream, peer)) => return ServeExit::Replaced(stream, peer),
                    Err(e) => warn!("[{}] accept failed: {}", self.name, e),
                },

                permit = conn.sender().reserve(), if self.pending.is_some() => {
                    if let (Ok(permit), Some(frame)) = (permit, self.pending.take()) {
                        permit.send(frame);
                    }
                }

                frame = self.outbox.recv(), if self.pending.is_none() => match frame {
                    Some(frame) => {
                        if let Err(e) = conn.sender().try_send(frame) {
                            self.pending = Some(e.into_inner());
                        }
                    }
                    // Every handle is gone
                    None => return ServeExit::Stopped,
                },
            }
        }
    }

    /// Move whatever fits from the outbox into the write queue before a
    /// clean close.
    fn flush_into(&mut self, conn: &TunnelConnection) {
        let mut moved = 0usize;
        loop {
            let Some(frame) = self.pending.take().or_else(|| self.outbox.try_recv().ok()) else {
                break;
            };
            if let Err(e) = conn.sender().try_send(frame) {
                self.pending = Some(e.into_inner());
                break;
            }
            moved += 1;
        }
        if self.pending.is_some() {
            warn!("[{}] write queue full at shutdown, unsent frames dropped", self.name);
        }
        debug!("[{}] flushed {} queued frames", self.name, moved);
    }

    fn schedule_retry(&mut self) {
        if matches!(self.config.role, LinkRole::Client { .. }) {
            let delay = self.backoff.next_delay();
            self.set_retry_delay(delay);
        }
    }

    fn set_retry_delay(&mut self, delay: Duration) {
        self.retry_delay = Some(delay);
        *self.shared.retry_delay.lock() = Some(delay);
    }

    fn publish(&self, state: ConnectionState, connection_id: Option<ConnectionId>) {
        let status = LinkStatus {
            state,
            connection_id,
        };
        let previous = self.status.send_replace(status);
        if previous.state != state {
            debug!("[{}] {} -> {}", self.name, previous.state, state);
        }
    }
}

async fn dial(target: &str, timeout: Duration) -> Result<(TcpStream, SocketAddr), TransportError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(target))
        .await
        .map_err(|_| TransportError::ConnectTimeout {
            target: target.to_string(),
            timeout,
        })?
        .map_err(|source| TransportError::Connect {
            target: target.to_string(),
            source,
        })?;
    let peer = stream.peer_addr().map_err(TransportError::SocketSetup)?;
    Ok((stream, peer))
}

async fn accept_on(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Resolves once the stop flag is raised or its sender is gone.
async fn wait_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn fast_link(role: LinkRole, heartbeat_role: HeartbeatRole) -> LinkConfig {
        let mut config = LinkConfig::new(role, heartbeat_role);
        config.heartbeat.interval_ms = 20;
        config.reconnect.min_backoff_ms = 20;
        config.reconnect.max_backoff_ms = 100;
        config
    }

    async fn wait_for(
        rx: &mut watch::Receiver<LinkStatus>,
        pred: impl Fn(&LinkStatus) -> bool,
    ) -> LinkStatus {
        let status = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| pred(s)))
            .await
            .expect("timed out waiting for link status")
            .expect("supervisor gone");
        *status
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Degraded.to_string(), "DEGRADED");
        assert!(ConnectionState::Degraded.is_operational());
        assert!(!ConnectionState::Connecting.is_operational());
    }

    #[tokio::test]
    async fn test_bind_failure_reported_at_start() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bind = taken.local_addr().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let result = ConnectionSupervisor::start(
            "dup",
            LinkConfig::new(LinkRole::Server { bind }, HeartbeatRole::Responder),
            tx,
        )
        .await;
        assert!(matches!(result, Err(TunnelError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_frames_queued_before_connect_are_delivered() {
        let (srv_tx, mut srv_rx) = mpsc::channel(8);
        let server = ConnectionSupervisor::start(
            "server",
            fast_link(
                LinkRole::Server {
                    bind: "127.0.0.1:0".parse().unwrap(),
                },
                HeartbeatRole::Responder,
            ),
            srv_tx,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();

        let (cli_tx, _cli_rx) = mpsc::channel(8);
        let client = ConnectionSupervisor::start(
            "client",
            fast_link(
                LinkRole::Client {
                    target: addr.to_string(),
                },
                HeartbeatRole::Initiator,
            ),
            cli_tx,
        )
        .await
        .unwrap();
        client.try_submit(Frame::data(3, b"early".to_vec())).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(10), srv_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.domain_id, 3);
        assert_eq!(got.payload, b"early".to_vec());

        let mut status = client.subscribe();
        wait_for(&mut status, |s| s.state == ConnectionState::Connected).await;
        let health = client.health();
        assert!(health.peer_addr.is_some());
        assert_eq!(health.reconnects, 0);

        client.shutdown().await;
        server.shutdown().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(
            client.try_submit(Frame::data(0, Vec::new())),
            Err(TunnelError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_full_outbox_is_backpressure() {
        let (tx, _rx) = mpsc::channel(8);
        let mut config = fast_link(
            LinkRole::Client {
                // Nothing listens here; frames stay queued
                target: "127.0.0.1:1".into(),
            },
            HeartbeatRole::Initiator,
        );
        config.limits.outbox = 2;
        let client = ConnectionSupervisor::start("client", config, tx).await.unwrap();

        client.try_submit(Frame::data(0, vec![1])).unwrap();
        client.try_submit(Frame::data(0, vec![2])).unwrap();
        let err = client.try_submit(Frame::data(0, vec![3])).unwrap_err();
        assert!(err.is_retryable());

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_connection_reconnects() {
        let (srv_tx, _srv_rx) = mpsc::channel(8);
        let server = ConnectionSupervisor::start(
            "server",
            fast_link(
                LinkRole::Server {
                    bind: "127.0.0.1:0".parse().unwrap(),
                },
                HeartbeatRole::Responder,
            ),
            srv_tx,
        )
        .await
        .unwrap();
        let (cli_tx, _cli_rx) = mpsc::channel(8);
        let client = ConnectionSupervisor::start(
            "client",
            fast_link(
                LinkRole::Client {
                    target: server.local_addr().unwrap().to_string(),
                },
                HeartbeatRole::Initiator,
            ),
            cli_tx,
        )
        .await
        .unwrap();

        let mut status = client.subscribe();
        let first = wait_for(&mut status, |s| s.state == ConnectionState::Connected).await;
        client.drop_connection();
        let second = wait_for(&mut status, |s| {
            s.state == ConnectionState::Connected && s.connection_id != first.connection_id
        })
        .await;
        assert_ne!(first.connection_id, second.connection_id);
        assert_eq!(client.health().reconnects, 1);

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (tx, _rx) = mpsc::channel(8);
        let server = ConnectionSupervisor::start(
            "server",
            LinkConfig::new(
                LinkRole::Server {
                    bind: "127.0.0.1:0".parse().unwrap(),
                },
                HeartbeatRole::Responder,
            ),
            tx,
        )
        .await
        .unwrap();
        server.shutdown().await;
        server.shutdown().await;
        server.clone().shutdown().await;
        assert_eq!(server.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_invalid_limits_refused_at_start() {
        let (tx, _rx) = mpsc::channel(8);
        let mut config = LinkConfig::new(
            LinkRole::Client {
                target: "127.0.0.1:1".into(),
            },
            HeartbeatRole::Initiator,
        );
        config.limits.outbox = 0;
        let result = ConnectionSupervisor::start("client", config, tx).await;
        assert!(matches!(result, Err(TunnelError::Config(_))));
    }

    #[tokio::test]
    async fn test_oversize_frame_refused_by_handle() {
        let (tx, _rx) = mpsc::channel(8);
        let mut config = fast_link(
            LinkRole::Client {
                target: "127.0.0.1:1".into(),
            },
            HeartbeatRole::Disabled,
        );
        config.limits.max_frame_size = 16;
        let client = ConnectionSupervisor::start("client", config, tx).await.unwrap();

        assert!(matches!(
            client.try_submit(Frame::data(0, vec![0; 17])),
            Err(TunnelError::PayloadTooLarge { len: 17, max: 16 })
        ));
        assert!(matches!(
            client.submit(Frame::data(0, vec![0; 17])).await,
            Err(TunnelError::PayloadTooLarge { .. })
        ));
        client.try_submit(Frame::data(0, vec![0; 16])).unwrap();

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_new_inbound_connection_replaces_active_one() {
        let (tx, _rx) = mpsc::channel(8);
        let server = ConnectionSupervisor::start(
            "server",
            fast_link(
                LinkRole::Server {
                    bind: "127.0.0.1:0".parse().unwrap(),
                },
                HeartbeatRole::Responder,
            ),
            tx,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let mut status = server.subscribe();

        let mut first = TcpStream::connect(addr).await.unwrap();
        let one = wait_for(&mut status, |s| s.state == ConnectionState::Connected).await;

        let _second = TcpStream::connect(addr).await.unwrap();
        let two = wait_for(&mut status, |s| {
            s.state == ConnectionState::Connected && s.connection_id != one.connection_id
        })
        .await;
        assert!(two.connection_id.is_some());
        assert_eq!(server.health().reconnects, 1);

        // The replaced connection gets closed
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), first.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_backoff_resets_after_stable_connection() {
        // Reserve a port and leave it closed so the first dials fail
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let min = Duration::from_millis(20);
        let (tx, _rx) = mpsc::channel(8);
        let mut config = fast_link(
            LinkRole::Client {
                target: addr.to_string(),
            },
            HeartbeatRole::Disabled,
        );
        config.reconnect.min_backoff_ms = 20;
        config.reconnect.max_backoff_ms = 5_000;
        config.reconnect.stable_after_secs = 1;
        let client = ConnectionSupervisor::start("client", config, tx).await.unwrap();
        let mut status = client.subscribe();

        wait_until("backoff growth", || {
            client
                .health()
                .retry_delay
                .is_some_and(|d| d >= Duration::from_millis(80))
        })
        .await;
        let listener = TcpListener::bind(addr).await.unwrap();

        // Short-lived connection: the backoff keeps growing
        let (short, _) = listener.accept().await.unwrap();
        let up = wait_for(&mut status, |s| s.state == ConnectionState::Connected).await;
        drop(short);
        wait_for(&mut status, |s| s.connection_id != up.connection_id).await;
        assert!(client.health().retry_delay.unwrap() > min);

        // Connection outlives the stable period: back to the minimum
        let (stable, _) = listener.accept().await.unwrap();
        let up = wait_for(&mut status, |s| s.state == ConnectionState::Connected).await;
        tokio::time::sleep(Duration::from_millis(1200)).await;
        drop(stable);
        wait_for(&mut status, |s| s.connection_id != up.connection_id).await;
        assert_eq!(client.health().retry_delay, Some(min));

        client.shutdown().await;
    }
}
