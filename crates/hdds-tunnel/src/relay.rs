// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay mode for symmetric NAT.
//!
//! When neither endpoint can accept inbound connections, both dial a relay
//! that listens on a pair of ports and splices the two links together.
//!
//! # How it works
//!
//! 1. Each port of a pair is a Server-role link with its own supervisor
//! 2. A coordinator pairs the two sides once both are connected
//! 3. Forwarders move Data frames verbatim from one side to the other
//! 4. When either side disconnects the session ends and the survivor is
//!    dropped, so both endpoints reconnect and pair again
//!
//! Heartbeats terminate at each side. Data that arrives before the session
//! exists is held: first in the side's inbound queue, then in the
//! connection's inbound hold, while pings keep being answered. Once the hold
//! is full the relay stops reading and TCP flow control pushes back on the
//! sender until its outbox fills and `submit` reports backpressure.

use crate::codec::Frame;
use crate::config::{PortPair, RelayConfig};
use crate::connection::{ConnectionId, InboundPayload};
use crate::error::TunnelError;
use crate::supervisor::{
    ConnectionSupervisor, HealthSnapshot, LinkConfig, LinkRole, LinkStatus, SupervisorHandle,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Sessions are keyed by the bound port pair.
pub type SessionKey = PortPair;

/// Two connected sides spliced together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySession {
    pub connection_a: ConnectionId,
    pub connection_b: ConnectionId,
    pub created_at: Instant,
}

/// Forwarding direction within a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    AToB,
    BToA,
}

/// Relay statistics.
#[derive(Debug, Default)]
pub struct RelayStats {
    sessions_created: AtomicU64,
    sessions_destroyed: AtomicU64,
    frames_a_to_b: AtomicU64,
    bytes_a_to_b: AtomicU64,
    frames_b_to_a: AtomicU64,
    bytes_b_to_a: AtomicU64,
}

/// Snapshot of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub sessions_created: u64,
    pub sessions_destroyed: u64,
    pub frames_a_to_b: u64,
    pub bytes_a_to_b: u64,
    pub frames_b_to_a: u64,
    pub bytes_b_to_a: u64,
}

impl RelayStats {
    fn record(&self, direction: Direction, bytes: usize) {
        let (frames, total) = match direction {
            Direction::AToB => (&self.frames_a_to_b, &self.bytes_a_to_b),
            Direction::BToA => (&self.frames_b_to_a, &self.bytes_b_to_a),
        };
        frames.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_destroyed: self.sessions_destroyed.load(Ordering::Relaxed),
            frames_a_to_b: self.frames_a_to_b.load(Ordering::Relaxed),
            bytes_a_to_b: self.bytes_a_to_b.load(Ordering::Relaxed),
            frames_b_to_a: self.frames_b_to_a.load(Ordering::Relaxed),
            bytes_b_to_a: self.bytes_b_to_a.load(Ordering::Relaxed),
        }
    }
}

type SessionTable = Arc<Mutex<HashMap<SessionKey, RelaySession>>>;

struct RelayPair {
    key: SessionKey,
    side_a: SupervisorHandle,
    side_b: SupervisorHandle,
}

/// Splices the links of every configured port pair.
pub struct RelayRouter {
    pairs: Vec<RelayPair>,
    sessions: SessionTable,
    stats: Arc<RelayStats>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayRouter {
    /// Bind every port pair and start relaying.
    pub async fn start(config: &RelayConfig) -> Result<Self, TunnelError> {
        config.validate()?;

        let sessions: SessionTable = Arc::new(Mutex::new(HashMap::new()));
        let stats = Arc::new(RelayStats::default());
        let (stop, _) = watch::channel(false);
        let mut pairs: Vec<RelayPair> = Vec::with_capacity(config.pairs.len());
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        for pair in &config.pairs {
            let (a_tx, a_rx) = mpsc::channel(config.limits.inbound_queue);
            let (b_tx, b_rx) = mpsc::channel(config.limits.inbound_queue);

            let sides = match Self::start_side(config, pair.port_a, a_tx).await {
                Ok(side_a) => match Self::start_side(config, pair.port_b, b_tx).await {
                    Ok(side_b) => Ok((side_a, side_b)),
                    Err(e) => {
                        side_a.shutdown().await;
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };
            let (side_a, side_b) = match sides {
                Ok(sides) => sides,
                Err(e) => {
                    // Undo the pairs that did start
                    for started in &pairs {
                        started.side_a.shutdown().await;
                        started.side_b.shutdown().await;
                    }
                    for task in tasks {
                        task.abort();
                    }
                    return Err(e);
                }
            };

            let key = SessionKey {
                port_a: side_a.local_addr().map_or(pair.port_a, |a| a.port()),
                port_b: side_b.local_addr().map_or(pair.port_b, |a| a.port()),
            };
            info!("Relay pair {} <-> {} ready", key.port_a, key.port_b);

            let (paired_tx, paired_rx) = watch::channel(false);
            tasks.push(tokio::spawn(coordinate(
                key,
                side_a.clone(),
                side_b.clone(),
                sessions.clone(),
                stats.clone(),
                paired_tx,
                stop.subscribe(),
            )));
            tasks.push(tokio::spawn(forward(
                Direction::AToB,
                a_rx,
                side_b.clone(),
                paired_rx.clone(),
                stats.clone(),
            )));
            tasks.push(tokio::spawn(forward(
                Direction::BToA,
                b_rx,
                side_a.clone(),
                paired_rx,
                stats.clone(),
            )));

            pairs.push(RelayPair {
                key,
                side_a,
                side_b,
            });
        }

        Ok(Self {
            pairs,
            sessions,
            stats,
            stop,
            tasks: Mutex::new(tasks),
        })
    }

    async fn start_side(
        config: &RelayConfig,
        port: u16,
        inbound: mpsc::Sender<InboundPayload>,
    ) -> Result<SupervisorHandle, TunnelError> {
        let link = LinkConfig {
            role: LinkRole::Server {
                bind: SocketAddr::new(config.bind_address, port),
            },
            heartbeat_role: config.heartbeat_role(),
            heartbeat: config.heartbeat.clone(),
            reconnect: config.reconnect.clone(),
            limits: config.limits.clone(),
            tcp: config.tcp.clone(),
        };
        ConnectionSupervisor::start(format!("relay:{}", port), link, inbound).await
    }

    /// Bound port pairs, in configuration order.
    pub fn pairs(&self) -> Vec<SessionKey> {
        self.pairs.iter().map(|p| p.key).collect()
    }

    /// Current session of a pair, if both sides are connected.
    pub fn session(&self, key: &SessionKey) -> Option<RelaySession> {
        self.sessions.lock().get(key).copied()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Health of both sides of a pair.
    pub fn health(&self, key: &SessionKey) -> Option<(HealthSnapshot, HealthSnapshot)> {
        self.pairs
            .iter()
            .find(|p| p.key == *key)
            .map(|p| (p.side_a.health(), p.side_b.health()))
    }

    /// Stop every side and the relay tasks. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        for pair in &self.pairs {
            pair.side_a.shutdown().await;
            pair.side_b.shutdown().await;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
        self.sessions.lock().clear();
    }
}

impl Drop for RelayRouter {
    fn drop(&mut self) {
        for task in self.tasks.lock().iter() {
            task.abort();
        }
    }
}

/// Connection ids of both sides when both are carrying traffic.
fn both_up(a: &LinkStatus, b: &LinkStatus) -> Option<(ConnectionId, ConnectionId)> {
    if !a.state.is_operational() || !b.state.is_operational() {
        return None;
    }
    Some((a.connection_id?, b.connection_id?))
}

async fn coordinate(
    key: SessionKey,
    side_a: SupervisorHandle,
    side_b: SupervisorHandle,
    sessions: SessionTable,
    stats: Arc<RelayStats>,
    paired: watch::Sender<bool>,
    mut stop: watch::Receiver<bool>,
) {
    let mut status_a = side_a.subscribe();
    let mut status_b = side_b.subscribe();
    let mut current: Option<(ConnectionId, ConnectionId)> = None;

    loop {
        let a = *status_a.borrow_and_update();
        let b = *status_b.borrow_and_update();
        let up = both_up(&a, &b);

        if up != current {
            let mut dropped_survivor = false;
            if let Some((old_a, old_b)) = current.take() {
                paired.send_replace(false);
                sessions.lock().remove(&key);
                stats.sessions_destroyed.fetch_add(1, Ordering::Relaxed);
                info!("Relay session {} <-> {} closed", key.port_a, key.port_b);

                // The side that is still on its old connection is the survivor
                if a.connection_id == Some(old_a) {
                    side_a.drop_connection_id(old_a);
                    dropped_survivor = true;
                }
                if b.connection_id == Some(old_b) {
                    side_b.drop_connection_id(old_b);
                    dropped_survivor = true;
                }
            }

            if let (Some((conn_a, conn_b)), false) = (up, dropped_survivor) {
                sessions.lock().insert(
                    key,
                    RelaySession {
                        connection_a: conn_a,
                        connection_b: conn_b,
                        created_at: Instant::now(),
                    },
                );
                stats.sessions_created.fetch_add(1, Ordering::Relaxed);
                current = Some((conn_a, conn_b));
                paired.send_replace(true);
                info!(
                    "Relay session {} <-> {} paired (connections {} and {})",
                    key.port_a, key.port_b, conn_a, conn_b
                );
            }
        }

        tokio::select! {
            changed = status_a.changed() => if changed.is_err() { break },
            changed = status_b.changed() => if changed.is_err() { break },
            changed = stop.changed() => if changed.is_err() || *stop.borrow() { break },
        }
    }

    paired.send_replace(false);
    sessions.lock().remove(&key);
    debug!("Relay coordinator {} <-> {} stopped", key.port_a, key.port_b);
}

async fn forward(
    direction: Direction,
    mut inbound: mpsc::Receiver<InboundPayload>,
    to: SupervisorHandle,
    mut paired: watch::Receiver<bool>,
    stats: Arc<RelayStats>,
) {
    loop {
        // Hold inbound data until the other side is there to take it
        if paired.wait_for(|p| *p).await.is_err() {
            return;
        }
        let Some(InboundPayload { domain_id, payload }) = inbound.recv().await else {
            return;
        };
        let len = payload.len();
        if to.submit(Frame::data(domain_id, payload)).await.is_err() {
            return;
        }
        stats.record(direction, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: crate::supervisor::ConnectionState, id: Option<u64>) -> LinkStatus {
        LinkStatus {
            state,
            connection_id: id,
        }
    }

    #[test]
    fn test_both_up() {
        use crate::supervisor::ConnectionState::*;
        assert_eq!(
            both_up(&status(Connected, Some(1)), &status(Degraded, Some(2))),
            Some((1, 2))
        );
        assert_eq!(
            both_up(&status(Connected, Some(1)), &status(Connecting, None)),
            None
        );
    }

    #[test]
    fn test_stats_per_direction() {
        let stats = RelayStats::default();
        stats.record(Direction::AToB, 10);
        stats.record(Direction::AToB, 5);
        stats.record(Direction::BToA, 1);
        let snap = stats.snapshot();
        assert_eq!(snap.frames_a_to_b, 2);
        assert_eq!(snap.bytes_a_to_b, 15);
        assert_eq!(snap.frames_b_to_a, 1);
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_pair() {
        let config = RelayConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            pairs: vec![PortPair {
                port_a: 0,
                port_b: 0,
            }],
            ..Default::default()
        };
        let relay = RelayRouter::start(&config).await.unwrap();
        let pairs = relay.pairs();
        assert_eq!(pairs.len(), 1);
        assert_ne!(pairs[0].port_a, 0);
        assert_ne!(pairs[0].port_a, pairs[0].port_b);
        assert_eq!(relay.session_count(), 0);
        assert!(relay.health(&pairs[0]).is_some());

        relay.shutdown().await;
        relay.shutdown().await;
    }
}
