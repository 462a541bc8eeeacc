// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local UDP <-> tunnel bridge
//!
//! Lets the binary stand in for the DDS collaborator: datagrams received on
//! the local socket are submitted on the endpoint's domain, and payloads
//! coming out of the tunnel are sent to the configured local peer (or to
//! whoever sent the last local datagram).

use crate::endpoint::TunnelEndpoint;
use crate::error::TunnelError;
use crate::mux::DomainPayload;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Largest UDP datagram.
const MAX_DATAGRAM: usize = 65_535;

/// Submission attempts before a datagram is dropped under backpressure.
const BACKPRESSURE_RETRIES: u32 = 5;

/// Pause between submission attempts.
const BACKPRESSURE_PAUSE: Duration = Duration::from_millis(10);

/// Bridge counters.
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub datagrams_in: AtomicU64,
    pub datagrams_out: AtomicU64,
    pub dropped: AtomicU64,
}

/// UDP side of the binary.
pub struct UdpBridge {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
    last_sender: Mutex<Option<SocketAddr>>,
    stats: BridgeStats,
}

impl UdpBridge {
    /// Bind the local socket.
    pub async fn bind(bind: SocketAddr, peer: Option<SocketAddr>) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind).await?;
        info!("Local bridge on {} (peer: {:?})", socket.local_addr()?, peer);
        Ok(Self {
            socket,
            peer,
            last_sender: Mutex::new(None),
            stats: BridgeStats::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// Shuttle datagrams until `stop` is raised or the payload stream ends.
    pub async fn run(
        &self,
        endpoint: &TunnelEndpoint,
        mut payloads: mpsc::Receiver<DomainPayload>,
        mut stop: watch::Receiver<bool>,
    ) -> io::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    *self.last_sender.lock() = Some(from);
                    self.stats.datagrams_in.fetch_add(1, Ordering::Relaxed);
                    self.submit(endpoint, buf[..len].to_vec()).await;
                }
                payload = payloads.recv() => {
                    let Some(payload) = payload else {
                        debug!("Tunnel payload stream ended");
                        return Ok(());
                    };
                    self.deliver(payload).await;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn submit(&self, endpoint: &TunnelEndpoint, datagram: Vec<u8>) {
        let mut attempt = 0;
        loop {
            match endpoint.send(datagram.clone()) {
                Ok(()) => return,
                Err(TunnelError::Backpressure) if attempt < BACKPRESSURE_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(BACKPRESSURE_PAUSE).await;
                }
                Err(e) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("Dropping local datagram ({} bytes): {}", datagram.len(), e);
                    return;
                }
            }
        }
    }

    async fn deliver(&self, payload: DomainPayload) {
        let target = self.peer.or(*self.last_sender.lock());
        let Some(target) = target else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("No local peer yet, dropping {} bytes", payload.payload.len());
            return;
        };
        match self.socket.send_to(&payload.payload, target).await {
            Ok(_) => {
                self.stats.datagrams_out.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Send to local peer {} failed: {}", target, e);
            }
        }
    }
}
