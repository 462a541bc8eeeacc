// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Domain multiplexer.
//!
//! The boundary with the DDS collaborator: outgoing payloads are tagged with
//! the configured domain id, inbound Data frames for that domain are handed
//! over, and frames for any other domain are dropped and reported as
//! protocol anomalies.

use crate::codec::Frame;
use crate::connection::InboundPayload;
use crate::error::{ProtocolAnomaly, TunnelError};
use crate::supervisor::SupervisorHandle;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Payload exchanged with the DDS collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainPayload {
    pub domain_id: u32,
    pub payload: Vec<u8>,
}

/// Multiplexer counters.
#[derive(Debug, Default)]
pub struct MuxStats {
    /// Payloads accepted from the collaborator
    pub submitted: AtomicU64,
    /// Payloads handed to the collaborator
    pub delivered: AtomicU64,
    /// Inbound frames dropped for carrying another domain id
    pub anomalies: AtomicU64,
}

/// Routes one domain's payloads over a supervised link.
pub struct DomainMultiplexer {
    domain_id: u32,
    link: SupervisorHandle,
    stats: Arc<MuxStats>,
    router: JoinHandle<()>,
}

impl DomainMultiplexer {
    /// Attach to `link`, consuming the Data frames it receives through
    /// `inbound`. Returns the multiplexer and the collaborator's payload
    /// receiver (`capacity` payloads deep).
    pub fn attach(
        domain_id: u32,
        link: SupervisorHandle,
        inbound: mpsc::Receiver<InboundPayload>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<DomainPayload>) {
        let (tx, rx) = mpsc::channel(capacity);
        let stats = Arc::new(MuxStats::default());
        let router = tokio::spawn(route_inbound(
            domain_id,
            link.clone(),
            inbound,
            tx,
            stats.clone(),
        ));

        (
            Self {
                domain_id,
                link,
                stats,
                router,
            },
            rx,
        )
    }

    pub fn domain_id(&self) -> u32 {
        self.domain_id
    }

    /// Queue a payload for the peer without waiting.
    ///
    /// Refuses payloads for a domain other than the configured one, payloads
    /// larger than the frame limit, and returns
    /// [`TunnelError::Backpressure`] when the outgoing queue is full.
    pub fn submit(&self, domain_id: u32, payload: Vec<u8>) -> Result<(), TunnelError> {
        if domain_id != self.domain_id {
            return Err(TunnelError::DomainMismatch {
                expected: self.domain_id,
                got: domain_id,
            });
        }
        self.link.try_submit(Frame::data(domain_id, payload))?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queue a payload on the configured domain.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), TunnelError> {
        self.submit(self.domain_id, payload)
    }

    /// Inbound frames dropped for a foreign domain id.
    pub fn anomalies(&self) -> u64 {
        self.stats.anomalies.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.stats.delivered.load(Ordering::Relaxed)
    }

    pub fn submitted(&self) -> u64 {
        self.stats.submitted.load(Ordering::Relaxed)
    }

    /// Stop routing inbound payloads. The collaborator's receiver then ends.
    pub fn detach(self) {
        debug!("domain {} multiplexer detached", self.domain_id);
    }
}

impl Drop for DomainMultiplexer {
    fn drop(&mut self) {
        self.router.abort();
    }
}

async fn route_inbound(
    domain_id: u32,
    link: SupervisorHandle,
    mut inbound: mpsc::Receiver<InboundPayload>,
    out: mpsc::Sender<DomainPayload>,
    stats: Arc<MuxStats>,
) {
    while let Some(InboundPayload {
        domain_id: got,
        payload,
    }) = inbound.recv().await
    {
        if got != domain_id {
            let anomaly = ProtocolAnomaly::DomainMismatch {
                expected: domain_id,
                got,
            };
            warn!("[{}] dropping frame: {}", link.name(), anomaly);
            stats.anomalies.fetch_add(1, Ordering::Relaxed);
            link.report_anomaly(anomaly);
            continue;
        }

        if out
            .send(DomainPayload {
                domain_id: got,
                payload,
            })
            .await
            .is_err()
        {
            debug!("[{}] payload consumer gone", link.name());
            return;
        }
        stats.delivered.fetch_add(1, Ordering::Relaxed);
    }
}
