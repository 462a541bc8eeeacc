// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tunnel endpoint: one supervised link plus its domain multiplexer.

use crate::config::{ConfigError, EndpointRole, Topology, TunnelConfig};
use crate::error::TunnelError;
use crate::mux::{DomainMultiplexer, DomainPayload};
use crate::supervisor::{
    ConnectionState, ConnectionSupervisor, HealthSnapshot, LinkConfig, LinkRole, LinkStatus,
    SupervisorHandle,
};
use std::net::SocketAddr;
use tokio::sync::{mpsc, watch};
use tracing::info;

/// Build the link description for an endpoint configuration.
pub fn link_config(config: &TunnelConfig) -> Result<LinkConfig, ConfigError> {
    let role = match config.endpoint_role {
        EndpointRole::Server => LinkRole::Server {
            bind: config.listen_addr(),
        },
        EndpointRole::Client => LinkRole::Client {
            target: config
                .target_address
                .clone()
                .ok_or_else(|| ConfigError::Invalid("client role needs target_address".into()))?,
        },
    };
    Ok(LinkConfig {
        role,
        heartbeat_role: config.heartbeat_role(),
        heartbeat: config.heartbeat.clone(),
        reconnect: config.reconnect.clone(),
        limits: config.limits.clone(),
        tcp: config.tcp.clone(),
    })
}

/// A running tunnel endpoint.
pub struct TunnelEndpoint {
    link: SupervisorHandle,
    mux: DomainMultiplexer,
}

impl TunnelEndpoint {
    /// Validate `config`, start the link and attach the multiplexer.
    ///
    /// Returns the endpoint and the receiver of payloads for the configured
    /// domain.
    pub async fn start(
        config: &TunnelConfig,
    ) -> Result<(Self, mpsc::Receiver<DomainPayload>), TunnelError> {
        config.validate()?;
        let link_config = link_config(config)?;

        let name = match (&config.endpoint_role, &config.topology) {
            (EndpointRole::Server, _) => "server",
            (EndpointRole::Client, Topology::Asymmetric) => "client",
            (EndpointRole::Client, Topology::Symmetric) => "client/relayed",
        };
        if let Some(public) = &config.public_address {
            info!("[{}] advertised as {}", name, public);
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(config.limits.inbound_queue);
        let link = ConnectionSupervisor::start(name, link_config, inbound_tx).await?;
        let (mux, payloads) = DomainMultiplexer::attach(
            config.domain_id,
            link.clone(),
            inbound_rx,
            config.limits.inbound_queue,
        );
        info!(
            "[{}] tunnel endpoint up (domain {}, heartbeat {})",
            name,
            config.domain_id,
            config.heartbeat_role()
        );

        Ok((Self { link, mux }, payloads))
    }

    /// Queue a payload for the peer; see [`DomainMultiplexer::submit`].
    pub fn submit(&self, domain_id: u32, payload: Vec<u8>) -> Result<(), TunnelError> {
        self.mux.submit(domain_id, payload)
    }

    /// Queue a payload on the configured domain.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), TunnelError> {
        self.mux.send(payload)
    }

    pub fn domain_id(&self) -> u32 {
        self.mux.domain_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn status(&self) -> LinkStatus {
        self.link.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.link.subscribe()
    }

    pub fn health(&self) -> HealthSnapshot {
        self.link.health()
    }

    /// Bound listen address (server role only).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link.local_addr()
    }

    /// Inbound frames dropped for a foreign domain id.
    pub fn domain_anomalies(&self) -> u64 {
        self.mux.anomalies()
    }

    /// Underlying link, for callers that need the raw supervisor.
    pub fn link(&self) -> &SupervisorHandle {
        &self.link
    }

    /// Flush and stop. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.link.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_config_roles() {
        let server = link_config(&TunnelConfig::server(7400)).unwrap();
        assert!(matches!(server.role, LinkRole::Server { bind } if bind.port() == 7400));
        assert_eq!(
            server.heartbeat_role,
            crate::heartbeat::HeartbeatRole::Responder
        );

        let client = link_config(&TunnelConfig::client("10.0.0.1:7400")).unwrap();
        assert_eq!(
            client.role,
            LinkRole::Client {
                target: "10.0.0.1:7400".into()
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_config_refused() {
        let mut config = TunnelConfig::server(0);
        config.topology = Topology::Symmetric;
        assert!(matches!(
            TunnelEndpoint::start(&config).await,
            Err(TunnelError::Config(_))
        ));
    }
}
