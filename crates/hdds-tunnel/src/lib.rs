// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS NAT Tunnel
//!
//! Carries DDS traffic between two sites over one long-lived TCP connection
//! when NAT or firewalls prevent direct participant-to-participant traffic.
//!
//! # Features
//!
//! - **Asymmetric NAT**: one side accepts, the other dials
//! - **Symmetric NAT**: both sides dial a relay that splices the links
//! - **Liveness**: ping/pong heartbeat with degraded state and grace period
//! - **Recovery**: reconnect with exponential backoff, outbox kept across
//!   reconnects
//! - **Domain tagging**: payloads carry their DDS domain id; foreign domains
//!   are refused
//!
//! # Quick Start
//!
//! ```bash
//! # Site with a reachable address
//! hdds-tunnel server --internal-port 7400
//!
//! # Site behind NAT
//! hdds-tunnel client --server-address tunnel.example.com:7400
//!
//! # Both sites behind symmetric NAT
//! hdds-tunnel relay --port-a 7500 --port-b 7501
//! hdds-tunnel client --server-address relay.example.com:7500 --symmetric
//! ```
//!
//! # Wire format
//!
//! ```text
//! +------+------------+---------------------+----------------+
//! | kind | length u32 | sequence u64 (1, 2) |                |
//! |  u8  |  (BE)      | domain_id u32 (3)   | payload bytes  |
//! +------+------------+---------------------+----------------+
//! ```

pub mod adapter;
pub mod backoff;
pub mod codec;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod heartbeat;
pub mod mux;
pub mod relay;
pub mod supervisor;

pub use codec::{Decode, Frame, FrameCodec, FrameKind};
pub use config::{
    ConfigError, EndpointRole, HeartbeatConfig, LimitsConfig, PortPair, ReconnectConfig,
    RelayConfig, TcpOptions, Topology, TunnelConfig,
};
pub use connection::{InboundPayload, TunnelConnection};
pub use endpoint::TunnelEndpoint;
pub use error::{ProtocolAnomaly, TransportError, TunnelError};
pub use heartbeat::{HeartbeatMonitor, HeartbeatRole, HeartbeatStats};
pub use mux::{DomainMultiplexer, DomainPayload};
pub use relay::{RelayRouter, RelaySession, RelayStatsSnapshot};
pub use supervisor::{
    ConnectionState, ConnectionSupervisor, HealthSnapshot, LinkConfig, LinkRole, LinkStatus,
    SupervisorHandle,
};
