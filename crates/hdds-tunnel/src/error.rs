// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for the tunnel.
//!
//! - [`TransportError`] - fatal to the current connection, recovered by the
//!   supervisor through reconnect-with-backoff.
//! - [`ProtocolAnomaly`] - the offending frame is dropped; too many anomalies
//!   in a window escalate to [`TransportError::AnomalyThreshold`].
//! - [`TunnelError`] - what callers of the public API see (startup failures,
//!   backpressure, stopped endpoints).

use crate::config::ConfigError;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Failure of one physical connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("socket setup failed: {0}")]
    SocketSetup(#[source] std::io::Error),

    #[error("connection closed by peer")]
    PeerClosed,

    #[error("protocol anomaly threshold reached ({count} in window)")]
    AnomalyThreshold { count: usize },

    #[error("no heartbeat reply within grace period {0:?}")]
    LivenessTimeout(Duration),

    #[error("inbound payload consumer closed")]
    ConsumerClosed,
}

/// Malformed or misrouted traffic. Never fatal on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolAnomaly {
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),

    #[error("frame length {len} exceeds maximum {max}")]
    Oversize { len: u32, max: u32 },

    #[error("control frame carries {0} payload bytes")]
    ControlPayload(u32),

    #[error("data frame for domain {got}, expected domain {expected}")]
    DomainMismatch { expected: u32, got: u32 },
}

/// Errors surfaced by the public tunnel API.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Outgoing queue full, retry later")]
    Backpressure,

    #[error("Payload for domain {got} refused, endpoint is configured for domain {expected}")]
    DomainMismatch { expected: u32, got: u32 },

    #[error("Payload of {len} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge { len: usize, max: u32 },

    #[error("Tunnel stopped")]
    Stopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backpressure)
    }
}
