// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tunnel and relay configuration.
//!
//! Both structs are loaded once at startup (TOML file or CLI flags), validated,
//! and then handed by value to the components. Nothing mutates them afterwards.
//!
//! ```toml
//! topology = "asymmetric"
//! endpoint_role = "client"
//! target_address = "203.0.113.7:7400"
//! domain_id = 0
//!
//! [heartbeat]
//! role = "initiator"
//! interval_ms = 1000
//! miss_threshold = 3
//! ```

use crate::heartbeat::HeartbeatRole;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// NAT topology between the two endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// One endpoint accepts inbound connections (port-forward).
    #[default]
    Asymmetric,
    /// Neither endpoint accepts inbound connections; both dial a relay.
    Symmetric,
}

/// Which side of the TCP connection this endpoint is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    /// Accepts the tunnel connection on `listen_port`.
    Server,
    /// Dials `target_address`.
    #[default]
    Client,
}

/// Heartbeat tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat role. When unset, servers respond and clients initiate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<HeartbeatRole>,

    /// Ping period (initiator only).
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Consecutive unanswered pings before a liveness failure.
    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,

    /// Time spent Degraded before the connection is torn down.
    #[serde(default = "default_grace")]
    pub grace_ms: u64,

    /// Number of RTT samples kept for the rolling latency.
    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

/// Reconnection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_min_backoff")]
    pub min_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// A connection that stays up this long resets the backoff.
    #[serde(default = "default_stable_after")]
    pub stable_after_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Queue sizes and protocol limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum payload length accepted in one frame (anti-OOM protection).
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,

    /// Per-connection write queue (frames).
    #[serde(default = "default_write_queue")]
    pub write_queue: usize,

    /// Outgoing payloads buffered across reconnects (frames).
    #[serde(default = "default_outbox")]
    pub outbox: usize,

    /// Inbound payloads waiting for the consumer (frames).
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,

    /// Bytes of inbound Data a connection holds while its consumer is behind.
    /// Past this the connection stops reading the socket.
    #[serde(default = "default_inbound_hold_bytes")]
    pub inbound_hold_bytes: usize,

    /// Anomalies within `anomaly_window_secs` that force a reconnect.
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: usize,

    #[serde(default = "default_anomaly_window")]
    pub anomaly_window_secs: u64,

    /// Upper bound on flushing queued frames during a clean shutdown.
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_ms: u64,
}

/// Socket options applied to every tunnel connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpOptions {
    #[serde(default = "default_true")]
    pub nodelay: bool,

    #[serde(default = "default_true")]
    pub keepalive: bool,

    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
}

/// Configuration of one tunnel endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub topology: Topology,

    #[serde(default)]
    pub endpoint_role: EndpointRole,

    /// Address to bind when acting as server (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Internal port the server listens on (default: 7400)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Server or relay address (`host:port`), required for clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_address: Option<String>,

    /// Address the server is reachable at from the outside (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,

    /// DDS domain carried by this tunnel
    #[serde(default)]
    pub domain_id: u32,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub tcp: TcpOptions,
}

/// A pair of relay ports bridged together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortPair {
    pub port_a: u16,
    pub port_b: u16,
}

/// Configuration of a relay bridge for symmetric NAT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    #[serde(default = "default_pairs")]
    pub pairs: Vec<PortPair>,

    /// Heartbeat settings of each relay side (default role: responder)
    #[serde(default = "default_relay_heartbeat")]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub tcp: TcpOptions,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_listen_port() -> u16 {
    7400
}

fn default_heartbeat_interval() -> u64 {
    1000
}

fn default_miss_threshold() -> u32 {
    3
}

fn default_grace() -> u64 {
    5000
}

fn default_history_len() -> usize {
    32
}

fn default_min_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_stable_after() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_frame_size() -> u32 {
    16 * 1024 * 1024 // 16 MB
}

fn default_write_queue() -> usize {
    256
}

fn default_outbox() -> usize {
    1024
}

fn default_inbound_queue() -> usize {
    256
}

fn default_inbound_hold_bytes() -> usize {
    32 * 1024 * 1024 // 32 MB
}

fn default_anomaly_threshold() -> usize {
    16
}

fn default_anomaly_window() -> u64 {
    60
}

fn default_flush_timeout() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_keepalive_interval() -> u64 {
    15
}

fn default_pairs() -> Vec<PortPair> {
    vec![PortPair {
        port_a: 7500,
        port_b: 7501,
    }]
}

fn default_relay_heartbeat() -> HeartbeatConfig {
    HeartbeatConfig {
        role: Some(HeartbeatRole::Responder),
        ..Default::default()
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            role: None,
            interval_ms: default_heartbeat_interval(),
            miss_threshold: default_miss_threshold(),
            grace_ms: default_grace(),
            history_len: default_history_len(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.interval_ms cannot be 0".into(),
            ));
        }
        if self.miss_threshold == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.miss_threshold cannot be 0".into(),
            ));
        }
        if self.history_len == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.history_len cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_backoff_ms: default_min_backoff(),
            max_backoff_ms: default_max_backoff(),
            stable_after_secs: default_stable_after(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl ReconnectConfig {
    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_secs(self.stable_after_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_backoff_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.min_backoff_ms cannot be 0".into(),
            ));
        }
        if self.max_backoff_ms < self.min_backoff_ms {
            return Err(ConfigError::Invalid(
                "reconnect.max_backoff_ms must be >= min_backoff_ms".into(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.connect_timeout_secs cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            write_queue: default_write_queue(),
            outbox: default_outbox(),
            inbound_queue: default_inbound_queue(),
            inbound_hold_bytes: default_inbound_hold_bytes(),
            anomaly_threshold: default_anomaly_threshold(),
            anomaly_window_secs: default_anomaly_window(),
            flush_timeout_ms: default_flush_timeout(),
        }
    }
}

impl LimitsConfig {
    pub fn anomaly_window(&self) -> Duration {
        Duration::from_secs(self.anomaly_window_secs)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_frame_size cannot be 0".into(),
            ));
        }
        // tokio mpsc channels panic on a zero capacity
        for (name, value) in [
            ("write_queue", self.write_queue),
            ("outbox", self.outbox),
            ("inbound_queue", self.inbound_queue),
            ("inbound_hold_bytes", self.inbound_hold_bytes),
            ("anomaly_threshold", self.anomaly_threshold),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "limits.{} cannot be 0",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: true,
            keepalive_interval_secs: default_keepalive_interval(),
        }
    }
}

impl TcpOptions {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            endpoint_role: EndpointRole::default(),
            bind_address: default_bind_address(),
            listen_port: default_listen_port(),
            target_address: None,
            public_address: None,
            domain_id: 0,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            limits: LimitsConfig::default(),
            tcp: TcpOptions::default(),
        }
    }
}

impl TunnelConfig {
    /// Server-role configuration listening on `listen_port`.
    pub fn server(listen_port: u16) -> Self {
        Self {
            endpoint_role: EndpointRole::Server,
            listen_port,
            ..Default::default()
        }
    }

    /// Client-role configuration dialing `target_address`.
    pub fn client(target_address: impl Into<String>) -> Self {
        Self {
            endpoint_role: EndpointRole::Client,
            target_address: Some(target_address.into()),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Serialize configuration to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to a TOML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Heartbeat role in effect: servers respond and clients initiate unless
    /// configured otherwise.
    pub fn heartbeat_role(&self) -> HeartbeatRole {
        self.heartbeat.role.unwrap_or(match self.endpoint_role {
            EndpointRole::Server => HeartbeatRole::Responder,
            EndpointRole::Client => HeartbeatRole::Initiator,
        })
    }

    /// Socket address the server role binds.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.listen_port)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.endpoint_role {
            EndpointRole::Server => {
                if self.topology == Topology::Symmetric {
                    return Err(ConfigError::Invalid(
                        "symmetric topology requires the client role (both ends dial the relay)"
                            .into(),
                    ));
                }
            }
            EndpointRole::Client => {
                let target = self.target_address.as_deref().ok_or_else(|| {
                    ConfigError::Invalid("target_address required for the client role".into())
                })?;
                validate_target(target)?;
            }
        }
        self.heartbeat.validate()?;
        self.reconnect.validate()?;
        self.limits.validate()
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            pairs: default_pairs(),
            heartbeat: default_relay_heartbeat(),
            reconnect: ReconnectConfig::default(),
            limits: LimitsConfig::default(),
            tcp: TcpOptions::default(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Serialize configuration to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Heartbeat role of each relay side.
    pub fn heartbeat_role(&self) -> HeartbeatRole {
        self.heartbeat.role.unwrap_or(HeartbeatRole::Responder)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pairs.is_empty() {
            return Err(ConfigError::Invalid(
                "relay needs at least one port pair".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for pair in &self.pairs {
            if pair.port_a == pair.port_b && pair.port_a != 0 {
                return Err(ConfigError::Invalid(format!(
                    "relay pair uses port {} twice",
                    pair.port_a
                )));
            }
            // port 0 asks the OS for an ephemeral port and may repeat
            for port in [pair.port_a, pair.port_b] {
                if port != 0 && !seen.insert(port) {
                    return Err(ConfigError::Invalid(format!(
                        "relay port {} used by more than one pair",
                        port
                    )));
                }
            }
        }
        self.heartbeat.validate()?;
        self.reconnect.validate()?;
        self.limits.validate()
    }
}

/// Check that `target` looks like `host:port` without resolving it.
fn validate_target(target: &str) -> Result<(), ConfigError> {
    if target.parse::<SocketAddr>().is_ok() {
        return Ok(());
    }
    let (host, port) = target.rsplit_once(':').ok_or_else(|| {
        ConfigError::Invalid(format!("target_address '{}' is not host:port", target))
    })?;
    if host.is_empty() || host.contains(':') {
        return Err(ConfigError::Invalid(format!(
            "target_address '{}' has an invalid host",
            target
        )));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(ConfigError::Invalid(format!(
            "target_address '{}' has an invalid port",
            target
        ))),
        Ok(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TunnelConfig::server(7400);
        assert_eq!(config.listen_port, 7400);
        assert_eq!(config.domain_id, 0);
        assert_eq!(config.heartbeat_role(), HeartbeatRole::Responder);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_defaults_to_initiator() {
        let config = TunnelConfig::client("1.2.3.4:7500");
        assert_eq!(config.heartbeat_role(), HeartbeatRole::Initiator);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_requires_target() {
        let config = TunnelConfig {
            endpoint_role: EndpointRole::Client,
            target_address: None,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_target_validation() {
        assert!(validate_target("relay.example.com:7500").is_ok());
        assert!(validate_target("[::1]:7500").is_ok());
        assert!(validate_target("relay.example.com").is_err());
        assert!(validate_target("relay.example.com:0").is_err());
        assert!(validate_target(":7500").is_err());
        assert!(validate_target("host:notaport").is_err());
    }

    #[test]
    fn test_symmetric_server_rejected() {
        let config = TunnelConfig {
            topology: Topology::Symmetric,
            ..TunnelConfig::server(7400)
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_queue_rejected() {
        let mut config = TunnelConfig::server(7400);
        config.limits.write_queue = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = TunnelConfig::client("10.0.0.1:7400");
        config.domain_id = 5;
        config.heartbeat.role = Some(HeartbeatRole::Responder);

        let toml_str = config.to_toml().unwrap();
        let parsed = TunnelConfig::from_toml(&toml_str).unwrap();
        assert_eq!(parsed.domain_id, 5);
        assert_eq!(parsed.target_address.as_deref(), Some("10.0.0.1:7400"));
        assert_eq!(parsed.heartbeat_role(), HeartbeatRole::Responder);
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config = TunnelConfig::from_toml(
            r#"
            endpoint_role = "server"
            listen_port = 7410

            [heartbeat]
            role = "disabled"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_port, 7410);
        assert_eq!(config.heartbeat_role(), HeartbeatRole::Disabled);
        assert_eq!(config.heartbeat.miss_threshold, 3);
        assert_eq!(config.limits.max_frame_size, 16 * 1024 * 1024);
    }

    #[test]
    fn test_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel.toml");
        TunnelConfig::server(7420).to_file(&path).unwrap();

        let loaded = TunnelConfig::from_file(&path).unwrap();
        assert_eq!(loaded.listen_port, 7420);
        assert_eq!(loaded.endpoint_role, EndpointRole::Server);
    }

    #[test]
    fn test_relay_validation() {
        assert!(RelayConfig::default().validate().is_ok());

        let config = RelayConfig {
            pairs: vec![PortPair {
                port_a: 7500,
                port_b: 7500,
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            pairs: vec![
                PortPair {
                    port_a: 7500,
                    port_b: 7501,
                },
                PortPair {
                    port_a: 7501,
                    port_b: 7502,
                },
            ],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_durations() {
        let config = TunnelConfig::default();
        assert_eq!(config.heartbeat.interval(), Duration::from_secs(1));
        assert_eq!(config.reconnect.max_backoff(), Duration::from_secs(30));
        assert_eq!(config.limits.anomaly_window(), Duration::from_secs(60));
    }
}
