// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HDDS NAT Tunnel
//!
//! Bridges DDS traffic between two sites through NAT and firewalls.
//!
//! # Usage
//!
//! ```bash
//! # Side with a reachable address, local DDS traffic on UDP 7410
//! hdds-tunnel --local-bind 127.0.0.1:7410 server --internal-port 7400
//!
//! # Side behind NAT
//! hdds-tunnel --local-bind 127.0.0.1:7410 client --server-address gw.example.com:7400
//!
//! # Relay for symmetric NAT, both sites dial it with --symmetric
//! hdds-tunnel relay --port-a 7500 --port-b 7501
//!
//! # Configuration files
//! hdds-tunnel gen-config --output tunnel.toml
//! hdds-tunnel --config tunnel.toml
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use hdds_tunnel::adapter::UdpBridge;
use hdds_tunnel::{
    EndpointRole, HealthSnapshot, HeartbeatRole, PortPair, RelayConfig, RelayRouter, Topology,
    TunnelConfig, TunnelEndpoint,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// HDDS NAT Tunnel - DDS traffic across NAT boundaries
#[derive(Parser, Debug)]
#[command(name = "hdds-tunnel")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// DDS domain carried by the tunnel
    #[arg(short, long)]
    domain_id: Option<u32>,

    /// Disable the heartbeat on this side
    #[arg(long)]
    no_heartbeat: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Health reporting interval (seconds, 0 to disable)
    #[arg(long, default_value = "30")]
    stats_interval: u64,

    /// Local UDP address exchanging payloads with the DDS side
    #[arg(long)]
    local_bind: Option<SocketAddr>,

    /// Local UDP address tunnel payloads are sent to (default: last sender)
    #[arg(long, requires = "local_bind")]
    local_peer: Option<SocketAddr>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept the tunnel connection (side with a reachable address)
    Server {
        /// TCP port to listen on
        #[arg(short = 'p', long)]
        internal_port: Option<u16>,

        /// Bind address (0.0.0.0 for all interfaces)
        #[arg(long)]
        bind: Option<String>,

        /// Address the peer uses to reach this side (informational)
        #[arg(short = 'a', long)]
        public_address: Option<String>,
    },

    /// Dial the tunnel server or relay (side behind NAT)
    Client {
        /// Server or relay address (host:port)
        #[arg(short = 'a', long)]
        server_address: Option<String>,

        /// Heartbeat role of this side
        #[arg(short = 't', long, value_enum)]
        heartbeat_type: Option<HeartbeatType>,

        /// Peer is reached through a relay (symmetric NAT)
        #[arg(long)]
        symmetric: bool,
    },

    /// Splice two client connections (symmetric NAT)
    Relay {
        /// Port the first site dials
        #[arg(long, requires = "port_b")]
        port_a: Option<u16>,

        /// Port the second site dials
        #[arg(long, requires = "port_a")]
        port_b: Option<u16>,

        /// Bind address (0.0.0.0 for all interfaces)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "tunnel.toml")]
        output: PathBuf,

        /// Configuration kind
        #[arg(short, long, value_enum, default_value = "tunnel")]
        kind: ConfigKind,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,

        /// Configuration kind
        #[arg(short, long, value_enum, default_value = "tunnel")]
        kind: ConfigKind,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum HeartbeatType {
    Initiator,
    Responder,
}

impl From<HeartbeatType> for HeartbeatRole {
    fn from(value: HeartbeatType) -> Self {
        match value {
            HeartbeatType::Initiator => HeartbeatRole::Initiator,
            HeartbeatType::Responder => HeartbeatRole::Responder,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ConfigKind {
    Tunnel,
    Relay,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match &args.command {
        Some(Commands::GenConfig { output, kind }) => cmd_gen_config(output, *kind),
        Some(Commands::Validate { config, kind }) => cmd_validate(config, *kind),
        Some(Commands::Relay {
            port_a,
            port_b,
            bind,
        }) => {
            let mut config = match &args.config {
                Some(path) => {
                    info!("Loading config from {:?}", path);
                    RelayConfig::from_file(path)?
                }
                None => RelayConfig::default(),
            };
            if let (Some(port_a), Some(port_b)) = (port_a, port_b) {
                config.pairs = vec![PortPair {
                    port_a: *port_a,
                    port_b: *port_b,
                }];
            }
            if let Some(bind) = bind {
                config.bind_address = bind.parse()?;
            }
            if args.no_heartbeat {
                config.heartbeat.role = Some(HeartbeatRole::Disabled);
            }
            run_relay(config, args.stats_interval).await
        }
        command => {
            let config = build_tunnel_config(&args, command.as_ref())?;
            run_endpoint(config, &args).await
        }
    }
}

fn build_tunnel_config(
    args: &Args,
    command: Option<&Commands>,
) -> Result<TunnelConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            TunnelConfig::from_file(path)?
        }
        None if command.is_none() => {
            return Err("nothing to do: pass a subcommand or --config (see --help)".into());
        }
        None => TunnelConfig::default(),
    };

    match command {
        Some(Commands::Server {
            internal_port,
            bind,
            public_address,
        }) => {
            config.endpoint_role = EndpointRole::Server;
            if let Some(port) = internal_port {
                config.listen_port = *port;
            }
            if let Some(bind) = bind {
                config.bind_address = bind.parse()?;
            }
            if public_address.is_some() {
                config.public_address = public_address.clone();
            }
        }
        Some(Commands::Client {
            server_address,
            heartbeat_type,
            symmetric,
        }) => {
            config.endpoint_role = EndpointRole::Client;
            if server_address.is_some() {
                config.target_address = server_address.clone();
            }
            if let Some(heartbeat) = heartbeat_type {
                config.heartbeat.role = Some((*heartbeat).into());
            }
            if *symmetric {
                config.topology = Topology::Symmetric;
            }
        }
        _ => {}
    }

    if let Some(domain_id) = args.domain_id {
        config.domain_id = domain_id;
    }
    if args.no_heartbeat {
        config.heartbeat.role = Some(HeartbeatRole::Disabled);
    }
    config.validate()?;
    Ok(config)
}

async fn run_endpoint(config: TunnelConfig, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    info!("+----------------------------------------------------+");
    info!(
        "|       HDDS NAT Tunnel v{}                      |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    match config.endpoint_role {
        EndpointRole::Server => info!("|  Listen:    {:37} |", config.listen_addr()),
        EndpointRole::Client => info!(
            "|  Target:    {:37} |",
            config.target_address.as_deref().unwrap_or("-")
        ),
    }
    info!("|  Topology:  {:37} |", format!("{:?}", config.topology));
    info!("|  Domain:    {:37} |", config.domain_id);
    info!("|  Heartbeat: {:37} |", config.heartbeat_role().to_string());
    info!("+----------------------------------------------------+");

    let (endpoint, payloads) = TunnelEndpoint::start(&config).await?;
    let endpoint = Arc::new(endpoint);
    let (stop_tx, stop_rx) = watch::channel(false);

    let local = match args.local_bind {
        Some(bind) => {
            let bridge = UdpBridge::bind(bind, args.local_peer).await?;
            let endpoint = endpoint.clone();
            let stop = stop_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = bridge.run(&endpoint, payloads, stop).await {
                    warn!("Local bridge stopped: {}", e);
                }
            })
        }
        None => {
            // Without a local collaborator inbound payloads are only logged
            let mut payloads = payloads;
            tokio::spawn(async move {
                while let Some(payload) = payloads.recv().await {
                    debug!(
                        "Payload for domain {} ({} bytes)",
                        payload.domain_id,
                        payload.payload.len()
                    );
                }
            })
        }
    };

    if args.stats_interval > 0 {
        let endpoint = endpoint.clone();
        let mut stop = stop_rx.clone();
        let period = Duration::from_secs(args.stats_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => log_health(&endpoint.health()),
                    _ = stop.changed() => break,
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping tunnel...");
    stop_tx.send_replace(true);
    endpoint.shutdown().await;
    local.abort();

    info!("Final health:");
    log_health(&endpoint.health());
    info!("Tunnel stopped");
    Ok(())
}

async fn run_relay(config: RelayConfig, stats_interval: u64) -> Result<(), Box<dyn std::error::Error>> {
    info!("+----------------------------------------------------+");
    info!(
        "|       HDDS Tunnel Relay v{}                    |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Bind:   {:40} |", config.bind_address);
    for pair in &config.pairs {
        info!(
            "|  Pair:   {:40} |",
            format!("{} <-> {}", pair.port_a, pair.port_b)
        );
    }
    info!("+----------------------------------------------------+");

    let relay = Arc::new(RelayRouter::start(&config).await?);

    let stats_task = (stats_interval > 0).then(|| {
        let relay = relay.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(stats_interval));
            interval.tick().await;
            loop {
                interval.tick().await;
                log_relay_stats(&relay);
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping relay...");
    if let Some(task) = stats_task {
        task.abort();
    }
    relay.shutdown().await;

    log_relay_stats(&relay);
    info!("Relay stopped");
    Ok(())
}

fn log_health(health: &HealthSnapshot) {
    let rtt = health
        .heartbeat
        .mean_rtt
        .map_or_else(|| "-".to_string(), |rtt| format!("{:.1?}", rtt));
    info!(
        "--- Tunnel {} (connection {:?}, peer {:?}) ---",
        health.state, health.connection_id, health.peer_addr
    );
    info!(
        "  up {:?}, reconnects {}, anomalies {}, rtt {} ({} samples, {} missed)",
        health.connected_for.unwrap_or_default(),
        health.reconnects,
        health.anomalies,
        rtt,
        health.heartbeat.samples,
        health.heartbeat.missed_streak
    );
    info!(
        "  sent {} frames / {}, received {} frames / {}",
        health.traffic.frames_sent,
        format_bytes(health.traffic.bytes_sent),
        health.traffic.frames_received,
        format_bytes(health.traffic.bytes_received)
    );
    if let Some(delay) = health.retry_delay {
        info!("  last reconnect delay {:?}", delay);
    }
}

fn log_relay_stats(relay: &RelayRouter) {
    let stats = relay.stats();
    info!(
        "--- Relay: {} active sessions ({} created, {} closed) ---",
        relay.session_count(),
        stats.sessions_created,
        stats.sessions_destroyed
    );
    info!(
        "  a->b {} frames / {}, b->a {} frames / {}",
        stats.frames_a_to_b,
        format_bytes(stats.bytes_a_to_b),
        stats.frames_b_to_a,
        format_bytes(stats.bytes_b_to_a)
    );
}

fn cmd_gen_config(output: &Path, kind: ConfigKind) -> Result<(), Box<dyn std::error::Error>> {
    let body = match kind {
        ConfigKind::Tunnel => {
            let config = TunnelConfig {
                target_address: Some("tunnel.example.com:7400".into()),
                ..Default::default()
            };
            config.to_toml()?
        }
        ConfigKind::Relay => RelayConfig::default().to_toml()?,
    };

    let content = format!(
        r#"# HDDS Tunnel Configuration ({:?})
# Generated by hdds-tunnel gen-config

{}
"#,
        kind, body
    );

    std::fs::write(output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(path: &Path, kind: ConfigKind) -> Result<(), Box<dyn std::error::Error>> {
    let result = match kind {
        ConfigKind::Tunnel => TunnelConfig::from_file(path).and_then(|config| {
            config.validate()?;
            Ok(format!(
                "Role: {:?} ({:?}), domain {}, heartbeat {}",
                config.endpoint_role,
                config.topology,
                config.domain_id,
                config.heartbeat_role()
            ))
        }),
        ConfigKind::Relay => RelayConfig::from_file(path).and_then(|config| {
            config.validate()?;
            Ok(format!("Relay pairs: {}", config.pairs.len()))
        }),
    };

    match result {
        Ok(summary) => {
            println!("Configuration valid!");
            println!();
            println!("{}", summary);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
