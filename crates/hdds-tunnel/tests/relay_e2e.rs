// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test/bench code readability over pedantic

//! Relay (symmetric NAT) tests
//!
//! Two client endpoints dial the two ports of a relay pair.

use hdds_tunnel::{
    DomainPayload, LimitsConfig, PortPair, RelayConfig, RelayRouter, Topology, TunnelConfig,
    TunnelEndpoint,
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(10);

fn relay_config(limits: LimitsConfig) -> RelayConfig {
    RelayConfig {
        bind_address: "127.0.0.1".parse().unwrap(),
        pairs: vec![PortPair {
            port_a: 0,
            port_b: 0,
        }],
        limits,
        ..Default::default()
    }
}

async fn start_relay() -> (RelayRouter, PortPair) {
    let relay = RelayRouter::start(&relay_config(LimitsConfig::default()))
        .await
        .unwrap();
    let pair = relay.pairs()[0];
    (relay, pair)
}

fn relayed_config(port: u16) -> TunnelConfig {
    let mut config = TunnelConfig::client(format!("127.0.0.1:{}", port));
    config.topology = Topology::Symmetric;
    config.heartbeat.interval_ms = 50;
    config.reconnect.min_backoff_ms = 100;
    config.reconnect.max_backoff_ms = 400;
    config
}

async fn relayed_client(port: u16) -> (TunnelEndpoint, mpsc::Receiver<DomainPayload>) {
    TunnelEndpoint::start(&relayed_config(port)).await.unwrap()
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_early_data_is_held_until_paired() {
    let (relay, pair) = start_relay().await;

    let (site_a, _rx_a) = relayed_client(pair.port_a).await;
    site_a.send(b"early".to_vec()).unwrap();
    wait_until("site A connected", || site_a.state().is_operational()).await;

    // Nobody on the other side yet
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(relay.session_count(), 0);
    assert_eq!(relay.stats().frames_a_to_b, 0);

    let (site_b, mut rx_b) = relayed_client(pair.port_b).await;
    let got = tokio::time::timeout(TIMEOUT, rx_b.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.payload, b"early".to_vec());

    let session = relay.session(&pair).expect("session exists once paired");
    assert_ne!(session.connection_a, session.connection_b);
    assert_eq!(relay.stats().sessions_created, 1);
    assert_eq!(relay.stats().bytes_a_to_b, 5);

    site_a.shutdown().await;
    site_b.shutdown().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn test_early_data_beyond_inbound_queue_is_kept() {
    let limits = LimitsConfig {
        inbound_queue: 4,
        ..Default::default()
    };
    let relay = RelayRouter::start(&relay_config(limits)).await.unwrap();
    let pair = relay.pairs()[0];

    let mut config_a = relayed_config(pair.port_a);
    config_a.heartbeat.grace_ms = 200;
    let (site_a, _rx_a) = TunnelEndpoint::start(&config_a).await.unwrap();
    wait_until("site A connected", || site_a.state().is_operational()).await;
    for i in 0..20u8 {
        site_a.send(vec![i]).unwrap();
    }

    // Several grace periods pass while the relay holds the data
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(site_a.health().reconnects, 0);
    assert!(site_a.state().is_operational());

    let (site_b, mut rx_b) = relayed_client(pair.port_b).await;
    for i in 0..20u8 {
        let got = tokio::time::timeout(TIMEOUT, rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.payload, vec![i]);
    }
    wait_until("forwarding stats", || relay.stats().frames_a_to_b == 20).await;
    assert_eq!(site_a.health().reconnects, 0);

    site_a.shutdown().await;
    site_b.shutdown().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn test_both_directions_forwarded() {
    let (relay, pair) = start_relay().await;
    let (site_a, mut rx_a) = relayed_client(pair.port_a).await;
    let (site_b, mut rx_b) = relayed_client(pair.port_b).await;

    wait_until("session", || relay.session_count() == 1).await;
    site_a.send(b"a->b".to_vec()).unwrap();
    site_b.send(b"b->a".to_vec()).unwrap();

    let at_b = tokio::time::timeout(TIMEOUT, rx_b.recv()).await.unwrap().unwrap();
    let at_a = tokio::time::timeout(TIMEOUT, rx_a.recv()).await.unwrap().unwrap();
    assert_eq!(at_b.payload, b"a->b".to_vec());
    assert_eq!(at_a.payload, b"b->a".to_vec());

    let stats = relay.stats();
    assert_eq!(stats.frames_a_to_b, 1);
    assert_eq!(stats.frames_b_to_a, 1);

    site_a.shutdown().await;
    site_b.shutdown().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_tears_down_survivor() {
    let (relay, pair) = start_relay().await;
    let (site_a, _rx_a) = relayed_client(pair.port_a).await;
    let (site_b, _rx_b) = relayed_client(pair.port_b).await;

    wait_until("session", || relay.session_count() == 1).await;
    let first_b = site_b.status().connection_id;
    assert!(first_b.is_some());

    site_a.shutdown().await;

    wait_until("session destroyed", || relay.stats().sessions_destroyed == 1).await;
    assert_eq!(relay.session_count(), 0);
    // The relay dropped B's connection; B comes back on a new one
    wait_until("site B reconnected", || {
        let status = site_b.status();
        status.state.is_operational() && status.connection_id != first_b
    })
    .await;
    assert_eq!(relay.session_count(), 0);

    site_b.shutdown().await;
    relay.shutdown().await;
}
