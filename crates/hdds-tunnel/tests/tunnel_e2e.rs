// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test/bench code readability over pedantic
#![allow(clippy::missing_panics_doc)] // Tests/examples panic on failure

//! End-to-end tunnel tests over loopback sockets
//!
//! Server and client endpoints talk to each other, or a client talks to a
//! hand-driven fake peer that speaks the wire format through `FrameCodec`.

use hdds_tunnel::adapter::UdpBridge;
use hdds_tunnel::{
    ConnectionState, Decode, DomainPayload, Frame, FrameCodec, LinkStatus, TunnelConfig,
    TunnelEndpoint, TunnelError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Loopback config with short timers.
fn fast(mut config: TunnelConfig) -> TunnelConfig {
    config.bind_address = "127.0.0.1".parse().unwrap();
    config.heartbeat.interval_ms = 50;
    config.reconnect.min_backoff_ms = 100;
    config.reconnect.max_backoff_ms = 400;
    config
}

async fn server_and_client(
    server_domain: u32,
    client_domain: u32,
) -> (
    (TunnelEndpoint, mpsc::Receiver<DomainPayload>),
    (TunnelEndpoint, mpsc::Receiver<DomainPayload>),
) {
    let mut server_config = fast(TunnelConfig::server(0));
    server_config.domain_id = server_domain;
    let server = TunnelEndpoint::start(&server_config).await.unwrap();
    let addr = server.0.local_addr().unwrap();

    let mut client_config = fast(TunnelConfig::client(addr.to_string()));
    client_config.domain_id = client_domain;
    let client = TunnelEndpoint::start(&client_config).await.unwrap();
    (server, client)
}

async fn recv(rx: &mut mpsc::Receiver<DomainPayload>) -> DomainPayload {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for payload")
        .expect("payload stream closed")
}

async fn wait_status(
    rx: &mut watch::Receiver<LinkStatus>,
    pred: impl Fn(&LinkStatus) -> bool,
) -> LinkStatus {
    let status = tokio::time::timeout(TIMEOUT, rx.wait_for(|s| pred(s)))
        .await
        .expect("timed out waiting for link status")
        .expect("link gone");
    *status
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Read the next frame a tunnel endpoint sent to a fake peer.
async fn read_frame(stream: &mut TcpStream, codec: &mut FrameCodec) -> Frame {
    let mut buf = [0u8; 4096];
    loop {
        match codec.next_frame() {
            Decode::Complete { frame, .. } => return frame,
            Decode::NeedMoreData => {}
            Decode::Corrupt(anomaly) => panic!("endpoint sent a corrupt frame: {}", anomaly),
        }
        let n = tokio::time::timeout(TIMEOUT, stream.read(&mut buf))
            .await
            .expect("timed out reading from endpoint")
            .unwrap();
        assert!(n > 0, "endpoint closed the connection");
        codec.feed(&buf[..n]);
    }
}

async fn read_ping(stream: &mut TcpStream, codec: &mut FrameCodec) -> u64 {
    loop {
        if let Frame::Ping { sequence } = read_frame(stream, codec).await {
            return sequence;
        }
    }
}

/// Record every state the link goes through.
fn record_states(mut rx: watch::Receiver<LinkStatus>) -> Arc<parking_lot::Mutex<Vec<ConnectionState>>> {
    let seen = Arc::new(parking_lot::Mutex::new(vec![rx.borrow().state]));
    let log = seen.clone();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().state;
            log.lock().push(state);
        }
    });
    seen
}

#[tokio::test]
async fn test_server_client_hello() {
    let ((server, mut server_rx), (client, mut client_rx)) = server_and_client(0, 0).await;

    client.submit(0, b"hello".to_vec()).unwrap();
    assert_eq!(
        recv(&mut server_rx).await,
        DomainPayload {
            domain_id: 0,
            payload: b"hello".to_vec()
        }
    );

    server.send(b"world".to_vec()).unwrap();
    assert_eq!(recv(&mut client_rx).await.payload, b"world".to_vec());

    let health = client.health();
    assert!(health.state.is_operational());
    assert_eq!(health.peer_addr, server.local_addr());
    assert_eq!(health.anomalies, 0);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_ordering_preserved() {
    let ((server, mut server_rx), (client, _client_rx)) = server_and_client(0, 0).await;

    for i in 0..200u32 {
        client.send(i.to_be_bytes().to_vec()).unwrap();
    }
    for i in 0..200u32 {
        assert_eq!(recv(&mut server_rx).await.payload, i.to_be_bytes().to_vec());
    }

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_domain_mismatch_is_dropped_and_counted() {
    let ((server, mut server_rx), (client, _client_rx)) = server_and_client(0, 5).await;

    // Refused locally before reaching the wire
    assert!(matches!(
        client.submit(0, b"x".to_vec()),
        Err(TunnelError::DomainMismatch {
            expected: 5,
            got: 0
        })
    ));

    client.submit(5, b"foreign".to_vec()).unwrap();
    wait_until("domain anomaly", || server.domain_anomalies() == 1).await;
    wait_until("reported anomaly", || server.health().anomalies == 1).await;
    assert!(server_rx.try_recv().is_err());
    // One anomaly is far below the threshold
    assert!(server.state().is_operational());

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_twice_is_noop() {
    let (server, _rx) = TunnelEndpoint::start(&fast(TunnelConfig::server(0)))
        .await
        .unwrap();

    server.shutdown().await;
    assert_eq!(server.state(), ConnectionState::Disconnected);
    server.shutdown().await;
    assert_eq!(server.state(), ConnectionState::Disconnected);
    assert!(matches!(
        server.send(b"late".to_vec()),
        Err(TunnelError::Stopped)
    ));
}

#[tokio::test]
async fn test_client_reconnects_with_fresh_heartbeat() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, _rx) = TunnelEndpoint::start(&fast(TunnelConfig::client(addr.to_string())))
        .await
        .unwrap();
    let states = record_states(client.subscribe());

    // First connection: answer a few pings so the history fills up
    let (mut first, _) = listener.accept().await.unwrap();
    let mut codec = FrameCodec::with_default_max();
    for expected in 0..3u64 {
        let sequence = read_ping(&mut first, &mut codec).await;
        assert_eq!(sequence, expected);
        first
            .write_all(&FrameCodec::encode(&Frame::Pong { sequence }))
            .await
            .unwrap();
    }
    wait_until("heartbeat samples", || client.health().heartbeat.samples >= 2).await;
    let first_id = client.status().connection_id;

    // Transport error on the client side
    drop(first);

    let (mut second, _) = tokio::time::timeout(TIMEOUT, listener.accept())
        .await
        .unwrap()
        .unwrap();
    let mut codec = FrameCodec::with_default_max();
    assert_eq!(read_ping(&mut second, &mut codec).await, 0);

    // History was cleared before the new connection sent anything
    assert_eq!(client.health().heartbeat.samples, 0);
    wait_until("second connection", || {
        let status = client.status();
        status.state.is_operational() && status.connection_id != first_id
    })
    .await;
    assert_eq!(client.health().reconnects, 1);

    let seen = states.lock().clone();
    let connected = seen
        .iter()
        .position(|s| *s == ConnectionState::Connected)
        .unwrap();
    assert!(
        seen[connected..].contains(&ConnectionState::Connecting),
        "states: {:?}",
        seen
    );

    client.shutdown().await;
}

#[tokio::test]
async fn test_missing_pongs_degrade_then_recover() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = fast(TunnelConfig::client(addr.to_string()));
    config.heartbeat.grace_ms = 30_000;
    let (client, _rx) = TunnelEndpoint::start(&config).await.unwrap();
    let mut status = client.subscribe();

    let (mut peer, _) = listener.accept().await.unwrap();
    let respond = Arc::new(AtomicBool::new(false));
    let peer_respond = respond.clone();
    let fake = tokio::spawn(async move {
        let mut codec = FrameCodec::with_default_max();
        loop {
            let sequence = read_ping(&mut peer, &mut codec).await;
            if peer_respond.load(Ordering::SeqCst) {
                let pong = FrameCodec::encode(&Frame::Pong { sequence });
                if peer.write_all(&pong).await.is_err() {
                    return;
                }
            }
        }
    });

    let degraded = wait_status(&mut status, |s| s.state == ConnectionState::Degraded).await;
    // Data still flows while degraded
    client.send(b"still here".to_vec()).unwrap();

    respond.store(true, Ordering::SeqCst);
    let recovered = wait_status(&mut status, |s| s.state == ConnectionState::Connected).await;
    assert_eq!(degraded.connection_id, recovered.connection_id);
    assert!(client.health().heartbeat.samples >= 1);

    fake.abort();
    client.shutdown().await;
}

#[tokio::test]
async fn test_grace_expiry_forces_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = fast(TunnelConfig::client(addr.to_string()));
    config.heartbeat.grace_ms = 200;
    let (client, _rx) = TunnelEndpoint::start(&config).await.unwrap();
    let mut status = client.subscribe();

    // Accept and stay silent
    let (_silent, _) = listener.accept().await.unwrap();
    let degraded = wait_status(&mut status, |s| s.state == ConnectionState::Degraded).await;

    let next = wait_status(&mut status, |s| s.connection_id != degraded.connection_id).await;
    assert_ne!(next.state, ConnectionState::Degraded);

    client.shutdown().await;
}

#[tokio::test]
async fn test_udp_bridge_round_trip() {
    let ((server, server_rx), (client, mut client_rx)) = server_and_client(0, 0).await;
    let server = Arc::new(server);

    let dds = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let bridge = UdpBridge::bind(
        "127.0.0.1:0".parse().unwrap(),
        Some(dds.local_addr().unwrap()),
    )
    .await
    .unwrap();
    let bridge_addr = bridge.local_addr().unwrap();
    let (stop_tx, stop_rx) = watch::channel(false);
    let bridge_server = server.clone();
    let bridge_task = tokio::spawn(async move {
        bridge.run(&bridge_server, server_rx, stop_rx).await.unwrap();
    });

    // Tunnel -> local datagram
    client.send(b"from-remote".to_vec()).unwrap();
    let mut buf = [0u8; 1024];
    let (n, _) = tokio::time::timeout(TIMEOUT, dds.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"from-remote");

    // Local datagram -> tunnel
    dds.send_to(b"from-local", bridge_addr).await.unwrap();
    assert_eq!(recv(&mut client_rx).await.payload, b"from-local".to_vec());

    stop_tx.send_replace(true);
    tokio::time::timeout(TIMEOUT, bridge_task).await.unwrap().unwrap();
    client.shutdown().await;
    server.shutdown().await;
}
