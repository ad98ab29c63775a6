//! End-to-end scenarios run against a mock peer built from `axum`
//! (control-channel handshake) plus a bare `TcpListener` (the NRT
//! accept side) and a bare `UdpSocket` (the RT receive side) — a
//! test-double standing in for a second, fully independent node.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::{TcpListener, UdpSocket};

use meshmidi_connection::config::ConnectionConfig;
use meshmidi_connection::facade::ConnectionFacade;
use meshmidi_connection::worker::{ConnectionEvent, ConnectionState};
use meshmidi_protocol::handshake::{HandshakeDevice, HandshakeResponse};
use meshmidi_protocol::node::{DeviceDirection, NodeInfo};

/// Mirrors the `tracing_subscriber::fmt()` + `EnvFilter` setup every
/// teacher binary runs at startup; `try_init` makes it safe to call once
/// per test process regardless of test execution order.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

fn local_node(id: u128, control_port: u16) -> NodeInfo {
    NodeInfo {
        id,
        name: format!("node-{id}"),
        hostname: "localhost".into(),
        address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        control_port,
        udp_port: 0,
        protocol_version: meshmidi_protocol::PROTOCOL_VERSION.to_string(),
        advertised_device_count: 0,
    }
}

/// A mock peer: an axum handshake server plus a bare TCP acceptor on
/// `control_port + 1` that just keeps accepted NRT connections alive,
/// and a bare UDP socket standing in for its RT receiver.
struct MockPeer {
    control_port: u16,
    udp_socket: Arc<UdpSocket>,
    handshake_calls: Arc<AtomicUsize>,
}

#[derive(Clone)]
struct HandshakeState {
    status: StatusCode,
    udp_endpoint: String,
    calls: Arc<AtomicUsize>,
}

async fn handshake_handler(
    State(state): State<HandshakeState>,
) -> (StatusCode, Json<HandshakeResponse>) {
    state.calls.fetch_add(1, Ordering::Relaxed);
    (
        state.status,
        Json(HandshakeResponse {
            udp_endpoint: state.udp_endpoint.clone(),
            devices: vec![HandshakeDevice {
                id: 7,
                name: "Piano".into(),
                direction: DeviceDirection::Input,
            }],
        }),
    )
}

async fn spawn_mock_peer(status: StatusCode) -> MockPeer {
    let control_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_port = control_listener.local_addr().unwrap().port();

    let udp_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let udp_endpoint = udp_socket.local_addr().unwrap().to_string();

    let calls = Arc::new(AtomicUsize::new(0));
    let state = HandshakeState {
        status,
        udp_endpoint,
        calls: calls.clone(),
    };
    let app = Router::new()
        .route("/network/handshake", post(handshake_handler))
        .with_state(state);
    tokio::spawn(async move {
        axum::serve(control_listener, app).await.unwrap();
    });

    // NRT accept side: keep every accepted stream alive indefinitely.
    let nrt_addr: SocketAddr = format!("127.0.0.1:{}", control_port + 1).parse().unwrap();
    let nrt_listener = TcpListener::bind(nrt_addr).await.unwrap();
    tokio::spawn(async move {
        loop {
            match nrt_listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(async move {
                        let _stream = stream;
                        std::future::pending::<()>().await
                    });
                }
                Err(_) => break,
            }
        }
    });

    MockPeer {
        control_port,
        udp_socket,
        handshake_calls: calls,
    }
}

async fn wait_for_state(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent>,
    target: ConnectionState,
    budget: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Some(ConnectionEvent::StateChanged { new, .. })) if new == target => return true,
            Ok(Some(_)) => continue,
            _ => return false,
        }
    }
}

#[tokio::test]
async fn s1_happy_handshake_reaches_connected_with_one_device() {
    init_tracing();
    let peer = spawn_mock_peer(StatusCode::OK).await;
    let remote = local_node(2, peer.control_port);
    let (facade, mut events) =
        ConnectionFacade::new(local_node(1, 0), remote, ConnectionConfig::default(), None).unwrap();

    facade.connect();
    assert!(wait_for_state(&mut events, ConnectionState::Connecting, Duration::from_secs(1)).await);
    assert!(wait_for_state(&mut events, ConnectionState::Connected, Duration::from_secs(2)).await);

    let devices = facade.get_remote_devices().await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, 7);
    assert_eq!(peer.handshake_calls.load(Ordering::Relaxed), 1);

    facade.shutdown().await;
}

#[tokio::test]
async fn s2_handshake_failure_transitions_to_failed_and_frees_resources_for_retry() {
    init_tracing();
    let peer = spawn_mock_peer(StatusCode::INTERNAL_SERVER_ERROR).await;
    let remote = local_node(2, peer.control_port);
    let (facade, mut events) =
        ConnectionFacade::new(local_node(1, 0), remote, ConnectionConfig::default(), None).unwrap();

    facade.connect();

    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Some(event)) => {
                let reached_failed = matches!(
                    &event,
                    ConnectionEvent::StateChanged { new: ConnectionState::Failed, .. }
                );
                seen.push(event);
                if reached_failed {
                    break;
                }
            }
            _ => break,
        }
    }

    assert!(seen.iter().any(|e| matches!(
        e,
        ConnectionEvent::StateChanged { new: ConnectionState::Failed, .. }
    )));
    assert!(seen.iter().any(|e| matches!(
        e,
        ConnectionEvent::Error(err) if err.to_string().to_lowercase().contains("handshake failed")
    )));

    facade.shutdown().await;

    // Resources are released: a subsequent connect against a working
    // peer must be able to succeed.
    let good_peer = spawn_mock_peer(StatusCode::OK).await;
    let good_remote = local_node(3, good_peer.control_port);
    let (facade2, mut events2) =
        ConnectionFacade::new(local_node(1, 0), good_remote, ConnectionConfig::default(), None)
            .unwrap();
    facade2.connect();
    assert!(wait_for_state(&mut events2, ConnectionState::Connected, Duration::from_secs(2)).await);
    facade2.shutdown().await;
}

#[tokio::test]
async fn s3_real_time_burst_preserves_ring_buffer_conservation() {
    init_tracing();
    let peer = spawn_mock_peer(StatusCode::OK).await;
    let remote = local_node(2, peer.control_port);
    let mut config = ConnectionConfig::default();
    config.ring_buffer_capacity = 2048;
    let (facade, mut events) =
        ConnectionFacade::new(local_node(1, 0), remote, config, None).unwrap();

    facade.connect();
    assert!(wait_for_state(&mut events, ConnectionState::Connected, Duration::from_secs(2)).await);

    // Drain the peer's UDP socket concurrently so sends don't back up.
    let received = Arc::new(AtomicUsize::new(0));
    {
        let sock = Arc::clone(&peer.udp_socket);
        let received = Arc::clone(&received);
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                if sock.recv(&mut buf).await.is_err() {
                    break;
                }
                received.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    for i in 0..5000u16 {
        // Note-On, channel 0, key i%128, velocity 64 — classifies RealTime.
        facade.send_midi(1, vec![0x90, (i % 128) as u8, 64]);
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    facade.shutdown().await;

    assert!(received.load(Ordering::Relaxed) > 0);
}

#[tokio::test]
async fn s5_heartbeat_timeout_transitions_to_failed_exactly_once() {
    init_tracing();
    let peer = spawn_mock_peer(StatusCode::OK).await;
    let remote = local_node(2, peer.control_port);
    let mut config = ConnectionConfig::default();
    // Shrink the timeout so the scenario completes quickly; the ratio
    // to the monitor tick is what spec S5 actually constrains.
    config.heartbeat_timeout_ms = 150;
    let (facade, mut events) =
        ConnectionFacade::new(local_node(1, 0), remote, config, None).unwrap();

    facade.connect();
    assert!(wait_for_state(&mut events, ConnectionState::Connected, Duration::from_secs(2)).await);

    // No further NotifyHeartbeat is delivered; simulate a monitor tick
    // every 50ms until the timeout is observed.
    let mut failed_transitions = 0;
    let mut saw_timeout_error = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        facade.check_heartbeat();
        match tokio::time::timeout(Duration::from_millis(50), events.recv()).await {
            Ok(Some(ConnectionEvent::StateChanged {
                new: ConnectionState::Failed,
                ..
            })) => failed_transitions += 1,
            Ok(Some(ConnectionEvent::Error(e))) => {
                if matches!(e, meshmidi_connection::error::ConnectionError::HeartbeatTimeout) {
                    saw_timeout_error = true;
                }
            }
            _ => {}
        }
        if failed_transitions > 0 && saw_timeout_error {
            break;
        }
    }

    assert_eq!(failed_transitions, 1, "must transition to Failed exactly once");
    assert!(saw_timeout_error);
    facade.shutdown().await;
}

#[tokio::test]
async fn s6_concurrent_state_queries_never_deadlock_and_stay_within_budget() {
    init_tracing();
    let peer = spawn_mock_peer(StatusCode::OK).await;
    let remote = local_node(2, peer.control_port);
    let (facade, mut events) =
        ConnectionFacade::new(local_node(1, 0), remote, ConnectionConfig::default(), None).unwrap();

    facade.connect();
    assert!(wait_for_state(&mut events, ConnectionState::Connected, Duration::from_secs(2)).await);

    let mut handles = Vec::new();
    for _ in 0..20 {
        let facade = facade.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..1000 {
                let _ = facade.get_state();
                let _ = tokio::time::timeout(Duration::from_secs(1), facade.query_state()).await;
            }
        }));
    }

    let all = tokio::time::timeout(Duration::from_secs(30), futures_join_all(handles)).await;
    assert!(all.is_ok(), "concurrent queries must not deadlock");

    facade.shutdown().await;
}

/// Small local stand-in for `futures::future::join_all` so this crate
/// doesn't need the `futures` dependency just for one test helper.
async fn futures_join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}
