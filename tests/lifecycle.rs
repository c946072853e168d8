//! Supervisor lifecycle: binding, timeouts, shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use intercepting_proxy::{ProxyError, ProxyServer};

mod common;
use common::{
    connect_through_proxy, send_proxy_request, test_config, wait_for, Decision, Event,
    RecordingInterceptor, TestPki,
};

const SETTLE: Duration = Duration::from_secs(5);

/// A plain TCP target that holds each connection open until the peer leaves.
async fn start_silent_target() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut sink = Vec::new();
                let _ = socket.read_to_end(&mut sink).await;
            });
        }
    });
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_is_idempotent_and_releases_the_port() {
    let recorder = Arc::new(RecordingInterceptor::with_decision(Decision::Reject));
    let proxy = ProxyServer::start(test_config(), recorder).await.unwrap();
    let address = proxy.address();
    assert_ne!(address.port(), 0);

    proxy.close().await.unwrap();
    proxy.close().await.unwrap();
    assert!(TcpStream::connect(address).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_bind_on_the_same_port_fails() {
    let recorder = Arc::new(RecordingInterceptor::with_decision(Decision::Reject));
    let first = ProxyServer::start(test_config(), recorder.clone()).await.unwrap();

    let mut config = test_config();
    config.listener.port = first.address().port();
    let second = ProxyServer::start(config, recorder).await;
    assert!(matches!(second, Err(ProxyError::Bind { .. })));
    first.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_interrupts_open_tunnels() {
    let target = start_silent_target().await;
    let recorder = Arc::new(RecordingInterceptor::with_decision(Decision::Passthrough));
    let proxy = ProxyServer::start(test_config(), recorder.clone()).await.unwrap();

    let _tunnel = connect_through_proxy(proxy.address(), &target.to_string()).await;
    assert!(wait_for(SETTLE, || proxy.active_connections() == 1).await);

    let started = Instant::now();
    proxy.close().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(proxy.active_connections(), 0);

    assert_eq!(
        recorder.events().last(),
        Some(&Event::ConnectionEnded {
            client_to_target: Some("shutdown".into()),
            target_to_client: Some("shutdown".into()),
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_tunnels_time_out() {
    let target = start_silent_target().await;
    let recorder = Arc::new(RecordingInterceptor::with_decision(Decision::Passthrough));
    let mut config = test_config();
    config.timeouts.idle_ms = Some(100);
    let proxy = ProxyServer::start(config, recorder.clone()).await.unwrap();

    let _tunnel = connect_through_proxy(proxy.address(), &target.to_string()).await;
    assert!(wait_for(SETTLE, || recorder.has_ended()).await);

    let events = recorder.events();
    assert!(matches!(
        events.last(),
        Some(Event::ConnectionEnded { client_to_target: Some(e), .. }) if e == "timeout:idle"
    ));
    proxy.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_client_handshake_times_out() {
    let pki = TestPki::new();
    let recorder = Arc::new(RecordingInterceptor::intercepting(&pki));
    let mut config = test_config();
    config.timeouts.handshake_ms = Some(100);
    let proxy = ProxyServer::start(config, recorder.clone()).await.unwrap();

    // CONNECT is answered, but no ClientHello ever follows.
    let _stream = connect_through_proxy(proxy.address(), "127.0.0.1:443").await;
    assert!(wait_for(SETTLE, || recorder.has_ended()).await);

    assert_eq!(recorder.count(|e| matches!(e, Event::ClientHandshake { .. })), 0);
    assert_eq!(
        recorder.events().last(),
        Some(&Event::ConnectionEnded {
            client_to_target: Some("timeout:client handshake".into()),
            target_to_client: None,
        })
    );
    proxy.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_clients_are_dropped_without_events() {
    let recorder = Arc::new(RecordingInterceptor::with_decision(Decision::Passthrough));
    let mut config = test_config();
    config.timeouts.idle_ms = Some(100);
    let proxy = ProxyServer::start(config, recorder.clone()).await.unwrap();

    let mut stream = TcpStream::connect(proxy.address()).await.unwrap();
    let mut buf = Vec::new();
    let read = tokio::time::timeout(SETTLE, stream.read_to_end(&mut buf)).await;
    assert!(matches!(read, Ok(Ok(0))));
    assert!(recorder.events().is_empty());
    proxy.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_version_gets_505_before_any_decision() {
    let recorder = Arc::new(RecordingInterceptor::with_decision(Decision::Passthrough));
    let proxy = ProxyServer::start(test_config(), recorder.clone()).await.unwrap();

    let (_stream, head) = send_proxy_request(proxy.address(), "CONNECT 127.0.0.1:443 HTTP/2.0").await;
    assert!(head.starts_with("HTTP/1.1 505"), "{head}");
    assert!(recorder.events().is_empty());
    proxy.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_proxy_request_gets_400() {
    let recorder = Arc::new(RecordingInterceptor::with_decision(Decision::Passthrough));
    let proxy = ProxyServer::start(test_config(), recorder.clone()).await.unwrap();

    let mut stream = TcpStream::connect(proxy.address()).await.unwrap();
    stream.write_all(b"NONSENSE\r\n\r\n").await.unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert!(reply.starts_with(b"HTTP/1.1 400 Bad Request"));
    assert!(recorder.events().is_empty());
    proxy.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_proxy_request_gets_400() {
    let recorder = Arc::new(RecordingInterceptor::with_decision(Decision::Passthrough));
    let mut config = test_config();
    config.limits.max_head_bytes = 1024;
    let proxy = ProxyServer::start(config, recorder.clone()).await.unwrap();

    let mut stream = TcpStream::connect(proxy.address()).await.unwrap();
    let header = format!("X-Filler: {}\r\n", "a".repeat(2048));
    let _ = stream
        .write_all(format!("CONNECT 127.0.0.1:443 HTTP/1.1\r\n{header}\r\n").as_bytes())
        .await;
    let mut reply = Vec::new();
    let _ = stream.read_to_end(&mut reply).await;
    assert!(reply.starts_with(b"HTTP/1.1 400 Bad Request"));
    assert!(recorder.events().is_empty());
    proxy.close().await.unwrap();
}
