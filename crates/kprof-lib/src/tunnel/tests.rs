//! Tunnel coordinator tests
//!
//! The pod side is replaced by in-memory duplex pipes so the listener,
//! readiness and shutdown behaviour can be exercised without a cluster.

use super::*;
use crate::ports::free_port;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Echoes every byte back, like a trivial server inside the pod
#[derive(Default)]
struct EchoDialer {
    check_delay: Option<Duration>,
    dials: AtomicUsize,
}

#[async_trait]
impl PodDialer for EchoDialer {
    async fn check(&self) -> Result<()> {
        if let Some(delay) = self.check_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn dial(&self, _remote_port: u16) -> Result<Upstream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (local, remote) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(remote);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        Ok(Upstream::new(Box::new(local)))
    }
}

/// Every stream is backed by a session that takes a while to close
#[derive(Default)]
struct SlowSessionDialer {
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl PodDialer for SlowSessionDialer {
    async fn dial(&self, _remote_port: u16) -> Result<Upstream> {
        let (local, _remote) = tokio::io::duplex(64);
        let closed = self.closed.clone();
        Ok(Upstream::with_session(Box::new(local), async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            closed.store(true, Ordering::SeqCst);
        }))
    }
}

/// Cannot reach the pod
struct UnreachableDialer;

#[async_trait]
impl PodDialer for UnreachableDialer {
    async fn dial(&self, remote_port: u16) -> Result<Upstream> {
        Err(KprofError::Tunnel(format!("lost connection to pod on {}", remote_port)))
    }
}

/// Pod exists but is not running
struct PendingPodDialer;

#[async_trait]
impl PodDialer for PendingPodDialer {
    async fn check(&self) -> Result<()> {
        Err(KprofError::Tunnel("pod is not running".to_string()))
    }

    async fn dial(&self, _remote_port: u16) -> Result<Upstream> {
        unreachable!("dial after failed check")
    }
}

fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn settings() -> TunnelSettings {
    TunnelSettings {
        bind_address: localhost(),
        grace: Duration::from_millis(500),
    }
}

fn spawn_tunnel<D: PodDialer>(
    dialer: Arc<D>,
    local_port: u16,
    cancel: CancellationToken,
) -> (tokio::task::JoinHandle<Result<()>>, ReadyWaiter) {
    let (ready, waiter) = ready_signal();
    let coordinator = TunnelCoordinator::new(dialer, 6060, local_port, settings());
    (tokio::spawn(coordinator.run(cancel, ready)), waiter)
}

#[tokio::test]
async fn test_ready_signal_delivers_address_once() {
    let (ready, waiter) = ready_signal();
    let addr: SocketAddr = "127.0.0.1:6060".parse().unwrap();

    ready.fire(addr);
    assert_eq!(waiter.wait().await, Some(addr));
}

#[tokio::test]
async fn test_waiter_sees_dropped_signal() {
    let (ready, waiter) = ready_signal();
    drop(ready);
    assert_eq!(waiter.wait().await, None);
}

#[tokio::test]
async fn test_ready_after_bind_and_forwards_bytes() {
    let port = free_port(localhost()).unwrap();
    let dialer = Arc::new(EchoDialer::default());
    let cancel = CancellationToken::new();
    let (handle, waiter) = spawn_tunnel(dialer.clone(), port, cancel.clone());

    let addr = waiter.wait().await.expect("tunnel should become ready");
    assert_eq!(addr.port(), port);
    assert_eq!(dialer.dials.load(Ordering::SeqCst), 0, "ready must not wait for traffic");

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"GET /debug/pprof/heap").await.unwrap();
    let mut buf = [0u8; 21];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"GET /debug/pprof/heap");
    assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("tunnel should stop after cancellation")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_readiness_waits_for_slow_setup() {
    let delay = Duration::from_millis(200);
    let port = free_port(localhost()).unwrap();
    let dialer = Arc::new(EchoDialer {
        check_delay: Some(delay),
        ..EchoDialer::default()
    });
    let cancel = CancellationToken::new();

    let started = Instant::now();
    let (handle, waiter) = spawn_tunnel(dialer, port, cancel.clone());
    waiter.wait().await.expect("tunnel should become ready");
    assert!(started.elapsed() >= delay);

    cancel.cancel();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_no_connections_then_cancel() {
    let port = free_port(localhost()).unwrap();
    let cancel = CancellationToken::new();
    let (handle, waiter) = spawn_tunnel(Arc::new(EchoDialer::default()), port, cancel.clone());

    waiter.wait().await.unwrap();
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(result.is_ok());

    // The listener is gone once the coordinator returns.
    std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
}

#[tokio::test]
async fn test_cancel_with_open_connection() {
    let port = free_port(localhost()).unwrap();
    let cancel = CancellationToken::new();
    let (handle, waiter) = spawn_tunnel(Arc::new(EchoDialer::default()), port, cancel.clone());

    let addr = waiter.wait().await.unwrap();
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(result.is_ok());

    // The forwarded connection was closed from our side.
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_dial_failure_is_fatal() {
    let port = free_port(localhost()).unwrap();
    let cancel = CancellationToken::new();
    let (handle, waiter) = spawn_tunnel(Arc::new(UnreachableDialer), port, cancel.clone());

    let addr = waiter.wait().await.unwrap();
    let _client = TcpStream::connect(addr).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    match result {
        Err(KprofError::Tunnel(message)) => assert!(message.contains("lost connection")),
        other => panic!("expected tunnel error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_check_never_signals_ready() {
    let port = free_port(localhost()).unwrap();
    let (handle, waiter) = spawn_tunnel(Arc::new(PendingPodDialer), port, CancellationToken::new());

    assert_eq!(waiter.wait().await, None);
    assert!(matches!(handle.await.unwrap(), Err(KprofError::Tunnel(_))));
}

#[tokio::test]
async fn test_port_in_use_is_tunnel_error() {
    let occupied = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = occupied.local_addr().unwrap().port();
    let (handle, waiter) = spawn_tunnel(Arc::new(EchoDialer::default()), port, CancellationToken::new());

    assert_eq!(waiter.wait().await, None);
    assert!(matches!(handle.await.unwrap(), Err(KprofError::Tunnel(_))));
}

#[tokio::test]
async fn test_cancel_before_check_completes() {
    let port = free_port(localhost()).unwrap();
    let dialer = Arc::new(EchoDialer {
        check_delay: Some(Duration::from_secs(30)),
        ..EchoDialer::default()
    });
    let cancel = CancellationToken::new();
    let (handle, waiter) = spawn_tunnel(dialer, port, cancel.clone());

    cancel.cancel();
    assert_eq!(waiter.wait().await, None);
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_shutdown_waits_for_upstream_session() {
    let port = free_port(localhost()).unwrap();
    let dialer = Arc::new(SlowSessionDialer::default());
    let closed = dialer.closed.clone();
    let cancel = CancellationToken::new();
    let (handle, waiter) = spawn_tunnel(dialer, port, cancel.clone());

    let addr = waiter.wait().await.unwrap();
    let _client = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(closed.load(Ordering::SeqCst), "session should be closed before the tunnel returns");
}
