//! Integration tests for relayed connections over real sockets

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use armd::config::ListenAddress;
use armd::relay::{serve, PendingRelay, RelayConnection, RelayOutcome, RelayStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_test_dir() -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = PathBuf::from(format!("/tmp/armd-relay-test-{}-{}", std::process::id(), id));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// A connected TCP pair
async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (near, far) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (near.unwrap(), far.unwrap().0)
}

#[tokio::test]
async fn test_client_close_still_delivers_backend_reply() {
    let (client_peer, client) = tcp_pair().await;
    let (backend, backend_peer) = tcp_pair().await;
    let relay = tokio::spawn(RelayConnection::new("echo", client, backend).run());

    let (mut client_rx, mut client_tx) = client_peer.into_split();
    client_tx.write_all(b"GET /\n").await.unwrap();
    client_tx.shutdown().await.unwrap();

    let (mut backend_rx, mut backend_tx) = backend_peer.into_split();
    let mut request = Vec::new();
    backend_rx.read_to_end(&mut request).await.unwrap();
    assert_eq!(request, b"GET /\n");

    backend_tx.write_all(b"200 OK\n").await.unwrap();
    drop(backend_tx);
    drop(backend_rx);

    let mut reply = Vec::new();
    client_rx.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"200 OK\n");

    let report = tokio::time::timeout(Duration::from_secs(5), relay)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.client_to_backend, 6);
    assert_eq!(report.backend_to_client, 7);
    assert_eq!(report.outcome, RelayOutcome::Completed);
}

#[tokio::test]
async fn test_backend_close_first() {
    let (mut client_peer, client) = tcp_pair().await;
    let (backend, mut backend_peer) = tcp_pair().await;
    let relay = tokio::spawn(RelayConnection::new("echo", client, backend).run());

    backend_peer.write_all(b"banner\n").await.unwrap();
    backend_peer.shutdown().await.unwrap();

    let mut banner = [0u8; 7];
    client_peer.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, b"banner\n");

    // Client can still talk to the backend after the backend stopped sending
    client_peer.write_all(b"bye").await.unwrap();
    let mut bye = [0u8; 3];
    backend_peer.read_exact(&mut bye).await.unwrap();
    assert_eq!(&bye, b"bye");

    drop(client_peer);
    drop(backend_peer);
    let report = tokio::time::timeout(Duration::from_secs(5), relay)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.backend_to_client, 7);
    assert_eq!(report.client_to_backend, 3);
}

#[tokio::test]
async fn test_serve_waits_for_late_unix_backend() {
    let dir = unique_test_dir();
    let path = dir.join("late.sock");

    let (mut client_peer, client) = UnixStream::pair().unwrap();
    let pending = PendingRelay::new("late", RelayStream::from(client));

    // Bytes sent before the service is up are delivered once it is
    client_peer.write_all(b"early").await.unwrap();

    let backend_path = path.clone();
    let backend = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let listener = UnixListener::bind(&backend_path).unwrap();
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        conn.write_all(&buf).await.unwrap();
        buf
    });

    let relay = tokio::spawn(serve(
        pending,
        ListenAddress::Unix(path.clone()),
        Duration::from_secs(5),
    ));

    let mut echoed = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), client_peer.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"early");
    assert_eq!(&backend.await.unwrap(), b"early");

    drop(client_peer);
    let report = tokio::time::timeout(Duration::from_secs(5), relay)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.service, "late");
    assert_eq!(report.client_to_backend, 5);
    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_serve_drops_client_when_backend_never_appears() {
    let dir = unique_test_dir();
    let (mut client_peer, client) = UnixStream::pair().unwrap();
    let pending = PendingRelay::new("ghost", RelayStream::from(client));

    let report = serve(
        pending,
        ListenAddress::Unix(dir.join("missing.sock")),
        Duration::from_millis(100),
    )
    .await;
    assert_eq!(report.outcome, RelayOutcome::BackendUnreachable);
    assert_eq!(report.client_to_backend, 0);

    let mut buf = [0u8; 1];
    assert_eq!(client_peer.read(&mut buf).await.unwrap(), 0);
    let _ = fs::remove_dir_all(&dir);
}
