//! Listening socket pool
//!
//! Owns one record per bound listen socket of every service that is not yet
//! known to be running, and multiplexes their readiness into [`ListenEvent`]s.
//! Membership in the pool means "this service has not been activated".

use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::OwnedFd;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use socket2::{Domain, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;

use crate::config::ListenAddress;

use super::{ActivationStrategy, HandoffSocket};

/// Backlog of every listening socket the pool creates
pub const LISTEN_BACKLOG: i32 = 5;

/// Synthetic identifier of a pool record, stable for the record's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenId(u64);

impl fmt::Display for ListenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Result of an administrative stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopResult {
    RemovedSome,
    RemovedNone,
}

/// Readiness of one pool record
#[derive(Debug)]
pub enum ListenEvent {
    /// A client is waiting on a handoff record
    Readable { id: ListenId },
    /// A client was accepted from a relay record
    Accepted { id: ListenId, client: Socket },
    /// Accepting from a relay record failed; the record stays armed
    AcceptFailed { id: ListenId, error: std::io::Error },
    /// The reactor could not watch the record any more
    WatchFailed { id: ListenId, error: std::io::Error },
}

/// One `(service, bound address)` pair
#[derive(Debug)]
pub struct ServiceListenRecord {
    name: String,
    address: ListenAddress,
    strategy: ActivationStrategy,
    socket: AsyncFd<Socket>,
    armed: bool,
}

impl ServiceListenRecord {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address actually bound (ephemeral ports are resolved)
    pub fn address(&self) -> &ListenAddress {
        &self.address
    }

    pub fn strategy(&self) -> ActivationStrategy {
        self.strategy
    }

    /// Whether a readable watch is outstanding
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Give up the listening socket without closing it
    pub fn into_handoff(self) -> HandoffSocket {
        let socket = self.socket.into_inner();
        HandoffSocket::new(OwnedFd::from(socket), self.address)
    }

    /// Close the listening socket and remove its filesystem entry, so the
    /// service can bind the same address itself
    pub fn close(self) {
        let Self { name, address, socket, .. } = self;
        drop(socket);
        if let ListenAddress::Unix(path) = &address {
            if let Err(e) = std::fs::remove_file(path) {
                log::debug!("{}: failed to remove {}: {}", name, path.display(), e);
            }
        }
    }
}

/// The pool of not-yet-activated listening sockets
#[derive(Debug, Default)]
pub struct ListenPool {
    records: BTreeMap<ListenId, ServiceListenRecord>,
    next_id: u64,
}

impl ListenPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: ListenId) -> Option<&ServiceListenRecord> {
        self.records.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ListenId, &ServiceListenRecord)> {
        self.records.iter().map(|(id, record)| (*id, record))
    }

    /// Whether any record belongs to `name`
    pub fn has_service(&self, name: &str) -> bool {
        self.records.values().any(|r| r.name == name)
    }

    /// Bind a listening socket for `name` and arm its readable watch.
    ///
    /// Failures are logged and leave this address unmonitored; they never
    /// affect other addresses of the same service. Must be called from
    /// within a tokio runtime.
    pub fn create_listening_socket(
        &mut self,
        address: &ListenAddress,
        name: &str,
        strategy: ActivationStrategy,
    ) -> Option<ListenId> {
        if address.is_placeholder() {
            log::debug!("{}: skipping unix address without a path", name);
            return None;
        }

        let (socket, bound) = match bind_listener(address) {
            Ok(pair) => pair,
            Err(e) => {
                log::error!(
                    "{}: unable to listen on {} address {}: {}",
                    name,
                    address.family(),
                    address,
                    e
                );
                return None;
            }
        };

        let socket = match AsyncFd::new(socket) {
            Ok(fd) => fd,
            Err(e) => {
                log::error!("{}: failed to watch {}: {}", name, bound, e);
                return None;
            }
        };

        let id = ListenId(self.next_id);
        self.next_id += 1;

        log::info!("{}: monitoring connections at {} ({})", name, bound, strategy);
        self.records.insert(
            id,
            ServiceListenRecord {
                name: name.to_string(),
                address: bound,
                strategy,
                socket,
                armed: true,
            },
        );
        Some(id)
    }

    /// Disarm and remove a single record
    pub fn retire(&mut self, id: ListenId) -> Option<ServiceListenRecord> {
        let mut record = self.records.remove(&id)?;
        record.armed = false;
        Some(record)
    }

    /// Disarm and remove every record of `name`.
    ///
    /// Matching ids are collected first and removed after the scan.
    pub fn retire_service(&mut self, name: &str) -> Vec<ServiceListenRecord> {
        let ids: Vec<ListenId> = self
            .records
            .iter()
            .filter(|(_, r)| r.name == name)
            .map(|(id, _)| *id)
            .collect();

        ids.into_iter().filter_map(|id| self.retire(id)).collect()
    }

    /// Close every record of `name`, or every record when `name` is `None`
    pub fn stop_listening(&mut self, name: Option<&str>) -> StopResult {
        let ids: Vec<ListenId> = self
            .records
            .iter()
            .filter(|(_, r)| name.map_or(true, |n| r.name == n))
            .map(|(id, _)| *id)
            .collect();

        if ids.is_empty() {
            return StopResult::RemovedNone;
        }

        for id in ids {
            if let Some(record) = self.retire(id) {
                log::info!("{}: stopped listening at {}", record.name, record.address);
                record.close();
            }
        }
        StopResult::RemovedSome
    }

    /// Poll every armed record for readiness.
    ///
    /// Handoff records report `Readable` without consuming the pending
    /// connection; relay records accept it.
    pub fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<ListenEvent> {
        for (&id, record) in self.records.iter() {
            if !record.armed {
                continue;
            }

            loop {
                let mut guard = match record.socket.poll_read_ready(cx) {
                    Poll::Pending => break,
                    Poll::Ready(Err(error)) => {
                        return Poll::Ready(ListenEvent::WatchFailed { id, error })
                    }
                    Poll::Ready(Ok(guard)) => guard,
                };

                match record.strategy {
                    ActivationStrategy::Handoff => {
                        return Poll::Ready(ListenEvent::Readable { id });
                    }
                    ActivationStrategy::Relay => {
                        match guard.try_io(|fd| fd.get_ref().accept()) {
                            Ok(Ok((client, _peer))) => {
                                return Poll::Ready(ListenEvent::Accepted { id, client });
                            }
                            Ok(Err(error)) => {
                                // Wait for the next readiness edge instead of
                                // spinning on a persistent failure
                                guard.clear_ready();
                                return Poll::Ready(ListenEvent::AcceptFailed { id, error });
                            }
                            // Spurious wakeup, readiness was cleared
                            Err(_would_block) => continue,
                        }
                    }
                }
            }
        }

        Poll::Pending
    }
}

/// Create, configure, bind and listen a stream socket for `address`
fn bind_listener(address: &ListenAddress) -> std::io::Result<(Socket, ListenAddress)> {
    match address {
        ListenAddress::Inet(addr) => {
            let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, None)?;
            socket.set_reuse_address(true)?;
            if addr.is_ipv6() {
                socket.set_only_v6(true)?;
            }
            socket.bind(&SockAddr::from(*addr))?;
            socket.listen(LISTEN_BACKLOG)?;
            socket.set_nonblocking(true)?;

            let bound = socket
                .local_addr()?
                .as_socket()
                .map(ListenAddress::Inet)
                .unwrap_or_else(|| address.clone());
            Ok((socket, bound))
        }
        ListenAddress::Unix(path) => {
            // Remove a stale socket file and make sure the directory exists
            let _ = std::fs::remove_file(path);
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }

            let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
            socket.set_reuse_address(true)?;
            socket.bind(&SockAddr::unix(path)?)?;
            socket.listen(LISTEN_BACKLOG)?;
            socket.set_nonblocking(true)?;
            Ok((socket, address.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn loopback() -> ListenAddress {
        ListenAddress::Inet("127.0.0.1:0".parse().unwrap())
    }

    fn port_of(address: &ListenAddress) -> u16 {
        match address {
            ListenAddress::Inet(addr) => addr.port(),
            ListenAddress::Unix(_) => panic!("not an inet address"),
        }
    }

    #[tokio::test]
    async fn test_create_resolves_ephemeral_port() {
        let mut pool = ListenPool::new();
        let id = pool
            .create_listening_socket(&loopback(), "echo", ActivationStrategy::Handoff)
            .unwrap();

        let record = pool.get(id).unwrap();
        assert_eq!(record.name(), "echo");
        assert!(record.is_armed());
        assert_ne!(port_of(record.address()), 0);
    }

    #[tokio::test]
    async fn test_bind_failure_is_not_fatal() {
        let mut pool = ListenPool::new();
        let first = pool
            .create_listening_socket(&loopback(), "echo", ActivationStrategy::Handoff)
            .unwrap();
        let taken = pool.get(first).unwrap().address().clone();

        // A second socket cannot listen on a port that is already listening
        assert!(pool
            .create_listening_socket(&taken, "other", ActivationStrategy::Handoff)
            .is_none());
        assert_eq!(pool.len(), 1);

        // Other addresses of the same service still work
        assert!(pool
            .create_listening_socket(&loopback(), "other", ActivationStrategy::Handoff)
            .is_some());
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_placeholder_unix_address_is_skipped() {
        let mut pool = ListenPool::new();
        let placeholder = ListenAddress::Unix(Default::default());
        assert!(pool
            .create_listening_socket(&placeholder, "echo", ActivationStrategy::Handoff)
            .is_none());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_stop_listening_by_name() {
        let mut pool = ListenPool::new();
        for name in ["x", "x", "y"] {
            pool.create_listening_socket(&loopback(), name, ActivationStrategy::Handoff)
                .unwrap();
        }

        assert_eq!(pool.stop_listening(Some("x")), StopResult::RemovedSome);
        assert!(!pool.has_service("x"));
        assert!(pool.has_service("y"));
        assert_eq!(pool.len(), 1);

        assert_eq!(pool.stop_listening(Some("x")), StopResult::RemovedNone);
    }

    #[tokio::test]
    async fn test_stop_listening_all() {
        let mut pool = ListenPool::new();
        for name in ["x", "y"] {
            pool.create_listening_socket(&loopback(), name, ActivationStrategy::Relay)
                .unwrap();
        }
        assert_eq!(pool.stop_listening(None), StopResult::RemovedSome);
        assert!(pool.is_empty());
        assert_eq!(pool.stop_listening(None), StopResult::RemovedNone);
    }

    #[tokio::test]
    async fn test_stopped_port_refuses_connections() {
        let mut pool = ListenPool::new();
        let id = pool
            .create_listening_socket(&loopback(), "x", ActivationStrategy::Handoff)
            .unwrap();
        let ListenAddress::Inet(addr) = pool.get(id).unwrap().address().clone() else {
            panic!("not an inet address");
        };

        pool.stop_listening(Some("x"));
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_retire_service_takes_all_siblings() {
        let mut pool = ListenPool::new();
        for name in ["x", "y", "x"] {
            pool.create_listening_socket(&loopback(), name, ActivationStrategy::Handoff)
                .unwrap();
        }

        let retired = pool.retire_service("x");
        assert_eq!(retired.len(), 2);
        assert!(retired.iter().all(|r| !r.is_armed() && r.name() == "x"));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_relay_record_accepts_on_readiness() {
        let mut pool = ListenPool::new();
        let id = pool
            .create_listening_socket(&loopback(), "echo", ActivationStrategy::Relay)
            .unwrap();
        let ListenAddress::Inet(addr) = pool.get(id).unwrap().address().clone() else {
            panic!("not an inet address");
        };

        let _client = std::net::TcpStream::connect(addr).unwrap();
        let event = std::future::poll_fn(|cx| pool.poll_event(cx)).await;
        match event {
            ListenEvent::Accepted { id: got, client } => {
                assert_eq!(got, id);
                let peer: SocketAddr = client.peer_addr().unwrap().as_socket().unwrap();
                assert!(peer.ip().is_loopback());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_accept_waits_for_next_readiness() {
        let mut pool = ListenPool::new();
        let id = pool
            .create_listening_socket(&loopback(), "echo", ActivationStrategy::Relay)
            .unwrap();

        // A shut down listener stays readable while every accept fails
        pool.records[&id]
            .socket
            .get_ref()
            .shutdown(std::net::Shutdown::Both)
            .unwrap();

        let event = std::future::poll_fn(|cx| pool.poll_event(cx)).await;
        assert!(matches!(event, ListenEvent::AcceptFailed { id: got, .. } if got == id));
        assert!(pool.get(id).unwrap().is_armed());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let mut next = tokio_test::task::spawn(std::future::poll_fn(|cx| pool.poll_event(cx)));
        assert!(next.poll().is_pending());
    }

    #[tokio::test]
    async fn test_handoff_record_reports_readable() {
        let mut pool = ListenPool::new();
        let id = pool
            .create_listening_socket(&loopback(), "echo", ActivationStrategy::Handoff)
            .unwrap();
        let ListenAddress::Inet(addr) = pool.get(id).unwrap().address().clone() else {
            panic!("not an inet address");
        };

        let _client = std::net::TcpStream::connect(addr).unwrap();
        let event = std::future::poll_fn(|cx| pool.poll_event(cx)).await;
        assert!(matches!(event, ListenEvent::Readable { id: got } if got == id));
    }

    #[tokio::test]
    async fn test_unix_listener_is_removed_on_stop() {
        let dir = std::env::temp_dir().join(format!("armd-pool-{}", std::process::id()));
        let path = dir.join("echo.sock");
        let mut pool = ListenPool::new();
        pool.create_listening_socket(
            &ListenAddress::Unix(path.clone()),
            "echo",
            ActivationStrategy::Relay,
        )
        .unwrap();
        assert!(path.exists());

        pool.stop_listening(Some("echo"));
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
