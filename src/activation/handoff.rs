//! Listening sockets in transit to a newly launched service
//!
//! A retired listening socket that is handed to a child process is moved into
//! a [`HandoffSocket`]. The bundle is consumed by the launcher; dropping it
//! afterwards closes the parent's copies while the child keeps its own.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::config::ListenAddress;

/// One listening socket on its way to a child process
#[derive(Debug)]
pub struct HandoffSocket {
    fd: OwnedFd,
    address: ListenAddress,
}

impl HandoffSocket {
    pub fn new(fd: OwnedFd, address: ListenAddress) -> Self {
        Self { fd, address }
    }

    pub fn address(&self) -> &ListenAddress {
        &self.address
    }

    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsRawFd for HandoffSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Ordered set of sockets a service inherits at launch.
///
/// Order is preserved so the child sees them at consecutive descriptors
/// starting at [`LISTEN_FDS_START`].
#[derive(Debug, Default)]
pub struct InheritedSockets {
    sockets: Vec<HandoffSocket>,
}

/// First descriptor number an inherited socket is installed at in the child
pub const LISTEN_FDS_START: RawFd = 3;

impl InheritedSockets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, socket: HandoffSocket) {
        self.sockets.push(socket);
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Raw descriptors in installation order; valid while `self` lives
    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.sockets.iter().map(AsRawFd::as_raw_fd).collect()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &ListenAddress> {
        self.sockets.iter().map(HandoffSocket::address)
    }

    pub fn into_sockets(self) -> Vec<HandoffSocket> {
        self.sockets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::FromRawFd;

    fn pipe_fds() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn test_order_is_preserved() {
        let (a, b) = pipe_fds();
        let (raw_a, raw_b) = (a.as_raw_fd(), b.as_raw_fd());
        let mut sockets = InheritedSockets::new();
        sockets.push(HandoffSocket::new(a, ListenAddress::Unix("/tmp/a".into())));
        sockets.push(HandoffSocket::new(b, ListenAddress::Unix("/tmp/b".into())));

        assert_eq!(sockets.len(), 2);
        assert_eq!(sockets.raw_fds(), vec![raw_a, raw_b]);
        let addrs: Vec<String> = sockets.addresses().map(ToString::to_string).collect();
        assert_eq!(addrs, vec!["unix:/tmp/a", "unix:/tmp/b"]);
    }

    #[test]
    fn test_dropping_bundle_closes_descriptors() {
        use std::io::Read;

        let (read_end, write_end) = pipe_fds();
        let mut sockets = InheritedSockets::new();
        sockets.push(HandoffSocket::new(write_end, ListenAddress::Unix("/tmp/a".into())));
        drop(sockets);

        // The only write end is gone, so the reader sees end-of-file
        let mut reader = std::fs::File::from(read_end);
        let mut buf = [0u8; 1];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }
}
