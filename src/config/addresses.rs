//! Bind address resolution
//!
//! Expands a service's `PORT`/`BINDTO`/`UNIXPATH`/`DISABLEV6` settings into the
//! list of concrete addresses the supervisor listens on for it.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use super::ServiceConfig;

/// A resolved bind address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenAddress {
    /// IPv4 or IPv6 stream address
    Inet(SocketAddr),
    /// Unix-domain stream socket path
    Unix(PathBuf),
}

impl ListenAddress {
    pub fn family(&self) -> &'static str {
        match self {
            Self::Inet(SocketAddr::V4(_)) => "ipv4",
            Self::Inet(SocketAddr::V6(_)) => "ipv6",
            Self::Unix(_) => "unix",
        }
    }

    /// A Unix address with nothing to bind to
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Unix(path) if path.as_os_str().is_empty())
    }

    /// Address a local client should connect to in order to reach whatever
    /// is bound here. Wildcard binds are reached through loopback.
    pub fn connect_target(&self) -> ListenAddress {
        match self {
            Self::Inet(addr) if addr.ip().is_unspecified() => {
                let ip = match addr.ip() {
                    IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                    IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
                };
                Self::Inet(SocketAddr::new(ip, addr.port()))
            }
            other => other.clone(),
        }
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{}", addr),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("{0}: have neither PORT nor UNIXPATH, but one is required")]
    NoAddress(String),

    #[error("{service}: failed to resolve '{host}': {source}")]
    Resolve {
        service: String,
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{service}: no usable address found for '{host}'")]
    NoUsableAddress { service: String, host: String },
}

/// Check whether this host can create IPv6 sockets at all
pub fn ipv6_available() -> bool {
    socket2::Socket::new(socket2::Domain::IPV6, socket2::Type::STREAM, None).is_ok()
}

/// Resolve all addresses a service should be reachable on.
///
/// The Unix path (if any) comes first, followed by the IP addresses.
pub fn resolve_addresses(service: &ServiceConfig) -> Result<Vec<ListenAddress>, AddressError> {
    let port = service.port.unwrap_or(0);
    if port == 0 && service.unix_path.is_none() {
        return Err(AddressError::NoAddress(service.name.clone()));
    }

    let mut disable_v6 = service.disable_v6;
    if !disable_v6 && !ipv6_available() {
        log::info!(
            "{}: disabling IPv6 support, failed to create IPv6 socket",
            service.name
        );
        disable_v6 = true;
    }

    let mut addrs = Vec::new();
    if let Some(path) = &service.unix_path {
        addrs.push(ListenAddress::Unix(path.clone()));
    }

    if port == 0 {
        return Ok(addrs);
    }

    match &service.bind_to {
        Some(host) => {
            let resolved = (host.as_str(), port)
                .to_socket_addrs()
                .map_err(|source| AddressError::Resolve {
                    service: service.name.clone(),
                    host: host.clone(),
                    source,
                })?;

            let before = addrs.len();
            for addr in resolved {
                if disable_v6 && addr.is_ipv6() {
                    continue;
                }
                let addr = ListenAddress::Inet(addr);
                if !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }
            if addrs.len() == before {
                return Err(AddressError::NoUsableAddress {
                    service: service.name.clone(),
                    host: host.clone(),
                });
            }
        }
        None => {
            // Bind against everything, just set the port
            if !disable_v6 {
                addrs.push(ListenAddress::Inet(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                    port,
                )));
            }
            addrs.push(ListenAddress::Inet(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port,
            )));
        }
    }

    Ok(addrs)
}
