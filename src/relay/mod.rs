//! Connection relay
//!
//! Used for services that cannot take over a listening socket. The daemon
//! accepts the first client itself, waits for the launched service to
//! answer on the same address, and then shuttles bytes both ways until both
//! directions have ended.
//!
//! Each direction ends independently. Ending one shuts down the sending
//! side of its sink (half-close); the sockets are released only once both
//! directions are done.

mod probe;
mod pump;
mod stream;

pub use probe::{wait_for_backend, ProbeError, INITIAL_BACKOFF};
pub use pump::{Pump, PumpState, RELAY_BUFFER_SIZE};
pub use stream::RelayStream;

use std::io::ErrorKind;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

use crate::config::ListenAddress;

/// One direction of a relayed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl Direction {
    fn bit(self) -> u8 {
        match self {
            Self::ClientToBackend => DoneMask::CLIENT_TO_BACKEND,
            Self::BackendToClient => DoneMask::BACKEND_TO_CLIENT,
        }
    }
}

/// Which directions have finished
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DoneMask(u8);

impl DoneMask {
    pub const CLIENT_TO_BACKEND: u8 = 1;
    pub const BACKEND_TO_CLIENT: u8 = 2;
    const BOTH: u8 = Self::CLIENT_TO_BACKEND | Self::BACKEND_TO_CLIENT;

    pub fn mark(&mut self, direction: Direction) {
        self.0 |= direction.bit();
    }

    pub fn is_done(&self, direction: Direction) -> bool {
        self.0 & direction.bit() != 0
    }

    pub fn is_complete(&self) -> bool {
        self.0 == Self::BOTH
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// How a relayed connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Both directions reached end-of-stream
    Completed,
    /// At least one direction ended with an error
    Interrupted,
    /// The service never accepted a connection
    BackendUnreachable,
}

/// Summary of a finished relayed connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub service: String,
    pub client_to_backend: u64,
    pub backend_to_client: u64,
    pub outcome: RelayOutcome,
}

/// An accepted client whose service is not reachable yet
#[derive(Debug)]
pub struct PendingRelay {
    service: String,
    client: RelayStream,
}

impl PendingRelay {
    pub fn new(service: impl Into<String>, client: RelayStream) -> Self {
        Self {
            service: service.into(),
            client,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Pair the client with a connected backend
    pub fn attach<B>(self, backend: B) -> RelayConnection<RelayStream, B>
    where
        B: AsyncRead + AsyncWrite,
    {
        RelayConnection::new(self.service, self.client, backend)
    }
}

/// A client and a backend with one pump per direction
pub struct RelayConnection<C, B> {
    service: String,
    upstream: Pump<ReadHalf<C>, WriteHalf<B>>,
    downstream: Pump<ReadHalf<B>, WriteHalf<C>>,
    done: DoneMask,
}

impl<C, B> RelayConnection<C, B>
where
    C: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    pub fn new(service: impl Into<String>, client: C, backend: B) -> Self {
        Self::with_capacity(service, client, backend, RELAY_BUFFER_SIZE)
    }

    pub fn with_capacity(service: impl Into<String>, client: C, backend: B, capacity: usize) -> Self {
        let (client_rx, client_tx) = tokio::io::split(client);
        let (backend_rx, backend_tx) = tokio::io::split(backend);
        Self {
            service: service.into(),
            upstream: Pump::with_capacity(client_rx, backend_tx, capacity),
            downstream: Pump::with_capacity(backend_rx, client_tx, capacity),
            done: DoneMask::default(),
        }
    }

    pub fn done(&self) -> DoneMask {
        self.done
    }

    /// Relay until both directions have ended, then release both sockets
    pub async fn run(mut self) -> RelayReport {
        let mut outcome = RelayOutcome::Completed;

        {
            let Self {
                service,
                upstream,
                downstream,
                done,
            } = &mut self;

            let up = upstream.run();
            let down = downstream.run();
            tokio::pin!(up, down);

            while !done.is_complete() {
                let (direction, result) = tokio::select! {
                    result = &mut up, if !done.is_done(Direction::ClientToBackend) => {
                        (Direction::ClientToBackend, result)
                    }
                    result = &mut down, if !done.is_done(Direction::BackendToClient) => {
                        (Direction::BackendToClient, result)
                    }
                };

                done.mark(direction);
                match result {
                    Ok(bytes) => {
                        log::debug!("{}: {:?} closed after {} bytes", service, direction, bytes)
                    }
                    Err(e) => {
                        outcome = RelayOutcome::Interrupted;
                        match e.kind() {
                            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => {
                                log::debug!("{}: {:?} reset: {}", service, direction, e)
                            }
                            _ => log::warn!("{}: {:?} failed: {}", service, direction, e),
                        }
                    }
                }
            }
        }

        RelayReport {
            service: self.service,
            client_to_backend: self.upstream.forwarded(),
            backend_to_client: self.downstream.forwarded(),
            outcome,
        }
    }
}

/// Wait for the service behind `backend` to come up and relay the pending
/// client to it. The client is dropped if the service never answers.
pub async fn serve(pending: PendingRelay, backend: ListenAddress, timeout: Duration) -> RelayReport {
    let probed = wait_for_backend(pending.service(), &backend, timeout).await;
    match probed {
        Ok(stream) => pending.attach(stream).run().await,
        Err(e) => {
            log::error!("{}", e);
            RelayReport {
                service: pending.service,
                client_to_backend: 0,
                backend_to_client: 0,
                outcome: RelayOutcome::BackendUnreachable,
            }
        }
    }
}
