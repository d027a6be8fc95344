//! On-demand service activation
//!
//! The manager owns the pool of not-yet-activated listening sockets and
//! reacts to the first client that shows up on any of them:
//!
//! ```text
//!  configure ──▶ ListenPool ──first connection──▶ trigger
//!                                                   │
//!            ┌──────────── handoff ─────────────────┤
//!            ▼                                      ▼ relay
//!   launch(name, sockets)               accept ─▶ launch(name)
//!                                                   │
//!                                       probe ─▶ RelayConnection
//! ```
//!
//! Everything runs on one task. Launching is synchronous from the manager's
//! point of view; relayed connections run as tasks in a [`JoinSet`] and
//! report back through [`ManagerEvent::RelayFinished`].

mod handoff;
mod pool;

pub use handoff::{HandoffSocket, InheritedSockets, LISTEN_FDS_START};
pub use pool::{
    ListenEvent, ListenId, ListenPool, ServiceListenRecord, StopResult, LISTEN_BACKLOG,
};

use std::fmt;
use std::task::Poll;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::Socket;
use tokio::task::{JoinError, JoinSet};

use crate::config::ListenAddress;
use crate::launcher::{LaunchError, ServiceLauncher, ServiceStatus};
use crate::protocol::ListenInfo;
use crate::registry::DefaultServices;
use crate::relay::{self, PendingRelay, RelayOutcome, RelayReport, RelayStream};

/// How a service receives its first connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationStrategy {
    /// Pass the listening sockets themselves to the new process
    Handoff,
    /// Accept the client here and shuttle bytes to the new process
    Relay,
}

impl fmt::Display for ActivationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handoff => write!(f, "handoff"),
            Self::Relay => write!(f, "relay"),
        }
    }
}

/// Everything the event loop can be woken by
#[derive(Debug)]
pub enum ManagerEvent {
    Listen(ListenEvent),
    RelayFinished(Result<RelayReport, JoinError>),
}

/// What an activation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    HandedOff {
        service: String,
        pid: u32,
        sockets: usize,
    },
    Relaying {
        service: String,
        pid: u32,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("{service}: launch failed: {source}")]
    Launch {
        service: String,
        #[source]
        source: LaunchError,
    },
}

/// The activation engine
pub struct ActivationManager<L> {
    pool: ListenPool,
    launcher: L,
    defaults: DefaultServices,
    probe_timeout: Duration,
    relays: JoinSet<RelayReport>,
}

impl<L: ServiceLauncher> ActivationManager<L> {
    pub fn new(launcher: L, defaults: DefaultServices, probe_timeout: Duration) -> Self {
        Self {
            pool: ListenPool::new(),
            launcher,
            defaults,
            probe_timeout,
            relays: JoinSet::new(),
        }
    }

    pub fn pool(&self) -> &ListenPool {
        &self.pool
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn launcher_mut(&mut self) -> &mut L {
        &mut self.launcher
    }

    pub fn defaults(&self) -> &DefaultServices {
        &self.defaults
    }

    /// Relayed connections still in flight (including ones still probing)
    pub fn active_relays(&self) -> usize {
        self.relays.len()
    }

    /// Launch every default service once. Returns how many started.
    pub fn start_default_services(&mut self) -> usize {
        let mut started = 0;
        for name in self.defaults.iter() {
            match self.launcher.start_service(name, None) {
                Ok(pid) => {
                    log::info!("{}: started as default service (pid {})", name, pid);
                    started += 1;
                }
                Err(e) => log::error!("{}: failed to start default service: {}", name, e),
            }
        }
        started
    }

    /// Put a lazily started service under watch on each of `addresses`.
    ///
    /// Does nothing for services that are not marked for autostart or that
    /// are started eagerly as default services. Returns the number of
    /// addresses actually being monitored.
    pub fn configure(
        &mut self,
        name: &str,
        addresses: &[ListenAddress],
        autostart: bool,
        strategy: ActivationStrategy,
    ) -> usize {
        if !autostart {
            log::debug!("{}: not configured for autostart", name);
            return 0;
        }
        if self.defaults.contains(name) {
            log::debug!("{}: default service, not started on demand", name);
            return 0;
        }

        addresses
            .iter()
            .filter_map(|address| self.create_listening_socket(address, name, strategy))
            .count()
    }

    pub fn create_listening_socket(
        &mut self,
        address: &ListenAddress,
        name: &str,
        strategy: ActivationStrategy,
    ) -> Option<ListenId> {
        self.pool.create_listening_socket(address, name, strategy)
    }

    /// Stop monitoring `name`, or every service when `name` is `None`
    pub fn stop_listening(&mut self, name: Option<&str>) -> StopResult {
        let result = self.pool.stop_listening(name);
        if result == StopResult::RemovedNone {
            log::debug!("stop listening: nothing monitored for {}", name.unwrap_or("any service"));
        }
        result
    }

    /// Start `name` on request.
    ///
    /// Whatever the pool still monitors for the service is taken over:
    /// handoff sockets go to the new process, relay sockets are closed so the
    /// service can bind them itself.
    pub fn start_service(&mut self, name: &str) -> Result<u32, ManagerError> {
        let mut inherited = InheritedSockets::new();
        for record in self.pool.retire_service(name) {
            match record.strategy() {
                ActivationStrategy::Handoff => inherited.push(record.into_handoff()),
                ActivationStrategy::Relay => record.close(),
            }
        }
        let inherited = (!inherited.is_empty()).then_some(inherited);

        self.launcher
            .start_service(name, inherited)
            .map_err(|source| ManagerError::Launch {
                service: name.to_string(),
                source,
            })
    }

    /// Stop monitoring `name` and drop one start request for it
    pub fn stop_service(&mut self, name: &str) -> ServiceStatus {
        self.stop_listening(Some(name));
        self.launcher.stop_service(name)
    }

    /// Snapshot of what is currently being monitored
    pub fn listening(&self) -> Vec<ListenInfo> {
        self.pool
            .iter()
            .map(|(_, record)| ListenInfo {
                service: record.name().to_string(),
                address: record.address().to_string(),
                strategy: record.strategy(),
            })
            .collect()
    }

    /// Wait for the next listening socket readiness or relay completion
    pub async fn next_event(&mut self) -> ManagerEvent {
        std::future::poll_fn(|cx| {
            if let Poll::Ready(Some(result)) = self.relays.poll_join_next(cx) {
                return Poll::Ready(ManagerEvent::RelayFinished(result));
            }
            self.pool.poll_event(cx).map(ManagerEvent::Listen)
        })
        .await
    }

    /// React to one event.
    ///
    /// Events naming a record that is no longer in the pool are ignored.
    pub fn handle_event(&mut self, event: ManagerEvent) -> Result<Option<Activation>, ManagerError> {
        match event {
            ManagerEvent::Listen(ListenEvent::Readable { id }) => self.activate_handoff(id),
            ManagerEvent::Listen(ListenEvent::Accepted { id, client }) => {
                self.activate_relay(id, client)
            }
            ManagerEvent::Listen(ListenEvent::AcceptFailed { id, error }) => {
                if let Some(record) = self.pool.get(id) {
                    log::warn!("{}: accept failed on {}: {}", record.name(), record.address(), error);
                }
                Ok(None)
            }
            ManagerEvent::Listen(ListenEvent::WatchFailed { id, error }) => {
                if let Some(record) = self.pool.retire(id) {
                    log::error!(
                        "{}: giving up on {}: {}",
                        record.name(),
                        record.address(),
                        error
                    );
                    record.close();
                }
                Ok(None)
            }
            ManagerEvent::RelayFinished(result) => {
                log_relay_result(result);
                Ok(None)
            }
        }
    }

    /// The first client is waiting: pass every socket of the service to a
    /// new process without accepting anything
    fn activate_handoff(&mut self, id: ListenId) -> Result<Option<Activation>, ManagerError> {
        let Some(trigger) = self.pool.retire(id) else {
            log::debug!("{}: readiness for retired record ignored", id);
            return Ok(None);
        };
        let service = trigger.name().to_string();

        let mut inherited = InheritedSockets::new();
        for sibling in self.pool.retire_service(&service) {
            inherited.push(sibling.into_handoff());
        }
        inherited.push(trigger.into_handoff());

        let sockets = inherited.len();
        log::info!(
            "{}: connection pending, starting service with {} listening socket(s)",
            service,
            sockets
        );

        let pid = self
            .launcher
            .start_service(&service, Some(inherited))
            .map_err(|source| ManagerError::Launch {
                service: service.clone(),
                source,
            })?;

        Ok(Some(Activation::HandedOff {
            service,
            pid,
            sockets,
        }))
    }

    /// The first client has been accepted: free every address of the
    /// service, launch it and relay the client once it answers
    fn activate_relay(
        &mut self,
        id: ListenId,
        client: Socket,
    ) -> Result<Option<Activation>, ManagerError> {
        let Some(record) = self.pool.get(id) else {
            log::debug!("{}: accepted connection for retired record dropped", id);
            return Ok(None);
        };

        let client = match RelayStream::from_accepted(client, record.address()) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("{}: unusable client connection: {}", record.name(), e);
                return Ok(None);
            }
        };

        let Some(trigger) = self.pool.retire(id) else {
            return Ok(None);
        };
        let service = trigger.name().to_string();
        let backend = trigger.address().connect_target();

        // The service binds these addresses itself
        for sibling in self.pool.retire_service(&service) {
            sibling.close();
        }
        trigger.close();

        log::info!("{}: connection accepted, starting service and relaying", service);
        let pid = self
            .launcher
            .start_service(&service, None)
            .map_err(|source| ManagerError::Launch {
                service: service.clone(),
                source,
            })?;

        let pending = PendingRelay::new(service.clone(), client);
        self.relays
            .spawn(relay::serve(pending, backend, self.probe_timeout));

        Ok(Some(Activation::Relaying { service, pid }))
    }

    /// Stop monitoring everything and abort relays in flight
    pub fn shutdown(&mut self) {
        self.pool.stop_listening(None);
        if !self.relays.is_empty() {
            log::info!("aborting {} relayed connection(s)", self.relays.len());
        }
        self.relays.abort_all();
    }
}

fn log_relay_result(result: Result<RelayReport, JoinError>) {
    match result {
        Ok(report) => match report.outcome {
            RelayOutcome::Completed => log::debug!(
                "{}: relay finished ({} bytes to service, {} bytes to client)",
                report.service,
                report.client_to_backend,
                report.backend_to_client
            ),
            RelayOutcome::Interrupted => log::info!(
                "{}: relay interrupted ({} bytes to service, {} bytes to client)",
                report.service,
                report.client_to_backend,
                report.backend_to_client
            ),
            RelayOutcome::BackendUnreachable => {
                log::warn!("{}: service never became reachable, client dropped", report.service)
            }
        },
        Err(e) if e.is_cancelled() => log::debug!("relay task cancelled"),
        Err(e) => log::error!("relay task failed: {}", e),
    }
}
