//! Service launching
//!
//! The activation engine only knows the [`ServiceLauncher`] seam. The daemon
//! plugs in [`ProcessLauncher`], tests plug in recorders.

mod process;

pub use process::{
    build_command_line, ProcessLauncher, INITIAL_RESTART_DELAY, LISTEN_FDS_ENV, MAX_RESTART_DELAY,
};

use serde::{Deserialize, Serialize};

use crate::activation::InheritedSockets;

/// Whether a service is still wanted after a start or stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    Up,
    Down,
}

/// Starts and stops services by name
pub trait ServiceLauncher {
    /// Start `name`, optionally handing it pre-bound listening sockets.
    ///
    /// The sockets are consumed: after this returns the caller no longer
    /// holds them, whether or not the launch succeeded. Starting a service
    /// that is already running is not an error; it takes another reference
    /// on it. Returns the process id.
    fn start_service(
        &mut self,
        name: &str,
        inherited: Option<InheritedSockets>,
    ) -> Result<u32, LaunchError>;

    /// Drop one reference to `name`. The process is asked to terminate when
    /// the last reference goes.
    fn stop_service(&mut self, name: &str) -> ServiceStatus;
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Service {0} is not configured")]
    UnknownService(String),

    #[error("Service {0} has no BINARY")]
    NoBinary(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(String),
}
