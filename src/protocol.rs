//! IPC protocol for armd daemon communication
//!
//! Defines request/response types for armctl ↔ daemon communication.

use serde::{Deserialize, Serialize};

use crate::activation::{ActivationStrategy, StopResult};
use crate::launcher::ServiceStatus;

pub const DEFAULT_SOCKET_PATH: &str = "/run/armd.sock";

/// Control socket path: system-wide for root, per-user runtime dir otherwise
pub fn default_socket_path() -> String {
    let euid = nix::unistd::geteuid();
    if euid.is_root() {
        return DEFAULT_SOCKET_PATH.to_string();
    }
    match dirs::runtime_dir() {
        Some(dir) => dir.join("armd.sock").display().to_string(),
        None => format!("/tmp/armd-{}.sock", euid),
    }
}

/// Request from CLI to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Start a service now, taking over its monitored addresses
    Start { service: String },
    /// Stop monitoring a service and release one start request for it
    Stop { service: String },
    /// Stop monitoring a service's addresses (all services when `None`)
    StopListening { service: Option<String> },
    /// List monitored addresses
    List,
    /// Ping (health check)
    Ping,
}

/// One monitored address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenInfo {
    pub service: String,
    pub address: String,
    pub strategy: ActivationStrategy,
}

/// Response from daemon to CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Outcome of a stop request
    Stopped(StopResult),
    /// Whether a started or stopped service is still wanted
    Status { service: String, status: ServiceStatus },
    /// Currently monitored addresses
    Listening(Vec<ListenInfo>),
    /// Error with message
    Error(String),
    /// Pong (response to ping)
    Pong,
}
