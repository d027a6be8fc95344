//! armd - on-demand service activation for a peer-to-peer node supervisor
//!
//! Services marked for autostart are not launched at boot. Instead the
//! daemon binds their addresses itself and launches a service when the
//! first client connects:
//!
//! - Handoff: the listening sockets are passed to the new process, which
//!   accepts the waiting client itself.
//! - Relay: the daemon accepts the client, waits for the new process to
//!   come up on the same address, and relays bytes between the two.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                      armd                         │
//! ├──────────────────────────────────────────────────┤
//! │  Config / Registry │ ActivationManager │ IPC     │
//! ├──────────────────────────────────────────────────┤
//! │  ListenPool  │  ProcessLauncher  │  Relay tasks  │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod activation;
pub mod config;
pub mod launcher;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod signals;

pub use activation::{ActivationManager, ActivationStrategy, StopResult};
pub use config::{ArmConfig, ListenAddress, ServiceConfig};
pub use launcher::{LaunchError, ProcessLauncher, ServiceLauncher, ServiceStatus};
pub use registry::{DefaultServices, Registry};
