//! Signal handling for the daemon
//!
//! - SIGTERM/SIGINT: stop monitoring, terminate services, exit
//! - SIGUSR1: dump monitored addresses and running services to the log

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;

/// Signals that armd handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmSignal {
    /// Shutdown request (SIGTERM)
    Term,
    /// Interrupt (SIGINT, Ctrl+C)
    Int,
    /// User signal 1 (SIGUSR1) - state dump
    Usr1,
}

pub struct SignalHandler {
    sigterm: Signal,
    sigint: Signal,
    sigusr1: Signal,
}

impl SignalHandler {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sigusr1: signal(SignalKind::user_defined1())?,
        })
    }

    /// Wait for the next signal
    pub async fn wait(&mut self) -> ArmSignal {
        tokio::select! {
            _ = self.sigterm.recv() => ArmSignal::Term,
            _ = self.sigint.recv() => ArmSignal::Int,
            _ = self.sigusr1.recv() => ArmSignal::Usr1,
        }
    }

    /// Spawn a task that forwards signals to a channel
    pub fn spawn_forwarder(mut self) -> mpsc::Receiver<ArmSignal> {
        let (tx, rx) = mpsc::channel(8);

        tokio::spawn(async move {
            loop {
                let sig = self.wait().await;
                if tx.send(sig).await.is_err() {
                    break;
                }
            }
        });

        rx
    }

    pub fn is_shutdown(sig: ArmSignal) -> bool {
        matches!(sig, ArmSignal::Term | ArmSignal::Int)
    }
}
