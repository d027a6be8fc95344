//! Readiness probing of a freshly launched service
//!
//! A launched process needs time before it accepts connections. The prober
//! keeps trying to connect, doubling the pause between attempts, until it
//! succeeds or the deadline passes. The successful connection is the one the
//! relay uses.

use std::time::Duration;

use tokio::time::Instant;

use super::RelayStream;
use crate::config::ListenAddress;

/// Pause after the first failed attempt
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("{service}: not reachable at {address} after {attempts} attempt(s) in {timeout:?}")]
    Timeout {
        service: String,
        address: String,
        attempts: u32,
        timeout: Duration,
        #[source]
        last_error: Option<std::io::Error>,
    },
}

/// Connect to `address`, retrying with exponential back-off for up to
/// `timeout`
pub async fn wait_for_backend(
    service: &str,
    address: &ListenAddress,
    timeout: Duration,
) -> Result<RelayStream, ProbeError> {
    let deadline = Instant::now() + timeout;
    let mut backoff = INITIAL_BACKOFF;
    let mut attempts = 0u32;
    let mut last_error = None;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        attempts += 1;
        match tokio::time::timeout(remaining, RelayStream::connect(address)).await {
            Ok(Ok(stream)) => {
                log::debug!(
                    "{}: reachable at {} after {} attempt(s)",
                    service,
                    address,
                    attempts
                );
                return Ok(stream);
            }
            Ok(Err(e)) => {
                log::trace!("{}: attempt {} at {} failed: {}", service, attempts, address, e);
                last_error = Some(e);
            }
            Err(_elapsed) => break,
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(backoff.min(remaining)).await;
        backoff = backoff.saturating_mul(2);
    }

    Err(ProbeError::Timeout {
        service: service.to_string(),
        address: address.to_string(),
        attempts,
        timeout,
        last_error,
    })
}
