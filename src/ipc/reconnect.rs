//! Client reconnection: backoff schedule and the connect supervisor.
//!
//! The supervisor owns the client side of the socket. It connects, runs a
//! session until the peer goes away, then waits out a backoff delay and tries
//! again. Delays double from `base_delay` up to `max_delay`, and optional
//! jitter spreads simultaneous clients apart.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::sync::oneshot;

use crate::config::ReconnectPolicy;
use crate::error::EventsError;
use crate::ipc::transport::{SessionEnd, Shutdown, Transport};
use crate::models::{ConnectionState, Notice};

/// Exponential backoff state for one client.
///
/// The failure counter only resets on a successful connect, so the delays a
/// client observes between consecutive failures never decrease.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Consecutive failures since the last successful connect.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Forget past failures after a successful connect.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Un-jittered delay after `failures` previous failures:
    /// `min(max_delay, base_delay * 2^failures)`.
    pub fn base_delay_for(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.policy.base_delay.checked_mul(factor))
            .map_or(self.policy.max_delay, |delay| delay.min(self.policy.max_delay))
    }

    /// Record a failed attempt.
    ///
    /// Returns the delay to wait before the next attempt, or `None` once the
    /// attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.base_delay_for(self.failures);
        self.failures = self.failures.saturating_add(1);

        if let Some(max) = self.policy.max_attempts {
            if self.failures >= max {
                return None;
            }
        }

        if !self.policy.jitter {
            return Some(delay);
        }
        // Up to +100%, capped. Keeps consecutive delays non-decreasing.
        let jitter = delay.mul_f64(rand::random::<f64>());
        Some((delay + jitter).min(self.policy.max_delay))
    }
}

/// Drive the client connection until shutdown or until the retry budget runs
/// out.
///
/// `first_attempt` fires once the first connect attempt has settled, either
/// with a live session installed or with a failure.
pub(crate) async fn run_client(
    transport: Arc<Transport>,
    policy: ReconnectPolicy,
    mut shutdown: Shutdown,
    first_attempt: oneshot::Sender<()>,
) {
    let mut backoff = Backoff::new(policy);
    let mut first_attempt = Some(first_attempt);

    loop {
        if shutdown.is_set() {
            break;
        }
        transport.set_state(ConnectionState::Connecting);

        let connected = tokio::select! {
            _ = shutdown.wait() => break,
            res = UnixStream::connect(transport.path()) => res,
        };

        let reason = match connected {
            Ok(stream) => {
                backoff.reset();
                tracing::info!("Connected to {}", transport.path().display());
                match transport
                    .run_session(stream, shutdown.clone(), first_attempt.take())
                    .await
                {
                    SessionEnd::Shutdown => break,
                    end => end.to_string(),
                }
            }
            Err(e) => {
                if let Some(tx) = first_attempt.take() {
                    let _ = tx.send(());
                }
                e.to_string()
            }
        };

        let Some(delay) = backoff.next_delay() else {
            let attempts = backoff.failures();
            tracing::error!(
                "Giving up on {} after {} attempts: {}",
                transport.path().display(),
                attempts,
                reason
            );
            transport.set_state(ConnectionState::Failed);
            transport.notify(Notice::Error(EventsError::ConnectionFailed { attempts }));
            return;
        };

        let attempt = backoff.failures();
        trace_event!(
            transport.debug(),
            "Reconnect attempt {} in {:?} ({})",
            attempt,
            delay,
            reason
        );
        transport.set_state(ConnectionState::BackingOff);
        transport.notify(Notice::Reconnecting { attempt, delay });

        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::debug!("Client supervisor for {} stopped", transport.path().display());
}
