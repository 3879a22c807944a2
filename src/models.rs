//! Connection state and the non-fatal notification stream.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EventsError;

/// Connection state of an instance.
///
/// Servers move between `Disconnected` (listening, no peer) and `Connected`.
/// Clients additionally pass through `Connecting` and `BackingOff`, and end in
/// `Failed` when their retry budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not initialized yet.
    Idle,
    /// Client connect attempt in flight.
    Connecting,
    /// A peer is attached and frames can be written.
    Connected,
    /// Client waiting before its next attempt.
    BackingOff,
    /// No peer attached.
    Disconnected,
    /// Client gave up reconnecting.
    Failed,
    /// `close()` in progress.
    Closing,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::BackingOff => "backing_off",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }

    /// True once `close()` has started.
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-fatal notification delivered to the application.
///
/// Obtained through [`Linker::notices`](crate::Linker::notices). Connection
/// failures, corrupt peer data, listener failures and unobserved send
/// failures all arrive here instead of being raised.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// The connection state changed.
    State(ConnectionState),

    /// The client will retry after `delay`.
    Reconnecting {
        /// Consecutive failures so far (1-based)
        attempt: u32,
        delay: Duration,
    },

    /// A background failure.
    Error(EventsError),
}
