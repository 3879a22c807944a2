//! Error taxonomy for the event bus.
//!
//! Connection-level failures never escape the background tasks; they reach the
//! application through [`Notice`](crate::models::Notice). Programmer errors are
//! returned synchronously from the call that caused them.

use thiserror::Error;

/// Errors produced by a [`Linker`](crate::Linker).
///
/// I/O errors are carried as strings so the type stays `Clone` and can be
/// broadcast to every notice subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventsError {
    /// Channel name unusable as a socket path.
    #[error("Invalid channel {channel:?}: {reason}")]
    InvalidChannel {
        /// The rejected channel name
        channel: String,
        /// Why it was rejected
        reason: String,
    },

    /// Role string other than "server" or "client".
    #[error("Invalid role: {0}. Must be 'server' or 'client'")]
    InvalidRole(String),

    /// Another live server already listens on the channel.
    #[error("Address already in use: {0}")]
    AddressInUse(String),

    /// The client exhausted its reconnection budget.
    #[error("Connection failed after {attempts} attempts")]
    ConnectionFailed {
        /// Consecutive failed attempts before giving up
        attempts: u32,
    },

    /// No peer is connected right now.
    #[error("Not connected")]
    NotConnected,

    /// The peer sent bytes that do not decode as a frame.
    #[error("Corrupt frame: {0}")]
    CorruptFrame(String),

    /// An outgoing payload could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An outgoing envelope exceeds the configured frame limit.
    #[error("Frame of {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Encoded envelope size
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// A listener failed while handling an event.
    #[error("Listener for {event:?} failed: {message}")]
    ListenerError {
        /// Event being delivered
        event: String,
        /// Failure description
        message: String,
    },

    /// The instance was used before `init`.
    #[error("Linker not initialized")]
    NotInitialized,

    /// `init` was called on an instance that is already running.
    #[error("Linker already initialized")]
    AlreadyInitialized,

    /// The instance has been closed.
    #[error("Linker closed")]
    Closed,

    /// I/O error on the socket.
    #[error("I/O error: {0}")]
    Io(String),
}

impl EventsError {
    /// True for errors caused by the caller rather than by the connection.
    ///
    /// `send_sync` and `send_async` return these as `Err`; everything else is
    /// collapsed into `Ok(false)`.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            EventsError::InvalidChannel { .. }
                | EventsError::InvalidRole(_)
                | EventsError::Serialization(_)
                | EventsError::FrameTooLarge { .. }
                | EventsError::NotInitialized
                | EventsError::AlreadyInitialized
                | EventsError::Closed
        )
    }
}

impl From<std::io::Error> for EventsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::AddrInUse => EventsError::AddressInUse(err.to_string()),
            std::io::ErrorKind::NotConnected => EventsError::NotConnected,
            _ => EventsError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for EventsError {
    fn from(err: serde_json::Error) -> Self {
        EventsError::Serialization(err.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T, E = EventsError> = std::result::Result<T, E>;
