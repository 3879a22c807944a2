//! UnixEvents Library
//!
//! An event bus between exactly two processes over one Unix domain socket:
//!
//! - `linker` - the [`Linker`] facade: init, receive, send, close
//! - `ipc` - frame codec, connection sessions and reconnection
//! - `dispatch` - event-name to listener registry and delivery thread
//! - `pipeline` - ordered single-writer send path
//! - `channel` - channel name to socket path resolution
//! - `config` / `models` / `error` - configuration, state and errors
//!
//! # Example
//!
//! ```ignore
//! use unixevents::Linker;
//! use serde_json::json;
//!
//! let server = Linker::server("chat")?;
//! server.receive("greet", |payload| println!("hello {payload}"));
//!
//! let client = Linker::client("chat")?;
//! assert!(client.send_sync("greet", &json!({"name": "Alice"}))?);
//! ```

/// Emit an instance trace line: `debug!` when the instance is in debug mode,
/// `trace!` otherwise.
macro_rules! trace_event {
    ($debug:expr, $($arg:tt)+) => {
        if $debug.load(::std::sync::atomic::Ordering::Relaxed) {
            ::tracing::debug!($($arg)+);
        } else {
            ::tracing::trace!($($arg)+);
        }
    };
}

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ipc;
pub mod linker;
pub mod models;
mod pipeline;

pub use config::{LinkerConfig, ReconnectPolicy, Role};
pub use dispatch::Subscription;
pub use error::EventsError;
pub use linker::Linker;
pub use models::{ConnectionState, Notice};
