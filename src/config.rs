//! Construction-time configuration for a [`Linker`](crate::Linker).
//!
//! Configuration can be built in code or deserialized from JSON; every field
//! except `role` and `channel` has a default.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EventsError;
use crate::ipc::DEFAULT_MAX_FRAME_SIZE;

/// Environment variable that enables debug tracing at construction.
pub const DEBUG_ENV: &str = "UNIXEVENTS_DEBUG";

/// Which end of the channel this instance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Binds the channel socket and accepts one peer at a time.
    Server,
    /// Connects to the channel socket and reconnects on failure.
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = EventsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(Role::Server),
            "client" => Ok(Role::Client),
            _ => Err(EventsError::InvalidRole(s.to_string())),
        }
    }
}

/// Client-side reconnection policy.
///
/// The delay before retry `n` (0-based) is `min(max_delay, base_delay * 2^n)`.
/// With `jitter` enabled a random extra in `[0, delay]` is added and the sum is
/// clamped to `max_delay`, which keeps observed delays non-decreasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    /// Consecutive failures tolerated before giving up.
    /// `None` retries until the instance is closed.
    pub max_attempts: Option<u32>,

    /// Randomize delays to avoid synchronized retries.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: None,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Short delays for peers expected to come back quickly.
    pub fn local() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            max_attempts: None,
            jitter: true,
        }
    }

    /// Long delays and no attempt limit.
    pub fn patient() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            max_attempts: None,
            jitter: true,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

/// Full configuration for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkerConfig {
    pub role: Role,
    pub channel: String,

    /// Emit trace lines for connection, frame and dispatch activity.
    #[serde(default = "debug_from_env")]
    pub debug: bool,

    /// Directory holding the channel socket; defaults to
    /// [`default_socket_dir`](crate::channel::default_socket_dir).
    #[serde(default)]
    pub socket_dir: Option<PathBuf>,

    /// Largest envelope accepted in either direction, in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl LinkerConfig {
    pub fn new(role: Role, channel: impl Into<String>) -> Self {
        Self {
            role,
            channel: channel.into(),
            debug: debug_from_env(),
            socket_dir: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn server(channel: impl Into<String>) -> Self {
        Self::new(Role::Server, channel)
    }

    pub fn client(channel: impl Into<String>) -> Self {
        Self::new(Role::Client, channel)
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = Some(dir.into());
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Resolve the socket path this configuration points at.
    pub fn socket_path(&self) -> Result<PathBuf, EventsError> {
        match &self.socket_dir {
            Some(dir) => crate::channel::resolve_in(dir, &self.channel),
            None => crate::channel::resolve(&self.channel),
        }
    }
}

fn debug_from_env() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

/// Serialize `Duration` as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
