//! Channel name to socket path resolution.
//!
//! A server and a client using the same channel name (and the same socket
//! directory) always resolve to the same path.

use std::path::{Path, PathBuf};

use crate::error::{EventsError, Result};

/// Environment variable overriding the socket directory.
pub const SOCKET_DIR_ENV: &str = "UNIXEVENTS_SOCKET_DIR";

/// Suffix appended to every channel name.
pub const SOCKET_SUFFIX: &str = ".sock";

/// Longest accepted channel name.
const MAX_CHANNEL_LEN: usize = 64;

/// `sun_path` is 104 bytes on macOS and 108 on Linux; use the smaller one.
const MAX_SOCKET_PATH: usize = 104;

/// Resolve the default directory for channel sockets.
///
/// Resolution order:
/// 1. `$UNIXEVENTS_SOCKET_DIR`
/// 2. `$XDG_RUNTIME_DIR` (Linux standard, per-user)
/// 3. The platform cache directory (`~/Library/Caches` on macOS)
/// 4. `/tmp`
pub fn default_socket_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(SOCKET_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir);
    }

    if let Some(cache_dir) = dirs::cache_dir() {
        return cache_dir;
    }

    PathBuf::from("/tmp")
}

/// Resolve `channel` in the default socket directory.
pub fn resolve(channel: &str) -> Result<PathBuf> {
    resolve_in(&default_socket_dir(), channel)
}

/// Resolve `channel` inside `dir`.
///
/// Pure: the same inputs always produce the same path.
///
/// # Errors
///
/// Returns `EventsError::InvalidChannel` if the name is empty, too long,
/// starts with a dot, contains characters outside `[A-Za-z0-9._-]`, or if the
/// resulting path would not fit in a socket address.
pub fn resolve_in(dir: &Path, channel: &str) -> Result<PathBuf> {
    validate(channel)?;

    let path = dir.join(format!("{channel}{SOCKET_SUFFIX}"));
    let path_len = path.as_os_str().len();
    if path_len >= MAX_SOCKET_PATH {
        return Err(invalid(
            channel,
            format!(
                "socket path too long ({path_len} bytes, max {}): {}",
                MAX_SOCKET_PATH - 1,
                path.display()
            ),
        ));
    }

    Ok(path)
}

fn validate(channel: &str) -> Result<()> {
    if channel.is_empty() {
        return Err(invalid(channel, "empty name".to_string()));
    }
    if channel.len() > MAX_CHANNEL_LEN {
        return Err(invalid(
            channel,
            format!("longer than {MAX_CHANNEL_LEN} characters"),
        ));
    }
    if channel.starts_with('.') {
        return Err(invalid(channel, "must not start with '.'".to_string()));
    }
    if let Some(bad) = channel
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(invalid(channel, format!("unsupported character {bad:?}")));
    }
    Ok(())
}

fn invalid(channel: &str, reason: String) -> EventsError {
    EventsError::InvalidChannel {
        channel: channel.to_string(),
        reason,
    }
}
