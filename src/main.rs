//! unixevents - command line peer for an event bus channel.
//!
//! Runs one end of a channel, prints every event it listens for, and sends
//! each stdin line of the form `event payload-json` to the other side.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use unixevents::{Linker, LinkerConfig, Notice, ReconnectPolicy, Role};

#[derive(Parser)]
#[command(name = "unixevents", version, about = "Two-process event bus over a Unix socket")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Listen on a channel as the server.
    Serve(PeerArgs),
    /// Connect to a channel as the client.
    Connect(PeerArgs),
}

#[derive(Args)]
struct PeerArgs {
    /// Channel name
    channel: String,

    /// Event names to print when received
    #[arg(short, long = "listen", default_value = "message")]
    events: Vec<String>,

    /// Directory holding the socket file (default: $UNIXEVENTS_SOCKET_DIR, $XDG_RUNTIME_DIR)
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Give up after this many failed connection attempts (client only)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Log connection transitions, frames and dispatch
    #[arg(short, long)]
    debug: bool,
}

impl PeerArgs {
    fn config(&self, role: Role) -> LinkerConfig {
        let mut reconnect = ReconnectPolicy::default();
        if let Some(max_attempts) = self.max_attempts {
            reconnect = reconnect.with_max_attempts(max_attempts);
        }
        let mut config = LinkerConfig::new(role, self.channel.clone()).with_reconnect(reconnect);
        if self.debug {
            config = config.with_debug(true);
        }
        if let Some(dir) = &self.socket_dir {
            config = config.with_socket_dir(dir);
        }
        config
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "unixevents=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let (role, args) = match cli.command {
        Command::Serve(args) => (Role::Server, args),
        Command::Connect(args) => (Role::Client, args),
    };

    let linker = Linker::new();
    for event in &args.events {
        let name = event.clone();
        linker.receive(event, move |payload| println!("{name} {payload}"));
    }
    watch_notices(&linker);

    linker
        .init_with(args.config(role))
        .with_context(|| format!("Failed to start {role} on channel {:?}", args.channel))?;
    tracing::info!("unixevents v{} ready", env!("CARGO_PKG_VERSION"));

    if role == Role::Client && !linker.wait_connected(Duration::from_secs(1)) {
        tracing::info!("Server not up yet, lines are dropped until it connects");
    }

    for line in io::stdin().lock().lines() {
        let line = line.context("Failed to read stdin")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (event, payload) = parse_line(line)?;
        if !linker.send_sync(event, &payload)? {
            eprintln!("not delivered: {event}");
        }
    }

    linker.close();
    Ok(())
}

/// Split `event payload-json`. A payload that is not JSON is sent as a string.
fn parse_line(line: &str) -> Result<(&str, Value)> {
    let (event, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    if event.is_empty() {
        bail!("Missing event name in {line:?}");
    }
    let rest = rest.trim();
    let payload = if rest.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(rest).unwrap_or_else(|_| Value::String(rest.to_string()))
    };
    Ok((event, payload))
}

/// Print notices to stderr from a background thread.
fn watch_notices(linker: &Linker) {
    let mut notices = linker.notices();
    std::thread::spawn(move || loop {
        match notices.blocking_recv() {
            Ok(Notice::State(state)) => eprintln!("[{state}]"),
            Ok(Notice::Reconnecting { attempt, delay }) => {
                eprintln!("[retry {attempt} in {}ms]", delay.as_millis())
            }
            Ok(Notice::Error(e)) => eprintln!("[error] {e}"),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    });
}
