//! Integration tests for the event bus over real Unix domain sockets.
//!
//! Every test uses its own temporary socket directory, so tests can run in
//! parallel without sharing channels.
//!
//! # Running
//!
//! ```bash
//! cargo test --test ipc_integration -- --nocapture
//! ```

use std::io::Write;
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream};
use std::path::Path;
use std::sync::{mpsc, Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::sync::broadcast::{self, error::TryRecvError};

use unixevents::ipc::{encode, DEFAULT_MAX_FRAME_SIZE};
use unixevents::{
    ConnectionState, EventsError, Linker, LinkerConfig, Notice, ReconnectPolicy,
};

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy::default().with_delays(Duration::from_millis(20), Duration::from_millis(200))
}

fn server_config(dir: &Path, channel: &str) -> LinkerConfig {
    LinkerConfig::server(channel).with_socket_dir(dir)
}

fn client_config(dir: &Path, channel: &str) -> LinkerConfig {
    LinkerConfig::client(channel)
        .with_socket_dir(dir)
        .with_reconnect(fast_policy())
}

fn start_server(dir: &Path, channel: &str) -> Linker {
    Linker::with_config(server_config(dir, channel)).expect("server should start")
}

fn start_client(dir: &Path, channel: &str) -> Linker {
    let client = Linker::with_config(client_config(dir, channel)).expect("client should start");
    assert!(client.wait_connected(TIMEOUT), "client did not connect");
    client
}

/// Register a listener that forwards payloads into a channel.
fn collect(linker: &Linker, event: &str) -> mpsc::Receiver<Value> {
    let (tx, rx) = mpsc::channel();
    linker.receive(event, move |payload| {
        let _ = tx.send(payload);
    });
    rx
}

/// Poll `notices` until `matches` accepts one or the timeout expires.
fn wait_for_notice(
    notices: &mut broadcast::Receiver<Notice>,
    matches: impl Fn(&Notice) -> bool,
) -> Option<Notice> {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        match notices.try_recv() {
            Ok(notice) if matches(&notice) => return Some(notice),
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => return None,
            Err(TryRecvError::Empty) => {
                if Instant::now() >= deadline {
                    return None;
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
    }
}

#[test]
fn test_event_delivered_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path(), "greetings");
    let greetings = collect(&server, "greet");
    let client = start_client(dir.path(), "greetings");

    assert_eq!(client.send_sync("greet", &json!({"name": "Alice"})), Ok(true));

    assert_eq!(greetings.recv_timeout(TIMEOUT).unwrap(), json!({"name": "Alice"}));
    assert!(greetings.recv_timeout(QUIET).is_err());
}

#[test]
fn test_server_sends_to_client() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path(), "reverse");
    let client = start_client(dir.path(), "reverse");
    let replies = collect(&client, "reply");
    assert!(server.wait_connected(TIMEOUT));

    assert_eq!(server.send_sync("reply", &json!([1, 2, 3])), Ok(true));
    assert_eq!(replies.recv_timeout(TIMEOUT).unwrap(), json!([1, 2, 3]));
}

#[test]
fn test_sends_arrive_in_program_order() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path(), "ordered");
    let numbers = collect(&server, "n");
    let client = start_client(dir.path(), "ordered");

    for i in 0..200 {
        client.send("n", &json!(i)).unwrap();
    }
    assert_eq!(client.send_sync("n", &json!(200)), Ok(true));

    let received: Vec<Value> = (0..=200)
        .map(|_| numbers.recv_timeout(TIMEOUT).unwrap())
        .collect();
    let expected: Vec<Value> = (0..=200).map(|i| json!(i)).collect();
    assert_eq!(received, expected);
}

#[test]
fn test_receive_once_fires_once() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path(), "once");
    let (tx, rx) = mpsc::channel();
    server.receive_once("tick", move |payload| {
        let _ = tx.send(payload);
    });
    let all = collect(&server, "tick");
    let client = start_client(dir.path(), "once");

    assert_eq!(client.send_sync("tick", &json!(1)), Ok(true));
    assert_eq!(client.send_sync("tick", &json!(2)), Ok(true));

    assert_eq!(all.recv_timeout(TIMEOUT).unwrap(), json!(1));
    assert_eq!(all.recv_timeout(TIMEOUT).unwrap(), json!(2));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), json!(1));
    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path(), "unsub");
    let (tx, rx) = mpsc::channel();
    let subscription = server.receive("e", move |payload| {
        let _ = tx.send(payload);
    });
    let client = start_client(dir.path(), "unsub");

    assert_eq!(client.send_sync("e", &json!("first")), Ok(true));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), json!("first"));

    assert!(server.unsubscribe(&subscription));
    assert!(!server.unsubscribe(&subscription));
    assert_eq!(client.send_sync("e", &json!("second")), Ok(true));
    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn test_send_sync_without_server_returns_false() {
    let dir = tempfile::tempdir().unwrap();
    let client = Linker::new();
    assert!(client.init_with(client_config(dir.path(), "nobody")).is_ok());

    assert_eq!(client.send_sync("greet", &json!({})), Ok(false));
    assert_ne!(client.state(), ConnectionState::Connected);
}

#[test]
fn test_close_unblocks_pending_send_sync() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stuck.sock");

    // A peer that accepts but never reads, so the client's writes block.
    let listener = StdUnixListener::bind(&path).unwrap();
    let (hold_tx, hold_rx) = mpsc::channel();
    thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            let _ = hold_rx.recv();
            drop(stream);
        }
    });

    let client = Arc::new(start_client(dir.path(), "stuck"));
    let sender = Arc::clone(&client);
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let big = "x".repeat(1024 * 1024);
        let outcome = loop {
            match sender.send_sync("big", &big) {
                Ok(true) => continue,
                other => break other,
            }
        };
        let _ = done_tx.send(outcome);
    });

    assert!(done_rx.recv_timeout(QUIET).is_err(), "send_sync should be blocked");
    client.close();

    let outcome = done_rx.recv_timeout(TIMEOUT).expect("send_sync still blocked");
    assert!(matches!(outcome, Ok(false) | Err(EventsError::Closed)));
    let _ = hold_tx.send(());
}

#[test]
fn test_client_started_before_server() {
    let dir = tempfile::tempdir().unwrap();
    let client = Linker::new();
    let mut notices = client.notices();
    assert!(client.init_with(client_config(dir.path(), "late")).is_ok());

    thread::sleep(Duration::from_millis(400));
    let server = start_server(dir.path(), "late");
    let greetings = collect(&server, "greet");
    assert!(client.wait_connected(TIMEOUT));

    let mut delays = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        if let Notice::Reconnecting { delay, .. } = notice {
            delays.push(delay);
        }
    }
    assert!(!delays.is_empty());
    assert!(delays.windows(2).all(|w| w[0] <= w[1]), "delays decreased: {delays:?}");
    assert!(delays.iter().all(|d| *d <= Duration::from_millis(200)));

    assert_eq!(client.send_sync("greet", &json!({"name": "Bob"})), Ok(true));
    assert_eq!(greetings.recv_timeout(TIMEOUT).unwrap(), json!({"name": "Bob"}));
}

#[test]
fn test_client_reconnects_after_server_restart() {
    let dir = tempfile::tempdir().unwrap();
    let first = start_server(dir.path(), "restart");
    let client = start_client(dir.path(), "restart");
    let pongs = collect(&client, "pong");

    first.close();
    let deadline = Instant::now() + TIMEOUT;
    while client.is_connected() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(client.send_sync("ping", &json!(1)), Ok(false));

    let second = start_server(dir.path(), "restart");
    let pings = collect(&second, "ping");
    assert!(client.wait_connected(TIMEOUT));
    assert!(second.wait_connected(TIMEOUT));

    assert_eq!(client.send_sync("ping", &json!(2)), Ok(true));
    assert_eq!(pings.recv_timeout(TIMEOUT).unwrap(), json!(2));

    assert_eq!(second.send_sync("pong", &json!(3)), Ok(true));
    assert_eq!(pongs.recv_timeout(TIMEOUT).unwrap(), json!(3));
}

#[test]
fn test_second_server_gets_address_in_use() {
    let dir = tempfile::tempdir().unwrap();
    let first = start_server(dir.path(), "taken");

    let second = Linker::with_config(server_config(dir.path(), "taken"));
    assert!(matches!(second, Err(EventsError::AddressInUse(_))));

    assert!(first.socket_path().unwrap().exists());
    let client = start_client(dir.path(), "taken");
    assert_eq!(client.send_sync("still", &json!("up")), Ok(true));
}

#[test]
fn test_stale_socket_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stale.sock");
    drop(StdUnixListener::bind(&path).unwrap());
    assert!(path.exists());

    let server = start_server(dir.path(), "stale");
    let greetings = collect(&server, "greet");
    let client = start_client(dir.path(), "stale");
    assert_eq!(client.send_sync("greet", &json!(null)), Ok(true));
    assert_eq!(greetings.recv_timeout(TIMEOUT).unwrap(), Value::Null);
}

#[test]
fn test_socket_removed_on_close_and_drop() {
    let dir = tempfile::tempdir().unwrap();

    let server = start_server(dir.path(), "closed");
    let path = server.socket_path().unwrap();
    assert!(path.exists());
    server.close();
    assert!(!path.exists());

    let dropped = start_server(dir.path(), "dropped");
    let path = dropped.socket_path().unwrap();
    drop(dropped);
    assert!(!path.exists());
}

#[test]
fn test_gives_up_after_max_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let client = Linker::new();
    let mut notices = client.notices();
    let config = LinkerConfig::client("absent")
        .with_socket_dir(dir.path())
        .with_reconnect(fast_policy().with_max_attempts(3));
    assert!(client.init_with(config).is_ok());

    let failed = wait_for_notice(&mut notices, |n| matches!(n, Notice::Error(_)));
    assert_eq!(
        failed,
        Some(Notice::Error(EventsError::ConnectionFailed { attempts: 3 }))
    );
    assert_eq!(client.state(), ConnectionState::Failed);
    assert_eq!(client.send_sync("e", &json!(1)), Ok(false));
}

#[test]
fn test_failing_listener_is_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path(), "faulty");
    let mut notices = server.notices();
    server.receive("e", |_| panic!("listener exploded"));
    let survivors = collect(&server, "e");
    let client = start_client(dir.path(), "faulty");

    assert_eq!(client.send_sync("e", &json!(1)), Ok(true));
    assert_eq!(client.send_sync("e", &json!(2)), Ok(true));

    assert_eq!(survivors.recv_timeout(TIMEOUT).unwrap(), json!(1));
    assert_eq!(survivors.recv_timeout(TIMEOUT).unwrap(), json!(2));
    let failure = wait_for_notice(&mut notices, |n| {
        matches!(n, Notice::Error(EventsError::ListenerError { .. }))
    });
    assert_eq!(
        failure,
        Some(Notice::Error(EventsError::ListenerError {
            event: "e".to_string(),
            message: "listener exploded".to_string(),
        }))
    );
}

#[test]
fn test_listener_can_reply_with_send_sync() {
    let dir = tempfile::tempdir().unwrap();
    let server = Arc::new(start_server(dir.path(), "echo"));
    let weak: Weak<Linker> = Arc::downgrade(&server);
    server.receive("ping", move |payload| {
        if let Some(server) = weak.upgrade() {
            let _ = server.send_sync("pong", &payload);
        }
    });

    let client = start_client(dir.path(), "echo");
    let pongs = collect(&client, "pong");
    assert_eq!(client.send_sync("ping", &json!({"seq": 7})), Ok(true));
    assert_eq!(pongs.recv_timeout(TIMEOUT).unwrap(), json!({"seq": 7}));
}

#[test]
fn test_typed_receive() {
    #[derive(Debug, PartialEq, serde::Deserialize)]
    struct Greeting {
        name: String,
    }

    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path(), "typed");
    let (tx, rx) = mpsc::channel();
    server.receive_as("greet", move |greeting: Greeting| {
        let _ = tx.send(greeting);
    });
    let client = start_client(dir.path(), "typed");

    assert_eq!(client.send_sync("greet", &json!({"name": 42})), Ok(true));
    assert_eq!(client.send_sync("greet", &json!({"name": "Alice"})), Ok(true));
    assert_eq!(
        rx.recv_timeout(TIMEOUT).unwrap(),
        Greeting {
            name: "Alice".to_string()
        }
    );
}

#[test]
fn test_extra_peer_does_not_disturb_session() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path(), "pair");
    let messages = collect(&server, "m");
    let first = start_client(dir.path(), "pair");
    assert!(server.wait_connected(TIMEOUT));

    let intruder = Linker::new();
    assert!(intruder.init_with(client_config(dir.path(), "pair")).is_ok());
    thread::sleep(QUIET);
    intruder.close();

    assert_eq!(first.send_sync("m", &json!("hello")), Ok(true));
    assert_eq!(messages.recv_timeout(TIMEOUT).unwrap(), json!("hello"));
    assert_eq!(server.state(), ConnectionState::Connected);
}

#[test]
fn test_send_with_reports_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path(), "callbacks");
    let client = start_client(dir.path(), "callbacks");

    let (tx, rx) = mpsc::channel();
    client
        .send_with("e", &json!(1), move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Ok(()));

    server.close();
    let deadline = Instant::now() + TIMEOUT;
    while client.is_connected() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    let (tx, rx) = mpsc::channel();
    client
        .send_with("e", &json!(2), move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Err(EventsError::NotConnected));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let server = Linker::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    server.receive("greet", move |payload| {
        let _ = tx.send(payload);
    });
    server
        .init_with_async(server_config(dir.path(), "async"))
        .await
        .unwrap();

    let client = Linker::new();
    client
        .init_with_async(client_config(dir.path(), "async"))
        .await
        .unwrap();
    assert!(client.wait_connected_async(TIMEOUT).await);

    assert_eq!(client.send_async("greet", &json!({"name": "Alice"})).await, Ok(true));
    let payload = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap();
    assert_eq!(payload, Some(json!({"name": "Alice"})));

    client.close();
    assert_eq!(
        client.send_async("greet", &json!(1)).await,
        Err(EventsError::Closed)
    );
}

#[test]
fn test_corrupt_frame_drops_connection_with_blocked_writer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wedged.sock");

    // A peer that never reads, then sends garbage once the client's writes stall.
    let listener = StdUnixListener::bind(&path).unwrap();
    let (corrupt_tx, corrupt_rx) = mpsc::channel::<()>();
    let (hold_tx, hold_rx) = mpsc::channel::<()>();
    thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let _ = corrupt_rx.recv();
            let _ = stream.write_all(&[0, 0, 0, 0]);
            let _ = hold_rx.recv();
        }
    });

    let client = Arc::new(
        Linker::with_config(
            LinkerConfig::client("wedged")
                .with_socket_dir(dir.path())
                .with_reconnect(ReconnectPolicy::default().with_delays(
                    Duration::from_secs(30),
                    Duration::from_secs(60),
                )),
        )
        .unwrap(),
    );
    assert!(client.wait_connected(TIMEOUT));
    let mut notices = client.notices();

    let sender = Arc::clone(&client);
    thread::spawn(move || {
        let big = "x".repeat(1024 * 1024);
        while let Ok(true) = sender.send_sync("big", &big) {}
    });
    thread::sleep(QUIET);
    corrupt_tx.send(()).unwrap();

    let corrupt = wait_for_notice(&mut notices, |n| {
        matches!(n, Notice::Error(EventsError::CorruptFrame(_)))
    });
    assert!(corrupt.is_some());
    let deadline = Instant::now() + TIMEOUT;
    while client.is_connected() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_ne!(client.state(), ConnectionState::Connected);

    client.close();
    let _ = hold_tx.send(());
}

#[test]
fn test_close_during_long_backoff_is_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let client = Linker::new();
    let mut notices = client.notices();
    let config = LinkerConfig::client("slow")
        .with_socket_dir(dir.path())
        .with_reconnect(
            ReconnectPolicy::default().with_delays(Duration::from_secs(30), Duration::from_secs(60)),
        );
    assert!(client.init_with(config).is_ok());

    let backing_off = wait_for_notice(&mut notices, |n| {
        matches!(n, Notice::State(ConnectionState::BackingOff))
    });
    assert!(backing_off.is_some());

    let started = Instant::now();
    client.close();
    assert!(started.elapsed() < Duration::from_secs(1), "close took {:?}", started.elapsed());
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[test]
fn test_frames_batched_in_one_write_dispatch_separately() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path(), "batched");
    let (tx, once) = mpsc::channel();
    server.receive_once("tick", move |payload| {
        let _ = tx.send(payload);
    });
    let all = collect(&server, "tick");

    let path = server.socket_path().unwrap();
    let mut peer = UnixStream::connect(&path).unwrap();
    let mut batch = encode("tick", &json!(1), DEFAULT_MAX_FRAME_SIZE).unwrap();
    batch.extend(encode("tick", &json!(2), DEFAULT_MAX_FRAME_SIZE).unwrap());
    peer.write_all(&batch).unwrap();

    assert_eq!(all.recv_timeout(TIMEOUT).unwrap(), json!(1));
    assert_eq!(all.recv_timeout(TIMEOUT).unwrap(), json!(2));
    assert_eq!(once.recv_timeout(TIMEOUT).unwrap(), json!(1));
    assert!(once.recv_timeout(QUIET).is_err());
}
