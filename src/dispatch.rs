//! Event-name to listener registry and the delivery thread.
//!
//! Incoming frames are handed to a dedicated OS thread that invokes the
//! registered listeners in registration order. Listeners never run on the
//! socket tasks, so a slow or blocking listener (including one that calls
//! `send_sync`) cannot stall reading from the connection.
//!
//! Send completion callbacks run on the same thread.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::error::{EventsError, Result};
use crate::ipc::Frame;
use crate::models::Notice;

/// A registered listener. Returning `Err` reports a listener failure without
/// affecting other listeners.
pub type Listener = Arc<dyn Fn(Value) -> anyhow::Result<()> + Send + Sync>;

/// Completion callback for a send.
pub type SendCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Handle returned by `receive`, used to remove exactly that registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    event: String,
    id: u64,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

struct Registration {
    id: u64,
    once: bool,
    listener: Listener,
}

/// Listener registry.
#[derive(Default)]
pub struct Dispatcher {
    registry: RwLock<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `event`. With `once` set the registration is
    /// removed before its first invocation.
    pub fn register(&self, event: &str, once: bool, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.write()
            .entry(event.to_string())
            .or_default()
            .push(Registration { id, once, listener });
        Subscription {
            event: event.to_string(),
            id,
        }
    }

    /// Remove one registration. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut registry = self.write();
        let Some(regs) = registry.get_mut(&subscription.event) else {
            return false;
        };
        let before = regs.len();
        regs.retain(|reg| reg.id != subscription.id);
        let removed = regs.len() != before;
        if regs.is_empty() {
            registry.remove(&subscription.event);
        }
        removed
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.read().get(event).map_or(0, Vec::len)
    }

    /// Deliver `payload` to every listener of `event`.
    ///
    /// Each listener gets its own copy of the payload. Failures are collected
    /// and returned; they never stop later listeners. Unknown events are
    /// dropped.
    pub fn dispatch(&self, event: &str, payload: Value) -> Vec<EventsError> {
        let targets = self.take_targets(event);
        let mut failures = Vec::new();
        let mut payload = Some(payload);

        for (i, listener) in targets.iter().enumerate() {
            let value = if i + 1 == targets.len() {
                payload.take().unwrap_or_default()
            } else {
                payload.clone().unwrap_or_default()
            };
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener(value)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => panic_message(panic.as_ref()),
            };
            failures.push(EventsError::ListenerError {
                event: event.to_string(),
                message,
            });
        }

        failures
    }

    /// Snapshot the listeners for `event`, consuming once-registrations.
    fn take_targets(&self, event: &str) -> Vec<Listener> {
        {
            let registry = self.read();
            match registry.get(event) {
                None => return Vec::new(),
                Some(regs) if !regs.iter().any(|reg| reg.once) => {
                    return regs.iter().map(|reg| Arc::clone(&reg.listener)).collect();
                }
                Some(_) => {}
            }
        }

        let mut registry = self.write();
        let Some(regs) = registry.get_mut(event) else {
            return Vec::new();
        };
        let targets = regs.iter().map(|reg| Arc::clone(&reg.listener)).collect();
        regs.retain(|reg| !reg.once);
        if regs.is_empty() {
            registry.remove(event);
        }
        targets
    }

    // Listeners run outside the lock, so poisoning cannot leave the map
    // half-updated.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<Registration>>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<Registration>>> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Work items for the delivery thread.
pub(crate) enum DispatchMsg {
    Frame(Frame),
    Callback(SendCallback, Result<()>),
    /// Finish pending callbacks, skip remaining frames, then exit.
    Stop,
}

/// Run a send callback, containing any panic.
pub(crate) fn run_callback(callback: SendCallback, outcome: Result<()>) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| callback(outcome))) {
        tracing::warn!("Send callback panicked: {}", panic_message(panic.as_ref()));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked".to_string()
    }
}

/// Handle to the delivery thread.
///
/// When shut down, sends `Stop` and waits briefly for the thread to exit.
pub(crate) struct DeliveryThread {
    tx: mpsc::UnboundedSender<DispatchMsg>,
    handle: Option<JoinHandle<()>>,
}

impl DeliveryThread {
    pub(crate) fn spawn(
        dispatcher: Arc<Dispatcher>,
        notices: broadcast::Sender<Notice>,
        debug: Arc<AtomicBool>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = thread::Builder::new()
            .name("unixevents-dispatch".to_string())
            .spawn(move || delivery_loop(dispatcher, rx, notices, debug))?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<DispatchMsg> {
        self.tx.clone()
    }

    /// Stop the thread. Safe to call from a listener running on it.
    pub(crate) fn shutdown(&mut self) {
        let _ = self.tx.send(DispatchMsg::Stop);

        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        // Never park an async executor worker; the thread exits on its own.
        if tokio::runtime::Handle::try_current().is_ok() {
            if !handle.is_finished() {
                tracing::debug!("Detaching delivery thread from async context");
            }
            return;
        }

        const QUICK_CHECK_INTERVAL: Duration = Duration::from_millis(10);
        const MAX_QUICK_CHECKS: u32 = 20;

        for _ in 0..MAX_QUICK_CHECKS {
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::warn!("Delivery thread panicked during shutdown");
                }
                return;
            }
            thread::sleep(QUICK_CHECK_INTERVAL);
        }
        tracing::debug!(
            "Delivery thread busy in a listener after {}ms, detaching",
            QUICK_CHECK_INTERVAL.as_millis() * MAX_QUICK_CHECKS as u128
        );
    }
}

fn delivery_loop(
    dispatcher: Arc<Dispatcher>,
    mut rx: mpsc::UnboundedReceiver<DispatchMsg>,
    notices: broadcast::Sender<Notice>,
    debug: Arc<AtomicBool>,
) {
    let mut stopping = false;

    while let Some(msg) = rx.blocking_recv() {
        match msg {
            DispatchMsg::Frame(_) if stopping => {}
            DispatchMsg::Frame(frame) => {
                trace_event!(debug, "Dispatching {:?}", frame.event);
                for failure in dispatcher.dispatch(&frame.event, frame.payload) {
                    tracing::warn!("{}", failure);
                    let _ = notices.send(Notice::Error(failure));
                }
            }
            DispatchMsg::Callback(callback, outcome) => run_callback(callback, outcome),
            DispatchMsg::Stop => {
                stopping = true;
                rx.close();
            }
        }
    }

    tracing::debug!("Delivery thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Listener {
        let log = Arc::clone(log);
        Arc::new(move |payload: Value| -> anyhow::Result<()> {
            log.lock().unwrap().push(format!("{tag}:{payload}"));
            Ok(())
        })
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register("greet", false, recorder(&log, "a"));
        dispatcher.register("greet", false, recorder(&log, "b"));

        let failures = dispatcher.dispatch("greet", json!({"name": "Alice"}));
        assert!(failures.is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                r#"a:{"name":"Alice"}"#.to_string(),
                r#"b:{"name":"Alice"}"#.to_string()
            ]
        );
    }

    #[test]
    fn test_once_listener_fires_once() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register("tick", true, recorder(&log, "once"));
        dispatcher.register("tick", false, recorder(&log, "always"));

        dispatcher.dispatch("tick", json!(1));
        dispatcher.dispatch("tick", json!(2));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["once:1", "always:1", "always:2"]
        );
        assert_eq!(dispatcher.listener_count("tick"), 1);
    }

    #[test]
    fn test_unknown_event_is_dropped() {
        let dispatcher = Dispatcher::new();
        assert!(dispatcher.dispatch("nobody", json!(null)).is_empty());
    }

    #[test]
    fn test_unsubscribe_removes_only_that_registration() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = dispatcher.register("e", false, recorder(&log, "first"));
        dispatcher.register("e", false, recorder(&log, "second"));

        assert!(dispatcher.unsubscribe(&first));
        assert!(!dispatcher.unsubscribe(&first));
        dispatcher.dispatch("e", json!(0));
        assert_eq!(*log.lock().unwrap(), vec!["second:0"]);
    }

    #[test]
    fn test_failing_listener_does_not_stop_others() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register(
            "e",
            false,
            Arc::new(|_: Value| -> anyhow::Result<()> { panic!("boom") }),
        );
        dispatcher.register(
            "e",
            false,
            Arc::new(|_: Value| -> anyhow::Result<()> { Err(anyhow::anyhow!("bad input")) }),
        );
        dispatcher.register("e", false, recorder(&log, "ok"));

        let failures = dispatcher.dispatch("e", json!(true));
        assert_eq!(
            failures,
            vec![
                EventsError::ListenerError {
                    event: "e".to_string(),
                    message: "boom".to_string()
                },
                EventsError::ListenerError {
                    event: "e".to_string(),
                    message: "bad input".to_string()
                },
            ]
        );
        assert_eq!(*log.lock().unwrap(), vec!["ok:true"]);
    }

    #[test]
    fn test_listener_may_register_during_dispatch() {
        let dispatcher = Arc::new(Dispatcher::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = Arc::clone(&dispatcher);
        let inner_log = Arc::clone(&log);
        dispatcher.register(
            "e",
            true,
            Arc::new(move |_: Value| -> anyhow::Result<()> {
                inner.register("e", false, recorder(&inner_log, "late"));
                Ok(())
            }),
        );

        dispatcher.dispatch("e", json!(1));
        dispatcher.dispatch("e", json!(2));
        assert_eq!(*log.lock().unwrap(), vec!["late:2"]);
    }

    #[test]
    fn test_delivery_thread_runs_frames_and_callbacks() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (notices, mut notice_rx) = broadcast::channel(8);
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        let frame_tx = done_tx.clone();
        dispatcher.register(
            "e",
            false,
            Arc::new(move |payload: Value| -> anyhow::Result<()> {
                frame_tx.send(format!("frame:{payload}")).unwrap();
                Err(anyhow::anyhow!("reported"))
            }),
        );

        let mut thread =
            DeliveryThread::spawn(dispatcher, notices, Arc::new(AtomicBool::new(true))).unwrap();
        let tx = thread.sender();
        tx.send(DispatchMsg::Frame(Frame::new("e", json!(7)))).unwrap();
        tx.send(DispatchMsg::Callback(
            Box::new(move |outcome: Result<()>| done_tx.send(format!("callback:{outcome:?}")).unwrap()),
            Ok(()),
        ))
        .unwrap();

        let timeout = Duration::from_secs(2);
        assert_eq!(done_rx.recv_timeout(timeout).unwrap(), "frame:7");
        assert_eq!(done_rx.recv_timeout(timeout).unwrap(), "callback:Ok(())");
        assert!(matches!(
            notice_rx.try_recv(),
            Ok(Notice::Error(EventsError::ListenerError { .. }))
        ));

        thread.shutdown();
        assert!(tx.send(DispatchMsg::Stop).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_in_async_context_does_not_wait_for_busy_listener() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (notices, _) = broadcast::channel(8);
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        dispatcher.register(
            "slow",
            false,
            Arc::new(move |_: Value| -> anyhow::Result<()> {
                started_tx.send(()).unwrap();
                let _ = release_rx.lock().unwrap().recv();
                Ok(())
            }),
        );

        let mut thread =
            DeliveryThread::spawn(dispatcher, notices, Arc::new(AtomicBool::new(false))).unwrap();
        thread
            .sender()
            .send(DispatchMsg::Frame(Frame::new("slow", json!(null))))
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let started = std::time::Instant::now();
        thread.shutdown();
        assert!(started.elapsed() < Duration::from_millis(100), "{:?}", started.elapsed());
        release_tx.send(()).unwrap();
    }
}
