//! The public [`Linker`] facade.
//!
//! A `Linker` is one end of an event bus channel. It is created idle, started
//! with one of the `init` methods, and stopped with [`Linker::close`] (or by
//! dropping it). Listeners can be registered at any time, including before
//! `init`.
//!
//! # Threads
//!
//! An initialized instance owns a small tokio runtime for socket I/O and one
//! delivery thread on which listeners and send callbacks run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::{LinkerConfig, Role};
use crate::dispatch::{DeliveryThread, Dispatcher, Subscription};
use crate::error::{EventsError, Result};
use crate::ipc::transport::{self, Shutdown, Transport};
use crate::ipc::reconnect;
use crate::models::{ConnectionState, Notice};
use crate::pipeline::{self, Completion, Outlet, SendPipeline};

/// Buffered notices per subscriber before it starts lagging.
const NOTICE_CAPACITY: usize = 256;

/// How long `close()` waits for I/O tasks to wind down.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

const IO_WORKER_THREADS: usize = 2;

/// One end of an event bus channel.
///
/// # Example
///
/// ```ignore
/// use unixevents::Linker;
///
/// let linker = Linker::new();
/// linker.receive("greet", |payload| println!("{payload}"));
/// if !linker.init("server", "chat") {
///     eprintln!("could not start");
/// }
/// ```
pub struct Linker {
    dispatcher: Arc<Dispatcher>,
    notices: broadcast::Sender<Notice>,
    debug: Arc<AtomicBool>,
    lifecycle: Mutex<Lifecycle>,
}

enum Lifecycle {
    Idle,
    Running(Box<Running>),
    Closed,
}

/// Resources of an initialized instance.
struct Running {
    config: LinkerConfig,
    path: PathBuf,
    runtime: Option<Runtime>,
    transport: Arc<Transport>,
    pipeline: Arc<SendPipeline>,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    delivery: DeliveryThread,
}

impl Default for Linker {
    fn default() -> Self {
        Self::new()
    }
}

impl Linker {
    /// Create an uninitialized instance.
    pub fn new() -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            dispatcher: Arc::new(Dispatcher::new()),
            notices,
            debug: Arc::new(AtomicBool::new(false)),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    /// Create and initialize an instance from a full configuration.
    pub fn with_config(config: LinkerConfig) -> Result<Self> {
        let linker = Self::new();
        linker.init_with(config)?;
        Ok(linker)
    }

    /// Create a server bound to `channel` with default settings.
    pub fn server(channel: &str) -> Result<Self> {
        Self::with_config(LinkerConfig::server(channel))
    }

    /// Create a client for `channel` with default settings.
    pub fn client(channel: &str) -> Result<Self> {
        Self::with_config(LinkerConfig::client(channel))
    }

    // ---- lifecycle -------------------------------------------------------

    /// Start the instance as `role` ("server" or "client") on `channel`.
    ///
    /// Returns false for an invalid role or channel, an address already in
    /// use, or an instance that was already initialized or closed. A client
    /// returns true even when no server is listening yet; it keeps retrying
    /// in the background.
    ///
    /// Inside an async context this does not wait for the client's first
    /// connection attempt; prefer [`Linker::init_async`] there.
    pub fn init(&self, role: &str, channel: &str) -> bool {
        let result = role
            .parse::<Role>()
            .and_then(|role| self.init_with(LinkerConfig::new(role, channel)));
        self.report_init(result)
    }

    /// Async form of [`Linker::init`].
    pub async fn init_async(&self, role: &str, channel: &str) -> bool {
        let result = match role.parse::<Role>() {
            Ok(role) => self.init_with_async(LinkerConfig::new(role, channel)).await,
            Err(e) => Err(e),
        };
        self.report_init(result)
    }

    /// Start the instance from a full configuration.
    ///
    /// For a client this returns once the first connection attempt has
    /// settled, so a server that is already listening is connected on return.
    pub fn init_with(&self, config: LinkerConfig) -> Result<()> {
        let Some(first_attempt) = self.start(config)? else {
            return Ok(());
        };
        if Handle::try_current().is_ok() {
            tracing::debug!("init called inside an async context, not waiting for first connect");
            return Ok(());
        }
        let _ = first_attempt.blocking_recv();
        Ok(())
    }

    /// Async form of [`Linker::init_with`].
    pub async fn init_with_async(&self, config: LinkerConfig) -> Result<()> {
        if let Some(first_attempt) = self.start(config)? {
            let _ = first_attempt.await;
        }
        Ok(())
    }

    fn report_init(&self, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("init failed: {}", e);
                false
            }
        }
    }

    /// Bring up the runtime, delivery thread and I/O tasks.
    ///
    /// Returns the first-attempt signal for clients.
    fn start(&self, config: LinkerConfig) -> Result<Option<oneshot::Receiver<()>>> {
        let mut lifecycle = self.lifecycle();
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running(_) => return Err(EventsError::AlreadyInitialized),
            Lifecycle::Closed => return Err(EventsError::Closed),
        }

        let path = config.socket_path()?;
        if config.debug {
            self.debug.store(true, Ordering::Relaxed);
        }
        let listener = match config.role {
            Role::Server => Some(transport::bind(&path)?),
            Role::Client => None,
        };

        let resources = DeliveryThread::spawn(
            Arc::clone(&self.dispatcher),
            self.notices.clone(),
            Arc::clone(&self.debug),
        )
        .and_then(|delivery| build_runtime().map(|runtime| (delivery, runtime)));
        let (delivery, runtime) = match resources {
            Ok(resources) => resources,
            Err(e) => {
                if listener.is_some() {
                    let _ = transport::remove_socket(&path);
                }
                return Err(e.into());
            }
        };

        let (state_tx, state) = watch::channel(ConnectionState::Idle);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let transport = Arc::new(Transport::new(
            path.clone(),
            config.max_frame_size,
            state_tx,
            delivery.sender(),
            self.notices.clone(),
            Arc::clone(&self.debug),
        ));

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(SendPipeline::new(
            queue_tx,
            state.clone(),
            Outlet::new(delivery.sender(), self.notices.clone()),
            config.max_frame_size,
            Arc::clone(&self.debug),
        ));
        runtime.spawn(pipeline::run_writer(
            Arc::clone(&transport),
            queue_rx,
            Shutdown::new(shutdown_rx.clone()),
        ));

        let first_attempt = match listener {
            Some(listener) => {
                runtime.spawn(
                    Arc::clone(&transport).accept_loop(listener, Shutdown::new(shutdown_rx)),
                );
                None
            }
            None => {
                let (tx, rx) = oneshot::channel();
                runtime.spawn(reconnect::run_client(
                    Arc::clone(&transport),
                    config.reconnect.clone(),
                    Shutdown::new(shutdown_rx),
                    tx,
                ));
                Some(rx)
            }
        };

        tracing::info!("Initialized {} on {}", config.role, path.display());
        *lifecycle = Lifecycle::Running(Box::new(Running {
            config,
            path,
            runtime: Some(runtime),
            transport,
            pipeline,
            state,
            shutdown,
            delivery,
        }));
        Ok(first_attempt)
    }

    /// Shut the instance down.
    ///
    /// Stops reconnecting, closes the connection, completes queued sends with
    /// failure, unblocks waiting `send_sync` callers and removes the server's
    /// socket file. Calling it again is a no-op. A closed instance cannot be
    /// initialized again.
    pub fn close(&self) {
        let running = {
            let mut lifecycle = self.lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Closed) {
                Lifecycle::Running(running) => running,
                _ => return,
            }
        };
        running.shutdown();
    }

    // ---- receiving -------------------------------------------------------

    /// Register a listener for `event`.
    ///
    /// Listeners for the same event run in registration order on the
    /// delivery thread, each with its own copy of the payload.
    pub fn receive<F>(&self, event: &str, listener: F) -> Subscription
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.dispatcher.register(
            event,
            false,
            Arc::new(move |payload: Value| -> anyhow::Result<()> {
                listener(payload);
                Ok(())
            }),
        )
    }

    /// Register a listener that fires at most once.
    pub fn receive_once<F>(&self, event: &str, listener: F) -> Subscription
    where
        F: FnOnce(Value) + Send + 'static,
    {
        let slot = Mutex::new(Some(listener));
        self.dispatcher.register(
            event,
            true,
            Arc::new(move |payload: Value| -> anyhow::Result<()> {
                let listener = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(listener) = listener {
                    listener(payload);
                }
                Ok(())
            }),
        )
    }

    /// Register a fallible listener. An `Err` is reported as
    /// [`EventsError::ListenerError`] on the notice channel.
    pub fn try_receive<F>(&self, event: &str, listener: F) -> Subscription
    where
        F: Fn(Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.register(event, false, Arc::new(listener))
    }

    /// Register a listener for a typed payload.
    ///
    /// Payloads that do not deserialize into `T` are reported as listener
    /// errors and the listener is not called.
    pub fn receive_as<T, F>(&self, event: &str, listener: F) -> Subscription
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let name = event.to_string();
        self.try_receive(event, move |payload| {
            let value: T = serde_json::from_value(payload).with_context(|| {
                format!(
                    "payload for {:?} is not a {}",
                    name,
                    std::any::type_name::<T>()
                )
            })?;
            listener(value);
            Ok(())
        })
    }

    /// Remove a registration. Returns false if it was already removed.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.dispatcher.unsubscribe(subscription)
    }

    // ---- sending ---------------------------------------------------------

    /// Send an event without waiting.
    ///
    /// Failures after this returns (no peer, broken connection) are reported
    /// on the notice channel.
    ///
    /// # Errors
    ///
    /// `Serialization` or `FrameTooLarge` for an unsendable payload,
    /// `NotInitialized` or `Closed` for an instance that is not running.
    pub fn send<T: Serialize + ?Sized>(&self, event: &str, payload: &T) -> Result<()> {
        let pipeline = self.pipeline()?;
        let frame = pipeline.encode(event, payload)?;
        pipeline.submit(event, frame, Completion::Report);
        Ok(())
    }

    /// Send an event and call `callback` exactly once with the outcome.
    ///
    /// The callback runs on the delivery thread. It is not called when this
    /// method returns `Err`.
    pub fn send_with<T, F>(&self, event: &str, payload: &T, callback: F) -> Result<()>
    where
        T: Serialize + ?Sized,
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let pipeline = self.pipeline()?;
        let frame = pipeline.encode(event, payload)?;
        pipeline.submit(event, frame, Completion::Callback(Box::new(callback)));
        Ok(())
    }

    /// Send an event and block until it is written.
    ///
    /// Returns `Ok(true)` once the frame is on the socket and `Ok(false)` for
    /// any transient failure (no peer, write error, closed while waiting).
    ///
    /// # Panics
    ///
    /// Panics when called from within an async context; use
    /// [`Linker::send_async`] there. Listeners may call it.
    pub fn send_sync<T: Serialize + ?Sized>(&self, event: &str, payload: &T) -> Result<bool> {
        let pipeline = self.pipeline()?;
        let frame = pipeline.encode(event, payload)?;
        Ok(pipeline.send_blocking(event, frame))
    }

    /// Async form of [`Linker::send_sync`].
    pub async fn send_async<T: Serialize + ?Sized>(&self, event: &str, payload: &T) -> Result<bool> {
        let pipeline = self.pipeline()?;
        let frame = pipeline.encode(event, payload)?;
        Ok(pipeline.send_async(event, frame).await)
    }

    fn pipeline(&self) -> Result<Arc<SendPipeline>> {
        match &*self.lifecycle() {
            Lifecycle::Running(running) => Ok(Arc::clone(&running.pipeline)),
            Lifecycle::Idle => Err(EventsError::NotInitialized),
            Lifecycle::Closed => Err(EventsError::Closed),
        }
    }

    // ---- state -----------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        match &*self.lifecycle() {
            Lifecycle::Idle => ConnectionState::Idle,
            Lifecycle::Running(running) => *running.state.borrow(),
            Lifecycle::Closed => ConnectionState::Closed,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Block until a peer is attached or `timeout` elapses.
    ///
    /// The wait runs on the instance runtime, so this may be called from any
    /// thread, including one driving another runtime.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let (handle, mut state) = match &*self.lifecycle() {
            Lifecycle::Running(running) => match &running.runtime {
                Some(runtime) => (runtime.handle().clone(), running.state.clone()),
                None => return false,
            },
            _ => return false,
        };

        let (tx, rx) = std::sync::mpsc::channel();
        handle.spawn(async move {
            let connected = tokio::time::timeout(timeout, settled_connected(&mut state)).await;
            let _ = tx.send(connected.unwrap_or(false));
        });
        // A runtime shut down by `close` drops the task and its sender.
        rx.recv().unwrap_or(false)
    }

    /// Wait until a peer is attached or `timeout` elapses.
    pub async fn wait_connected_async(&self, timeout: Duration) -> bool {
        let mut state = match &*self.lifecycle() {
            Lifecycle::Running(running) => running.state.clone(),
            _ => return false,
        };
        tokio::time::timeout(timeout, settled_connected(&mut state))
            .await
            .unwrap_or(false)
    }

    /// Subscribe to non-fatal notifications: state changes, reconnect
    /// attempts, listener failures and unobserved send failures.
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn role(&self) -> Option<Role> {
        match &*self.lifecycle() {
            Lifecycle::Running(running) => Some(running.config.role),
            _ => None,
        }
    }

    pub fn channel(&self) -> Option<String> {
        match &*self.lifecycle() {
            Lifecycle::Running(running) => Some(running.config.channel.clone()),
            _ => None,
        }
    }

    pub fn socket_path(&self) -> Option<PathBuf> {
        match &*self.lifecycle() {
            Lifecycle::Running(running) => Some(running.path.clone()),
            _ => None,
        }
    }

    // ---- debug -----------------------------------------------------------

    /// Log connection transitions, frames and dispatch at `debug` level.
    pub fn enable_debug(&self) {
        self.debug.store(true, Ordering::Relaxed);
    }

    pub fn disable_debug(&self) {
        self.debug.store(false, Ordering::Relaxed);
    }

    pub fn is_debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wait for the state to settle on connected or on a terminal state.
async fn settled_connected(state: &mut watch::Receiver<ConnectionState>) -> bool {
    let settled = state
        .wait_for(|s| {
            matches!(s, ConnectionState::Connected | ConnectionState::Failed) || s.is_closed()
        })
        .await;
    matches!(settled, Ok(s) if *s == ConnectionState::Connected)
}

fn build_runtime() -> std::io::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(IO_WORKER_THREADS)
        .thread_name("unixevents-io")
        .enable_all()
        .build()
}

impl Running {
    fn shutdown(mut self: Box<Self>) {
        tracing::info!(
            "Closing {} on {} ({})",
            self.config.role,
            self.path.display(),
            self.transport.state()
        );
        self.transport.set_state(ConnectionState::Closing);
        self.shutdown.send_replace(true);

        if let Some(runtime) = self.runtime.take() {
            // Blocking on the runtime is not allowed from inside another one.
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(CLOSE_TIMEOUT);
            }
        }

        if self.config.role == Role::Server {
            if let Err(e) = transport::remove_socket(&self.path) {
                tracing::warn!("Could not remove {}: {}", self.path.display(), e);
            }
        }

        self.transport.set_state(ConnectionState::Closed);
        self.delivery.shutdown();
    }
}

impl Drop for Linker {
    fn drop(&mut self) {
        self.close();
    }
}
