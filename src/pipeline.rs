//! Ordered send path.
//!
//! Every send becomes a [`PendingSend`] on one FIFO queue drained by a single
//! writer task, so frames from one instance hit the socket in program order
//! and never interleave. The three public flavours (fire-and-forget, callback,
//! awaited) differ only in how the outcome is reported.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::dispatch::{self, DispatchMsg, SendCallback};
use crate::error::{EventsError, Result};
use crate::ipc::transport::{Shutdown, Transport};
use crate::ipc::encode;
use crate::models::{ConnectionState, Notice};

/// How the outcome of a send is reported.
pub(crate) enum Completion {
    /// Wake a blocked or awaiting caller.
    Waiter(oneshot::Sender<Result<()>>),
    /// Run a callback on the delivery thread.
    Callback(SendCallback),
    /// Nobody is waiting; failures go to the notice channel.
    Report,
}

/// Where completions are delivered.
#[derive(Clone)]
pub(crate) struct Outlet {
    dispatch: mpsc::UnboundedSender<DispatchMsg>,
    notices: broadcast::Sender<Notice>,
}

impl Outlet {
    pub(crate) fn new(
        dispatch: mpsc::UnboundedSender<DispatchMsg>,
        notices: broadcast::Sender<Notice>,
    ) -> Self {
        Self { dispatch, notices }
    }
}

/// One queued frame and its completion.
///
/// A pending send is completed exactly once. If it is dropped before that,
/// for instance when the runtime shuts down with it still queued, it
/// completes with `EventsError::Closed`.
pub(crate) struct PendingSend {
    event: String,
    frame: Vec<u8>,
    completion: Option<Completion>,
    outlet: Outlet,
}

impl PendingSend {
    pub(crate) fn complete(mut self, outcome: Result<()>) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: Result<()>) {
        match self.completion.take() {
            Some(Completion::Waiter(tx)) => {
                let _ = tx.send(outcome);
            }
            Some(Completion::Callback(callback)) => {
                if let Err(mpsc::error::SendError(msg)) = self
                    .outlet
                    .dispatch
                    .send(DispatchMsg::Callback(callback, outcome))
                {
                    // Delivery thread already stopped: run it here.
                    if let DispatchMsg::Callback(callback, outcome) = msg {
                        dispatch::run_callback(callback, outcome);
                    }
                }
            }
            Some(Completion::Report) => {
                if let Err(e) = outcome {
                    tracing::warn!("Send of {:?} failed: {}", self.event, e);
                    let _ = self.outlet.notices.send(Notice::Error(e));
                }
            }
            None => {}
        }
    }
}

impl Drop for PendingSend {
    fn drop(&mut self) {
        if self.completion.is_some() {
            self.finish(Err(EventsError::Closed));
        }
    }
}

/// Submission side of the send path.
pub(crate) struct SendPipeline {
    queue: mpsc::UnboundedSender<PendingSend>,
    state: watch::Receiver<ConnectionState>,
    outlet: Outlet,
    max_frame_size: usize,
    debug: Arc<AtomicBool>,
}

impl SendPipeline {
    pub(crate) fn new(
        queue: mpsc::UnboundedSender<PendingSend>,
        state: watch::Receiver<ConnectionState>,
        outlet: Outlet,
        max_frame_size: usize,
        debug: Arc<AtomicBool>,
    ) -> Self {
        Self {
            queue,
            state,
            outlet,
            max_frame_size,
            debug,
        }
    }

    /// Encode synchronously so programmer errors reach the caller directly.
    pub(crate) fn encode<T: Serialize + ?Sized>(&self, event: &str, payload: &T) -> Result<Vec<u8>> {
        encode(event, payload, self.max_frame_size)
    }

    /// Queue an encoded frame.
    ///
    /// Fails fast with `NotConnected` when no peer is attached, so nothing is
    /// buffered for a future connection.
    pub(crate) fn submit(&self, event: &str, frame: Vec<u8>, completion: Completion) {
        let pending = PendingSend {
            event: event.to_string(),
            frame,
            completion: Some(completion),
            outlet: self.outlet.clone(),
        };

        let state = *self.state.borrow();
        if state != ConnectionState::Connected {
            trace_event!(self.debug, "Not sending {:?}: {}", event, state);
            let err = if state.is_closed() {
                EventsError::Closed
            } else {
                EventsError::NotConnected
            };
            pending.complete(Err(err));
            return;
        }

        if let Err(mpsc::error::SendError(pending)) = self.queue.send(pending) {
            pending.complete(Err(EventsError::Closed));
        }
    }

    /// Queue a frame and block the current thread until it is written.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub(crate) fn send_blocking(&self, event: &str, frame: Vec<u8>) -> bool {
        let (tx, rx) = oneshot::channel();
        self.submit(event, frame, Completion::Waiter(tx));
        matches!(rx.blocking_recv(), Ok(Ok(())))
    }

    /// Queue a frame and wait until it is written.
    pub(crate) async fn send_async(&self, event: &str, frame: Vec<u8>) -> bool {
        let (tx, rx) = oneshot::channel();
        self.submit(event, frame, Completion::Waiter(tx));
        matches!(rx.await, Ok(Ok(())))
    }
}

/// Drain the send queue onto the live connection, one frame at a time.
pub(crate) async fn run_writer(
    transport: Arc<Transport>,
    mut queue: mpsc::UnboundedReceiver<PendingSend>,
    mut shutdown: Shutdown,
) {
    loop {
        let pending = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            next = queue.recv() => match next {
                Some(pending) => pending,
                None => break,
            },
        };

        let written = tokio::select! {
            biased;
            _ = shutdown.wait() => None,
            res = transport.write(&pending.frame) => Some(res),
        };

        match written {
            Some(outcome) => {
                if outcome.is_ok() {
                    trace_event!(transport.debug(), "Sent {:?}", pending.event);
                }
                pending.complete(outcome);
            }
            None => {
                pending.complete(Err(EventsError::Closed));
                break;
            }
        }
    }

    queue.close();
    while let Ok(pending) = queue.try_recv() {
        pending.complete(Err(EventsError::Closed));
    }
    tracing::debug!("Writer for {} stopped", transport.path().display());
}
