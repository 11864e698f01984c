//! Request/response correlation over one shared WebSocket.
//!
//! The correlator owns both halves of the socket:
//!
//! ```text
//!  callers ──► call() ──► [writer mutex] ──► sink ───────────► daemon
//!     ▲                                                           │
//!     └── oneshot ◄── pending table ◄── reader task ◄── stream ◄──┘
//!                                            │
//!                                            └──► broadcast (notifications)
//! ```
//!
//! Every call registers a waiter under a fresh id *before* its frame is
//! written. A single reader task demultiplexes inbound envelopes by id, so
//! any number of calls can be in flight at once. Responses for ids nobody is
//! waiting on (late, duplicated or foreign) are counted and dropped.
//!
//! A call's deadline covers both writing its frame and waiting for the
//! reply. Shutdown moves the shared [`Lifecycle`] to `Closed`, which also
//! abandons any write stuck on a peer that stopped reading.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

use super::codec::{self, DecodeError, Inbound, Notification, Request};
use super::error::RpcError;
use super::framing::{read_message, write_message};
use super::lifecycle::{ConnectionState, Lifecycle};
use super::service::RpcService;

/// Buffered notifications per subscriber before the slowest one lags.
const NOTIFICATION_CAPACITY: usize = 64;

/// Upper bound on flushing the close frame during `close()`.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type Waiter = oneshot::Sender<Result<Value, RpcError>>;
type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

#[derive(Debug, Clone)]
enum Status {
    Open,
    Closed,
    Failed(String),
}

impl Status {
    fn error(&self) -> Option<RpcError> {
        match self {
            Status::Open => None,
            Status::Closed => Some(RpcError::Closed),
            Status::Failed(reason) => Some(RpcError::Transport(reason.clone())),
        }
    }
}

struct Pending {
    status: Status,
    waiters: HashMap<u64, Waiter>,
}

/// State shared between callers and the reader task.
struct Shared {
    next_id: AtomicU64,
    pending: Mutex<Pending>,
    unexpected: AtomicU64,
    notifications: broadcast::Sender<Notification>,
    lifecycle: Lifecycle,
}

impl Shared {
    fn new(lifecycle: Lifecycle) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(Pending {
                status: Status::Open,
                waiters: HashMap::new(),
            }),
            unexpected: AtomicU64::new(0),
            notifications,
            lifecycle,
        }
    }

    fn table(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status_error(&self) -> Option<RpcError> {
        self.table().status.error()
    }

    fn register(&self, id: u64) -> Result<oneshot::Receiver<Result<Value, RpcError>>, RpcError> {
        let mut table = self.table();
        if let Some(err) = table.status.error() {
            return Err(err);
        }
        let (tx, rx) = oneshot::channel();
        table.waiters.insert(id, tx);
        Ok(rx)
    }

    /// Hand `result` to the caller waiting on `id`. False if nobody was.
    fn complete(&self, id: u64, result: Result<Value, RpcError>) -> bool {
        let waiter = self.table().waiters.remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    fn forget(&self, id: u64) {
        self.table().waiters.remove(&id);
    }

    /// Leave the `Open` state and fail every waiter. Only the first
    /// transition counts; returns whether this call made it.
    fn shut_down(&self, status: Status) -> bool {
        let Some(error) = status.error() else {
            return false;
        };
        let drained: Vec<Waiter> = {
            let mut table = self.table();
            if !matches!(table.status, Status::Open) {
                return false;
            }
            table.status = status;
            table.waiters.drain().map(|(_, waiter)| waiter).collect()
        };
        self.lifecycle.advance(ConnectionState::Closed);
        if !drained.is_empty() {
            debug!(pending = drained.len(), "Failing pending calls: {}", error);
        }
        for waiter in drained {
            let _ = waiter.send(Err(error.clone()));
        }
        true
    }

    fn discard(&self, id: u64, why: &str) {
        self.unexpected.fetch_add(1, Ordering::Relaxed);
        debug!(received_id = id, "Discarding {}", why);
    }

    fn dispatch(&self, text: &str) {
        match codec::decode(text) {
            Ok(Inbound::Response { id, outcome }) => {
                if !self.complete(id, outcome.map_err(RpcError::Protocol)) {
                    self.discard(id, "response with no pending request");
                }
            }
            Ok(Inbound::Notification(notification)) => {
                trace!(
                    method = notification.method.as_deref().unwrap_or("<none>"),
                    "Received notification"
                );
                // No subscribers is the common case.
                let _ = self.notifications.send(notification);
            }
            Err(DecodeError {
                id: Some(id),
                reason,
            }) => {
                warn!(id, "Malformed response: {}", reason);
                if !self.complete(id, Err(RpcError::decode("response", reason))) {
                    self.discard(id, "malformed response with no pending request");
                }
            }
            Err(e) => warn!("Discarding envelope: {}", e),
        }
    }
}

/// Removes the pending entry when a call finishes early (timeout or drop).
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.forget(self.id);
    }
}

/// Multiplexes concurrent calls over one WebSocket.
pub struct Correlator {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<FrameSink>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Correlator {
    /// Take ownership of an open WebSocket and start the reader task.
    ///
    /// `lifecycle` is moved to `Closed` when the connection shuts down.
    /// Must be called from within a Tokio runtime.
    pub fn spawn<S>(ws: WebSocketStream<S>, lifecycle: Lifecycle) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let shared = Arc::new(Shared::new(lifecycle));
        let reader = tokio::spawn(read_loop(stream, Arc::clone(&shared)));

        Self {
            shared,
            writer: tokio::sync::Mutex::new(Some(Box::pin(sink))),
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Send one request and wait for the response carrying its id.
    ///
    /// # Errors
    ///
    /// - `RpcError::Protocol` if the daemon answered with an error object
    /// - `RpcError::Decode` if the response for this id was malformed
    /// - `RpcError::Timeout` if `timeout` elapsed first, while either
    ///   writing the request or waiting for its reply
    /// - `RpcError::Transport` / `RpcError::Closed` if the connection is gone
    pub async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let reply = self.shared.register(id)?;
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        let body = codec::encode_request(&Request::new(id, method, params))?;
        debug!(method, id, "Sending JSON-RPC request");
        let exchange = async {
            match self.send(body).await {
                // The sender only vanishes unanswered during shutdown.
                Ok(()) => reply.await.unwrap_or_else(|_| Err(self.terminal_error())),
                Err(e) => Err(e),
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .unwrap_or_else(|_| {
                    Err(RpcError::Timeout {
                        method: method.to_string(),
                        timeout: limit,
                    })
                }),
            None => exchange.await,
        }
    }

    /// Write one frame, giving up as soon as the connection shuts down.
    async fn send(&self, body: String) -> Result<(), RpcError> {
        tokio::select! {
            result = self.write(body) => result,
            () = self.shared.lifecycle.closed() => Err(self.terminal_error()),
        }
    }

    async fn write(&self, body: String) -> Result<(), RpcError> {
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(self.terminal_error());
        };
        if let Some(err) = self.shared.status_error() {
            return Err(err);
        }
        if let Err(e) = write_message(sink, body).await {
            let reason = format!("failed to send request: {}", e);
            self.shared.shut_down(Status::Failed(reason.clone()));
            return Err(RpcError::Transport(reason));
        }
        Ok(())
    }

    fn terminal_error(&self) -> RpcError {
        self.shared.status_error().unwrap_or(RpcError::Closed)
    }

    /// Fail pending calls with `RpcError::Closed`, send a close frame and
    /// stop the reader. Safe to call more than once.
    ///
    /// The close frame is best effort: if the socket cannot take it within
    /// a short grace period, the socket is dropped without it.
    pub async fn close(&self) {
        if self.shared.shut_down(Status::Closed) {
            debug!("Closing connection");
        }
        let graceful = async {
            let sink = self.writer.lock().await.take();
            if let Some(mut sink) = sink {
                if let Err(e) = sink.close().await {
                    trace!("Ignoring error while closing socket: {}", e);
                }
            }
        };
        if tokio::time::timeout(CLOSE_GRACE, graceful).await.is_err() {
            debug!("Socket did not accept close frame in time, dropping it");
        }
        self.stop_reader();
    }

    fn stop_reader(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// True until the connection is closed or fails.
    pub fn is_open(&self) -> bool {
        self.shared.status_error().is_none()
    }

    /// Error every new call will get, if the connection is no longer open.
    pub fn failure(&self) -> Option<RpcError> {
        self.shared.status_error()
    }

    /// Subscribe to server-pushed notifications received from now on.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.shared.notifications.subscribe()
    }

    /// Responses dropped because no call was waiting on their id.
    pub fn unexpected_responses(&self) -> u64 {
        self.shared.unexpected.load(Ordering::Relaxed)
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.shared.shut_down(Status::Closed);
        self.stop_reader();
    }
}

impl RpcService for Correlator {
    async fn call_raw(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        self.call(method, params, timeout).await
    }
}

async fn read_loop<S>(mut stream: S, shared: Arc<Shared>)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let reason = loop {
        match read_message(&mut stream).await {
            Ok(Some(text)) => shared.dispatch(&text),
            Ok(None) => break "connection closed by server".to_string(),
            Err(e) => break format!("failed to read response: {}", e),
        }
    };
    if shared.shut_down(Status::Failed(reason.clone())) {
        warn!("Connection lost: {}", reason);
    }
}
