//! Command/response correlation over one connection.
//!
//! A [`Session`] owns a [`Connection`], a pending-request table keyed by
//! [`RequestId`] and an [`EventBus`]. There is no background task: whichever
//! caller is waiting (a blocking [`Session::send`], [`Session::poll`] or
//! [`Session::wait_for_event`]) takes the connection lock for one bounded
//! read slice and routes what it reads. Responses go to their pending entry,
//! events go to the bus in wire order.
//!
//! # Example
//!
//! ```ignore
//! use devtools_channel::{Session, SessionConfig};
//! use serde_json::json;
//!
//! let session = Session::connect_url(&ws_url, SessionConfig::default()).await?;
//! session.on("Page.loadEventFired", |_| Ok(()));
//! session.enable("Page").await?;
//! let nav = session.send("Page.navigate", json!({ "url": "https://example.com" })).await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{IdSequence, RequestId, SubscriptionId};
use crate::protocol::{Incoming, Request};
use crate::session::bus::{DEFAULT_QUEUE_CAPACITY, EventBus, HandlerResult};
use crate::transport::connection::{Connection, Message, READ_SLICE};

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for the connect + upgrade handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for command responses.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum number of outstanding requests.
pub const DEFAULT_MAX_PENDING: usize = 100;

// ============================================================================
// SessionConfig
// ============================================================================

/// Session tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Timeout for TCP connect plus handshake.
    pub connect_timeout: Duration,
    /// Default command timeout, also the deadline of async requests.
    pub command_timeout: Duration,
    /// Maximum outstanding requests before new ones are refused.
    pub max_pending: usize,
    /// Capacity of the event bus queue.
    pub event_queue_capacity: usize,
    /// Queue events that arrive with no handler, for [`Session::flush_events`].
    pub buffer_unhandled_events: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
            event_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            buffer_unhandled_events: false,
        }
    }
}

impl SessionConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the default command timeout.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Sets the pending-request cap.
    #[must_use]
    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    /// Sets the event queue capacity.
    #[must_use]
    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    /// Enables or disables buffering of unhandled events.
    #[must_use]
    pub fn with_buffer_unhandled_events(mut self, enabled: bool) -> Self {
        self.buffer_unhandled_events = enabled;
        self
    }
}

// ============================================================================
// Pending Requests
// ============================================================================

/// Callback invoked once with the outcome of an async request.
pub type ResponseCallback = Box<dyn FnOnce(Result<Value>) + Send + 'static>;

enum Waiter {
    Blocking(oneshot::Sender<Result<Value>>),
    Callback(ResponseCallback),
}

struct Pending {
    method: String,
    issued_at: Instant,
    deadline: Instant,
    waiter: Waiter,
}

impl Pending {
    fn resolve(self, id: RequestId, outcome: Result<Value>) {
        trace!(
            %id,
            method = %self.method,
            elapsed_ms = self.issued_at.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "Request resolved"
        );
        match self.waiter {
            Waiter::Blocking(tx) => {
                let _ = tx.send(outcome);
            }
            Waiter::Callback(callback) => {
                if catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
                    error!(%id, method = %self.method, "Response callback panicked");
                }
            }
        }
    }

    fn is_async(&self) -> bool {
        matches!(self.waiter, Waiter::Callback(_))
    }
}

type PendingMap = FxHashMap<RequestId, Pending>;

/// Removes a request's entry unless disarmed, so a future dropped mid-write
/// or mid-wait never leaves its id behind.
struct PendingGuard<'a> {
    pending: &'a Mutex<PendingMap>,
    id: RequestId,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    fn new(pending: &'a Mutex<PendingMap>, id: RequestId) -> Self {
        Self {
            pending,
            id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending.lock().remove(&self.id);
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Multiplexes commands and events over one [`Connection`].
///
/// All methods take `&self`; wrap in an `Arc` to share between tasks.
pub struct Session {
    connection: AsyncMutex<Connection>,
    pending: Mutex<PendingMap>,
    events: Arc<EventBus>,
    ids: IdSequence,
    open: AtomicBool,
    config: SessionConfig,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("open", &self.is_connected())
            .field("pending", &self.pending_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connects to `ws://host:port/path` and wraps the connection.
    ///
    /// # Errors
    ///
    /// Any error of [`Connection::connect`].
    pub async fn connect(
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
        config: SessionConfig,
    ) -> Result<Self> {
        let mut connection = Connection::new(host, port, path);
        connection.connect(config.connect_timeout).await?;
        Ok(Self::new(connection, config))
    }

    /// Connects to a `ws://` URL and wraps the connection.
    ///
    /// # Errors
    ///
    /// - [`Error::Url`] / [`Error::Config`] if the URL is unusable
    /// - any error of [`Connection::connect`]
    pub async fn connect_url(ws_url: &str, config: SessionConfig) -> Result<Self> {
        let mut connection = Connection::from_url(ws_url)?;
        connection.connect(config.connect_timeout).await?;
        Ok(Self::new(connection, config))
    }

    /// Wraps an already connected connection.
    #[must_use]
    pub fn new(connection: Connection, config: SessionConfig) -> Self {
        let open = connection.is_connected();
        Self {
            connection: AsyncMutex::new(connection),
            pending: Mutex::new(PendingMap::default()),
            events: Arc::new(EventBus::with_queue_capacity(config.event_queue_capacity)),
            ids: IdSequence::new(),
            open: AtomicBool::new(open),
            config,
        }
    }

    /// Returns the session configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns the event bus for direct subscription.
    #[inline]
    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Returns `true` until the connection is closed or lost.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Returns the number of outstanding requests.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

// ============================================================================
// Session - Commands
// ============================================================================

impl Session {
    /// Sends a command and waits for its response with the default timeout.
    ///
    /// # Errors
    ///
    /// See [`Session::send_with_timeout`].
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        self.send_with_timeout(method, params, self.config.command_timeout)
            .await
    }

    /// Sends a command and waits up to `request_timeout` for its response.
    ///
    /// Events read while waiting are dispatched as they arrive.
    ///
    /// # Errors
    ///
    /// - [`Error::Remote`] if the remote end answered with an error
    /// - [`Error::RequestTimeout`] if no response arrived in time
    /// - [`Error::ConnectionClosed`] / [`Error::Connection`] if the connection is lost
    /// - [`Error::Protocol`] if too many requests are pending
    pub async fn send_with_timeout(
        &self,
        method: &str,
        params: Value,
        request_timeout: Duration,
    ) -> Result<Value> {
        let deadline = Instant::now() + request_timeout;
        let (tx, mut rx) = oneshot::channel();
        let id = self
            .issue(method, params, deadline, Waiter::Blocking(tx))
            .await?;
        let _guard = PendingGuard::new(&self.pending, id);

        loop {
            match rx.try_recv() {
                Ok(outcome) => return outcome,
                Err(TryRecvError::Closed) => return Err(Error::ConnectionClosed),
                Err(TryRecvError::Empty) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return self.expire(id, method, request_timeout, &mut rx);
            }

            let Ok(mut connection) = timeout_at(deadline, self.connection.lock()).await else {
                continue;
            };

            // Another reader may have routed our response while we queued.
            if !self.pending.lock().contains_key(&id) {
                drop(connection);
                continue;
            }

            let slice = deadline.saturating_duration_since(Instant::now()).min(READ_SLICE);
            if let Err(e) = self.read_one(&mut connection, slice).await {
                drop(connection);
                self.fail_pending_requests();
                return Err(e);
            }
        }
    }

    fn expire(
        &self,
        id: RequestId,
        method: &str,
        request_timeout: Duration,
        rx: &mut oneshot::Receiver<Result<Value>>,
    ) -> Result<Value> {
        if self.pending.lock().remove(&id).is_some() {
            warn!(%id, method, timeout_ms = request_timeout.as_millis() as u64, "Request timed out");
            return Err(Error::request_timeout(
                id,
                method,
                request_timeout.as_millis() as u64,
            ));
        }
        // Resolved between the last check and the deadline.
        rx.try_recv().unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Sends a command with typed params and deserializes the typed result.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if params or result do not match the types
    /// - any error of [`Session::send`]
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.send(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Sends a command without waiting; `callback` runs once with the outcome.
    ///
    /// The callback runs on whichever task is reading the connection when
    /// the response arrives (usually inside [`Session::poll`]). Requests
    /// older than the command timeout are failed by the next poll.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if too many requests are pending
    /// - [`Error::ConnectionClosed`] / [`Error::Connection`] if the write fails
    pub async fn send_async<F>(&self, method: &str, params: Value, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let deadline = Instant::now() + self.config.command_timeout;
        self.issue(method, params, deadline, Waiter::Callback(Box::new(callback)))
            .await
    }

    /// Enables a protocol domain (`<domain>.enable`).
    ///
    /// # Errors
    ///
    /// See [`Session::send`].
    pub async fn enable(&self, domain: &str) -> Result<Value> {
        self.send(&format!("{domain}.enable"), json!({})).await
    }

    /// Disables a protocol domain (`<domain>.disable`).
    ///
    /// # Errors
    ///
    /// See [`Session::send`].
    pub async fn disable(&self, domain: &str) -> Result<Value> {
        self.send(&format!("{domain}.disable"), json!({})).await
    }

    /// Registers a pending entry and writes the request before `deadline`.
    ///
    /// The entry is removed again if the write fails, the deadline passes
    /// first, or the future is dropped before the write completes.
    async fn issue(
        &self,
        method: &str,
        params: Value,
        deadline: Instant,
        waiter: Waiter,
    ) -> Result<RequestId> {
        if !self.is_connected() {
            return Err(Error::ConnectionClosed);
        }

        let id = RequestId::new(self.ids.next());
        let text = Request::new(id, method, params).to_json()?;
        let issued_at = Instant::now();

        {
            let mut pending = self.pending.lock();
            if pending.len() >= self.config.max_pending {
                warn!(
                    pending = pending.len(),
                    max = self.config.max_pending,
                    "Too many pending requests"
                );
                return Err(Error::protocol(format!(
                    "Too many pending requests: {}/{}",
                    pending.len(),
                    self.config.max_pending
                )));
            }
            pending.insert(
                id,
                Pending {
                    method: method.to_string(),
                    issued_at,
                    deadline,
                    waiter,
                },
            );
        }

        let guard = PendingGuard::new(&self.pending, id);
        let timed_out = || {
            let timeout_ms = deadline.duration_since(issued_at).as_millis() as u64;
            warn!(%id, method, timeout_ms, "Request timed out before it was written");
            Error::request_timeout(id, method, timeout_ms)
        };

        let Ok(mut connection) = timeout_at(deadline, self.connection.lock()).await else {
            return Err(timed_out());
        };
        let written = connection.send_until(&text, deadline).await;
        let still_open = connection.is_connected();
        drop(connection);

        if let Err(e) = written {
            drop(guard);
            if !still_open {
                self.fail_pending_requests();
            }
            return Err(if e.is_timeout() { timed_out() } else { e });
        }

        guard.disarm();
        trace!(%id, method, "Request sent");
        Ok(id)
    }
}

// ============================================================================
// Session - Reading
// ============================================================================

impl Session {
    /// Reads and routes inbound messages without a command in flight.
    ///
    /// Waits up to `wait` for the first message, then drains whatever is
    /// already available. Expired async requests are failed with
    /// [`Error::RequestTimeout`]. Returns the number of messages routed.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionClosed`] or the underlying failure if the
    /// connection is lost; every pending request is failed first.
    pub async fn poll(&self, wait: Duration) -> Result<usize> {
        self.sweep_expired();
        if !self.is_connected() {
            return Err(Error::ConnectionClosed);
        }

        let deadline = Instant::now() + wait;
        let Ok(mut connection) = timeout_at(deadline, self.connection.lock()).await else {
            return Ok(0);
        };

        let routed = match self.drain(&mut connection, deadline).await {
            Ok(routed) => routed,
            Err(e) => {
                drop(connection);
                self.fail_pending_requests();
                return Err(e);
            }
        };
        drop(connection);

        self.sweep_expired();
        Ok(routed)
    }

    async fn drain(&self, connection: &mut Connection, deadline: Instant) -> Result<usize> {
        let mut routed = 0;

        let wait = deadline.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            routed += self.read_one(connection, wait).await?;
        }

        loop {
            match connection.recv_nonblocking().await? {
                Some(message) => {
                    self.route(message);
                    routed += 1;
                }
                None if !connection.is_connected() => {
                    self.mark_closed();
                    return Err(Error::ConnectionClosed);
                }
                None => return Ok(routed),
            }
        }
    }

    /// Reads at most one message within `wait` and routes it.
    async fn read_one(&self, connection: &mut Connection, wait: Duration) -> Result<usize> {
        match connection.recv(wait).await {
            Ok(Some(message)) => {
                self.route(message);
                Ok(1)
            }
            Ok(None) if !connection.is_connected() => {
                self.mark_closed();
                Err(Error::ConnectionClosed)
            }
            Ok(None) => Ok(0),
            Err(e) => {
                self.mark_closed();
                Err(e)
            }
        }
    }

    fn route(&self, message: Message) {
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => {
                debug!(len = bytes.len(), "Ignoring binary message");
                return;
            }
        };

        match Incoming::parse(&text) {
            Ok(Incoming::Response(response)) => {
                let id = response.id;
                let entry = self.pending.lock().remove(&id);
                match entry {
                    Some(pending) => pending.resolve(id, response.into_result()),
                    None => warn!(%id, "Response for unknown or expired request, dropped"),
                }
            }
            Ok(Incoming::Event(event)) => {
                trace!(method = %event.method, "Event received");
                if self.config.buffer_unhandled_events && !self.events.has_listeners(&event.method) {
                    self.events.queue(event.method, event.params);
                } else {
                    self.events.dispatch(&event.method, &event.params);
                }
            }
            Err(e) => {
                warn!(error = %e, len = text.len(), "Failed to parse incoming message");
            }
        }
    }

    /// Fails async requests whose deadline passed.
    fn sweep_expired(&self) {
        let now = Instant::now();
        let expired: Vec<(RequestId, Pending)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, p)| p.is_async() && p.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        for (id, entry) in expired {
            let timeout_ms = entry.deadline.duration_since(entry.issued_at).as_millis() as u64;
            warn!(%id, method = %entry.method, timeout_ms, "Async request timed out");
            let error = Error::request_timeout(id, entry.method.clone(), timeout_ms);
            entry.resolve(id, Err(error));
        }
    }

    /// Fails every pending request with [`Error::ConnectionClosed`].
    fn fail_pending_requests(&self) {
        self.mark_closed();
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();

        for (id, entry) in drained {
            entry.resolve(id, Err(Error::ConnectionClosed));
        }

        if count > 0 {
            debug!(count, "Failed pending requests on connection loss");
        }
    }

    fn mark_closed(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            info!("Session connection closed");
        }
    }
}

// ============================================================================
// Session - Events
// ============================================================================

impl Session {
    /// Subscribes to an event. Delegates to [`EventBus::on`].
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.events.on(event, handler)
    }

    /// Subscribes to the next occurrence of an event. Delegates to [`EventBus::once`].
    pub fn once<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.events.once(event, handler)
    }

    /// Removes a subscription. Delegates to [`EventBus::off`].
    pub fn off(&self, event: &str, id: SubscriptionId) -> bool {
        self.events.off(event, id)
    }

    /// Replays events queued while nobody was subscribed.
    pub fn flush_events(&self) -> usize {
        self.events.flush()
    }

    /// Waits up to `wait` for `event`, reading the connection meanwhile.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the event does not arrive in time
    /// - any error of [`Session::poll`]
    pub async fn wait_for_event<P>(
        &self,
        event: &str,
        predicate: Option<P>,
        wait: Duration,
    ) -> Result<Value>
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        let deadline = Instant::now() + wait;
        let mut waiter = self.events.wait_for(event, predicate);

        loop {
            if let Some(params) = waiter.try_take() {
                return Ok(params);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::timeout(
                    format!("waiting for event {event}"),
                    wait.as_millis() as u64,
                ));
            }
            self.poll(remaining.min(READ_SLICE)).await?;
        }
    }
}

// ============================================================================
// Session - Shutdown
// ============================================================================

impl Session {
    /// Closes the connection and fails outstanding requests. Idempotent.
    ///
    /// # Errors
    ///
    /// Never fails in practice; close errors are logged.
    pub async fn close(&self) -> Result<()> {
        {
            let mut connection = self.connection.lock().await;
            if let Err(e) = connection.close().await {
                debug!(error = %e, "Error while closing connection");
            }
        }
        self.fail_pending_requests();
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use serde::Deserialize;

    use crate::test_support::{MockServer, result_for};

    async fn session_for(server: &MockServer, config: SessionConfig) -> Arc<Session> {
        let session = Session::connect_url(&server.ws_url(), config)
            .await
            .expect("connect");
        Arc::new(session)
    }

    fn request_id(request: &Value) -> u64 {
        request["id"].as_u64().expect("request id")
    }

    #[test]
    fn test_config_defaults_and_builder() {
        let config = SessionConfig::default();
        assert_eq!(config.command_timeout, Duration::from_secs(30));
        assert_eq!(config.max_pending, 100);
        assert!(!config.buffer_unhandled_events);

        let config = SessionConfig::new()
            .with_command_timeout(Duration::from_millis(250))
            .with_max_pending(4)
            .with_buffer_unhandled_events(true);
        assert_eq!(config.command_timeout, Duration::from_millis(250));
        assert_eq!(config.max_pending, 4);
        assert!(config.buffer_unhandled_events);
    }

    #[tokio::test]
    async fn test_event_before_response_is_dispatched() {
        let server = MockServer::responding(|request| {
            vec![
                json!({ "method": "Page.loadEventFired", "params": { "timestamp": 1.5 } })
                    .to_string(),
                result_for(request, json!({})),
            ]
        })
        .await;
        let session = session_for(&server, SessionConfig::default()).await;

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        session.on("Page.loadEventFired", move |params| {
            assert_eq!(params["timestamp"], 1.5);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let result = session.enable("Page").await.expect("Page.enable");
        assert_eq!(result, json!({}));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let request = server.next_request(Duration::from_secs(1)).await.expect("request");
        assert_eq!(request["method"], "Page.enable");
        assert_eq!(request["id"], 1);
        assert_eq!(request["params"], json!({}));
    }

    #[tokio::test]
    async fn test_interleaved_responses_reach_their_callers() {
        const N: u64 = 5;
        let server = MockServer::silent().await;
        let session = session_for(&server, SessionConfig::default()).await;

        let mut handles = Vec::new();
        for n in 0..N {
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(async move {
                let result = session
                    .send("Runtime.evaluate", json!({ "expression": n.to_string() }))
                    .await
                    .expect("response");
                (n, result)
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..N {
            requests.push(server.next_request(Duration::from_secs(2)).await.expect("request"));
        }

        // Reverse order with an event between every response.
        for request in requests.iter().rev() {
            server.push_json(json!({ "method": "Runtime.consoleAPICalled", "params": {} }));
            let echo = request["params"]["expression"].clone();
            server.push_text(result_for(request, json!({ "value": echo })));
        }

        for handle in handles {
            let (n, result) = handle.await.expect("join");
            assert_eq!(result["value"], n.to_string());
        }
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_is_dropped() {
        let server = MockServer::silent().await;
        let session = session_for(&server, SessionConfig::default()).await;

        let started = Instant::now();
        let err = session
            .send_with_timeout("Slow.op", json!({}), Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequestTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(session.pending_count(), 0);

        let slow = server.next_request(Duration::from_secs(1)).await.expect("slow request");
        server.push_text(result_for(&slow, json!({ "late": true })));

        let next = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.send("Fast.op", json!({})).await })
        };
        let fast = server.next_request(Duration::from_secs(1)).await.expect("fast request");
        assert_ne!(request_id(&fast), request_id(&slow));
        server.push_text(result_for(&fast, json!({ "fresh": true })));

        let result = next.await.expect("join").expect("fast response");
        assert_eq!(result, json!({ "fresh": true }));
    }

    #[tokio::test]
    async fn test_remote_error_is_returned() {
        let server = MockServer::responding(|request| {
            vec![json!({
                "id": request["id"],
                "error": { "code": -32601, "message": "'Foo.bar' wasn't found" }
            })
            .to_string()]
        })
        .await;
        let session = session_for(&server, SessionConfig::default()).await;

        match session.send("Foo.bar", json!({})).await {
            Err(Error::Remote { code, message, .. }) => {
                assert_eq!(code, -32601);
                assert!(message.contains("Foo.bar"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending_requests() {
        let server = MockServer::silent().await;
        let session = session_for(&server, SessionConfig::default()).await;

        let outcome = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&outcome);
        session
            .send_async("Async.op", json!({}), move |result| {
                *slot.lock() = Some(result.is_err());
            })
            .await
            .expect("send_async");

        let blocking = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.send("Blocking.op", json!({})).await })
        };
        server.next_request(Duration::from_secs(1)).await.expect("async request");
        server.next_request(Duration::from_secs(1)).await.expect("blocking request");
        server.disconnect();

        let started = Instant::now();
        let err = blocking.await.expect("join").unwrap_err();
        assert!(err.is_connection_error(), "unexpected: {err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));

        assert_eq!(*outcome.lock(), Some(true));
        assert_eq!(session.pending_count(), 0);
        assert!(!session.is_connected());
        assert!(matches!(
            session.send("After.close", json!({})).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_cancelled_sends_leave_no_pending_entries() {
        let server = MockServer::silent().await;
        let session = session_for(&server, SessionConfig::new().with_max_pending(3)).await;

        // Keeps the connection lock busy in read slices while the others queue.
        let holder = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                session
                    .send_with_timeout("Hold.op", json!({}), Duration::from_millis(600))
                    .await
            })
        };
        server.next_request(Duration::from_secs(1)).await.expect("hold request");

        for n in 0..10 {
            let cancelled = tokio::time::timeout(
                Duration::from_millis(1),
                session.send("Cancelled.op", json!({ "n": n })),
            )
            .await;
            assert!(cancelled.is_err(), "send {n} finished within 1ms");
        }

        let held = holder.await.expect("join").unwrap_err();
        assert!(matches!(held, Error::RequestTimeout { .. }));
        assert_eq!(session.pending_count(), 0);

        session
            .send_async("After.op", json!({}), |_| {})
            .await
            .expect("cap not exhausted");
        assert_eq!(session.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_send_bounded_when_peer_stops_reading() {
        let server = MockServer::stalled().await;
        let session = session_for(&server, SessionConfig::default()).await;

        let blob = "x".repeat(32 * 1024 * 1024);
        let started = Instant::now();
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            session.send_with_timeout("Big.op", json!({ "p": blob }), Duration::from_millis(300)),
        )
        .await
        .expect("send bounded by its timeout")
        .unwrap_err();

        assert!(matches!(err, Error::RequestTimeout { .. }), "unexpected: {err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(session.pending_count(), 0);
        assert!(!session.is_connected());
        assert!(matches!(
            session.send("After.op", json!({})).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_max_pending_refuses_new_requests() {
        let server = MockServer::silent().await;
        let session = session_for(&server, SessionConfig::new().with_max_pending(2)).await;

        session.send_async("A.a", json!({}), |_| {}).await.expect("first");
        session.send_async("A.b", json!({}), |_| {}).await.expect("second");
        let err = session.send_async("A.c", json!({}), |_| {}).await.unwrap_err();
        assert!(err.is_protocol_error());
        assert_eq!(session.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_poll_resolves_async_and_sweeps_expired() {
        let server = MockServer::silent().await;
        let config = SessionConfig::new().with_command_timeout(Duration::from_millis(400));
        let session = session_for(&server, config).await;

        let answered = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&answered);
        let id = session
            .send_async("Answered.op", json!({}), move |result| {
                *slot.lock() = Some(result.expect("answered"));
            })
            .await
            .expect("send_async");

        let expired = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&expired);
        session
            .send_async("Ignored.op", json!({}), move |result| {
                *slot.lock() = Some(matches!(result, Err(Error::RequestTimeout { .. })));
            })
            .await
            .expect("send_async");

        server.push_json(json!({ "id": id.as_u64(), "result": { "ok": 1 } }));
        session.poll(Duration::from_millis(500)).await.expect("poll");
        assert_eq!(*answered.lock(), Some(json!({ "ok": 1 })));

        tokio::time::sleep(Duration::from_millis(450)).await;
        session.poll(Duration::ZERO).await.expect("poll");
        assert_eq!(*expired.lock(), Some(true));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_event_with_predicate() {
        let server = MockServer::silent().await;
        let session = session_for(&server, SessionConfig::default()).await;

        server.push_json(json!({ "method": "Page.lifecycleEvent", "params": { "name": "init" } }));
        server.push_json(json!({ "method": "Page.lifecycleEvent", "params": { "name": "load" } }));

        let params = session
            .wait_for_event(
                "Page.lifecycleEvent",
                Some(|params: &Value| params["name"] == "load"),
                Duration::from_secs(2),
            )
            .await
            .expect("event");
        assert_eq!(params["name"], "load");

        let err = session
            .wait_for_event("Never.fired", None::<fn(&Value) -> bool>, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_unhandled_events_buffered_and_flushed() {
        let server = MockServer::silent().await;
        let config = SessionConfig::new().with_buffer_unhandled_events(true);
        let session = session_for(&server, config).await;

        server.push_json(json!({ "method": "Log.entryAdded", "params": { "n": 1 } }));
        server.push_json(json!({ "method": "Log.entryAdded", "params": { "n": 2 } }));

        let deadline = Instant::now() + Duration::from_secs(2);
        while session.events().queued_len() < 2 && Instant::now() < deadline {
            session.poll(Duration::from_millis(50)).await.expect("poll");
        }
        assert_eq!(session.events().queued_len(), 2);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        session.on("Log.entryAdded", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(session.flush_events(), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_typed_call() {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Evaluate<'a> {
            expression: &'a str,
            return_by_value: bool,
        }

        #[derive(Deserialize)]
        struct Evaluated {
            result: RemoteObject,
        }

        #[derive(Deserialize)]
        struct RemoteObject {
            value: i64,
        }

        let server = MockServer::responding(|request| {
            assert_eq!(request["params"]["returnByValue"], true);
            vec![result_for(request, json!({ "result": { "type": "number", "value": 2 } }))]
        })
        .await;
        let session = session_for(&server, SessionConfig::default()).await;

        let evaluated: Evaluated = session
            .call(
                "Runtime.evaluate",
                &Evaluate {
                    expression: "1 + 1",
                    return_by_value: true,
                },
            )
            .await
            .expect("call");
        assert_eq!(evaluated.result.value, 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let server = MockServer::echo().await;
        let session = session_for(&server, SessionConfig::default()).await;

        session.close().await.expect("close");
        session.close().await.expect("close again");
        assert!(!session.is_connected());
        assert!(matches!(
            session.poll(Duration::ZERO).await,
            Err(Error::ConnectionClosed)
        ));
    }
}
