//! Named-event subscriptions and dispatch.
//!
//! # Semantics
//!
//! - Handlers for an event run in registration order.
//! - A handler returning `Err` or panicking is logged and skipped; later
//!   handlers still run and the dispatch caller never sees the failure.
//! - `once` subscriptions are removed before they run, so they fire exactly
//!   once even when they fail or when dispatches race.
//! - Events can be queued before anyone subscribes and replayed in FIFO
//!   order by [`EventBus::flush`]. The queue is bounded and drops its oldest
//!   entry when full.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{IdSequence, SubscriptionId};

// ============================================================================
// Constants
// ============================================================================

/// Default capacity of the pre-registration queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

// ============================================================================
// Types
// ============================================================================

/// Error type handlers may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type handlers return.
pub type HandlerResult = std::result::Result<(), BoxError>;

/// Event handler callback.
pub type EventHandler = Arc<dyn Fn(&Value) -> HandlerResult + Send + Sync>;

/// Predicate deciding whether an event satisfies a waiter.
type Predicate = Box<dyn Fn(&Value) -> bool + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    handler: EventHandler,
    once: bool,
}

struct Waiter {
    predicate: Option<Predicate>,
    tx: oneshot::Sender<Value>,
}

#[derive(Default)]
struct BusState {
    handlers: FxHashMap<String, Vec<Subscription>>,
    waiters: FxHashMap<String, Vec<Waiter>>,
    queue: VecDeque<(String, Value)>,
}

// ============================================================================
// EventBus
// ============================================================================

/// Registry of event subscriptions.
///
/// Shared behind an `Arc`; every method takes `&self`.
pub struct EventBus {
    state: Mutex<BusState>,
    ids: IdSequence,
    queue_capacity: usize,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EventBus")
            .field("events", &state.handlers.len())
            .field("queued", &state.queue.len())
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus with the default queue capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates a bus whose pre-registration queue holds at most `capacity` events.
    #[must_use]
    pub fn with_queue_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            ids: IdSequence::new(),
            queue_capacity: capacity.max(1),
        }
    }
}

// ============================================================================
// EventBus - Subscriptions
// ============================================================================

impl EventBus {
    /// Subscribes `handler` to every occurrence of `event`.
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe(event.into(), Arc::new(handler), false)
    }

    /// Subscribes `handler` to the next occurrence of `event` only.
    pub fn once<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe(event.into(), Arc::new(handler), true)
    }

    fn subscribe(&self, event: String, handler: EventHandler, once: bool) -> SubscriptionId {
        let id = SubscriptionId::new(self.ids.next());
        trace!(%event, %id, once, "Subscribed");
        self.state
            .lock()
            .handlers
            .entry(event)
            .or_default()
            .push(Subscription { id, handler, once });
        id
    }

    /// Removes one subscription. Returns `true` if it existed.
    pub fn off(&self, event: &str, id: SubscriptionId) -> bool {
        let mut state = self.state.lock();
        let Some(subs) = state.handlers.get_mut(event) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|sub| sub.id != id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            state.handlers.remove(event);
        }
        removed
    }

    /// Removes every subscription for `event`, or for all events with `None`.
    pub fn off_all(&self, event: Option<&str>) {
        let mut state = self.state.lock();
        match event {
            Some(event) => {
                state.handlers.remove(event);
            }
            None => state.handlers.clear(),
        }
    }

    /// Returns `true` if `event` has at least one subscription.
    #[must_use]
    pub fn has_handlers(&self, event: &str) -> bool {
        self.state
            .lock()
            .handlers
            .get(event)
            .is_some_and(|subs| !subs.is_empty())
    }

    /// Returns the number of subscriptions for `event`.
    #[must_use]
    pub fn handler_count(&self, event: &str) -> usize {
        self.state.lock().handlers.get(event).map_or(0, Vec::len)
    }

    /// Returns `true` if `event` has a subscription or a pending waiter.
    #[must_use]
    pub fn has_listeners(&self, event: &str) -> bool {
        let state = self.state.lock();
        state.handlers.get(event).is_some_and(|s| !s.is_empty())
            || state
                .waiters
                .get(event)
                .is_some_and(|w| w.iter().any(|waiter| !waiter.tx.is_closed()))
    }
}

// ============================================================================
// EventBus - Dispatch
// ============================================================================

impl EventBus {
    /// Delivers `params` to every handler of `event`.
    ///
    /// Returns the number of handlers invoked. Handler failures are logged,
    /// never propagated.
    pub fn dispatch(&self, event: &str, params: &Value) -> usize {
        self.resolve_waiters(event, params);
        let handlers = self.take_handlers(event);

        for (id, handler) in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(params))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(%event, subscription = %id, error = %e, "Event handler failed");
                }
                Err(panic) => {
                    error!(
                        %event,
                        subscription = %id,
                        panic = panic_message(panic.as_ref()),
                        "Event handler panicked"
                    );
                }
            }
        }

        trace!(%event, handlers = handlers.len(), "Event dispatched");
        handlers.len()
    }

    /// Resolves waiters whose predicate accepts `params`.
    ///
    /// Predicates run without the state lock held, so they may call back
    /// into the bus. A panicking predicate counts as "no match".
    fn resolve_waiters(&self, event: &str, params: &Value) {
        let Some(waiters) = self.state.lock().waiters.remove(event) else {
            return;
        };

        let mut unmatched = Vec::with_capacity(waiters.len());
        for waiter in waiters {
            if waiter.tx.is_closed() {
                continue;
            }
            let matched = match &waiter.predicate {
                None => true,
                Some(predicate) => match catch_unwind(AssertUnwindSafe(|| predicate(params))) {
                    Ok(matched) => matched,
                    Err(panic) => {
                        error!(
                            %event,
                            panic = panic_message(panic.as_ref()),
                            "Event waiter predicate panicked"
                        );
                        false
                    }
                },
            };
            if matched {
                let _ = waiter.tx.send(params.clone());
            } else {
                unmatched.push(waiter);
            }
        }

        if unmatched.is_empty() {
            return;
        }
        // Waiters registered while the predicates ran go after the survivors.
        let mut state = self.state.lock();
        let slot = state.waiters.entry(event.to_string()).or_default();
        unmatched.append(slot);
        *slot = unmatched;
    }

    /// Snapshots handlers for one dispatch, removing `once` subscriptions.
    fn take_handlers(&self, event: &str) -> Vec<(SubscriptionId, EventHandler)> {
        let mut state = self.state.lock();

        let Some(subs) = state.handlers.get_mut(event) else {
            return Vec::new();
        };
        let snapshot = subs
            .iter()
            .map(|sub| (sub.id, Arc::clone(&sub.handler)))
            .collect();
        subs.retain(|sub| !sub.once);
        if subs.is_empty() {
            state.handlers.remove(event);
        }
        snapshot
    }

    /// Buffers an event for later replay by [`EventBus::flush`].
    ///
    /// Drops the oldest queued event when the queue is full.
    pub fn queue(&self, event: impl Into<String>, params: Value) {
        let mut state = self.state.lock();
        if state.queue.len() >= self.queue_capacity
            && let Some((dropped, _)) = state.queue.pop_front()
        {
            debug!(event = %dropped, capacity = self.queue_capacity, "Event queue full, dropped oldest");
        }
        state.queue.push_back((event.into(), params));
    }

    /// Replays queued events in FIFO order through [`EventBus::dispatch`].
    ///
    /// Returns the number of events replayed.
    pub fn flush(&self) -> usize {
        let queued = std::mem::take(&mut self.state.lock().queue);
        let count = queued.len();
        for (event, params) in queued {
            self.dispatch(&event, &params);
        }
        count
    }

    /// Returns the number of queued events.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.state.lock().queue.len()
    }
}

// ============================================================================
// EventBus - Waiting
// ============================================================================

impl EventBus {
    /// Registers a one-shot waiter for the next `event` whose params satisfy
    /// `predicate` (any occurrence when `None`).
    ///
    /// The waiter is registered immediately, so an event that arrives before
    /// [`EventWaiter::wait`] is polled is not missed.
    pub fn wait_for<P>(&self, event: impl Into<String>, predicate: Option<P>) -> EventWaiter
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        let event = event.into();
        let (tx, rx) = oneshot::channel();
        let predicate = predicate.map(|p| Box::new(p) as Predicate);

        self.state
            .lock()
            .waiters
            .entry(event.clone())
            .or_default()
            .push(Waiter { predicate, tx });

        EventWaiter { event, rx }
    }
}

// ============================================================================
// EventWaiter
// ============================================================================

/// Handle resolving with the params of the awaited event.
#[derive(Debug)]
pub struct EventWaiter {
    event: String,
    rx: oneshot::Receiver<Value>,
}

impl EventWaiter {
    /// Returns the awaited event name.
    #[inline]
    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Returns the params if the event already arrived.
    pub fn try_take(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }

    /// Waits up to `wait` for the event.
    ///
    /// Something else must be reading the connection meanwhile; see
    /// [`Session::wait_for_event`](crate::Session::wait_for_event) for a
    /// variant that drives the read loop itself.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the event does not arrive in time
    /// - [`Error::ConnectionClosed`] if the bus was dropped
    pub async fn wait(self, wait: Duration) -> Result<Value> {
        match timeout(wait, self.rx).await {
            Ok(Ok(params)) => Ok(params),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::timeout(
                format!("waiting for event {}", self.event),
                wait.as_millis() as u64,
            )),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

// ============================================================================
// Tests
// ============================================================================
