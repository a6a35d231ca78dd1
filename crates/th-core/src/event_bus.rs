use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::types::{Event, EventType, ParseEnumError};

/// Default number of events retained in the in-memory history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10_000;

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type Handler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// Which events a subscriber receives. `"*"` parses to [`EventFilter::All`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFilter {
    All,
    Only(EventType),
}

impl EventFilter {
    pub fn matches(&self, event_type: EventType) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(t) => *t == event_type,
        }
    }
}

impl From<EventType> for EventFilter {
    fn from(t: EventType) -> Self {
        EventFilter::Only(t)
    }
}

impl FromStr for EventFilter {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            Ok(EventFilter::All)
        } else {
            s.parse().map(EventFilter::Only)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Inner {
    handlers: DashMap<EventFilter, Vec<(SubscriptionId, Handler)>>,
    channels: Mutex<Vec<(EventFilter, flume::Sender<Event>)>>,
    history: Mutex<VecDeque<Event>>,
    capacity: usize,
    next_id: AtomicU64,
}

/// In-process publish/subscribe with wildcard subscriptions and a bounded
/// history buffer.
///
/// Handlers are dispatched fire-and-forget: each invocation runs as its own
/// detached tokio task, so a slow or panicking handler never delays
/// [`emit`](Self::emit) or its siblings. The bus is cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: DashMap::new(),
                channels: Mutex::new(Vec::new()),
                history: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                capacity,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register an async handler for `filter`.
    pub fn subscribe<F, Fut>(&self, filter: impl Into<EventFilter>, handler: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)));
        self.inner
            .handlers
            .entry(filter.into())
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a handler. Returns `false` if it was not registered under
    /// `filter`.
    pub fn unsubscribe(&self, filter: impl Into<EventFilter>, id: SubscriptionId) -> bool {
        let filter = filter.into();
        let Some(mut entry) = self.inner.handlers.get_mut(&filter) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|(sub, _)| *sub != id);
        before != entry.len()
    }

    /// Register a channel subscriber; the receiver gets every matching event
    /// emitted from now on. Dropped receivers are pruned on the next emit.
    pub fn subscribe_channel(&self, filter: impl Into<EventFilter>) -> flume::Receiver<Event> {
        let (tx, rx) = flume::unbounded();
        lock(&self.inner.channels).push((filter.into(), tx));
        rx
    }

    /// Record `event` in history, then dispatch it to every matching
    /// handler and channel.
    pub fn emit(&self, event: Event) {
        {
            let mut history = lock(&self.inner.history);
            history.push_back(event.clone());
            while history.len() > self.inner.capacity {
                history.pop_front();
            }
        }

        let handlers = self.matching_handlers(event.event_type);
        if !handlers.is_empty() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    for handler in handlers {
                        let event = event.clone();
                        let event_type = event.event_type;
                        let join = runtime.spawn(async move { handler(event).await });
                        runtime.spawn(async move {
                            if let Err(e) = join.await {
                                if e.is_panic() {
                                    warn!(event_type = %event_type, "event handler panicked");
                                }
                            }
                        });
                    }
                }
                Err(_) => {
                    warn!(
                        event_type = %event.event_type,
                        handlers = handlers.len(),
                        "no tokio runtime; skipping handler dispatch"
                    );
                }
            }
        }

        lock(&self.inner.channels).retain(|(filter, tx)| {
            !filter.matches(event.event_type) || tx.send(event.clone()).is_ok()
        });

        debug!(event_type = %event.event_type, task_id = ?event.task_id, "event emitted");
    }

    /// Build and emit an event of `event_type` whose payload is `data`.
    pub fn emit_new(&self, event_type: EventType, data: serde_json::Value) -> Event {
        let event = Event::new(event_type).with_fields(data);
        self.emit(event.clone());
        event
    }

    /// Retained events, oldest first, optionally filtered.
    pub fn get_history(&self, filter: Option<EventFilter>) -> Vec<Event> {
        let history = lock(&self.inner.history);
        history
            .iter()
            .filter(|e| filter.map_or(true, |f| f.matches(e.event_type)))
            .cloned()
            .collect()
    }

    pub fn history_len(&self) -> usize {
        lock(&self.inner.history).len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of registered handlers across all filters.
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.iter().map(|e| e.value().len()).sum()
    }

    fn matching_handlers(&self, event_type: EventType) -> Vec<Handler> {
        let mut out = Vec::new();
        for filter in [EventFilter::All, EventFilter::Only(event_type)] {
            if let Some(entry) = self.inner.handlers.get(&filter) {
                out.extend(entry.iter().map(|(_, h)| Arc::clone(h)));
            }
        }
        out
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
