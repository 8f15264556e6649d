//! In-process typed publish/subscribe event bus (spec.md §4.1).
//!
//! A process-lifetime singleton: a plain `OnceLock`-backed static over a
//! dependency-heavy DI container (see `clock.rs` for the same "stdlib over
//! extra crate" call). Each subscriber owns a bounded queue backed by a
//! shared `VecDeque`; a full queue drops the oldest pending event for that
//! subscriber rather than blocking the publisher.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Heartbeat,
    DataSyncStarted,
    DataSyncCompleted,
    BacktestStarted,
    BacktestCompleted,
    BrokerConnected,
    BrokerDisconnected,
    QuoteReceived,
    BarReceived,
    ExecutionIntentCreated,
    ExecutionOrderSubmitted,
    ExecutionOrderAcknowledged,
    ExecutionOrderRejected,
    ExecutionOrderFilled,
    AutopilotEnabled,
    AutopilotDisabled,
    AutopilotSignal,
    KillSwitchActivated,
    KillSwitchReset,
    KillSwitchCloseFailed,
    ReconciliationWarning,
    PositionsUpdated,
    RecommendationApplied,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub created_at: DateTime<Utc>,
    pub run_id: Option<String>,
    pub data: HashMap<String, Value>,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            created_at: Utc::now(),
            run_id: None,
            data: HashMap::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}

const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// The queue half of a subscriber: shared between the publisher (which
/// pushes, dropping the oldest entry on overflow) and the `Subscription`
/// handle (which pops, waking on `notify`).
struct SharedQueue {
    events: parking_lot::Mutex<VecDeque<Event>>,
    notify: Notify,
}

impl SharedQueue {
    fn new() -> Self {
        Self {
            events: parking_lot::Mutex::new(VecDeque::with_capacity(SUBSCRIBER_QUEUE_CAPACITY)),
            notify: Notify::new(),
        }
    }

    /// Pushes `event`, dropping the oldest queued entry first if the queue
    /// is already at capacity. Returns `true` if an entry was dropped.
    fn push(&self, event: Event) -> bool {
        let mut events = self.events.lock();
        let dropped = if events.len() >= SUBSCRIBER_QUEUE_CAPACITY {
            events.pop_front();
            true
        } else {
            false
        };
        events.push_back(event);
        drop(events);
        self.notify.notify_one();
        dropped
    }

    fn try_pop(&self) -> Option<Event> {
        self.events.lock().pop_front()
    }
}

struct Subscriber {
    id: u64,
    event_type: EventType,
    queue: Arc<SharedQueue>,
    /// Used to make re-subscribing the same logical callback idempotent;
    /// callers pass a stable token (e.g. a component name) instead of a raw
    /// closure, since Rust closures aren't comparable the way Python
    /// callables are.
    token: String,
    dropped: Arc<AtomicU64>,
}

/// Handle returned from `subscribe`; drop or call `unsubscribe` to detach.
pub struct Subscription {
    pub id: u64,
    pub event_type: EventType,
    pub dropped_counter: Arc<AtomicU64>,
    queue: Arc<SharedQueue>,
}

impl Subscription {
    /// Waits for the next event, returning the oldest one currently queued.
    /// Never returns `None`: the bus is a process-lifetime singleton, so a
    /// subscription simply waits forever once unsubscribed.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.queue.try_pop() {
                return Some(event);
            }
            self.queue.notify.notified().await;
        }
    }
}

#[derive(Default)]
struct BusInner {
    subscribers: HashMap<EventType, Vec<Subscriber>>,
    next_id: u64,
}

pub struct EventBus {
    inner: parking_lot::Mutex<BusInner>,
}

impl EventBus {
    fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(BusInner::default()),
        }
    }

    /// Subscribe `token` to `event_type`. Subscribing the same token to the
    /// same event type twice is idempotent: the existing subscription's
    /// queue stays valid and no duplicate entry is created, matching
    /// spec.md's "subscribing the same callback twice is idempotent".
    pub fn subscribe(&self, event_type: EventType, token: impl Into<String>) -> Subscription {
        let token = token.into();
        let mut inner = self.inner.lock();
        let bucket = inner.subscribers.entry(event_type).or_default();
        if let Some(existing) = bucket.iter().find(|s| s.token == token) {
            return Subscription {
                id: existing.id,
                event_type,
                dropped_counter: existing.dropped.clone(),
                queue: existing.queue.clone(),
            };
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let dropped = Arc::new(AtomicU64::new(0));
        let queue = Arc::new(SharedQueue::new());
        inner.subscribers.entry(event_type).or_default().push(Subscriber {
            id,
            event_type,
            queue: queue.clone(),
            token,
            dropped: dropped.clone(),
        });
        Subscription {
            id,
            event_type,
            dropped_counter: dropped,
            queue,
        }
    }

    pub fn unsubscribe(&self, subscription_id: u64) {
        let mut inner = self.inner.lock();
        for bucket in inner.subscribers.values_mut() {
            bucket.retain(|s| s.id != subscription_id);
        }
    }

    /// Publish to all current subscribers of `event.event_type`. Never
    /// blocks: a full subscriber queue drops the oldest pending event for
    /// that subscriber and increments its drop counter.
    pub fn publish(&self, event: Event) {
        let inner = self.inner.lock();
        let Some(bucket) = inner.subscribers.get(&event.event_type) else {
            return;
        };
        for sub in bucket {
            if sub.queue.push(event.clone()) {
                sub.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.inner
            .lock()
            .subscribers
            .get(&event_type)
            .map(|b| b.len())
            .unwrap_or(0)
    }
}

static GLOBAL_BUS: OnceLock<EventBus> = OnceLock::new();

pub fn event_bus() -> &'static EventBus {
    GLOBAL_BUS.get_or_init(EventBus::new)
}
