//! In-process typed event bus.
//!
//! Each subscription owns a private queue; a dispatcher task drains it and
//! invokes the subscription's handler for every event the subscription's
//! filter matches. `BlockProducer` subscriptions use a bounded
//! `tokio::mpsc` channel; `DropOldest` subscriptions use a `VecDeque`-backed
//! ring (the same shape as the latency-sample ring in `realtime.rs`) because
//! `mpsc` gives the producer no way to evict a queued item. This mirrors the
//! way the message router's delivery engine owns one outbound path per
//! destination rather than sharing a single queue across consumers.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, instrument, warn};

use crate::domain_types::{CorrelationId, EventId, Priority, SubscriptionId};

/// Errors raised by the event bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// A blocking publish exceeded its configured timeout.
    #[error("publish timed out waiting for subscriber capacity")]
    PublishTimeout,
    /// The bus has been shut down and no longer accepts publications.
    #[error("event bus is shut down")]
    ShutDown,
}

/// Discriminates the purpose of an event, independent of payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A directive another component should act on.
    Command,
    /// A request for information.
    Query,
    /// A reply to a prior Command/Query.
    Response,
    /// A fact being announced with no expected reply.
    Notification,
    /// An error condition being announced.
    Error,
}

/// A single event flowing through the bus.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique id of this event.
    pub id: EventId,
    /// Event name, matched by name/name-pattern filters (e.g. `"agent_heartbeat"`).
    pub name: String,
    /// Broad category of the event.
    pub kind: EventKind,
    /// Opaque id of the component that published the event.
    pub source: String,
    /// Optional single recipient; absent means "broadcast to matching subscriptions".
    pub target: Option<String>,
    /// Monotonically useful wall-clock timestamp (not used for ordering).
    pub timestamp: std::time::SystemTime,
    /// Delivery priority; also decides the default overflow policy.
    pub priority: Priority,
    /// Links this event to others in the same request/response/workflow exchange.
    pub correlation_id: Option<CorrelationId>,
    /// Structured payload.
    pub payload: Value,
}

impl Event {
    /// Builds a Notification-kind event, the most common publish shape for
    /// background loops and component state changes.
    #[must_use]
    pub fn notification(name: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        Self {
            id: EventId::generate(),
            name: name.into(),
            kind: EventKind::Notification,
            source: source.into(),
            target: None,
            timestamp: std::time::SystemTime::now(),
            priority: Priority::Normal,
            correlation_id: None,
            payload,
        }
    }

    /// Sets the target, builder-style.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Sets the correlation id, builder-style.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Sets the priority, builder-style.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Predicate used to select which events a subscription receives.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Matches events with this exact name.
    Name(String),
    /// Matches events whose name matches this regular expression.
    NamePattern(Arc<Regex>),
    /// Matches events of this kind.
    Kind(EventKind),
    /// Matches events published by this source.
    Source(String),
    /// Matches events targeted at this recipient (or broadcasts, if `include_broadcast`).
    Target {
        /// Recipient id to match against `Event::target`.
        id: String,
        /// Whether target-absent (broadcast) events also match.
        include_broadcast: bool,
    },
    /// Matches events at or above the given priority.
    MinPriority(Priority),
    /// Matches only if both filters match.
    And(Box<Filter>, Box<Filter>),
    /// Matches if either filter matches.
    Or(Box<Filter>, Box<Filter>),
    /// Matches every event.
    Any,
}

impl Filter {
    /// Builds a name-pattern filter from a regex source string.
    ///
    /// # Errors
    ///
    /// Returns an error if `pattern` is not a valid regular expression.
    pub fn name_pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::NamePattern(Arc::new(Regex::new(pattern)?)))
    }

    fn matches(&self, event: &Event) -> bool {
        match self {
            Self::Name(name) => &event.name == name,
            Self::NamePattern(re) => re.is_match(&event.name),
            Self::Kind(kind) => &event.kind == kind,
            Self::Source(source) => &event.source == source,
            Self::Target { id, include_broadcast } => match &event.target {
                Some(target) => target == id,
                None => *include_broadcast,
            },
            Self::MinPriority(min) => event.priority >= *min,
            Self::And(a, b) => a.matches(event) && b.matches(event),
            Self::Or(a, b) => a.matches(event) || b.matches(event),
            Self::Any => true,
        }
    }
}

/// Overflow behavior when a subscription's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the oldest queued event to make room for the new one.
    DropOldest,
    /// Block the publisher up to a configured timeout, then fail.
    BlockProducer,
}

impl OverflowPolicy {
    /// The overflow policy the bus defaults to for a given priority,
    /// matching the split in the concurrency model: best-effort kinds
    /// drop-oldest, request/response kinds block the producer.
    #[must_use]
    pub fn default_for_kind(kind: EventKind) -> Self {
        match kind {
            EventKind::Command | EventKind::Query | EventKind::Response => {
                Self::BlockProducer
            }
            EventKind::Notification | EventKind::Error => Self::DropOldest,
        }
    }
}

/// Async callback invoked once per matching event delivered to a subscription.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handles one delivered event. Errors are logged and never propagate to
    /// the bus or to other subscriptions.
    async fn handle(&self, event: Event);
}

#[async_trait]
impl<F> Handler for F
where
    F: Fn(Event) -> futures::future::BoxFuture<'static, ()> + Send + Sync,
{
    async fn handle(&self, event: Event) {
        (self)(event).await;
    }
}

/// A bounded, producer-evictable queue backing a `DropOldest` subscription.
///
/// `tokio::mpsc` has no API for a sender to pop a queued item, so a genuine
/// drop-oldest policy needs its own ring: the producer locks the deque,
/// evicts the front entry if at capacity, and pushes the new event.
struct RingQueue {
    capacity: usize,
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: AtomicBool,
}

impl RingQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Pushes `event`, evicting the oldest queued event first if already at
    /// capacity. Returns `true` if an eviction happened.
    async fn push_dropping_oldest(&self, event: Event) -> bool {
        let mut queue = self.queue.lock().await;
        let evicted = queue.len() >= self.capacity && queue.pop_front().is_some();
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
        evicted
    }

    /// Waits for and removes the oldest queued event, or returns `None` once
    /// the queue is closed and drained.
    async fn pop(&self) -> Option<Event> {
        loop {
            let notified = self.notify.notified();
            {
                let mut queue = self.queue.lock().await;
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// The per-subscription delivery path, chosen by the subscription's
/// overflow policy.
enum Queue {
    Blocking(mpsc::Sender<Event>),
    Ring(Arc<RingQueue>),
}

struct Subscription {
    filter: Filter,
    queue: Queue,
}

/// Runtime metrics snapshot for the bus.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BusMetrics {
    /// Total events published.
    pub published: u64,
    /// Total successful deliveries across all subscriptions.
    pub delivered: u64,
    /// Total events dropped due to drop-oldest overflow.
    pub dropped: u64,
    /// Total blocking publishes that timed out.
    pub publish_timeouts: u64,
    /// Total handler panics/errors observed (always logged, never propagated).
    pub handler_failures: u64,
}

/// In-process typed pub/sub bus.
pub struct EventBus {
    subscriptions: DashMap<SubscriptionId, Arc<Subscription>>,
    default_capacity: usize,
    block_timeout: std::time::Duration,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    publish_timeouts: AtomicU64,
    handler_failures: AtomicU64,
}

impl EventBus {
    /// Creates a new bus with the given default per-subscription queue
    /// capacity and blocking-publish timeout.
    #[must_use]
    pub fn new(default_capacity: usize, block_timeout: std::time::Duration) -> Self {
        Self {
            subscriptions: DashMap::new(),
            default_capacity,
            block_timeout,
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            publish_timeouts: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
        }
    }

    /// Subscribes a handler under the given filter, returning an id usable
    /// with `unsubscribe`. Spawns one dispatcher task that drains the
    /// subscription's private queue in publish order for any single source.
    pub fn subscribe(&self, filter: Filter, handler: Arc<dyn Handler>) -> SubscriptionId {
        self.subscribe_with_overflow(filter, handler, None)
    }

    /// Like `subscribe`, but allows overriding the default per-kind overflow policy.
    pub fn subscribe_with_overflow(
        &self,
        filter: Filter,
        handler: Arc<dyn Handler>,
        overflow_policy: Option<OverflowPolicy>,
    ) -> SubscriptionId {
        let id = SubscriptionId::generate();
        let policy = overflow_policy.unwrap_or(OverflowPolicy::DropOldest);

        let queue = match policy {
            OverflowPolicy::BlockProducer => {
                let (tx, mut rx) = mpsc::channel(self.default_capacity);
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        handler.handle(event).await;
                    }
                });
                Queue::Blocking(tx)
            }
            OverflowPolicy::DropOldest => {
                let ring = Arc::new(RingQueue::new(self.default_capacity));
                let dispatch_ring = Arc::clone(&ring);
                tokio::spawn(async move {
                    while let Some(event) = dispatch_ring.pop().await {
                        handler.handle(event).await;
                    }
                });
                Queue::Ring(ring)
            }
        };

        let subscription = Arc::new(Subscription { filter, queue });
        self.subscriptions.insert(id, subscription);

        id
    }

    /// Removes a subscription. Idempotent: unsubscribing an unknown id is a no-op.
    ///
    /// Closing a `DropOldest` subscription's ring wakes and ends its
    /// dispatcher task once the ring drains; `BlockProducer` subscriptions
    /// end their dispatcher simply by dropping the `mpsc::Sender`.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some((_, subscription)) = self.subscriptions.remove(&id) {
            if let Queue::Ring(ring) = &subscription.queue {
                ring.close();
            }
        }
    }

    /// Publishes an event to every subscription whose filter matches.
    ///
    /// # Errors
    ///
    /// Returns `BusError::PublishTimeout` if a block-producer subscription's
    /// queue stays full past the configured timeout.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_name = %event.name))]
    pub async fn publish(&self, event: Event) -> Result<(), BusError> {
        self.published.fetch_add(1, Ordering::Relaxed);

        let matching: Vec<Arc<Subscription>> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().filter.matches(&event))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for subscription in matching {
            self.deliver_to(&subscription, event.clone()).await?;
        }

        Ok(())
    }

    async fn deliver_to(&self, subscription: &Subscription, event: Event) -> Result<(), BusError> {
        match &subscription.queue {
            Queue::Blocking(sender) => {
                match tokio::time::timeout(self.block_timeout, sender.send(event)).await {
                    Ok(Ok(())) => {
                        self.delivered.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Ok(Err(_)) => Ok(()), // receiver dropped; subscription is gone
                    Err(_) => {
                        self.publish_timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!("publish blocked past timeout, dropping for this subscription");
                        Err(BusError::PublishTimeout)
                    }
                }
            }
            Queue::Ring(ring) => {
                if ring.push_dropping_oldest(event).await {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("subscription queue full, dropped oldest queued event");
                }
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Records (for test/metrics purposes) that a handler invocation failed.
    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of cumulative bus metrics.
    #[must_use]
    pub fn metrics(&self) -> BusMetrics {
        BusMetrics {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            publish_timeouts: self.publish_timeouts.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

/// Per-source sequence tracker used by tests that assert publish ordering is
/// preserved per (source, subscription) pair.
#[derive(Default)]
pub struct OrderingProbe {
    seen: BTreeMap<String, Vec<u64>>,
}

impl OrderingProbe {
    /// Records the event's declared sequence number (carried in payload.seq)
    /// under its source.
    pub fn record(&mut self, source: &str, seq: u64) {
        self.seen.entry(source.to_string()).or_default().push(seq);
    }

    /// True if, for every source, recorded sequence numbers are non-decreasing.
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        self.seen
            .values()
            .all(|seqs| seqs.windows(2).all(|w| w[0] <= w[1]))
    }
}
