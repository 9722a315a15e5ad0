// ============================================================================
// BROADCAST HUB
// ============================================================================
// One-to-many fan-out of stream events with per-subscriber bounded queues.
//
// Subscriber lifecycle:
//
//   Connecting ──activate──▶ Active ──overflow / transport error / unsubscribe──▶ Closing ──▶ Closed
//
// While Connecting, live events are parked in a bounded pending list. The
// transition to Active queues the initial snapshot first and then the parked
// events, under the same lock `publish` takes, so a subscriber never sees a
// live event before its snapshot and never misses one in between.
//
// `publish` never waits: a subscriber whose queue is full is dropped.
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, trace, warn};

use crate::error::{TransportError, TransportResult};
use crate::telemetry::EngineMetrics;
use crate::types::{MetricPoint, StreamEvent};

// ----------------------------------------------------------------------------
// Identity & State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for SubscriberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why a subscriber left the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Send queue exceeded its capacity
    Overflow,
    /// The transport failed
    Transport,
    /// Explicit unsubscribe or handle dropped
    Unsubscribed,
    /// Hub shut down
    Shutdown,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Overflow => "overflow",
            DropReason::Transport => "transport",
            DropReason::Unsubscribed => "unsubscribed",
            DropReason::Shutdown => "shutdown",
        }
    }
}

impl Display for DropReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type SharedEvent = Arc<StreamEvent>;

struct Slot {
    state: SubscriberState,
    sender: Option<mpsc::Sender<SharedEvent>>,
    pending: Vec<SharedEvent>,
}

#[derive(Debug, Default)]
struct HubCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time hub statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub subscribers: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
}

// ----------------------------------------------------------------------------
// Hub
// ----------------------------------------------------------------------------

pub struct BroadcastHub {
    slots: DashMap<SubscriberId, Mutex<Slot>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    counters: HubCounters,
    metrics: EngineMetrics,
}

impl BroadcastHub {
    pub fn new(queue_capacity: usize, metrics: EngineMetrics) -> Self {
        Self {
            slots: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            counters: HubCounters::default(),
            metrics,
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Register a subscriber in the Connecting state. Live events published
    /// from now on are held until [`PendingSubscription::activate`].
    pub fn begin_subscribe(self: &Arc<Self>) -> PendingSubscription {
        let id = SubscriberId(self.next_id.fetch_add(1, AtomicOrdering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        self.slots.insert(
            id,
            Mutex::new(Slot {
                state: SubscriberState::Connecting,
                sender: Some(sender),
                pending: Vec::new(),
            }),
        );
        self.metrics.subscribers_active.inc();
        debug!(target: "pulse::hub", subscriber = %id, "Subscriber connecting");

        PendingSubscription {
            hub: Arc::clone(self),
            id,
            receiver: Some(receiver),
        }
    }

    /// Enqueue `event` to every subscriber. Returns how many accepted it
    /// (queued or parked).
    pub fn publish(&self, event: StreamEvent) -> usize {
        let event = Arc::new(event);
        self.counters.published.fetch_add(1, AtomicOrdering::Relaxed);

        // Parked events plus the initial snapshot must fit the queue.
        let pending_limit = self.queue_capacity.saturating_sub(1);
        let mut accepted = 0;
        let mut doomed = Vec::new();

        for entry in self.slots.iter() {
            let mut slot = entry.value().lock();
            match slot.state {
                SubscriberState::Connecting => {
                    if slot.pending.len() >= pending_limit {
                        slot.state = SubscriberState::Closing;
                        doomed.push((*entry.key(), DropReason::Overflow));
                    } else {
                        slot.pending.push(Arc::clone(&event));
                        accepted += 1;
                    }
                }
                SubscriberState::Active => {
                    let Some(sender) = slot.sender.as_ref() else {
                        continue;
                    };
                    match sender.try_send(Arc::clone(&event)) {
                        Ok(()) => accepted += 1,
                        Err(TrySendError::Full(_)) => {
                            slot.state = SubscriberState::Closing;
                            doomed.push((*entry.key(), DropReason::Overflow));
                        }
                        Err(TrySendError::Closed(_)) => {
                            slot.state = SubscriberState::Closing;
                            doomed.push((*entry.key(), DropReason::Transport));
                        }
                    }
                }
                SubscriberState::Closing | SubscriberState::Closed => {}
            }
        }

        for (id, reason) in doomed {
            self.drop_subscriber(id, reason);
        }

        self.counters
            .delivered
            .fetch_add(accepted as u64, AtomicOrdering::Relaxed);
        trace!(target: "pulse::hub", kind = event.kind(), accepted, "Event published");
        accepted
    }

    /// Remove a subscriber. Safe to call repeatedly; returns whether it was present.
    pub fn drop_subscriber(&self, id: SubscriberId, reason: DropReason) -> bool {
        let Some((_, slot)) = self.slots.remove(&id) else {
            return false;
        };
        {
            let mut slot = slot.lock();
            slot.state = SubscriberState::Closing;
            slot.pending.clear();
            // Dropping the sender lets the receiver drain what is queued, then end.
            slot.sender = None;
            slot.state = SubscriberState::Closed;
        }

        self.metrics.subscribers_active.dec();
        self.metrics.record_drop(reason);
        self.counters.dropped.fetch_add(1, AtomicOrdering::Relaxed);

        match reason {
            DropReason::Overflow => warn!(
                target: "pulse::hub",
                error = %TransportError::QueueOverflow {
                    subscriber: id.to_string(),
                    capacity: self.queue_capacity,
                },
                "Dropping slow subscriber"
            ),
            DropReason::Transport => info!(
                target: "pulse::hub",
                subscriber = %id,
                "Subscriber transport failed"
            ),
            DropReason::Unsubscribed | DropReason::Shutdown => debug!(
                target: "pulse::hub",
                subscriber = %id,
                reason = %reason,
                "Subscriber removed"
            ),
        }
        true
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.drop_subscriber(id, DropReason::Unsubscribed)
    }

    /// Closed for any id that is no longer registered
    pub fn state(&self, id: SubscriberId) -> SubscriberState {
        self.slots
            .get(&id)
            .map(|slot| slot.value().lock().state)
            .unwrap_or(SubscriberState::Closed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots.len()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            subscribers: self.subscriber_count(),
            published: self.counters.published.load(AtomicOrdering::Relaxed),
            delivered: self.counters.delivered.load(AtomicOrdering::Relaxed),
            dropped: self.counters.dropped.load(AtomicOrdering::Relaxed),
        }
    }

    /// Close every subscriber
    pub fn shutdown(&self) {
        let ids: Vec<SubscriberId> = self.slots.iter().map(|e| *e.key()).collect();
        let count = ids.len();
        for id in ids {
            self.drop_subscriber(id, DropReason::Shutdown);
        }
        info!(target: "pulse::hub", closed = count, "Broadcast hub shut down");
    }

    fn activate(&self, id: SubscriberId, initial: Vec<MetricPoint>) -> bool {
        let Some(entry) = self.slots.get(&id) else {
            return false;
        };
        let mut slot = entry.value().lock();
        if slot.state != SubscriberState::Connecting {
            return false;
        }
        let Some(sender) = slot.sender.clone() else {
            return false;
        };

        let parked = std::mem::take(&mut slot.pending);
        let snapshot_len = initial.len();
        let mut queued = true;
        for event in std::iter::once(Arc::new(StreamEvent::Initial(initial))).chain(parked) {
            if sender.try_send(event).is_err() {
                queued = false;
                break;
            }
        }
        if !queued {
            slot.state = SubscriberState::Closing;
            drop(slot);
            drop(entry);
            self.drop_subscriber(id, DropReason::Overflow);
            return false;
        }

        slot.state = SubscriberState::Active;
        debug!(
            target: "pulse::hub",
            subscriber = %id,
            snapshot = snapshot_len,
            "Subscriber active"
        );
        true
    }
}

// ----------------------------------------------------------------------------
// Handles
// ----------------------------------------------------------------------------

/// A subscriber that has not yet received its snapshot
pub struct PendingSubscription {
    hub: Arc<BroadcastHub>,
    id: SubscriberId,
    receiver: Option<mpsc::Receiver<SharedEvent>>,
}

impl PendingSubscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Queue the initial snapshot (oldest first) and go live
    pub fn activate(mut self, initial: Vec<MetricPoint>) -> Subscription {
        self.hub.activate(self.id, initial);
        Subscription {
            hub: Arc::clone(&self.hub),
            id: self.id,
            receiver: self.receiver.take(),
        }
    }
}

impl Drop for PendingSubscription {
    fn drop(&mut self) {
        // Abandoned before activation
        if self.receiver.is_some() {
            self.hub.unsubscribe(self.id);
        }
    }
}

/// Destination of a subscription's events
#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, event: &StreamEvent) -> TransportResult<()>;
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    hub: Arc<BroadcastHub>,
    id: SubscriberId,
    receiver: Option<mpsc::Receiver<SharedEvent>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn state(&self) -> SubscriberState {
        self.hub.state(self.id)
    }

    /// Next event in publish order; `None` once closed and drained
    pub async fn recv(&mut self) -> Option<Arc<StreamEvent>> {
        self.receiver.as_mut()?.recv().await
    }

    /// Forward events to `sink` until the subscription closes or the sink fails
    pub async fn pump<S: EventSink + ?Sized>(&mut self, sink: &mut S) -> TransportResult<()> {
        while let Some(event) = self.recv().await {
            if let Err(e) = sink.send(&event).await {
                self.hub.drop_subscriber(self.id, DropReason::Transport);
                return Err(e);
            }
        }
        Err(TransportError::Disconnected {
            subscriber: self.id.to_string(),
        })
    }

    pub fn unsubscribe(&self) {
        self.hub.unsubscribe(self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MetricType, Timestamp};

    fn hub(capacity: usize) -> Arc<BroadcastHub> {
        Arc::new(BroadcastHub::new(capacity, EngineMetrics::new().unwrap()))
    }

    fn metric(value: f64) -> StreamEvent {
        StreamEvent::Metric(
            MetricPoint::new("auth", MetricType::Latency, value).with_timestamp(Timestamp::from_secs(1)),
        )
    }

    fn value_of(event: &StreamEvent) -> f64 {
        match event {
            StreamEvent::Metric(p) => p.value,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_initial_snapshot_precedes_live_events() {
        let hub = hub(16);
        let pending = hub.begin_subscribe();
        assert_eq!(hub.state(pending.id()), SubscriberState::Connecting);

        assert_eq!(hub.publish(metric(1.0)), 1);
        assert_eq!(hub.publish(metric(2.0)), 1);

        let snapshot = vec![MetricPoint::new("auth", MetricType::Latency, 0.5)];
        let mut sub = pending.activate(snapshot);
        assert_eq!(sub.state(), SubscriberState::Active);
        hub.publish(metric(3.0));

        let first = sub.recv().await.unwrap();
        assert!(matches!(first.as_ref(), StreamEvent::Initial(points) if points.len() == 1));
        for expected in [1.0, 2.0, 3.0] {
            assert_eq!(value_of(&sub.recv().await.unwrap()), expected);
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped_others_unaffected() {
        let hub = hub(4);
        let mut slow = hub.begin_subscribe().activate(Vec::new());
        let mut fast = hub.begin_subscribe().activate(Vec::new());
        assert!(matches!(slow.recv().await.unwrap().as_ref(), StreamEvent::Initial(_)));
        assert!(matches!(fast.recv().await.unwrap().as_ref(), StreamEvent::Initial(_)));

        for i in 0..4 {
            hub.publish(metric(i as f64));
        }
        for i in 0..4 {
            assert_eq!(value_of(&fast.recv().await.unwrap()), i as f64);
        }

        assert_eq!(hub.publish(metric(4.0)), 1);
        assert_eq!(slow.state(), SubscriberState::Closed);
        assert_eq!(fast.state(), SubscriberState::Active);
        assert_eq!(value_of(&fast.recv().await.unwrap()), 4.0);

        // Queued events drain, then the stream ends.
        let mut drained = 0;
        while slow.recv().await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, 4);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(hub.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_connecting_overflow_drops() {
        let hub = hub(3);
        let pending = hub.begin_subscribe();
        hub.publish(metric(1.0));
        hub.publish(metric(2.0));
        assert_eq!(hub.publish(metric(3.0)), 0);
        assert_eq!(hub.state(pending.id()), SubscriberState::Closed);

        let mut sub = pending.activate(Vec::new());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_idempotent() {
        let hub = hub(8);
        let sub = hub.begin_subscribe().activate(Vec::new());
        let id = sub.id();
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.publish(metric(1.0)), 0);
    }

    #[tokio::test]
    async fn test_dropping_handles_unsubscribes() {
        let hub = hub(8);
        let pending = hub.begin_subscribe();
        let sub = hub.begin_subscribe().activate(Vec::new());
        assert_eq!(hub.subscriber_count(), 2);
        drop(pending);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn send(&mut self, _event: &StreamEvent) -> TransportResult<()> {
            Err(TransportError::SendFailed {
                subscriber: "test".into(),
                message: "broken pipe".into(),
            })
        }
    }

    struct CollectingSink(Vec<String>);

    #[async_trait]
    impl EventSink for CollectingSink {
        async fn send(&mut self, event: &StreamEvent) -> TransportResult<()> {
            self.0.push(event.kind().to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_transport_failure_isolated() {
        let hub = hub(8);
        let mut broken = hub.begin_subscribe().activate(Vec::new());
        let mut healthy = hub.begin_subscribe().activate(Vec::new());

        let err = broken.pump(&mut FailingSink).await.unwrap_err();
        assert!(matches!(err, TransportError::SendFailed { .. }));
        assert_eq!(broken.state(), SubscriberState::Closed);

        hub.publish(metric(1.0));
        hub.shutdown();
        let mut sink = CollectingSink(Vec::new());
        let result = healthy.pump(&mut sink).await;
        assert!(matches!(result, Err(TransportError::Disconnected { .. })));
        assert_eq!(sink.0, vec!["initial".to_string(), "metric".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everyone() {
        let hub = hub(8);
        let mut a = hub.begin_subscribe().activate(Vec::new());
        let b = hub.begin_subscribe();
        hub.shutdown();
        assert_eq!(hub.subscriber_count(), 0);
        assert!(a.recv().await.is_some());
        assert!(a.recv().await.is_none());
        assert_eq!(hub.state(b.id()), SubscriberState::Closed);
    }
}
