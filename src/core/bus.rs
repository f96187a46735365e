//! In-process event bus: the observation channel for the runtime.
//!
//! Every component (chat session, agentic loop, supervisor, skill registry)
//! publishes onto a closed set of [`Topic`]s. Each subscription owns a
//! bounded deque; when it's full, the oldest buffered event is evicted to
//! make room for the new one and a counter increments. The bus never
//! carries RPC results — only observations.
//!
//! The registry of per-subscriber slots follows the same
//! `RwLock<HashMap<...>>` shape the teacher uses for its tool registry
//! (`UnifiedMcpServer`), generalized here to fan one topic out to many
//! bounded queues instead of a single routed value. Delivery uses a
//! `Mutex<VecDeque<Event>>` plus a `Notify` per slot rather than `mpsc`,
//! since `mpsc`'s `Sender` has no way to pop the oldest queued item back out
//! on overflow — a real drop-oldest policy needs direct access to both ends.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

/// Closed set of topics events may be published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    MessageInbound,
    BrowserSnapshot,
    SkillExecuted,
    AgentReady,
    AgentExit,
    AgentShutdown,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::MessageInbound => "message:inbound",
            Topic::BrowserSnapshot => "browser:snapshot",
            Topic::SkillExecuted => "skill:executed",
            Topic::AgentReady => "agent:ready",
            Topic::AgentExit => "agent:exit",
            Topic::AgentShutdown => "agent:shutdown",
        }
    }
}

/// A published event: topic, opaque JSON payload, and publication timestamp.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: Topic,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

struct Slot {
    topic: Topic,
    capacity: usize,
    queue: std::sync::Mutex<VecDeque<Event>>,
    notify: Notify,
    drops: AtomicU64,
    closed: AtomicBool,
}

/// Handle returned by [`EventBus::subscribe`]. Holds this subscription's
/// registration id and a reference to its slot; `receive` pops from the
/// slot's queue directly rather than going through a channel.
pub struct Subscription {
    pub id: Uuid,
    topic: Topic,
    slot: Arc<Slot>,
}

impl Subscription {
    /// Block until the next event is available, or return `None` once the
    /// subscription has been removed (via [`EventBus::unsubscribe`]) and its
    /// queue has drained.
    pub async fn receive(&mut self) -> Option<Event> {
        loop {
            {
                let mut queue = self.slot.queue.lock().unwrap();
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
                if self.slot.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.slot.notify.notified().await;
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Number of events dropped from this subscription's queue due to
    /// overflow since it was created.
    pub fn dropped_count(&self) -> u64 {
        self.slot.drops.load(Ordering::Relaxed)
    }
}

/// In-process, single-replica event bus.
pub struct EventBus {
    capacity: usize,
    subscribers: RwLock<HashMap<Uuid, Arc<Slot>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        EventBus {
            capacity: capacity.max(1),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new subscription on `topic` with this bus's configured
    /// per-subscriber queue capacity.
    pub async fn subscribe(&self, topic: Topic) -> Subscription {
        let id = Uuid::new_v4();
        let slot = Arc::new(Slot {
            topic,
            capacity: self.capacity,
            queue: std::sync::Mutex::new(VecDeque::with_capacity(self.capacity)),
            notify: Notify::new(),
            drops: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.subscribers.write().await.insert(id, slot.clone());
        Subscription { id, topic, slot }
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        if let Some(slot) = self.subscribers.write().await.remove(&id) {
            slot.closed.store(true, Ordering::SeqCst);
            slot.notify.notify_waiters();
        }
    }

    /// Publish `payload` on `topic`. Delivery to every live subscriber on
    /// this topic pushes onto that subscriber's deque; a full deque evicts
    /// its oldest entry first (true drop-oldest, not drop-newest), and that
    /// subscriber's drop counter increments.
    pub async fn publish(&self, topic: Topic, payload: serde_json::Value) {
        let event = Event {
            topic,
            payload,
            timestamp: Utc::now(),
        };

        let subscribers = self.subscribers.read().await;
        for slot in subscribers.values() {
            if slot.topic != topic {
                continue;
            }
            {
                let mut queue = slot.queue.lock().unwrap();
                if queue.len() >= slot.capacity {
                    queue.pop_front();
                    slot.drops.fetch_add(1, Ordering::Relaxed);
                }
                queue.push_back(event.clone());
            }
            slot.notify.notify_one();
        }
    }

    pub async fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscribers
            .read()
            .await
            .values()
            .filter(|s| s.topic == topic)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_matching_subscriber_only() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe(Topic::AgentReady).await;
        bus.publish(Topic::AgentExit, serde_json::json!({"x": 1})).await;
        bus.publish(Topic::AgentReady, serde_json::json!({"agent": "a1"})).await;

        let event = sub.receive().await.unwrap();
        assert_eq!(event.topic, Topic::AgentReady);
        assert_eq!(event.payload["agent"], "a1");
    }

    #[tokio::test]
    async fn preserves_publication_order_per_subscriber() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe(Topic::SkillExecuted).await;
        for i in 0..5 {
            bus.publish(Topic::SkillExecuted, serde_json::json!({"i": i})).await;
        }
        for i in 0..5 {
            let event = sub.receive().await.unwrap();
            assert_eq!(event.payload["i"], i);
        }
    }

    #[tokio::test]
    async fn overflow_drops_the_oldest_entry_not_the_newest() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe(Topic::BrowserSnapshot).await;
        for i in 0..5 {
            bus.publish(Topic::BrowserSnapshot, serde_json::json!({"i": i})).await;
        }
        assert_eq!(sub.dropped_count(), 3);

        // Capacity 2, published i=0..4: 0,1,2 get evicted in turn as newer
        // entries arrive, leaving exactly 3 and 4 — the most recent two.
        let first = sub.receive().await.unwrap();
        let second = sub.receive().await.unwrap();
        assert_eq!(first.payload["i"], 3);
        assert_eq!(second.payload["i"], 4);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe(Topic::AgentShutdown).await;
        let id = sub.id;
        bus.unsubscribe(id).await;
        assert_eq!(bus.subscriber_count(Topic::AgentShutdown).await, 0);
    }

    #[tokio::test]
    async fn receive_returns_none_after_unsubscribe_drains_remaining_queue() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe(Topic::AgentShutdown).await;
        bus.publish(Topic::AgentShutdown, serde_json::json!({"i": 1})).await;
        bus.unsubscribe(sub.id).await;

        // Already-queued events are still delivered...
        let event = sub.receive().await.unwrap();
        assert_eq!(event.payload["i"], 1);
        // ...then the subscription reports closed.
        assert!(sub.receive().await.is_none());
    }
}
