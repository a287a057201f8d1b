//! Typed publish/subscribe for inbound channel events.
//!
//! One tokio broadcast channel carries every decoded event. Each
//! subscription names the categories it wants and holds a disposable
//! handle; disposing is synchronous, so once `dispose()` returns the
//! subscriber will not observe another event.
//!
//! Subscribers are told when they may have missed events: a lagging
//! receiver gets [`Delivery::Lagged`], and every subscriber gets
//! [`Delivery::Resync`] after the channel re-joins following a lost link.
//!
//! ```text
//!   channel reader ──publish──► EventBus ──► Subscription{categories} ──► reconciler
//!                                   │
//!                                   └──────► Subscription{presence}  ──► ...
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

use crate::protocol::{ChannelEvent, EventCategory};

/// Statistics for monitoring bus health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub events_published: u64,
    pub events_dropped: u64,
    pub active_subscriptions: usize,
}

/// One item handed to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Event(Arc<ChannelEvent>),
    /// This many events were overwritten before the subscriber read them.
    Lagged(u64),
    /// The channel came back after a lost link; events may be missing.
    Resync,
}

#[derive(Debug, Clone)]
enum BusItem {
    Event(Arc<ChannelEvent>),
    Resync,
}

type Registry = Arc<Mutex<HashMap<u64, HashSet<EventCategory>>>>;

#[derive(Default)]
struct AtomicBusStats {
    events_published: AtomicU64,
    events_dropped: AtomicU64,
}

pub struct EventBus {
    sender: broadcast::Sender<BusItem>,
    registry: Registry,
    next_id: AtomicU64,
    stats: Arc<AtomicBusStats>,
}

impl EventBus {
    /// `capacity` is the number of events buffered per subscriber before a
    /// slow subscriber starts losing the oldest ones.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            stats: Arc::new(AtomicBusStats::default()),
        }
    }

    pub fn subscribe(&self, categories: &[EventCategory]) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let wanted: HashSet<EventCategory> = categories.iter().copied().collect();
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, wanted.clone());
        Subscription {
            receiver: self.sender.subscribe(),
            categories: wanted,
            handle: SubscriptionHandle {
                id,
                registry: self.registry.clone(),
            },
            stats: self.stats.clone(),
        }
    }

    /// Publish to every subscription. Returns how many subscriptions want
    /// this event's category.
    pub fn publish(&self, event: ChannelEvent) -> usize {
        let category = event.category();
        let interested = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|cats| cats.contains(&category))
            .count();
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error: nobody is viewing a board.
        let _ = self.sender.send(BusItem::Event(Arc::new(event)));
        interested
    }

    /// Tell every subscription that events may have been missed.
    pub fn resync(&self) {
        log::debug!("Announcing resync to event subscribers");
        let _ = self.sender.send(BusItem::Resync);
    }

    pub fn active_subscriptions(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
            active_subscriptions: self.active_subscriptions(),
        }
    }
}

/// Cloneable handle that tears a subscription down.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: u64,
    registry: Registry,
}

impl SubscriptionHandle {
    pub fn dispose(&self) {
        let removed = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        if removed.is_some() {
            log::debug!("Disposed event subscription {}", self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&self.id)
    }
}

pub struct Subscription {
    receiver: broadcast::Receiver<BusItem>,
    categories: HashSet<EventCategory>,
    handle: SubscriptionHandle,
    stats: Arc<AtomicBusStats>,
}

impl Subscription {
    /// Next delivery: an event in one of the subscribed categories, or a
    /// notice that events were lost. `None` once the subscription is
    /// disposed or the bus is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            if !self.handle.is_active() {
                return None;
            }
            let item = self.receiver.recv().await;
            // Re-check: dispose may have happened while waiting.
            if !self.handle.is_active() {
                return None;
            }
            match item {
                Ok(BusItem::Event(event)) => {
                    if self.categories.contains(&event.category()) {
                        return Some(Delivery::Event(event));
                    }
                }
                Ok(BusItem::Resync) => return Some(Delivery::Resync),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Event subscriber lagged, {n} events dropped");
                    self.stats.events_dropped.fetch_add(n, Ordering::Relaxed);
                    return Some(Delivery::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event, treating loss notices as an error.
    pub async fn recv_event(&mut self) -> Option<Result<Arc<ChannelEvent>, Delivery>> {
        Some(match self.recv().await? {
            Delivery::Event(event) => Ok(event),
            notice => Err(notice),
        })
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PresenceEvent;
    use std::time::Duration;
    use taskboard_core::{BoardId, UserId};

    fn joined(user: &str) -> ChannelEvent {
        ChannelEvent::UserJoined(PresenceEvent {
            board_id: BoardId::new("b1"),
            user_id: UserId::new(user),
            user_name: None,
        })
    }

    fn left(user: &str) -> ChannelEvent {
        ChannelEvent::UserLeft(PresenceEvent {
            board_id: BoardId::new("b1"),
            user_id: UserId::new(user),
            user_name: None,
        })
    }

    #[tokio::test]
    async fn test_category_filtering() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(&[EventCategory::PresenceLeft]);

        assert_eq!(bus.publish(joined("u1")), 0);
        assert_eq!(bus.publish(left("u1")), 1);

        let event = sub.recv_event().await.unwrap().unwrap();
        assert_eq!(event.category(), EventCategory::PresenceLeft);
    }

    #[tokio::test]
    async fn test_dispose_is_immediate() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(&EventCategory::ALL);
        let handle = sub.handle();
        assert_eq!(bus.active_subscriptions(), 1);

        bus.publish(joined("u1"));
        handle.dispose();
        assert_eq!(bus.active_subscriptions(), 0);
        assert!(!handle.is_active());

        // Already-buffered events are not delivered after dispose.
        let next = tokio::time::timeout(Duration::from_millis(100), sub.recv()).await;
        assert_eq!(next.unwrap(), None);
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let bus = EventBus::new(4);
        {
            let _sub = bus.subscribe(&[EventCategory::CardCreated]);
            assert_eq!(bus.active_subscriptions(), 1);
        }
        assert_eq!(bus.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_is_told() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe(&EventCategory::ALL);
        for i in 0..5 {
            bus.publish(joined(&format!("u{i}")));
        }
        assert_eq!(sub.recv().await, Some(Delivery::Lagged(3)));
        assert_eq!(bus.stats().events_dropped, 3);
        assert_eq!(bus.stats().events_published, 5);

        // The newest events are still delivered afterwards.
        let event = sub.recv_event().await.unwrap().unwrap();
        assert_eq!(*event, joined("u3"));
    }

    #[tokio::test]
    async fn test_resync_reaches_every_subscriber() {
        let bus = EventBus::new(8);
        let mut presence = bus.subscribe(&[EventCategory::PresenceJoined]);
        let mut cards = bus.subscribe(&[EventCategory::CardUpdated]);

        bus.resync();
        assert_eq!(presence.recv().await, Some(Delivery::Resync));
        assert_eq!(cards.recv().await, Some(Delivery::Resync));
    }
}
