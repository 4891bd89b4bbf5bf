//! Subscription hub: per-shipment topic registry fanning events out to
//! subscriber sessions with bounded buffers.
//!
//! Each topic is a `tokio::sync::broadcast` channel sized by
//! `subscriber.buffer`. Publishing never blocks; a subscriber that falls
//! behind loses its oldest events and observes `RecvError::Lagged(n)`,
//! which the session layer converts into a `lagged` event so the client
//! can refetch state. Within one topic, events reach every subscriber in
//! publish order; slow sessions never affect other sessions or topics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{EntityId, ShipmentEvent};

/// Fan-out counters, exposed on the stats endpoint.
#[derive(Debug, Default)]
pub struct HubStats {
    pub published: AtomicU64,
    pub delivered: AtomicU64,
}

pub struct SubscriptionHub {
    topics: RwLock<HashMap<EntityId, broadcast::Sender<ShipmentEvent>>>,
    buffer: usize,
    stats: HubStats,
}

impl SubscriptionHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
            stats: HubStats::default(),
        }
    }

    /// Open a subscription to one shipment topic. Dropping the returned
    /// receiver unsubscribes the session from that topic.
    pub fn subscribe(&self, shipment_id: EntityId) -> broadcast::Receiver<ShipmentEvent> {
        if let Ok(topics) = self.topics.read() {
            if let Some(sender) = topics.get(&shipment_id) {
                return sender.subscribe();
            }
        }
        let mut topics = match self.topics.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics
            .entry(shipment_id)
            .or_insert_with(|| broadcast::channel(self.buffer).0)
            .subscribe()
    }

    /// Publish an event to its shipment topic. Non-blocking; returns the
    /// number of sessions that will observe it (0 when nobody listens).
    pub fn publish(&self, event: ShipmentEvent) -> usize {
        let shipment_id = event.shipment_id();
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        let delivered = {
            let topics = match self.topics.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match topics.get(&shipment_id) {
                // send() only errors when there are no receivers.
                Some(sender) => sender.send(event).unwrap_or(0),
                None => 0,
            }
        };

        if delivered > 0 {
            self.stats
                .delivered
                .fetch_add(delivered as u64, Ordering::Relaxed);
        } else {
            debug!(shipment_id, "Event published with no subscribers");
        }
        delivered
    }

    /// Drop topics nobody listens to anymore. Sessions call this after
    /// unsubscribing so the registry stays bounded by live interest.
    pub fn reap_idle_topics(&self) {
        let mut topics = match self.topics.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn published_total(&self) -> u64 {
        self.stats.published.load(Ordering::Relaxed)
    }
}
