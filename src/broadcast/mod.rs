//! Process-wide event fan-out to live subscribers.
//!
//! Every subscription owns a [`DropOldestQueue`]. [`Broadcaster::publish`]
//! walks the registry under one lock and does a non-blocking enqueue per
//! matching subscription, so a slow reader only ever loses its own oldest
//! events.

pub mod bridge;
pub mod queue;

pub use bridge::{InternalPublisher, spawn_bridge};
pub use queue::DropOldestQueue;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::Serialize;
use tracing::{debug, info};

use crate::event::MonitorEvent;
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Allow-lists a subscriber asked for. An absent dimension matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_types: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents: Option<BTreeSet<String>>,
    /// Matched against an event's `run_id` or `workflow_id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_ids: Option<BTreeSet<String>>,
}

impl SubscriptionFilter {
    /// Build from comma-separated query values. Blank lists are ignored.
    pub fn from_query(
        msg_types: Option<&str>,
        agents: Option<&str>,
        correlation_ids: Option<&str>,
    ) -> Self {
        Self {
            msg_types: split_list(msg_types),
            agents: split_list(agents),
            correlation_ids: split_list(correlation_ids),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.msg_types.is_none() && self.agents.is_none() && self.correlation_ids.is_none()
    }

    pub fn matches(&self, event: &MonitorEvent) -> bool {
        if let Some(types) = &self.msg_types
            && !types.contains(&event.msg_type)
        {
            return false;
        }
        if let Some(agents) = &self.agents
            && !event.agent.as_ref().is_some_and(|a| agents.contains(a))
        {
            return false;
        }
        if let Some(ids) = &self.correlation_ids {
            let hit = [&event.run_id, &event.workflow_id]
                .into_iter()
                .flatten()
                .any(|id| ids.contains(id));
            if !hit {
                return false;
            }
        }
        true
    }
}

fn split_list(raw: Option<&str>) -> Option<BTreeSet<String>> {
    let set: BTreeSet<String> = raw?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    (!set.is_empty()).then_some(set)
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// One live subscriber.
pub struct Subscription {
    pub id: String,
    pub filter: SubscriptionFilter,
    pub connected_at: DateTime<Utc>,
    disconnected_at: Mutex<Option<DateTime<Utc>>>,
    queue: DropOldestQueue<MonitorEvent>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Subscription {
    fn new(filter: SubscriptionFilter, capacity: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            filter,
            connected_at: Utc::now(),
            disconnected_at: Mutex::new(None),
            queue: DropOldestQueue::new(capacity),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking. Returns whether an older event was evicted.
    fn offer(&self, event: &MonitorEvent) -> bool {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        if self.queue.push(event.clone()).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Wait up to `wait` for the next event.
    pub async fn recv_timeout(&self, wait: Duration) -> Option<MonitorEvent> {
        self.queue.recv_timeout(wait).await
    }

    /// Events enqueued for this subscriber, including ones later evicted.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Events evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn disconnected_at(&self) -> Option<DateTime<Utc>> {
        *self
            .disconnected_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        *self
            .disconnected_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        self.queue.close();
    }
}

/// Point-in-time view of a subscription for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatus {
    pub client_id: String,
    pub filters: SubscriptionFilter,
    pub delivered: u64,
    pub dropped: u64,
    pub queued: usize,
    pub connected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

struct Registry {
    clients: Mutex<HashMap<String, Arc<Subscription>>>,
    capacity: usize,
}

/// Shared handle to the subscriber registry.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
}

impl Broadcaster {
    /// `capacity` bounds every subscription's queue.
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                clients: Mutex::new(HashMap::new()),
                capacity,
            }),
        }
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<String, Arc<Subscription>>> {
        self.registry
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Arc<Subscription> {
        let subscription = Arc::new(Subscription::new(filter, self.registry.capacity));
        let total = {
            let mut clients = self.clients();
            clients.insert(subscription.id.clone(), subscription.clone());
            clients.len()
        };
        info!(
            client_id = %subscription.id,
            filtered = !subscription.filter.is_empty(),
            total,
            "stream client connected"
        );
        subscription
    }

    /// Remove a subscription and mark it closed. Returns whether it was registered.
    pub fn unsubscribe(&self, client_id: &str) -> bool {
        let removed = self.clients().remove(client_id);
        match removed {
            Some(subscription) => {
                subscription.close();
                info!(
                    client_id,
                    delivered = subscription.delivered(),
                    dropped = subscription.dropped(),
                    "stream client disconnected"
                );
                true
            }
            None => false,
        }
    }

    /// Offer `event` to every matching subscription. Returns how many matched.
    pub fn publish(&self, event: &MonitorEvent) -> usize {
        let mut matched = 0;
        let mut dropped = 0;
        {
            let clients = self.clients();
            for subscription in clients.values() {
                if !subscription.filter.matches(event) {
                    continue;
                }
                matched += 1;
                if subscription.offer(event) {
                    dropped += 1;
                    debug!(client_id = %subscription.id, "queue full, dropped oldest event");
                }
            }
        }
        if matched > 0 {
            metrics::broadcast_delivered().add(matched as u64, &[]);
        }
        if dropped > 0 {
            metrics::broadcast_dropped().add(dropped, &[]);
        }
        matched
    }

    pub fn client_count(&self) -> usize {
        self.clients().len()
    }

    /// Status of every live subscription, oldest first.
    pub fn snapshot(&self) -> Vec<SubscriptionStatus> {
        let mut statuses: Vec<SubscriptionStatus> = self
            .clients()
            .values()
            .map(|s| SubscriptionStatus {
                client_id: s.id.clone(),
                filters: s.filter.clone(),
                delivered: s.delivered(),
                dropped: s.dropped(),
                queued: s.queued(),
                connected_at: s.connected_at,
            })
            .collect();
        statuses.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        statuses
    }

    /// Subscribe and return a guard that unsubscribes on drop.
    pub fn attach(&self, filter: SubscriptionFilter) -> SubscriptionGuard {
        SubscriptionGuard {
            subscription: self.subscribe(filter),
            broadcaster: self.clone(),
        }
    }
}

/// Keeps a subscription registered for as long as it lives.
pub struct SubscriptionGuard {
    subscription: Arc<Subscription>,
    broadcaster: Broadcaster,
}

impl SubscriptionGuard {
    pub fn subscription(&self) -> &Arc<Subscription> {
        &self.subscription
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(&self.subscription.id);
    }
}

// ---------------------------------------------------------------------------
// Reader loop
// ---------------------------------------------------------------------------

/// One item of a subscriber's outward stream.
#[derive(Debug, Clone)]
pub enum StreamItem {
    /// First item, carrying the subscription id.
    Connected { client_id: String },
    Event(MonitorEvent),
    /// Synthesized after `heartbeat` of silence.
    Heartbeat { timestamp: DateTime<Utc> },
}

/// Drain a subscription as a stream.
///
/// Waits at most `poll` per attempt; after `heartbeat` without an item a
/// keep-alive is emitted. Ends once the subscription is closed. Dropping
/// the stream unsubscribes.
pub fn subscription_stream(
    guard: SubscriptionGuard,
    heartbeat: Duration,
    poll: Duration,
) -> impl Stream<Item = StreamItem> + Send + 'static {
    async_stream::stream! {
        let subscription = guard.subscription().clone();
        yield StreamItem::Connected { client_id: subscription.id.clone() };

        let mut last_sent = tokio::time::Instant::now();
        loop {
            match subscription.recv_timeout(poll).await {
                Some(event) => {
                    last_sent = tokio::time::Instant::now();
                    yield StreamItem::Event(event);
                }
                None if subscription.is_closed() => break,
                None => {
                    if last_sent.elapsed() >= heartbeat {
                        last_sent = tokio::time::Instant::now();
                        yield StreamItem::Heartbeat { timestamp: Utc::now() };
                    }
                }
            }
        }
        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSource;

    fn event(msg_type: &str, agent: Option<&str>, run_id: Option<&str>) -> MonitorEvent {
        MonitorEvent {
            msg_type: msg_type.to_string(),
            agent: agent.map(str::to_string),
            run_id: run_id.map(str::to_string),
            workflow_id: None,
            payload: serde_json::json!({"msg_type": msg_type}),
            timestamp: Utc::now(),
            source: EventSource::Broker,
        }
    }

    #[test]
    fn filter_parsing_trims_and_drops_blanks() {
        let filter = SubscriptionFilter::from_query(Some(" stf_gen, data_ready ,,"), Some(""), None);
        assert_eq!(
            filter.msg_types,
            Some(BTreeSet::from(["stf_gen".to_string(), "data_ready".to_string()]))
        );
        assert_eq!(filter.agents, None);
        assert_eq!(filter.correlation_ids, None);
    }

    #[test]
    fn every_specified_dimension_must_match() {
        let filter = SubscriptionFilter::from_query(
            Some("stf_gen"),
            Some("daq-simulator"),
            Some("100010"),
        );
        assert!(filter.matches(&event("stf_gen", Some("daq-simulator"), Some("100010"))));
        assert!(!filter.matches(&event("stf_gen", Some("data-agent"), Some("100010"))));
        assert!(!filter.matches(&event("stf_gen", None, Some("100010"))));
        assert!(!filter.matches(&event("data_ready", Some("daq-simulator"), Some("100010"))));
        assert!(!filter.matches(&event("stf_gen", Some("daq-simulator"), Some("100011"))));
    }

    #[test]
    fn correlation_matches_workflow_id_too() {
        let filter = SubscriptionFilter::from_query(None, None, Some("wf-1"));
        let mut ev = event("data_ready", None, Some("100010"));
        assert!(!filter.matches(&ev));
        ev.workflow_id = Some("wf-1".to_string());
        assert!(filter.matches(&ev));
    }

    #[test]
    fn unsubscribe_closes_and_forgets() {
        let broadcaster = Broadcaster::new(4);
        let sub = broadcaster.subscribe(SubscriptionFilter::default());
        assert_eq!(broadcaster.client_count(), 1);
        assert!(broadcaster.unsubscribe(&sub.id));
        assert!(!broadcaster.unsubscribe(&sub.id));
        assert!(sub.is_closed());
        assert!(sub.disconnected_at().is_some());
        assert_eq!(broadcaster.publish(&event("stf_gen", None, None)), 0);
    }

    #[test]
    fn guard_drop_unsubscribes() {
        let broadcaster = Broadcaster::new(4);
        let guard = broadcaster.attach(SubscriptionFilter::default());
        let sub = guard.subscription().clone();
        drop(guard);
        assert_eq!(broadcaster.client_count(), 0);
        assert!(sub.is_closed());
    }
}
