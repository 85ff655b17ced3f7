//! Subscription registry for every client attached to the bus

use bytes::Bytes;
use rover_shared::{codec, subject};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Identifier assigned to each attached client
pub type ClientId = u64;

/// A message as seen by in-process subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
}

/// How messages reach a client
pub enum Delivery {
    /// Socket client: receives encoded MSG frames
    Remote(mpsc::Sender<Bytes>),
    /// In-process subscriber: receives decoded messages
    Local(mpsc::Sender<BusMessage>),
}

/// Point-in-time broker counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusStats {
    /// Socket clients (TCP and WebSocket)
    pub connections: usize,
    /// All attached clients, including in-process subscribers
    pub clients: usize,
    pub subscriptions: usize,
    pub messages_in: u64,
    pub messages_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Default)]
struct Counters {
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

struct Subscription {
    subject: String,
    queue: Option<String>,
    max: Option<u64>,
    delivered: u64,
}

struct ClientEntry {
    delivery: Delivery,
    echo: bool,
    subs: HashMap<String, Subscription>,
}

enum DeliveryOutcome {
    Delivered,
    Dropped,
    Closed,
}

impl ClientEntry {
    fn deliver(&self, sid: &str, subject: &str, reply: Option<&str>, payload: &Bytes) -> DeliveryOutcome {
        let result = match &self.delivery {
            Delivery::Remote(tx) => tx
                .try_send(codec::encode_msg(subject, sid, reply, payload))
                .map_err(|e| matches!(e, mpsc::error::TrySendError::Closed(_))),
            Delivery::Local(tx) => tx
                .try_send(BusMessage {
                    subject: subject.to_string(),
                    reply: reply.map(str::to_string),
                    payload: payload.clone(),
                })
                .map_err(|e| matches!(e, mpsc::error::TrySendError::Closed(_))),
        };

        match result {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(true) => DeliveryOutcome::Closed,
            Err(false) => DeliveryOutcome::Dropped,
        }
    }
}

/// Tracks all attached clients and their subscriptions
pub struct Registry {
    clients: RwLock<HashMap<ClientId, ClientEntry>>,
    next_id: AtomicU64,
    queue_cursor: AtomicUsize,
    counters: Counters,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_cursor: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    /// Attach a new client and return its id
    pub async fn register(&self, delivery: Delivery) -> ClientId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = ClientEntry {
            delivery,
            echo: true,
            subs: HashMap::new(),
        };

        self.clients.write().await.insert(id, entry);
        id
    }

    /// Detach a client and drop all its subscriptions
    pub async fn unregister(&self, id: ClientId) {
        self.clients.write().await.remove(&id);
    }

    /// Control whether a client receives its own publishes
    pub async fn set_echo(&self, id: ClientId, echo: bool) {
        if let Some(entry) = self.clients.write().await.get_mut(&id) {
            entry.echo = echo;
        }
    }

    /// Add (or replace) a subscription for a client
    pub async fn subscribe(&self, id: ClientId, sid: &str, subject: &str, queue: Option<String>) -> bool {
        let mut clients = self.clients.write().await;
        let Some(entry) = clients.get_mut(&id) else {
            return false;
        };

        entry.subs.insert(
            sid.to_string(),
            Subscription {
                subject: subject.to_string(),
                queue,
                max: None,
                delivered: 0,
            },
        );
        true
    }

    /// Remove a subscription now, or after `max` total deliveries
    pub async fn unsubscribe(&self, id: ClientId, sid: &str, max: Option<u64>) {
        let mut clients = self.clients.write().await;
        let Some(entry) = clients.get_mut(&id) else {
            return;
        };

        match (max, entry.subs.get_mut(sid)) {
            (Some(max), Some(sub)) if sub.delivered < max => sub.max = Some(max),
            _ => {
                entry.subs.remove(sid);
            }
        }
    }

    /// Route a message to every matching subscription.
    ///
    /// Each queue group receives the message on exactly one member. Returns the
    /// number of successful deliveries.
    pub async fn publish(
        &self,
        from: Option<ClientId>,
        subject: &str,
        reply: Option<&str>,
        payload: &Bytes,
    ) -> usize {
        self.counters.messages_in.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_in.fetch_add(payload.len() as u64, Ordering::Relaxed);

        let mut clients = self.clients.write().await;

        let mut targets: Vec<(ClientId, String)> = Vec::new();
        let mut groups: HashMap<&str, Vec<(ClientId, String)>> = HashMap::new();

        for (id, entry) in clients.iter() {
            if from == Some(*id) && !entry.echo {
                continue;
            }
            for (sid, sub) in entry.subs.iter() {
                if !subject::matches(&sub.subject, subject) {
                    continue;
                }
                match sub.queue.as_deref() {
                    Some(queue) => groups.entry(queue).or_default().push((*id, sid.clone())),
                    None => targets.push((*id, sid.clone())),
                }
            }
        }

        for members in groups.into_values() {
            let pick = self.queue_cursor.fetch_add(1, Ordering::Relaxed) % members.len();
            targets.push(members[pick].clone());
        }

        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, sid) in targets {
            let Some(entry) = clients.get_mut(&id) else {
                continue;
            };

            match entry.deliver(&sid, subject, reply, payload) {
                DeliveryOutcome::Delivered => {
                    delivered += 1;
                    self.counters.messages_out.fetch_add(1, Ordering::Relaxed);
                    self.counters.bytes_out.fetch_add(payload.len() as u64, Ordering::Relaxed);
                }
                DeliveryOutcome::Dropped => {
                    // Not counted against an UNSUB limit
                    warn!("Slow consumer: client {} dropped message on {}", id, subject);
                    continue;
                }
                DeliveryOutcome::Closed => {
                    closed.push(id);
                    continue;
                }
            }

            if let Some(sub) = entry.subs.get_mut(&sid) {
                sub.delivered += 1;
                if sub.max.is_some_and(|max| sub.delivered >= max) {
                    entry.subs.remove(&sid);
                }
            }
        }

        for id in closed {
            debug!("Pruning closed client {}", id);
            clients.remove(&id);
        }

        delivered
    }

    /// Snapshot of connection and traffic counters
    pub async fn stats(&self) -> BusStats {
        let clients = self.clients.read().await;
        BusStats {
            connections: clients
                .values()
                .filter(|entry| matches!(entry.delivery, Delivery::Remote(_)))
                .count(),
            clients: clients.len(),
            subscriptions: clients.values().map(|entry| entry.subs.len()).sum(),
            messages_in: self.counters.messages_in.load(Ordering::Relaxed),
            messages_out: self.counters.messages_out.load(Ordering::Relaxed),
            bytes_in: self.counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.counters.bytes_out.load(Ordering::Relaxed),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn local_client(registry: &Registry, capacity: usize) -> (ClientId, mpsc::Receiver<BusMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = registry.register(Delivery::Local(tx)).await;
        (id, rx)
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscriptions() {
        let registry = Registry::new();
        let (a, mut rx_a) = local_client(&registry, 8).await;
        let (b, mut rx_b) = local_client(&registry, 8).await;

        registry.subscribe(a, "1", "mavlink.*", None).await;
        registry.subscribe(b, "1", "rover.command", None).await;

        let payload = Bytes::from_static(b"{}");
        let n = registry.publish(None, "mavlink.heartbeat", None, &payload).await;
        assert_eq!(n, 1);

        let msg = rx_a.try_recv().expect("a should receive");
        assert_eq!(msg.subject, "mavlink.heartbeat");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_queue_group_delivers_once() {
        let registry = Registry::new();
        let (a, mut rx_a) = local_client(&registry, 8).await;
        let (b, mut rx_b) = local_client(&registry, 8).await;

        registry.subscribe(a, "1", "jobs", Some("workers".into())).await;
        registry.subscribe(b, "1", "jobs", Some("workers".into())).await;

        let n = registry.publish(None, "jobs", None, &Bytes::from_static(b"x")).await;
        assert_eq!(n, 1);

        let received = rx_a.try_recv().is_ok() as usize + rx_b.try_recv().is_ok() as usize;
        assert_eq!(received, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_with_max() {
        let registry = Registry::new();
        let (a, mut rx) = local_client(&registry, 8).await;
        registry.subscribe(a, "9", "t", None).await;
        registry.unsubscribe(a, "9", Some(2)).await;

        let payload = Bytes::from_static(b"p");
        for _ in 0..3 {
            registry.publish(None, "t", None, &payload).await;
        }

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.stats().await.subscriptions, 0);
    }

    #[tokio::test]
    async fn test_no_echo_skips_publisher() {
        let registry = Registry::new();
        let (a, mut rx) = local_client(&registry, 8).await;
        registry.subscribe(a, "1", "t", None).await;
        registry.set_echo(a, false).await;

        registry.publish(Some(a), "t", None, &Bytes::from_static(b"p")).await;
        assert!(rx.try_recv().is_err());

        registry.publish(None, "t", None, &Bytes::from_static(b"p")).await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_closed_clients_are_pruned() {
        let registry = Registry::new();
        let (a, rx) = local_client(&registry, 8).await;
        registry.subscribe(a, "1", "t", None).await;
        drop(rx);

        let n = registry.publish(None, "t", None, &Bytes::from_static(b"p")).await;
        assert_eq!(n, 0);
        assert_eq!(registry.stats().await.clients, 0);
    }

    #[tokio::test]
    async fn test_slow_consumer_drops_without_blocking() {
        let registry = Registry::new();
        let (a, mut rx) = local_client(&registry, 1).await;
        registry.subscribe(a, "1", "t", None).await;

        let payload = Bytes::from_static(b"p");
        assert_eq!(registry.publish(None, "t", None, &payload).await, 1);
        assert_eq!(registry.publish(None, "t", None, &payload).await, 0);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.stats().await.clients, 1);
    }

    #[tokio::test]
    async fn test_dropped_message_does_not_count_toward_max() {
        let registry = Registry::new();
        let (a, mut rx) = local_client(&registry, 1).await;
        registry.subscribe(a, "1", "t", None).await;
        registry.unsubscribe(a, "1", Some(2)).await;

        let payload = Bytes::from_static(b"p");
        assert_eq!(registry.publish(None, "t", None, &payload).await, 1);
        // Queue full: dropped, the subscription survives
        assert_eq!(registry.publish(None, "t", None, &payload).await, 0);
        assert_eq!(registry.stats().await.subscriptions, 1);

        assert!(rx.try_recv().is_ok());
        assert_eq!(registry.publish(None, "t", None, &payload).await, 1);
        assert!(rx.try_recv().is_ok());
        assert_eq!(registry.stats().await.subscriptions, 0);
    }

    #[tokio::test]
    async fn test_stats_count_traffic_and_connections() {
        let registry = Registry::new();
        let (remote_tx, _remote_rx) = mpsc::channel(8);
        let remote = registry.register(Delivery::Remote(remote_tx)).await;
        let (local, _local_rx) = local_client(&registry, 8).await;
        registry.subscribe(remote, "1", "t", None).await;
        registry.subscribe(local, "1", "t", None).await;

        registry.publish(None, "t", None, &Bytes::from_static(b"abcd")).await;

        let stats = registry.stats().await;
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.clients, 2);
        assert_eq!(stats.messages_in, 1);
        assert_eq!(stats.bytes_in, 4);
        assert_eq!(stats.messages_out, 2);
        assert_eq!(stats.bytes_out, 8);
    }
}
