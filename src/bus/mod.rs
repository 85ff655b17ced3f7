//! Message bus
//!
//! An in-process broker that remote operators reach over TCP or WebSocket and
//! local components use directly through [`BusHandle`].

mod broker;
mod client;
mod registry;
mod ws;

pub use broker::{Broker, BrokerConfig};
pub use registry::{BusMessage, BusStats, ClientId, Delivery, Registry};

use anyhow::{bail, Result};
use bytes::Bytes;
use rover_shared::subject;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Capacity of an in-process subscription queue
const LOCAL_SUBSCRIPTION_CAPACITY: usize = 256;

/// Cloneable handle for in-process access to the bus
#[derive(Clone)]
pub struct BusHandle {
    registry: Arc<Registry>,
}

impl BusHandle {
    pub(crate) fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Publish a message; returns the number of deliveries
    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<usize> {
        if !subject::is_valid(subject, false) {
            bail!("Invalid publish subject: {}", subject);
        }

        let payload = payload.into();
        Ok(self.registry.publish(None, subject, None, &payload).await)
    }

    /// Subscribe to a subject (wildcards allowed)
    pub async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        if !subject::is_valid(subject, true) {
            bail!("Invalid subscription subject: {}", subject);
        }

        let (tx, rx) = mpsc::channel(LOCAL_SUBSCRIPTION_CAPACITY);
        let id = self.registry.register(Delivery::Local(tx)).await;
        self.registry.subscribe(id, "1", subject, None).await;

        Ok(Subscription { id, rx })
    }

    /// Connection and traffic counters
    pub async fn stats(&self) -> BusStats {
        self.registry.stats().await
    }
}

/// An in-process subscription; dropping it detaches from the bus on the next
/// matching publish
pub struct Subscription {
    id: ClientId,
    rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    /// Wait for the next message
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Client id assigned by the registry
    pub fn id(&self) -> ClientId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_publish_subscribe() {
        let bus = BusHandle::new(Arc::new(Registry::new()));
        let mut sub = bus.subscribe("mavlink.>").await.unwrap();

        let n = bus.publish("mavlink.heartbeat", "{}").await.unwrap();
        assert_eq!(n, 1);

        let msg = sub.next().await.expect("message");
        assert_eq!(msg.subject, "mavlink.heartbeat");
        assert_eq!(&msg.payload[..], b"{}");
    }

    #[tokio::test]
    async fn test_invalid_subjects_rejected() {
        let bus = BusHandle::new(Arc::new(Registry::new()));
        assert!(bus.publish("mavlink.*", "x").await.is_err());
        assert!(bus.subscribe("a..b").await.is_err());
    }
}
