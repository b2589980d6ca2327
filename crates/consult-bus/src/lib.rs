//! Topic-based in-process pub/sub used by the consultation orchestrator.
//!
//! Each topic is backed by its own `tokio::sync::broadcast` channel created
//! lazily on first subscription. A firehose channel additionally receives
//! every published message in publish order, which is what UI layers use
//! when they want a single ordered stream of notifications.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage<M> {
    pub topic: String,
    pub payload: M,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("subscriber lagged behind by {0} messages")]
    Lagged(u64),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus<M>: Send + Sync
where
    M: Clone + Send + 'static,
{
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage<M>>;

    /// Receives every message regardless of topic.
    fn subscribe_all(&self) -> broadcast::Receiver<BusMessage<M>>;

    /// Returns how many receivers the message reached. Publishing to a topic
    /// nobody listens on is not an error.
    fn publish(&self, topic: &str, payload: M) -> usize;

    /// Drops the topic's sender so its receivers observe `Closed` once drained.
    fn close_topic(&self, topic: &str);
}

/// In-memory bus shared by everything living in one process.
pub struct LocalBus<M> {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage<M>>>>,
    firehose: broadcast::Sender<BusMessage<M>>,
    capacity: usize,
}

impl<M> LocalBus<M>
where
    M: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            topics: RwLock::new(HashMap::new()),
            firehose: broadcast::channel(capacity).0,
            capacity,
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage<M>> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl<M> Default for LocalBus<M>
where
    M: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for LocalBus<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBus")
            .field("topics", &self.topics.read().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<M> Bus<M> for LocalBus<M>
where
    M: Clone + Send + Sync + 'static,
{
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage<M>> {
        self.sender_for(topic).subscribe()
    }

    fn subscribe_all(&self) -> broadcast::Receiver<BusMessage<M>> {
        self.firehose.subscribe()
    }

    fn publish(&self, topic: &str, payload: M) -> usize {
        let message = BusMessage {
            topic: topic.to_string(),
            payload,
        };
        let topic_sender = self.topics.read().get(topic).cloned();
        let direct = match topic_sender {
            Some(sender) => sender.send(message.clone()).unwrap_or(0),
            None => 0,
        };
        let firehose = self.firehose.send(message).unwrap_or(0);
        tracing::trace!(
            target = "consult::bus",
            topic,
            direct,
            firehose,
            "published bus message"
        );
        direct + firehose
    }

    fn close_topic(&self, topic: &str) {
        if self.topics.write().remove(topic).is_some() {
            tracing::trace!(target = "consult::bus", topic, "closed bus topic");
        }
    }
}

/// Receives the next message, folding broadcast errors into [`BusError`].
pub async fn next_message<M: Clone>(
    receiver: &mut broadcast::Receiver<BusMessage<M>>,
) -> BusResult<BusMessage<M>> {
    receiver.recv().await.map_err(|err| match err {
        broadcast::error::RecvError::Closed => BusError::Closed,
        broadcast::error::RecvError::Lagged(skipped) => BusError::Lagged(skipped),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("room/alpha");
        let reached = bus.publish("room/alpha", Bytes::from_static(b"ping"));
        assert_eq!(reached, 1);
        let msg = next_message(&mut sub).await.expect("receive ok");
        assert_eq!(msg.topic, "room/alpha");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn firehose_sees_every_topic_in_order() {
        let bus: LocalBus<u32> = LocalBus::new();
        let mut all = bus.subscribe_all();
        let _session = bus.subscribe("session");
        bus.publish("session", 1);
        bus.publish("chat", 2);
        bus.publish("session", 3);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let msg = next_message(&mut all).await.expect("firehose message");
            seen.push((msg.topic, msg.payload));
        }
        assert_eq!(
            seen,
            vec![
                ("session".to_string(), 1),
                ("chat".to_string(), 2),
                ("session".to_string(), 3),
            ]
        );
    }

    #[test]
    fn publishing_without_listeners_reaches_nobody() {
        let bus: LocalBus<&'static str> = LocalBus::new();
        assert_eq!(bus.publish("nobody", "hello"), 0);
        assert_eq!(bus.subscriber_count("nobody"), 0);
    }

    #[tokio::test]
    async fn closing_a_topic_ends_its_subscribers() {
        let bus: LocalBus<u8> = LocalBus::new();
        let mut sub = bus.subscribe("room/beta");
        bus.publish("room/beta", 7);
        bus.close_topic("room/beta");

        assert_eq!(next_message(&mut sub).await.map(|m| m.payload), Ok(7));
        assert_eq!(next_message(&mut sub).await, Err(BusError::Closed));
    }

    #[tokio::test]
    async fn slow_subscribers_report_lag() {
        let bus: LocalBus<u8> = LocalBus::with_capacity(2);
        let mut sub = bus.subscribe("burst");
        for value in 0..5 {
            bus.publish("burst", value);
        }
        assert_eq!(next_message(&mut sub).await, Err(BusError::Lagged(3)));
        assert_eq!(next_message(&mut sub).await.map(|m| m.payload), Ok(3));
    }
}
