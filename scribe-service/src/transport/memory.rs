//! In-process broker for single-process deployments and tests.
//!
//! Queues are unbounded channels shared by competing consumers. Rejected
//! messages go to the dead-letter queue when one is configured and are
//! otherwise dropped. Nothing survives a restart.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::error::TransportError;

use super::broker::{Broker, Delivery, Subscription};

/// Per-queue counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub rejected: u64,
}

impl QueueStats {
    /// Messages published but not yet handed to a consumer
    pub fn pending(&self) -> u64 {
        self.published - self.delivered
    }
}

struct MemoryQueue {
    sender: mpsc::UnboundedSender<Vec<u8>>,
    receiver: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
}

impl MemoryQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn push(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.published.fetch_add(1, Ordering::SeqCst);
        self.sender
            .send(payload)
            .map_err(|_| TransportError::Closed)
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            published: self.published.load(Ordering::SeqCst),
            delivered: self.delivered.load(Ordering::SeqCst),
            acked: self.acked.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
        }
    }
}

/// Shared in-process queue registry
pub struct MemoryBroker {
    queues: DashMap<String, Arc<MemoryQueue>>,
    dead_letter: Option<String>,
}

impl MemoryBroker {
    pub fn new(dead_letter: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::new(),
            dead_letter,
        })
    }

    /// Open a connection that can be closed independently of the others.
    pub fn connect(self: &Arc<Self>) -> Arc<dyn Broker> {
        Arc::new(MemoryConnection {
            broker: Arc::clone(self),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn stats(&self, queue: &str) -> QueueStats {
        self.queues
            .get(queue)
            .map(|queue| queue.stats())
            .unwrap_or_default()
    }

    /// Publish bytes as-is, bypassing event encoding.
    #[cfg(test)]
    pub fn publish_raw(&self, queue: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.queue(queue).push(payload.to_vec())
    }

    fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        let entry = self
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new()));
        Arc::clone(entry.value())
    }

    fn dead_letter_for(&self, queue: &str) -> Option<Arc<MemoryQueue>> {
        self.dead_letter
            .as_deref()
            .filter(|dlq| *dlq != queue)
            .map(|dlq| self.queue(dlq))
    }
}

struct MemoryConnection {
    broker: Arc<MemoryBroker>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Broker for MemoryConnection {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.broker.queue(queue).push(payload.to_vec())
    }

    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        debug!(queue = %queue, prefetch, "In-memory consumer registered");
        Ok(Box::new(MemorySubscription {
            queue: self.broker.queue(queue),
            dead_letter: self.broker.dead_letter_for(queue),
            closed: Arc::clone(&self.closed),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemorySubscription {
    queue: Arc<MemoryQueue>,
    dead_letter: Option<Arc<MemoryQueue>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Option<Result<Box<dyn Delivery>, TransportError>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        // Competing consumers take turns waiting on the receiver.
        let mut receiver = self.queue.receiver.lock().await;
        let payload = receiver.recv().await?;
        self.queue.delivered.fetch_add(1, Ordering::SeqCst);

        Some(Ok(Box::new(MemoryDelivery {
            payload,
            queue: Arc::clone(&self.queue),
            dead_letter: self.dead_letter.clone(),
            settled: AtomicBool::new(false),
        })))
    }

    async fn cancel(self: Box<Self>) -> Result<(), TransportError> {
        Ok(())
    }
}

struct MemoryDelivery {
    payload: Vec<u8>,
    queue: Arc<MemoryQueue>,
    dead_letter: Option<Arc<MemoryQueue>>,
    settled: AtomicBool,
}

impl MemoryDelivery {
    fn settle(&self) -> bool {
        let first = !self.settled.swap(true, Ordering::SeqCst);
        if !first {
            warn!("Delivery settled twice; ignoring");
        }
        first
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn redelivered(&self) -> bool {
        false
    }

    async fn ack(&self) -> Result<(), TransportError> {
        if self.settle() {
            self.queue.acked.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn reject(&self) -> Result<(), TransportError> {
        if self.settle() {
            self.queue.rejected.fetch_add(1, Ordering::SeqCst);
            if let Some(dead_letter) = &self.dead_letter {
                dead_letter.push(self.payload.clone())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_ack() {
        let broker = MemoryBroker::new(None);
        let connection = broker.connect();

        connection.publish("work", b"one").await.unwrap();
        assert_eq!(broker.stats("work").pending(), 1);

        let mut subscription = connection.subscribe("work", 1).await.unwrap();
        let delivery = subscription.next_delivery().await.unwrap().unwrap();
        assert_eq!(delivery.payload(), b"one");
        delivery.ack().await.unwrap();
        delivery.ack().await.unwrap();

        let stats = broker.stats("work");
        assert_eq!(stats.pending(), 0);
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.rejected, 0);
    }

    #[tokio::test]
    async fn test_reject_routes_to_dead_letter() {
        let broker = MemoryBroker::new(Some("dead".to_string()));
        let connection = broker.connect();

        connection.publish("work", b"poison").await.unwrap();
        let mut subscription = connection.subscribe("work", 1).await.unwrap();
        let delivery = subscription.next_delivery().await.unwrap().unwrap();
        delivery.reject().await.unwrap();

        assert_eq!(broker.stats("work").rejected, 1);
        assert_eq!(broker.stats("work").pending(), 0);
        assert_eq!(broker.stats("dead").pending(), 1);
    }

    #[tokio::test]
    async fn test_reject_without_dead_letter_drops() {
        let broker = MemoryBroker::new(None);
        let connection = broker.connect();

        broker.publish_raw("work", b"poison").unwrap();
        let mut subscription = connection.subscribe("work", 1).await.unwrap();
        let delivery = subscription.next_delivery().await.unwrap().unwrap();
        delivery.reject().await.unwrap();

        let stats = broker.stats("work");
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.pending(), 0);
    }

    #[tokio::test]
    async fn test_closed_connection_refuses_publish() {
        let broker = MemoryBroker::new(None);
        let first = broker.connect();
        let second = broker.connect();

        first.close().await.unwrap();
        assert!(matches!(
            first.publish("work", b"x").await,
            Err(TransportError::Closed)
        ));
        second.publish("work", b"x").await.unwrap();
    }

    #[tokio::test]
    async fn test_competing_consumers_split_messages() {
        let broker = MemoryBroker::new(None);
        let connection = broker.connect();
        let mut a = connection.subscribe("work", 1).await.unwrap();
        let mut b = connection.subscribe("work", 1).await.unwrap();

        connection.publish("work", b"1").await.unwrap();
        connection.publish("work", b"2").await.unwrap();

        let first = a.next_delivery().await.unwrap().unwrap();
        let second = b.next_delivery().await.unwrap().unwrap();
        assert_ne!(first.payload(), second.payload());
        assert_eq!(broker.stats("work").delivered, 2);
    }
}
