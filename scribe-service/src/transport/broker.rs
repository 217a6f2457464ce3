//! Broker primitives shared by the AMQP and in-memory backends.

use async_trait::async_trait;

use crate::error::TransportError;

/// A connection to a named-queue message broker.
///
/// Each worker owns one of these; publishing goes through a dedicated
/// channel and every subscription opens its own.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Send a persistent message to `queue` through the default exchange.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Register a consumer on `queue` holding at most `prefetch` unsettled deliveries.
    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Subscription>, TransportError>;

    /// Close the publish channel, then the connection.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Stream of deliveries for one consumer registration
#[async_trait]
pub trait Subscription: Send {
    /// Next delivery, or `None` once the broker stops delivering.
    ///
    /// Dropping the returned future before it resolves loses nothing.
    async fn next_delivery(&mut self) -> Option<Result<Box<dyn Delivery>, TransportError>>;

    /// Cancel the consumer and close its channel.
    async fn cancel(self: Box<Self>) -> Result<(), TransportError>;
}

/// A single message awaiting settlement
#[async_trait]
pub trait Delivery: Send + Sync {
    fn payload(&self) -> &[u8];

    fn redelivered(&self) -> bool;

    /// Remove the message from the queue.
    async fn ack(&self) -> Result<(), TransportError>;

    /// Drop the message without requeueing it. Brokers with a dead-letter
    /// queue configured route it there.
    async fn reject(&self) -> Result<(), TransportError>;
}
