//! Typed publish/consume over a named-queue broker.
//!
//! Payloads are decoded into [`PipelineEvent`] here, once, before any handler
//! sees them. Settlement policy:
//! - handler success: ack
//! - undecodable payload: reject without requeue, no retry
//! - handler failure: retry per [`RetryPolicy`] while holding the delivery,
//!   then reject without requeue (dead-lettered when configured)

mod amqp;
mod broker;
mod memory;
mod retry;

pub use amqp::AmqpBroker;
pub use broker::{Broker, Delivery, Subscription};
pub use memory::MemoryBroker;
pub use retry::RetryPolicy;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ServiceError, ServiceResult, TransportError, format_error_chain};
use crate::events::{EventKind, PipelineEvent};

/// Processes one decoded event.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Event kind the consumed queue carries
    fn event_kind(&self) -> EventKind;

    async fn handle(&self, event: PipelineEvent) -> ServiceResult<()>;
}

/// Owned broker connection plus delivery policy for one component
pub struct QueueTransport {
    broker: Arc<dyn Broker>,
    prefetch: u16,
    retry: RetryPolicy,
}

impl QueueTransport {
    pub fn new(broker: Arc<dyn Broker>, prefetch: u16, retry: RetryPolicy) -> Self {
        Self {
            broker,
            prefetch: prefetch.max(1),
            retry,
        }
    }

    /// Encode `event` and send it, persistent, to `queue`.
    pub async fn publish(&self, event: &PipelineEvent, queue: &str) -> ServiceResult<()> {
        let payload = event.encode().map_err(TransportError::Encode)?;
        self.broker.publish(queue, &payload).await?;
        debug!(
            queue = %queue,
            doc_id = %event.document_id(),
            kind = %event.kind(),
            "Published event"
        );
        Ok(())
    }

    /// Consume `queue` until `shutdown` fires or the broker goes away.
    ///
    /// The in-flight delivery always finishes and is settled before the
    /// consumer is cancelled.
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> ServiceResult<()> {
        let mut subscription = self.broker.subscribe(queue, self.prefetch).await?;
        info!(queue = %queue, kind = %handler.event_kind(), "Consuming");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(queue = %queue, "Shutdown requested, stopping consumer");
                    break;
                }
                next = subscription.next_delivery() => next,
            };

            match next {
                Some(Ok(delivery)) => self.dispatch(queue, delivery, &handler).await?,
                Some(Err(e)) => {
                    error!(queue = %queue, error = %format_error_chain(&e), "Consumer failed");
                    return Err(e.into());
                }
                None if shutdown.is_cancelled() => break,
                None => {
                    error!(queue = %queue, "Broker stopped delivering");
                    return Err(TransportError::Closed.into());
                }
            }
        }

        subscription.cancel().await?;
        Ok(())
    }

    /// Close the broker connection.
    pub async fn close(&self) -> ServiceResult<()> {
        self.broker.close().await?;
        Ok(())
    }

    async fn dispatch(
        &self,
        queue: &str,
        delivery: Box<dyn Delivery>,
        handler: &Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError> {
        let event = match PipelineEvent::decode(delivery.payload(), handler.event_kind()) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    queue = %queue,
                    bytes = delivery.payload().len(),
                    error = %format_error_chain(&e),
                    "Rejecting malformed message"
                );
                record_outcome(queue, "malformed");
                return delivery.reject().await;
            }
        };

        let doc_id = event.document_id().clone();
        if delivery.redelivered() {
            warn!(queue = %queue, doc_id = %doc_id, "Processing redelivered message");
        }

        // Handler bodies run on their own task so a panic stays contained
        // and the consumer resumes with the next delivery.
        let result = self
            .retry
            .run(queue, || {
                let handler = Arc::clone(handler);
                let event = event.clone();
                async move {
                    tokio::spawn(async move { handler.handle(event).await })
                        .await
                        .unwrap_or_else(|join_error| {
                            Err(ServiceError::Internal {
                                message: format!("handler task failed: {join_error}"),
                            })
                        })
                }
            })
            .await;

        match result {
            Ok(()) => {
                delivery.ack().await?;
                record_outcome(queue, "acked");
                debug!(queue = %queue, doc_id = %doc_id, "Message acknowledged");
            }
            Err(e) => {
                error!(
                    queue = %queue,
                    doc_id = %doc_id,
                    retryable = e.is_retryable(),
                    error = %format_error_chain(&e),
                    "Message processing failed, rejecting"
                );
                delivery.reject().await?;
                record_outcome(queue, "rejected");
            }
        }
        Ok(())
    }
}

fn record_outcome(queue: &str, outcome: &'static str) {
    metrics::counter!(
        "scribe_messages_total",
        "queue" => queue.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
