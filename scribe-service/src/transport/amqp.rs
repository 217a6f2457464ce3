//! RabbitMQ backend over AMQP 0.9.1.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::QueueNames;
use crate::error::TransportError;

use super::broker::{Broker, Delivery, Subscription};

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT: u8 = 2;

/// Broker connection with a dedicated, confirm-mode publish channel
pub struct AmqpBroker {
    connection: Connection,
    publish_channel: Channel,
    uri: String,
    queues: QueueNames,
}

impl AmqpBroker {
    /// Connect and declare the pipeline's queues.
    pub async fn connect(uri: &str, queues: QueueNames) -> Result<Self, TransportError> {
        let redacted = redact_uri(uri);

        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|source| TransportError::Connect {
                uri: redacted.clone(),
                source,
            })?;

        let publish_channel =
            connection
                .create_channel()
                .await
                .map_err(|source| TransportError::Connect {
                    uri: redacted.clone(),
                    source,
                })?;
        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|source| TransportError::Connect {
                uri: redacted.clone(),
                source,
            })?;

        let broker = Self {
            connection,
            publish_channel,
            uri: redacted,
            queues,
        };

        for queue in broker.queues.all() {
            broker.declare_queue(&broker.publish_channel, queue).await?;
        }

        info!(uri = %broker.uri, "Connected to broker");
        Ok(broker)
    }

    /// Durable, shared, persistent queue. Work queues dead-letter into the
    /// configured queue when one exists.
    async fn declare_queue(&self, channel: &Channel, queue: &str) -> Result<(), TransportError> {
        let mut arguments = FieldTable::default();
        if let Some(dlq) = &self.queues.dead_letter
            && dlq != queue
        {
            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(LongString::from("")),
            );
            arguments.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(LongString::from(dlq.as_str())),
            );
        }

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await
            .map_err(|source| TransportError::Channel {
                queue: queue.to_string(),
                source,
            })?;

        debug!(queue = %queue, "Queue declared");
        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), TransportError> {
        let publish_error = |source| TransportError::Publish {
            queue: queue.to_string(),
            source,
        };

        let confirmation = self
            .publish_channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(PERSISTENT)
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;

        if confirmation.is_nack() {
            return Err(TransportError::PublishNacked {
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let channel_error = |source| TransportError::Channel {
            queue: queue.to_string(),
            source,
        };

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(channel_error)?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(channel_error)?;
        self.declare_queue(&channel, queue).await?;

        let consumer_tag = format!("scribe-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;

        info!(queue = %queue, consumer_tag = %consumer_tag, prefetch, "Consumer registered");
        Ok(Box::new(AmqpSubscription {
            channel,
            consumer,
            consumer_tag,
            queue: queue.to_string(),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.publish_channel
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|source| TransportError::Channel {
                queue: "<publish>".to_string(),
                source,
            })?;
        self.connection
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|source| TransportError::Connect {
                uri: self.uri.clone(),
                source,
            })?;
        info!(uri = %self.uri, "Broker connection closed");
        Ok(())
    }
}

struct AmqpSubscription {
    channel: Channel,
    consumer: Consumer,
    consumer_tag: String,
    queue: String,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next_delivery(&mut self) -> Option<Result<Box<dyn Delivery>, TransportError>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(|delivery| {
                Box::new(AmqpDelivery {
                    payload: delivery.data,
                    redelivered: delivery.redelivered,
                    acker: delivery.acker,
                }) as Box<dyn Delivery>
            })
            .map_err(|source| TransportError::Channel {
                queue: self.queue.clone(),
                source,
            }),
        )
    }

    async fn cancel(self: Box<Self>) -> Result<(), TransportError> {
        let channel_error = |source| TransportError::Channel {
            queue: self.queue.clone(),
            source,
        };

        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(channel_error)?;
        self.channel
            .close(REPLY_SUCCESS, "consumer cancelled")
            .await
            .map_err(channel_error)?;
        info!(queue = %self.queue, consumer_tag = %self.consumer_tag, "Consumer cancelled");
        Ok(())
    }
}

struct AmqpDelivery {
    payload: Vec<u8>,
    redelivered: bool,
    acker: Acker,
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    async fn ack(&self) -> Result<(), TransportError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(TransportError::Settle)
    }

    async fn reject(&self) -> Result<(), TransportError> {
        self.acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map(|_| ())
            .map_err(TransportError::Settle)
    }
}

/// Strip credentials from a broker URI so it can be logged.
fn redact_uri(uri: &str) -> String {
    match uri.split_once("://") {
        Some((scheme, rest)) => match rest.rsplit_once('@') {
            Some((_, host)) => format!("{scheme}://{host}"),
            None => uri.to_string(),
        },
        None => uri.to_string(),
    }
}
