//! AMQP (RabbitMQ) broker implementation.
//!
//! Every `open()` creates a new connection with one channel. Nothing is pooled:
//! the connection manager keeps its own long-lived session, publisher and RPC
//! calls open and close one per call.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery as AmqpDelivery,
    options::{
        BasicConsumeOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::AMQPErrorKind,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info};

use super::{Broker, BrokerSession, BusError, Delivery, DeliveryStream, MessageProperties, Result};

/// Consumer tag prefix for no-ack consumers.
const CONSUMER_TAG_PREFIX: &str = "storefront";

/// True when the error means the connection is unusable rather than one
/// operation failing on a healthy channel.
///
/// After the broker drops the connection, channel operations report an
/// invalid channel state or a hard (connection-level) protocol error.
fn is_connection_error(e: &lapin::Error) -> bool {
    match e {
        lapin::Error::IOError(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::InvalidChannelState(_) => true,
        lapin::Error::ProtocolError(amqp) => matches!(amqp.kind(), AMQPErrorKind::Hard(_)),
        _ => false,
    }
}

/// Map a lapin error, separating lost/unreachable connections from channel faults.
fn map_err(context: &str, e: lapin::Error) -> BusError {
    if is_connection_error(&e) {
        BusError::Connection(format!("{}: {}", context, e))
    } else {
        BusError::Channel(format!("{}: {}", context, e))
    }
}

fn to_amqp_properties(properties: MessageProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default().with_delivery_mode(2); // persistent
    if let Some(content_type) = properties.content_type {
        amqp = amqp.with_content_type(content_type.into());
    }
    if let Some(correlation_id) = properties.correlation_id {
        amqp = amqp.with_correlation_id(correlation_id.into());
    }
    if let Some(reply_to) = properties.reply_to {
        amqp = amqp.with_reply_to(reply_to.into());
    }
    amqp
}

fn from_amqp_properties(properties: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: properties.content_type().as_ref().map(|s| s.as_str().to_string()),
        correlation_id: properties.correlation_id().as_ref().map(|s| s.as_str().to_string()),
        reply_to: properties.reply_to().as_ref().map(|s| s.as_str().to_string()),
    }
}

impl From<AmqpDelivery> for Delivery {
    fn from(delivery: AmqpDelivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            routing_key: delivery.routing_key.as_str().to_string(),
            properties: from_amqp_properties(&delivery.properties),
            body: delivery.data,
        }
    }
}

/// Broker backed by a RabbitMQ server.
#[derive(Clone, Debug)]
pub struct AmqpBroker {
    url: String,
}

impl AmqpBroker {
    /// Create a broker for an AMQP URL (e.g., amqp://localhost:5672).
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn open(&self) -> Result<Arc<dyn BrokerSession>> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(200, "channel setup failed").await;
                return Err(BusError::Connection(format!(
                    "Failed to create channel: {}",
                    e
                )));
            }
        };

        debug!(url = %self.url, "Opened AMQP session");

        Ok(Arc::new(AmqpSession {
            connection,
            channel,
        }))
    }
}

/// A connection and its single channel.
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

impl AmqpSession {
    /// Like `map_err`, but any failure on a connection that is no longer
    /// connected counts as a connection error.
    fn map_err(&self, context: &str, e: lapin::Error) -> BusError {
        if self.connection.status().connected() {
            map_err(context, e)
        } else {
            BusError::Connection(format!("{}: {}", context, e))
        }
    }
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.map_err("Failed to declare exchange", e))
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| self.map_err("Failed to declare queue", e))
    }

    async fn declare_reply_queue(&self) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.map_err("Failed to declare reply queue", e))?;

        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.map_err("Failed to bind queue", e))?;

        info!(
            queue = %queue,
            exchange = %exchange,
            routing_key = %routing_key,
            "Bound queue to exchange"
        );
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<()> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                to_amqp_properties(properties),
            )
            .await
            .map_err(|e| self.map_err("Failed to publish", e))?
            .await
            .map_err(|e| self.map_err("Publish confirmation failed", e))?;

        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| self.map_err("Failed to get message", e))?;

        Ok(message.map(|m| Delivery::from(m.delivery)))
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|e| self.map_err("Failed to nack message", e))
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let consumer_tag = format!("{}-{}", CONSUMER_TAG_PREFIX, queue);
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.map_err("Failed to start consumer", e))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(Delivery::from)
                    .map_err(|e| map_err("Consumer delivery error", e))
            })
            .boxed())
    }

    async fn close(&self) -> Result<()> {
        let channel = self.channel.close(200, "OK").await;
        let connection = self.connection.close(200, "OK").await;

        channel.map_err(|e| self.map_err("Failed to close channel", e))?;
        connection.map_err(|e| self.map_err("Failed to close connection", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_round_trip_through_amqp() {
        let properties = MessageProperties::json()
            .with_correlation_id("corr-1")
            .with_reply_to("amq.gen-abc");

        let amqp = to_amqp_properties(properties.clone());

        assert_eq!(*amqp.delivery_mode(), Some(2));
        assert_eq!(from_amqp_properties(&amqp), properties);
    }

    #[test]
    fn test_empty_properties_stay_empty() {
        let amqp = to_amqp_properties(MessageProperties::default());
        assert_eq!(from_amqp_properties(&amqp), MessageProperties::default());
    }

    #[test]
    fn test_broker_keeps_url() {
        let broker = AmqpBroker::new("amqp://localhost:5672");
        assert_eq!(broker.url(), "amqp://localhost:5672");
    }

    #[test]
    fn test_io_errors_map_to_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = map_err("Failed to get message", lapin::Error::IOError(Arc::new(io)));
        assert!(err.is_connection());
    }

    #[test]
    fn test_invalid_channel_state_maps_to_connection() {
        for state in [lapin::ChannelState::Error, lapin::ChannelState::Closed] {
            let err = map_err(
                "Failed to get message",
                lapin::Error::InvalidChannelState(state),
            );
            assert!(err.is_connection(), "{:?} should be connection-class", err);
        }
    }

    #[test]
    fn test_hard_protocol_error_maps_to_connection() {
        use lapin::protocol::{AMQPError, AMQPHardError};

        let forced = AMQPError::new(
            AMQPErrorKind::Hard(AMQPHardError::CONNECTIONFORCED),
            "CONNECTION_FORCED - broker forced connection closure".into(),
        );
        let err = map_err("Failed to declare queue", lapin::Error::ProtocolError(forced));
        assert!(err.is_connection());
    }

    #[test]
    fn test_soft_protocol_error_stays_channel() {
        use lapin::protocol::{AMQPError, AMQPSoftError};

        let mismatch = AMQPError::new(
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED),
            "PRECONDITION_FAILED - inequivalent arg 'durable'".into(),
        );
        let err = map_err("Failed to declare queue", lapin::Error::ProtocolError(mismatch));
        assert!(matches!(err, BusError::Channel(_)));
    }
}
