//! Message broker access for the storefront services.
//!
//! This module contains:
//! - `Broker` trait: opens sessions (one connection plus one channel)
//! - `BrokerSession` trait: the AMQP operations the messaging core relies on
//! - `scoped`: per-call session acquisition with guaranteed release
//! - Implementations: AMQP (RabbitMQ), in-memory

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::warn;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;
pub mod topic;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

/// Content type stamped on every message the core publishes.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Name of the AMQP default (direct-to-queue) exchange.
pub const DEFAULT_EXCHANGE: &str = "";

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel operation failed: {0}")]
    Channel(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Malformed message body: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("No reply received within {0:?}")]
    RpcTimeout(Duration),

    #[error("Reply stream closed before a matching reply arrived")]
    ReplyClosed,
}

impl BusError {
    /// True for errors caused by an unreachable broker or a dropped connection.
    pub fn is_connection(&self) -> bool {
        matches!(self, BusError::Connection(_))
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Message properties the core reads or writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl MessageProperties {
    /// Properties for a plain JSON body.
    pub fn json() -> Self {
        Self {
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// A message handed out by the broker, either by `get` or by a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag used to ack/nack the message.
    pub delivery_tag: u64,
    /// Set when the broker has handed this message out before.
    pub redelivered: bool,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl Delivery {
    /// Decode the body as JSON.
    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.body).map_err(BusError::Parse)
    }
}

/// Stream of deliveries from a no-ack consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

// ============================================================================
// Traits
// ============================================================================

/// Opens sessions against a message broker.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP
/// - `MemoryBroker`: in-process broker for tests and local development
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new connection with a single channel.
    ///
    /// Fails with `BusError::Connection` when the broker is unreachable.
    async fn open(&self) -> Result<Arc<dyn BrokerSession>>;
}

/// One connection plus one channel.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Declare a durable topic exchange.
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    /// Declare a durable queue.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Declare an exclusive, server-named queue that is deleted with the session.
    ///
    /// Returns the name the broker assigned.
    async fn declare_reply_queue(&self) -> Result<String>;

    /// Bind a queue to an exchange under a routing pattern.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish one message. An empty exchange routes straight to the queue
    /// named by `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<()>;

    /// Fetch the next ready message without waiting (manual ack mode).
    async fn get(&self, queue: &str) -> Result<Option<Delivery>>;

    /// Negative-acknowledge a delivery, or every delivery up to it when `multiple`.
    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()>;

    /// Start a no-ack consumer on a queue.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    /// Close the channel, then the connection.
    ///
    /// Both steps are attempted; the first failure is returned.
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// Scoped acquisition
// ============================================================================

/// Run `f` against a freshly opened session and close it afterwards.
///
/// The session is closed on every return path of `f`. Close failures are
/// logged and never replace the outcome of `f`.
pub async fn scoped<T, F, Fut>(broker: &dyn Broker, f: F) -> Result<T>
where
    F: FnOnce(Arc<dyn BrokerSession>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let session = broker.open().await?;
    let outcome = f(Arc::clone(&session)).await;

    if let Err(e) = session.close().await {
        warn!(error = %e, "Failed to close broker session");
    }

    outcome
}
