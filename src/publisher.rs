//! Product event publisher.
//!
//! Each publish opens its own session, declares the topic exchange, publishes
//! one JSON message under `product.<event_type>` and closes the session again.
//! There is no retry and no local buffering: with the default `Log` policy a
//! broker outage loses the event and the caller carries on.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error};

use crate::bus::{scoped, Broker, BusError, MessageProperties, Result};
use crate::config::{MessagingConfig, PublishFailurePolicy};
use crate::events::{routing_key, ProductCreated, PRODUCT_CREATED};

/// Publishes product events to the product topic exchange.
pub struct EventPublisher {
    broker: Arc<dyn Broker>,
    exchange: String,
    on_failure: PublishFailurePolicy,
}

impl EventPublisher {
    pub fn new(
        broker: Arc<dyn Broker>,
        exchange: impl Into<String>,
        on_failure: PublishFailurePolicy,
    ) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
            on_failure,
        }
    }

    pub fn from_config(broker: Arc<dyn Broker>, config: &MessagingConfig) -> Self {
        Self::new(broker, &config.exchange, config.on_publish_failure)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publish `data` as a `product.<event_type>` event.
    ///
    /// Under `PublishFailurePolicy::Log` failures are logged and `Ok(())` is
    /// returned; under `Propagate` they come back as `BusError::Publish`.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(event_type = %event_type))]
    pub async fn publish<T>(&self, event_type: &str, data: &T) -> Result<()>
    where
        T: Serialize + ?Sized + Sync,
    {
        let routing_key = routing_key(event_type);

        let result = match serde_json::to_vec(data) {
            Ok(body) => self.send(&routing_key, body).await,
            Err(e) => Err(BusError::Publish(format!("Failed to encode payload: {}", e))),
        };

        match result {
            Ok(()) => {
                debug!(
                    exchange = %self.exchange,
                    routing_key = %routing_key,
                    "Event published"
                );
                Ok(())
            }
            Err(e) => match self.on_failure {
                PublishFailurePolicy::Log => {
                    error!(
                        error = %e,
                        routing_key = %routing_key,
                        id = ?event_id(data),
                        "Event publish failed"
                    );
                    Ok(())
                }
                PublishFailurePolicy::Propagate => Err(match e {
                    BusError::Publish(_) => e,
                    other => BusError::Publish(other.to_string()),
                }),
            },
        }
    }

    /// Publish a `product.created` event.
    pub async fn product_created(&self, event: &ProductCreated) -> Result<()> {
        self.publish(PRODUCT_CREATED, event).await
    }

    async fn send(&self, routing_key: &str, body: Vec<u8>) -> Result<()> {
        scoped(self.broker.as_ref(), |session| async move {
            session.declare_exchange(&self.exchange).await?;
            session
                .publish(&self.exchange, routing_key, &body, MessageProperties::json())
                .await
        })
        .await
    }
}

/// `id` field of the payload, if it has one, for log context.
fn event_id<T: Serialize + ?Sized>(data: &T) -> Option<serde_json::Value> {
    serde_json::to_value(data).ok()?.get("id").cloned()
}
