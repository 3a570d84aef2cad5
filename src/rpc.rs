//! Request/reply over the broker.
//!
//! `RpcClient` sends `{token, correlationId}` to the auth verification queue
//! and waits on an exclusive reply queue for the reply carrying the same
//! correlation id. `RpcResponder` is the serving side of the same pattern.
//!
//! ```text
//! [RpcClient] --(auth.verify, correlation_id, reply_to)--> [RpcResponder]
//!      ^                                                         |
//!      +-------------(amq.gen-..., correlation_id)---------------+
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{
    scoped, Broker, BrokerSession, BusError, DeliveryStream, MessageProperties, Result,
    DEFAULT_EXCHANGE,
};
use crate::config::RpcConfig;

/// Body of an auth verification request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub token: String,
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
}

/// Shorten a token for logging.
fn token_preview(token: &str) -> String {
    let prefix: String = token.chars().take(10).collect();
    format!("{}...", prefix)
}

/// Client side of the auth verification request/reply exchange.
///
/// Every call opens its own session and closes it again whatever the outcome.
pub struct RpcClient {
    broker: Arc<dyn Broker>,
    queue: String,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(broker: Arc<dyn Broker>, queue: impl Into<String>, timeout: Duration) -> Self {
        Self {
            broker,
            queue: queue.into(),
            timeout,
        }
    }

    pub fn from_config(broker: Arc<dyn Broker>, config: &RpcConfig) -> Self {
        Self::new(broker, &config.queue, config.timeout())
    }

    /// Send a verification request and wait up to the configured timeout.
    pub async fn call(&self, token: &str) -> Result<Value> {
        self.call_with_timeout(token, self.timeout).await
    }

    /// Send a verification request and wait up to `timeout` for the reply.
    ///
    /// Only a reply whose correlation id matches this request resolves the
    /// call; anything else on the reply queue is dropped.
    pub async fn call_with_timeout(&self, token: &str, timeout: Duration) -> Result<Value> {
        let correlation_id = Uuid::new_v4().to_string();

        scoped(self.broker.as_ref(), |session| async move {
            let reply_queue = session.declare_reply_queue().await?;
            let replies = session.consume(&reply_queue).await?;

            let request = AuthRequest {
                token: token.to_string(),
                correlation_id: correlation_id.clone(),
            };
            let body = serde_json::to_vec(&request)
                .map_err(|e| BusError::Publish(format!("Failed to encode request: {}", e)))?;

            info!(
                correlation_id = %correlation_id,
                token = %token_preview(token),
                "Sending auth request"
            );

            session
                .publish(
                    DEFAULT_EXCHANGE,
                    &self.queue,
                    &body,
                    MessageProperties::json()
                        .with_correlation_id(&correlation_id)
                        .with_reply_to(&reply_queue),
                )
                .await?;

            let result = tokio::time::timeout(timeout, await_reply(replies, &correlation_id))
                .await
                .map_err(|_| BusError::RpcTimeout(timeout))??;

            info!(correlation_id = %correlation_id, "Received auth response");
            Ok(result)
        })
        .await
    }
}

async fn await_reply(mut replies: DeliveryStream, correlation_id: &str) -> Result<Value> {
    while let Some(delivery) = replies.next().await {
        let delivery = delivery?;
        if delivery.properties.correlation_id.as_deref() == Some(correlation_id) {
            return delivery.json();
        }
        debug!(
            expected = %correlation_id,
            received = ?delivery.properties.correlation_id,
            "Ignoring reply with foreign correlation id"
        );
    }
    Err(BusError::ReplyClosed)
}

/// Serving side of the request/reply exchange.
///
/// `bind` declares the request queue and starts consuming before returning,
/// so requests published after it resolves are never dropped.
pub struct RpcResponder {
    session: Arc<dyn BrokerSession>,
    requests: DeliveryStream,
    queue: String,
}

impl RpcResponder {
    pub async fn bind(broker: &dyn Broker, queue: impl Into<String>) -> Result<Self> {
        let queue = queue.into();
        let session = broker.open().await?;

        let requests = match Self::listen(session.as_ref(), &queue).await {
            Ok(requests) => requests,
            Err(e) => {
                let _ = session.close().await;
                return Err(e);
            }
        };

        info!(queue = %queue, "RPC responder listening");
        Ok(Self {
            session,
            requests,
            queue,
        })
    }

    async fn listen(session: &dyn BrokerSession, queue: &str) -> Result<DeliveryStream> {
        session.declare_queue(queue).await?;
        session.consume(queue).await
    }

    /// Answer requests with `handler` until the request stream ends, then
    /// close the session.
    ///
    /// Requests without `reply_to` or with a malformed body are skipped.
    pub async fn serve<H, Fut>(mut self, handler: H) -> Result<()>
    where
        H: Fn(Value) -> Fut,
        Fut: Future<Output = Value>,
    {
        let outcome = self.answer_all(&handler).await;

        if let Err(e) = self.session.close().await {
            warn!(error = %e, queue = %self.queue, "Failed to close responder session");
        }
        outcome
    }

    async fn answer_all<H, Fut>(&mut self, handler: &H) -> Result<()>
    where
        H: Fn(Value) -> Fut,
        Fut: Future<Output = Value>,
    {
        while let Some(delivery) = self.requests.next().await {
            let delivery = delivery?;

            let Some(reply_to) = delivery.properties.reply_to.clone() else {
                warn!(queue = %self.queue, "Skipping request without reply_to");
                continue;
            };

            let request = match delivery.json() {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, queue = %self.queue, "Skipping malformed request");
                    continue;
                }
            };

            let reply = handler(request).await;
            let body = serde_json::to_vec(&reply)
                .map_err(|e| BusError::Publish(format!("Failed to encode reply: {}", e)))?;

            let mut properties = MessageProperties::json();
            properties.correlation_id = delivery.properties.correlation_id.clone();

            self.session
                .publish(DEFAULT_EXCHANGE, &reply_to, &body, properties)
                .await?;

            debug!(
                reply_to = %reply_to,
                correlation_id = ?delivery.properties.correlation_id,
                "Replied to request"
            );
        }
        Ok(())
    }
}
