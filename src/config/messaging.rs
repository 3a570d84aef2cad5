//! Broker topology and messaging behaviour.

use std::time::Duration;

use serde::Deserialize;

/// What the publisher does when a publish fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishFailurePolicy {
    /// Log the failure and report success to the caller.
    #[default]
    Log,
    /// Return the failure to the caller.
    #[serde(alias = "throw")]
    Propagate,
}

/// Request/reply settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Queue the auth service consumes verification requests from.
    pub queue: String,
    /// Seconds to wait for a correlated reply.
    pub timeout_secs: u64,
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            queue: "auth.verify".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Messaging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Durable queue the notification retriever reads.
    pub queue: String,
    /// Topic exchange product events are published to.
    pub exchange: String,
    /// Pattern binding `queue` to `exchange`; `None` leaves the queue unbound.
    pub binding_key: Option<String>,
    /// Publisher behaviour on failure.
    pub on_publish_failure: PublishFailurePolicy,
    /// Request/reply settings.
    pub rpc: RpcConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            queue: "sms_notifications".to_string(),
            exchange: "product_events".to_string(),
            binding_key: Some("product.*".to_string()),
            on_publish_failure: PublishFailurePolicy::Log,
            rpc: RpcConfig::default(),
        }
    }
}
