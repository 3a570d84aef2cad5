//! Notification retriever: non-destructive reads of the notification queue.
//!
//! A drain fetches every ready message with manual-ack `get`, holding each one
//! unacknowledged so it is not handed out twice, then negative-acknowledges
//! all of them with requeue. The queue is left exactly as it was found, so
//! repeated drains keep returning the same messages until something else
//! consumes them.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bus::{BrokerSession, Delivery, Result};
use crate::connection::ConnectionManager;

/// Reads the notification queue through the shared connection.
#[derive(Clone)]
pub struct NotificationRetriever {
    connection: Arc<ConnectionManager>,
}

impl NotificationRetriever {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Return every message currently in the queue, parsed as JSON, in queue
    /// order, without removing any of them.
    ///
    /// Either every message is returned or the call fails; partial results
    /// are never handed back. A malformed body aborts the whole drain with
    /// `BusError::Parse` after the fetched messages have been requeued.
    pub async fn get_all_messages(&self) -> Result<Vec<Value>> {
        let queue = self.connection.queue().to_string();

        let messages = self
            .connection
            .with_session(|session| async move { drain(session.as_ref(), &queue).await })
            .await?;

        info!(count = messages.len(), "Retrieved messages from queue");
        Ok(messages)
    }

    /// Verify the broker is reachable by re-declaring the queue.
    pub async fn health(&self) -> Result<()> {
        let queue = self.connection.queue().to_string();
        self.connection
            .with_session(|session| async move { session.declare_queue(&queue).await })
            .await
    }
}

async fn drain(session: &dyn BrokerSession, queue: &str) -> Result<Vec<Value>> {
    let mut fetched: Vec<Delivery> = Vec::new();
    while let Some(delivery) = session.get(queue).await? {
        fetched.push(delivery);
    }

    let Some(last_tag) = fetched.last().map(|d| d.delivery_tag) else {
        return Ok(Vec::new());
    };

    let parsed: Result<Vec<Value>> = fetched.iter().map(Delivery::json).collect();

    session.nack(last_tag, true, true).await?;
    debug!(queue = %queue, count = fetched.len(), "Requeued drained messages");

    parsed.map_err(|e| {
        warn!(queue = %queue, error = %e, "Aborting drain on malformed message");
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Broker, BusError, MemoryBroker, MessageProperties, DEFAULT_EXCHANGE};
    use crate::config::MessagingConfig;
    use crate::connection::QueueTopology;
    use serde_json::json;

    const QUEUE: &str = "sms_notifications";

    fn retriever(broker: &MemoryBroker) -> NotificationRetriever {
        let topology = QueueTopology::from_config(&MessagingConfig::default());
        NotificationRetriever::new(Arc::new(ConnectionManager::new(
            Arc::new(broker.clone()),
            topology,
        )))
    }

    async fn enqueue(broker: &MemoryBroker, bodies: &[&str]) {
        let session = broker.open().await.unwrap();
        session.declare_queue(QUEUE).await.unwrap();
        for body in bodies {
            session
                .publish(DEFAULT_EXCHANGE, QUEUE, body.as_bytes(), MessageProperties::json())
                .await
                .unwrap();
        }
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_returns_messages_in_fifo_order() {
        let broker = MemoryBroker::new();
        enqueue(&broker, &[r#"{"n":1}"#, r#"{"n":2}"#, r#"{"n":3}"#]).await;

        let messages = retriever(&broker).get_all_messages().await.unwrap();

        assert_eq!(messages, vec![json!({"n":1}), json!({"n":2}), json!({"n":3})]);
    }

    #[tokio::test]
    async fn test_drain_is_non_destructive() {
        let broker = MemoryBroker::new();
        enqueue(&broker, &[r#"{"n":1}"#, r#"{"n":2}"#]).await;
        let retriever = retriever(&broker);

        let first = retriever.get_all_messages().await.unwrap();
        let second = retriever.get_all_messages().await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_eq!(broker.queue_depth(QUEUE).await, Some(2));
    }

    #[tokio::test]
    async fn test_drain_sees_messages_published_between_calls() {
        let broker = MemoryBroker::new();
        enqueue(&broker, &[r#"{"n":1}"#]).await;
        let retriever = retriever(&broker);

        let first = retriever.get_all_messages().await.unwrap();
        enqueue(&broker, &[r#"{"n":2}"#]).await;
        let second = retriever.get_all_messages().await.unwrap();

        assert_eq!(first, vec![json!({"n":1})]);
        assert_eq!(second, vec![json!({"n":1}), json!({"n":2})]);
    }

    #[tokio::test]
    async fn test_drain_on_empty_queue_returns_empty() {
        let broker = MemoryBroker::new();

        let messages = retriever(&broker).get_all_messages().await.unwrap();

        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_drain_fails_atomically_when_unreachable() {
        let broker = MemoryBroker::new();
        enqueue(&broker, &[r#"{"n":1}"#]).await;
        broker.set_reachable(false).await;

        let result = retriever(&broker).get_all_messages().await;

        assert!(matches!(result, Err(e) if e.is_connection()));
        assert_eq!(broker.queue_depth(QUEUE).await, Some(1));
    }

    #[tokio::test]
    async fn test_malformed_message_aborts_drain_without_losing_messages() {
        let broker = MemoryBroker::new();
        enqueue(&broker, &[r#"{"n":1}"#, "not json", r#"{"n":3}"#]).await;
        let retriever = retriever(&broker);

        let result = retriever.get_all_messages().await;

        assert!(matches!(result, Err(BusError::Parse(_))));
        assert_eq!(broker.queue_depth(QUEUE).await, Some(3));
    }

    #[tokio::test]
    async fn test_drain_reconnects_after_lost_connection() {
        let broker = MemoryBroker::new();
        enqueue(&broker, &[r#"{"n":1}"#]).await;
        let retriever = retriever(&broker);
        retriever.connection().connect().await.unwrap();

        broker.sever_connections().await;
        let lost = retriever.get_all_messages().await;
        let recovered = retriever.get_all_messages().await.unwrap();

        assert!(matches!(lost, Err(e) if e.is_connection()));
        assert_eq!(recovered, vec![json!({"n":1})]);
    }

    #[tokio::test]
    async fn test_concurrent_drains_each_see_every_message() {
        let broker = MemoryBroker::new();
        enqueue(&broker, &[r#"{"n":1}"#, r#"{"n":2}"#]).await;
        let retriever = retriever(&broker);

        let (a, b) = tokio::join!(retriever.get_all_messages(), retriever.get_all_messages());

        assert_eq!(a.unwrap().len(), 2);
        assert_eq!(b.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_health_connects_and_declares_queue() {
        let broker = MemoryBroker::new();
        let retriever = retriever(&broker);

        retriever.health().await.unwrap();

        assert!(retriever.connection().is_connected().await);
        assert_eq!(broker.queue_depth(QUEUE).await, Some(0));
    }

    #[tokio::test]
    async fn test_health_fails_when_unreachable() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false).await;

        let result = retriever(&broker).health().await;

        assert!(matches!(result, Err(e) if e.is_connection()));
    }
}
