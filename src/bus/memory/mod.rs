//! In-memory broker for tests and local development.
//!
//! Models the slice of AMQP semantics the messaging core depends on:
//! - durable topic exchanges with `*` / `#` bindings, plus the default exchange
//! - queues with manual-ack `get`, `nack` with requeue in original order
//! - exclusive server-named queues deleted when their session closes
//! - no-ack consumers fed as messages arrive, round-robin when a queue has
//!   several (competing consumers)
//! - unacked messages returned to their queue when a session goes away
//!
//! Failure injection (`set_reachable`, `sever_connections`) and inspection
//! helpers (`published`, `queue_depth`, `open_sessions`) let tests assert
//! behaviour without a running RabbitMQ.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::topic::topic_matches;
use super::{
    Broker, BrokerSession, BusError, Delivery, DeliveryStream, MessageProperties, Result,
    DEFAULT_EXCHANGE,
};

/// Prefix for server-assigned reply queue names (mirrors RabbitMQ).
const REPLY_QUEUE_PREFIX: &str = "amq.gen-";

/// A message as recorded when it was published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    /// Broker-wide arrival order, used to restore position on requeue.
    sequence: u64,
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

impl StoredMessage {
    fn into_delivery(self, delivery_tag: u64) -> Delivery {
        Delivery {
            delivery_tag,
            redelivered: self.redelivered,
            routing_key: self.routing_key,
            body: self.body,
            properties: self.properties,
        }
    }
}

struct Binding {
    queue: String,
    pattern: String,
}

struct Consumer {
    session: u64,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

#[derive(Default)]
struct MemoryQueue {
    /// Owning session for exclusive queues.
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<Consumer>,
    /// Round-robin cursor into `consumers`.
    next_consumer: usize,
}

impl MemoryQueue {
    /// Put a message back at the position its sequence number dictates.
    fn requeue(&mut self, mut message: StoredMessage) {
        message.redelivered = true;
        let position = self
            .ready
            .iter()
            .position(|m| m.sequence > message.sequence)
            .unwrap_or(self.ready.len());
        self.ready.insert(position, message);
    }
}

#[derive(Default)]
struct SessionState {
    next_tag: u64,
    /// Delivery tag -> (queue, message) for messages handed out by `get`.
    unacked: BTreeMap<u64, (String, StoredMessage)>,
}

impl SessionState {
    fn next_tag(&mut self) -> u64 {
        self.next_tag += 1;
        self.next_tag
    }
}

struct BrokerState {
    reachable: bool,
    next_session: u64,
    next_sequence: u64,
    next_reply_queue: u64,
    exchanges: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, MemoryQueue>,
    sessions: HashMap<u64, SessionState>,
    published: Vec<PublishedMessage>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            next_session: 0,
            next_sequence: 0,
            next_reply_queue: 0,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            sessions: HashMap::new(),
            published: Vec::new(),
        }
    }
}

impl BrokerState {
    fn ensure_session(&self, session: u64) -> Result<()> {
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(BusError::Connection("Connection closed".to_string()))
        }
    }

    /// Hand a message to the next live consumer, or leave it ready.
    fn deliver(&mut self, queue_name: &str, message: StoredMessage) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.consumers.is_empty() {
            let index = queue.next_consumer % queue.consumers.len();
            let consumer = &queue.consumers[index];
            let tag = match self.sessions.get_mut(&consumer.session) {
                Some(session) => session.next_tag(),
                None => 0,
            };
            if consumer
                .sender
                .send(Ok(message.clone().into_delivery(tag)))
                .is_ok()
            {
                queue.next_consumer = index + 1;
                return;
            }
            // Receiver dropped
            queue.consumers.remove(index);
        }

        queue.ready.push_back(message);
    }

    /// Tear down a session: requeue its unacked messages, drop its exclusive
    /// queues and consumers.
    fn close_session(&mut self, session: u64) {
        let Some(state) = self.sessions.remove(&session) else {
            return;
        };

        for (_, (queue_name, message)) in state.unacked {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.requeue(message);
            }
        }

        self.queues.retain(|_, q| q.owner != Some(session));
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.session != session);
        }
        let queues = &self.queues;
        for bindings in self.exchanges.values_mut() {
            bindings.retain(|b| queues.contains_key(&b.queue));
        }
    }
}

/// In-process broker shared by every session opened from it.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `open()` fail with a connection error while unreachable.
    pub async fn set_reachable(&self, reachable: bool) {
        self.state.lock().await.reachable = reachable;
    }

    /// Drop every open session as if the broker connection was lost.
    pub async fn sever_connections(&self) {
        let mut state = self.state.lock().await;
        let sessions: Vec<u64> = state.sessions.keys().copied().collect();
        for session in sessions {
            state.close_session(session);
        }
    }

    /// Number of sessions currently open.
    pub async fn open_sessions(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Number of ready (not handed out) messages in a queue.
    pub async fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.ready.len())
    }

    pub async fn has_consumer(&self, queue: &str) -> bool {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .is_some_and(|q| !q.consumers.is_empty())
    }

    /// Every message published so far, in publish order.
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().await.published.clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open(&self) -> Result<Arc<dyn BrokerSession>> {
        let mut state = self.state.lock().await;
        if !state.reachable {
            return Err(BusError::Connection(
                "Failed to connect: connection refused".to_string(),
            ));
        }

        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(id, SessionState::default());
        debug!(session = id, "Opened in-memory session");

        Ok(Arc::new(MemorySession {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Session handle onto a `MemoryBroker`.
pub struct MemorySession {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_session(self.id)?;
        state.exchanges.entry(exchange.to_string()).or_default();
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_session(self.id)?;
        let existing = state.queues.entry(queue.to_string()).or_default();
        match existing.owner {
            Some(owner) if owner != self.id => Err(BusError::Channel(format!(
                "Queue '{}' is locked by another connection",
                queue
            ))),
            _ => Ok(()),
        }
    }

    async fn declare_reply_queue(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        state.ensure_session(self.id)?;
        state.next_reply_queue += 1;
        let name = format!("{}{}", REPLY_QUEUE_PREFIX, state.next_reply_queue);
        state.queues.insert(
            name.clone(),
            MemoryQueue {
                owner: Some(self.id),
                ..Default::default()
            },
        );
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_session(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(BusError::Channel(format!("No queue '{}'", queue)));
        }
        let bindings = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BusError::Channel(format!("No exchange '{}'", exchange)))?;
        if !bindings
            .iter()
            .any(|b| b.queue == queue && b.pattern == routing_key)
        {
            bindings.push(Binding {
                queue: queue.to_string(),
                pattern: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_session(self.id)?;

        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            vec![routing_key.to_string()]
        } else {
            let bindings = state
                .exchanges
                .get(exchange)
                .ok_or_else(|| BusError::Channel(format!("No exchange '{}'", exchange)))?;
            let mut targets: Vec<String> = Vec::new();
            for binding in bindings {
                if topic_matches(&binding.pattern, routing_key) && !targets.contains(&binding.queue)
                {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties: properties.clone(),
        });

        for queue in targets {
            state.next_sequence += 1;
            let message = StoredMessage {
                sequence: state.next_sequence,
                routing_key: routing_key.to_string(),
                body: body.to_vec(),
                properties: properties.clone(),
                redelivered: false,
            };
            state.deliver(&queue, message);
        }

        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>> {
        let mut state = self.state.lock().await;
        state.ensure_session(self.id)?;

        let message = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Channel(format!("No queue '{}'", queue)))?
            .ready
            .pop_front();

        let Some(message) = message else {
            return Ok(None);
        };

        let session = state
            .sessions
            .get_mut(&self.id)
            .ok_or_else(|| BusError::Connection("Connection closed".to_string()))?;
        let tag = session.next_tag();
        session
            .unacked
            .insert(tag, (queue.to_string(), message.clone()));

        Ok(Some(message.into_delivery(tag)))
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_session(self.id)?;

        let session = state
            .sessions
            .get_mut(&self.id)
            .ok_or_else(|| BusError::Connection("Connection closed".to_string()))?;

        let tags: Vec<u64> = if multiple {
            session
                .unacked
                .range(..=delivery_tag)
                .map(|(tag, _)| *tag)
                .collect()
        } else if session.unacked.contains_key(&delivery_tag) {
            vec![delivery_tag]
        } else {
            Vec::new()
        };

        if tags.is_empty() {
            return Err(BusError::Channel(format!(
                "Unknown delivery tag {}",
                delivery_tag
            )));
        }

        let released: Vec<(String, StoredMessage)> = tags
            .iter()
            .filter_map(|tag| session.unacked.remove(tag))
            .collect();

        if requeue {
            for (queue_name, message) in released {
                if let Some(queue) = state.queues.get_mut(&queue_name) {
                    queue.requeue(message);
                }
            }
        }

        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let mut state = self.state.lock().await;
        state.ensure_session(self.id)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let backlog: Vec<StoredMessage> = {
            let target = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BusError::Channel(format!("No queue '{}'", queue)))?;
            if target.owner.is_some_and(|owner| owner != self.id) {
                return Err(BusError::Channel(format!(
                    "Queue '{}' is exclusive to another connection",
                    queue
                )));
            }
            target.consumers.push(Consumer {
                session: self.id,
                sender,
            });
            target.ready.drain(..).collect()
        };

        for message in backlog {
            state.deliver(queue, message);
        }

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_session(self.id)?;
        state.close_session(self.id);
        debug!(session = self.id, "Closed in-memory session");
        Ok(())
    }
}
