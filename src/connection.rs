//! Long-lived broker session shared by the notification retriever.
//!
//! The manager is created at startup, handed around as `Arc<ConnectionManager>`
//! and closed on shutdown. Every operation runs while holding the session
//! lock, so concurrent drains are serialized rather than interleaved on the
//! same channel.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bus::{Broker, BrokerSession, Result};
use crate::config::MessagingConfig;

/// Queue topology declared on every new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    /// Durable queue to read from.
    pub queue: String,
    /// Topic exchange the queue is bound to.
    pub exchange: String,
    /// Binding pattern; `None` leaves the queue unbound.
    pub binding_key: Option<String>,
}

impl QueueTopology {
    pub fn from_config(config: &MessagingConfig) -> Self {
        Self {
            queue: config.queue.clone(),
            exchange: config.exchange.clone(),
            binding_key: config.binding_key.clone(),
        }
    }
}

/// Owns the shared session and the queue topology it serves.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    topology: QueueTopology,
    session: Mutex<Option<Arc<dyn BrokerSession>>>,
}

impl ConnectionManager {
    pub fn new(broker: Arc<dyn Broker>, topology: QueueTopology) -> Self {
        Self {
            broker,
            topology,
            session: Mutex::new(None),
        }
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    pub fn queue(&self) -> &str {
        &self.topology.queue
    }

    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Open a fresh session and declare the queue topology on it.
    ///
    /// Calling this while connected replaces the current session. Failures
    /// are returned as-is; there is no retry.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        if let Some(previous) = guard.take() {
            if let Err(e) = previous.close().await {
                warn!(error = %e, "Failed to close previous broker session");
            }
        }
        *guard = Some(self.open_session().await?);
        Ok(())
    }

    /// Close the shared session. A no-op when not connected.
    pub async fn close(&self) -> Result<()> {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.close().await?;
            info!(queue = %self.topology.queue, "Broker connection closed");
        }
        Ok(())
    }

    /// Run `f` against the shared session, connecting first if needed.
    ///
    /// The session lock is held until `f` completes. When `f` fails the
    /// session is discarded so the next call reconnects.
    pub async fn with_session<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn BrokerSession>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut guard = self.session.lock().await;

        let session = match guard.as_ref() {
            Some(session) => Arc::clone(session),
            None => {
                let session = self.open_session().await?;
                *guard = Some(Arc::clone(&session));
                session
            }
        };

        let outcome = f(Arc::clone(&session)).await;

        if let Err(e) = &outcome {
            warn!(error = %e, "Discarding broker session after failure");
            guard.take();
            if let Err(close_err) = session.close().await {
                warn!(error = %close_err, "Failed to close discarded broker session");
            }
        }

        outcome
    }

    async fn open_session(&self) -> Result<Arc<dyn BrokerSession>> {
        let session = self.broker.open().await?;

        if let Err(e) = self.declare_topology(session.as_ref()).await {
            let _ = session.close().await;
            return Err(e);
        }

        info!(
            queue = %self.topology.queue,
            exchange = %self.topology.exchange,
            binding_key = ?self.topology.binding_key,
            "Connected to broker"
        );
        Ok(session)
    }

    async fn declare_topology(&self, session: &dyn BrokerSession) -> Result<()> {
        session.declare_queue(&self.topology.queue).await?;

        if let Some(binding_key) = &self.topology.binding_key {
            session.declare_exchange(&self.topology.exchange).await?;
            session
                .bind_queue(&self.topology.queue, &self.topology.exchange, binding_key)
                .await?;
        }
        Ok(())
    }
}
