//! notification-retriever: HTTP view of the notification queue
//!
//! Connects to the broker at startup, declares the notification queue and
//! serves its current contents without consuming them.
//!
//! ## Architecture
//! ```text
//! [product_events] --product.*--> [sms_notifications] <--get/nack-- [notification-retriever]
//!                                                                           |
//!                                                                           v
//!                                                                  [HTTP :3002/notifications]
//! ```
//!
//! ## Configuration
//! - RABBITMQ_URL: broker URL (default: amqp://localhost:5672)
//! - RABBITMQ_QUEUE: queue to serve (default: sms_notifications)
//! - PORT: HTTP port (default: 3002)
//! - STOREFRONT_LOG: log filter (default: info)

use std::sync::Arc;

use tracing::{error, info, warn};

use storefront_messaging::bus::AmqpBroker;
use storefront_messaging::config::Config;
use storefront_messaging::connection::{ConnectionManager, QueueTopology};
use storefront_messaging::rest;
use storefront_messaging::retriever::NotificationRetriever;
use storefront_messaging::utils::bootstrap::{init_tracing, parse_config_path, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        queue = %config.messaging.queue,
        port = config.server.port,
        "starting notification-retriever"
    );

    let broker = Arc::new(AmqpBroker::new(&config.messaging.url));
    let connection = Arc::new(ConnectionManager::new(
        broker,
        QueueTopology::from_config(&config.messaging),
    ));

    if let Err(e) = connection.connect().await {
        error!(error = %e, "Failed to start server");
        return Err(e.into());
    }

    let listener = tokio::net::TcpListener::bind(config.server.bind_address()).await?;
    let retriever = NotificationRetriever::new(Arc::clone(&connection));

    let served = rest::serve(listener, retriever, shutdown_signal())
        .await
        .map_err(|e| -> Box<dyn std::error::Error> { e });

    if let Err(e) = connection.close().await {
        warn!(error = %e, "Failed to close broker connection");
    }

    served
}
