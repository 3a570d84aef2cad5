//! HTTP surface of the notification retriever.
//!
//! - `GET /notifications` returns every queued notification without consuming it
//! - `GET /notifications/health` checks the broker connection
//!
//! Failures are reported as `{message, error, timestamp}` with 500, or 503
//! when the broker could not be reached.

use std::future::Future;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::bus::BusError;
use crate::retriever::NotificationRetriever;

/// Service name reported by the health endpoint.
pub const SERVICE_NAME: &str = "notification-retriever";

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve<S>(
    listener: TcpListener,
    retriever: NotificationRetriever,
    shutdown: S,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app = router(retriever);
    let addr = listener.local_addr()?;
    info!(%addr, "Notification API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Build the axum router (separated for testing).
pub fn router(retriever: NotificationRetriever) -> Router {
    Router::new()
        .route("/notifications", get(notifications))
        .route("/notifications/health", get(health))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(retriever)
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ============================================================================
// Handlers
// ============================================================================

async fn notifications(
    State(retriever): State<NotificationRetriever>,
) -> Result<Json<NotificationsResponse>, ApiError> {
    let notifications = retriever
        .get_all_messages()
        .await
        .map_err(|e| {
            ApiError::from_bus(
                &e,
                "Failed to fetch notifications",
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        })?;

    info!(count = notifications.len(), "Fetched all notifications");
    Ok(Json(NotificationsResponse {
        status: "success",
        notifications,
    }))
}

async fn health(
    State(retriever): State<NotificationRetriever>,
) -> Result<Json<HealthResponse>, ApiError> {
    retriever
        .health()
        .await
        .map_err(|e| {
            ApiError::from_bus(&e, "Health check failed", StatusCode::SERVICE_UNAVAILABLE)
        })?;

    info!("Health check passed");
    Ok(Json(HealthResponse {
        status: "healthy",
        service: SERVICE_NAME,
        timestamp: now(),
        rabbitmq: "connected",
    }))
}

async fn not_found() -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        message: "Not found".to_string(),
        error: "No route matches the request".to_string(),
    }
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
struct NotificationsResponse {
    status: &'static str,
    notifications: Vec<Value>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    timestamp: String,
    rabbitmq: &'static str,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    message: String,
    error: String,
    timestamp: String,
}

/// Request failure rendered as the JSON error envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    error: String,
}

impl ApiError {
    /// Connection-class errors become 503 with a "Service unavailable" suffix.
    fn from_bus(err: &BusError, message: &str, status: StatusCode) -> Self {
        if err.is_connection() {
            Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: format!("{} - Service unavailable", message),
                error: err.to_string(),
            }
        } else {
            Self {
                status,
                message: message.to_string(),
                error: err.to_string(),
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.error, "{}", self.message);
        }
        let envelope = ErrorEnvelope {
            message: self.message,
            error: self.error,
            timestamp: now(),
        };
        (self.status, Json(envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::bus::{Broker, MemoryBroker, MessageProperties, DEFAULT_EXCHANGE};
    use crate::config::MessagingConfig;
    use crate::connection::{ConnectionManager, QueueTopology};

    const QUEUE: &str = "sms_notifications";

    fn app(broker: &MemoryBroker) -> Router {
        let topology = QueueTopology::from_config(&MessagingConfig::default());
        let connection = ConnectionManager::new(Arc::new(broker.clone()), topology);
        router(NotificationRetriever::new(Arc::new(connection)))
    }

    async fn enqueue(broker: &MemoryBroker, body: &str) {
        let session = broker.open().await.unwrap();
        session.declare_queue(QUEUE).await.unwrap();
        session
            .publish(DEFAULT_EXCHANGE, QUEUE, body.as_bytes(), MessageProperties::json())
            .await
            .unwrap();
        session.close().await.unwrap();
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn assert_envelope(json: &Value, message: &str) {
        assert_eq!(json["message"], message);
        assert!(json["error"].is_string());
        let timestamp = json["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[tokio::test]
    async fn test_notifications_lists_queued_messages() {
        let broker = MemoryBroker::new();
        enqueue(&broker, r#"{"message":"New product"}"#).await;
        enqueue(&broker, r#"{"message":"Restocked"}"#).await;

        let (status, json) = get(app(&broker), "/notifications").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json,
            json!({
                "status": "success",
                "notifications": [{"message": "New product"}, {"message": "Restocked"}]
            })
        );
        assert_eq!(broker.queue_depth(QUEUE).await, Some(2));
    }

    #[tokio::test]
    async fn test_notifications_on_empty_queue() {
        let broker = MemoryBroker::new();

        let (status, json) = get(app(&broker), "/notifications").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["notifications"], json!([]));
    }

    #[tokio::test]
    async fn test_notifications_unreachable_broker_is_503() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false).await;

        let (status, json) = get(app(&broker), "/notifications").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_envelope(&json, "Failed to fetch notifications - Service unavailable");
    }

    #[tokio::test]
    async fn test_notifications_malformed_message_is_500() {
        let broker = MemoryBroker::new();
        enqueue(&broker, "not json").await;

        let (status, json) = get(app(&broker), "/notifications").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_envelope(&json, "Failed to fetch notifications");
    }

    #[tokio::test]
    async fn test_health_reports_connected() {
        let broker = MemoryBroker::new();

        let (status, json) = get(app(&broker), "/notifications/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], SERVICE_NAME);
        assert_eq!(json["rabbitmq"], "connected");
        assert!(chrono::DateTime::parse_from_rfc3339(json["timestamp"].as_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_health_unreachable_broker_is_503() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false).await;

        let (status, json) = get(app(&broker), "/notifications/health").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_envelope(&json, "Health check failed - Service unavailable");
    }

    #[test]
    fn test_non_connection_error_keeps_requested_status() {
        let err = BusError::Channel("PRECONDITION_FAILED".to_string());

        let api = ApiError::from_bus(&err, "Health check failed", StatusCode::SERVICE_UNAVAILABLE);

        assert_eq!(api.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(api.message, "Health check failed");
    }

    #[tokio::test]
    async fn test_unknown_route_uses_error_envelope() {
        let broker = MemoryBroker::new();

        let (status, json) = get(app(&broker), "/unknown").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_envelope(&json, "Not found");
    }
}
