//! End-to-end flow over the in-memory broker: product events published by
//! the storefront show up on the notification API without being consumed.

use std::sync::Arc;

use axum::body::Body;
use axum::Router;
use http::{Request, StatusCode};
use serde_json::{json, Value};
use storefront_messaging::bus::MemoryBroker;
use storefront_messaging::config::{Config, PublishFailurePolicy};
use storefront_messaging::connection::{ConnectionManager, QueueTopology};
use storefront_messaging::events::ProductCreated;
use storefront_messaging::publisher::EventPublisher;
use storefront_messaging::rest;
use storefront_messaging::retriever::NotificationRetriever;
use tower::ServiceExt;

struct Storefront {
    broker: MemoryBroker,
    publisher: EventPublisher,
    app: Router,
}

async fn storefront() -> Storefront {
    let config = Config::for_test();
    let broker = MemoryBroker::new();

    let connection = Arc::new(ConnectionManager::new(
        Arc::new(broker.clone()),
        QueueTopology::from_config(&config.messaging),
    ));
    connection.connect().await.unwrap();

    let publisher = EventPublisher::new(
        Arc::new(broker.clone()),
        &config.messaging.exchange,
        PublishFailurePolicy::Propagate,
    );
    let app = rest::router(NotificationRetriever::new(connection));

    Storefront {
        broker,
        publisher,
        app,
    }
}

async fn notifications(app: &Router) -> (StatusCode, Value) {
    let req = Request::builder()
        .uri("/notifications")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

fn product(id: &str, name: &str) -> ProductCreated {
    ProductCreated {
        id: id.to_string(),
        seller_id: "7".to_string(),
        seller_name: "Asha".to_string(),
        message: Some(format!("New product listed: {}", name)),
        name: name.to_string(),
        price: 1200.0,
        stock: 4,
        category_id: "lamps".to_string(),
        subcategory_name: "desk".to_string(),
        description: None,
    }
}

#[tokio::test]
async fn test_published_products_appear_as_notifications() {
    let shop = storefront().await;

    shop.publisher
        .product_created(&product("p1", "Brass lamp"))
        .await
        .unwrap();
    shop.publisher
        .product_created(&product("p2", "Paper lantern"))
        .await
        .unwrap();

    let (status, json) = notifications(&shop.app).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "success");
    let listed = json["notifications"].as_array().unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["id"], "p1");
    assert_eq!(listed[0]["sellerName"], "Asha");
    assert_eq!(listed[1]["message"], "New product listed: Paper lantern");
}

#[tokio::test]
async fn test_notifications_survive_repeated_reads() {
    let shop = storefront().await;
    shop.publisher
        .publish("created", &json!({"id": "p1"}))
        .await
        .unwrap();

    let (_, first) = notifications(&shop.app).await;
    let (_, second) = notifications(&shop.app).await;

    assert_eq!(first, second);
    assert_eq!(shop.broker.queue_depth("sms_notifications").await, Some(1));
}

#[tokio::test]
async fn test_non_product_routing_keys_are_not_listed() {
    let shop = storefront().await;
    shop.publisher
        .publish("created.bulk", &json!({"id": "bulk"}))
        .await
        .unwrap();
    shop.publisher
        .publish("updated", &json!({"id": "p3"}))
        .await
        .unwrap();

    let (_, json) = notifications(&shop.app).await;

    assert_eq!(json["notifications"], json!([{"id": "p3"}]));
}
