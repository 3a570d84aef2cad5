//! Product events published by product-service.

use serde::{Deserialize, Serialize};

/// Routing key prefix for product events.
pub const PRODUCT_ROUTING_PREFIX: &str = "product";

/// Event type published after a product is persisted.
pub const PRODUCT_CREATED: &str = "created";

/// Routing key for a product event type: `product.<event_type>`.
pub fn routing_key(event_type: &str) -> String {
    format!("{}.{}", PRODUCT_ROUTING_PREFIX, event_type)
}

/// Payload of a `product.created` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductCreated {
    pub id: String,
    pub seller_id: String,
    pub seller_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub name: String,
    pub price: f64,
    pub stock: i64,
    pub category_id: String,
    #[serde(default)]
    pub subcategory_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}
