//! Storefront messaging core.
//!
//! The broker plumbing behind the storefront's notification pipeline:
//! product events published to a topic exchange, a non-destructive view of
//! the notification queue served over HTTP, and token verification as
//! request/reply over a queue.

pub mod bus;
pub mod config;
pub mod connection;
pub mod events;
pub mod publisher;
pub mod rest;
pub mod retriever;
pub mod rpc;
pub mod utils;

pub use bus::{Broker, BrokerSession, BusError};
pub use connection::{ConnectionManager, QueueTopology};
pub use publisher::EventPublisher;
pub use retriever::NotificationRetriever;
pub use rpc::{RpcClient, RpcResponder};
