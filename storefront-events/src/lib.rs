//! # Storefront Events
//!
//! Event bus shared by the storefront services (catalog, order, payment,
//! notification). State changes in one service reach the others without
//! synchronous coupling, over either of two transports behind one contract.
//!
//! ## Overview
//!
//! - **Event model**: [`Event`] envelope and the closed [`Topic`] vocabulary
//! - **Transport**: [`Transport`] trait with `connect`, `publish`,
//!   `subscribe`, `disconnect`
//! - **Topic routing**: [`TopicRouter`], one handler per topic, shared by
//!   both inbound paths
//! - **Log backend**: [`LogTransport`], partitioned log with consumer groups,
//!   at-least-once delivery and a dead-letter topic
//! - **Relay backend**: [`RelayTransport`], push relay delivering signed
//!   HTTP callbacks to the [`webhook`] endpoints
//! - **Signature verification**: [`SignatureVerifier`], HMAC-SHA256 over the
//!   raw callback body
//!
//! Switching transport is a deployment decision: business code holds an
//! `Arc<dyn Transport>` and never branches on which backend is behind it.
//!
//! ## Features
//!
//! - `memory` (default): in-process log broker for development and tests
//! - `kafka`: Kafka-compatible log broker via rdkafka
//!
//! ## Usage
//!
//! ### Publishing Events
//!
//! ```rust,no_run
//! use serde_json::json;
//! use storefront_events::{build_transport, BusConfig, Service, Topic};
//!
//! async fn publish_example() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BusConfig::from_env("catalog-service", 8003)?;
//!     let transport = build_transport(&config)?;
//!     transport.connect().await?;
//!
//!     transport
//!         .publish_payload(
//!             Topic::ProductCreated,
//!             Service::Catalog,
//!             json!({"id": "p1", "name": "Desk lamp", "price": 2999}),
//!         )
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Handling Events
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storefront_events::{
//!     build_transport, BusConfig, Event, FnHandler, ServiceRuntime, Topic, TopicRouter,
//! };
//!
//! async fn consume_example() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BusConfig::from_env("search-service", 8005)?;
//!     let router = TopicRouter::builder()
//!         .route(
//!             Topic::ProductCreated,
//!             Arc::new(FnHandler::new(|event: Event| async move {
//!                 println!("indexing {}", event.payload["name"]);
//!                 Ok(())
//!             })),
//!         )
//!         .build()?;
//!
//!     let transport = build_transport(&config)?;
//!     ServiceRuntime::new(config, router, transport).run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Delivery Guarantees
//!
//! Both transports deliver at least once, so handlers must be idempotent.
//! The log backend keeps per-partition order for a consumer group; the relay
//! backend gives no ordering guarantee and may run a handler concurrently
//! with itself.

pub mod bus;
pub mod config;
pub mod log;
pub mod relay;
pub mod retry;
pub mod router;
pub mod runtime;
pub mod signature;
pub mod types;
pub mod webhook;

// Re-export main types
pub use bus::{
    EventHandler, FnHandler, HandlerError, Transport, TransportError, TransportMode,
    TransportResult, TransportStats,
};
pub use config::{BusConfig, ConfigError, LogConfig, RelayConfig, WebhookConfig};
pub use log::{DeadLetter, LogClient, LogConsumer, LogRecord, LogTransport};
pub use relay::{PublishReceipt, RelayTransport};
pub use retry::RetryConfig;
pub use router::{DispatchOutcome, TopicRouter, TopicRouterBuilder};
pub use runtime::{build_transport, ServiceRuntime};
pub use signature::{sign, SignatureVerifier, SigningKey};
pub use types::{Event, Service, Topic, UnknownTopic};
pub use webhook::{webhook_router, WebhookState};

#[cfg(feature = "memory")]
pub use log::MemoryLog;

#[cfg(feature = "kafka")]
pub use log::KafkaLog;
