//! Transport abstraction
//!
//! This module defines the contract every transport implements, the error
//! taxonomy shared by both backends, and the handler trait consumers plug
//! into the [`TopicRouter`](crate::router::TopicRouter).

use crate::router::TopicRouter;
use crate::types::{Event, Service, Topic};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Which backend carries events for this deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Partitioned append log with consumer groups
    Log,
    /// Push relay delivering signed HTTP callbacks
    Relay,
}

impl TransportMode {
    /// Short name used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Log => "log",
            TransportMode::Relay => "relay",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kafka" | "log" => Ok(TransportMode::Log),
            "qs" | "qstash" | "relay" => Ok(TransportMode::Relay),
            other => Err(format!("unsupported message bus mode: {other}")),
        }
    }
}

/// Transport error types.
///
/// Backend-specific failures are normalized into these kinds before they
/// leave a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Backend unreachable after the connect retry budget
    #[error("Connection error ({mode}): {reason}")]
    ConnectionError {
        /// Transport that failed
        mode: TransportMode,
        /// Underlying cause
        reason: String,
    },

    /// Message not accepted by the transport
    #[error("Failed to publish to {topic}: {reason}")]
    PublishError {
        /// Topic the message was destined for
        topic: String,
        /// Underlying cause
        reason: String,
    },

    /// Signature invalid or header malformed
    #[error("Signature verification failed")]
    VerificationError,

    /// Handler failed while processing a delivered event
    #[error("Handler failed for {topic}: {source}")]
    HandlerError {
        /// Topic being processed
        topic: Topic,
        /// Handler failure
        #[source]
        source: HandlerError,
    },

    /// Failed to start consuming
    #[error("Failed to subscribe: {0}")]
    SubscribeError(String),

    /// Invalid transport configuration
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Operation requires `connect()` first
    #[error("Transport is not connected")]
    NotConnected,
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Failures raised by event handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Payload did not match the topic's schema
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// A collaborator (store, mailer, ...) failed
    #[error("Downstream failure: {0}")]
    Downstream(String),

    /// Processing exceeded its time budget
    #[error("Handler timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::InvalidPayload(e.to_string())
    }
}

/// Event handler trait for processing events.
///
/// Handlers must be idempotent: both transports deliver at least once and the
/// relay backend may invoke the same handler concurrently.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

/// Closure-based handler.
pub struct FnHandler<F> {
    handler: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    /// Wrap an async closure.
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        (self.handler)(event.clone()).await
    }
}

/// Transport statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    /// Events accepted by the backend
    pub published: u64,
    /// Events handed to a handler that completed
    pub delivered: u64,
    /// Events whose handler failed on every attempt
    pub handler_failures: u64,
    /// Events moved to a dead-letter topic
    pub dead_lettered: u64,
}

/// Lock-free counters behind [`TransportStats`].
#[derive(Debug, Default)]
pub struct StatsRecorder {
    published: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
    dead_lettered: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters.
    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Publish/subscribe contract shared by every backend.
///
/// Business code holds an `Arc<dyn Transport>` and never branches on which
/// backend is behind it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Backend carrying events.
    fn mode(&self) -> TransportMode;

    /// Establish backend readiness.
    ///
    /// Must be called before `publish` or `subscribe`. Fails with
    /// [`TransportError::ConnectionError`] once the retry budget is spent.
    async fn connect(&self) -> TransportResult<()>;

    /// Hand one event to the backend.
    ///
    /// Returns once the backend accepted the event; consumers may not have
    /// seen it yet.
    async fn publish(&self, event: Event) -> TransportResult<()>;

    /// Publish a payload on a topic, wrapping it in a fresh envelope.
    async fn publish_payload(
        &self,
        topic: Topic,
        source: Service,
        payload: serde_json::Value,
    ) -> TransportResult<()> {
        self.publish(Event::new(topic, source, payload)).await
    }

    /// Begin dispatching the router's topics to their handlers.
    async fn subscribe(&self, router: Arc<TopicRouter>) -> TransportResult<()>;

    /// Release backend resources. Idempotent.
    async fn disconnect(&self) -> TransportResult<()>;

    /// Get transport statistics.
    fn stats(&self) -> TransportStats;
}
