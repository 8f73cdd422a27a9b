//! Event types shared by every storefront service
//!
//! This module defines the event envelope carried by both transports and the
//! closed topic vocabulary the services publish and subscribe to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Version of the topic vocabulary stamped on every outgoing event.
pub const VOCABULARY_VERSION: u32 = 1;

/// Suffix appended to a topic name to form its dead-letter topic.
pub const DEAD_LETTER_SUFFIX: &str = ".dlq";

/// A topic name that is not part of the vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown topic: {0}")]
pub struct UnknownTopic(pub String);

/// Domain topics understood by the storefront services.
///
/// The payload schema of each topic is owned by its producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Topic {
    /// A product was added to the catalog
    #[serde(rename = "product.created")]
    ProductCreated,
    /// A product was removed from the catalog
    #[serde(rename = "product.deleted")]
    ProductDeleted,
    /// A user account was created
    #[serde(rename = "user.created")]
    UserCreated,
    /// A checkout payment completed
    #[serde(rename = "payment.successful")]
    PaymentSuccessful,
    /// An order was persisted
    #[serde(rename = "order.created")]
    OrderCreated,
}

impl Topic {
    /// Every topic in the vocabulary.
    pub const ALL: [Topic; 5] = [
        Topic::ProductCreated,
        Topic::ProductDeleted,
        Topic::UserCreated,
        Topic::PaymentSuccessful,
        Topic::OrderCreated,
    ];

    /// Wire name of the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ProductCreated => "product.created",
            Topic::ProductDeleted => "product.deleted",
            Topic::UserCreated => "user.created",
            Topic::PaymentSuccessful => "payment.successful",
            Topic::OrderCreated => "order.created",
        }
    }

    /// Service that owns the payload schema of this topic.
    pub fn producer(&self) -> Service {
        match self {
            Topic::ProductCreated | Topic::ProductDeleted => Service::Catalog,
            Topic::UserCreated => Service::Auth,
            Topic::PaymentSuccessful => Service::Payment,
            Topic::OrderCreated => Service::Order,
        }
    }

    /// Name of the dead-letter topic for this topic.
    pub fn dead_letter(&self) -> String {
        format!("{}{}", self.as_str(), DEAD_LETTER_SUFFIX)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = UnknownTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| UnknownTopic(s.to_string()))
    }
}

/// Services participating in the storefront.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    /// Product catalog
    Catalog,
    /// Order management
    Order,
    /// Payment processing
    Payment,
    /// Email and other notifications
    Notification,
    /// Account management
    Auth,
}

impl Service {
    /// Lowercase service name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Catalog => "catalog",
            Service::Order => "order",
            Service::Payment => "payment",
            Service::Notification => "notification",
            Service::Auth => "auth",
        }
    }
}

/// Event envelope.
///
/// Events are transient: the bus never stores them beyond what the backing
/// transport retains. Consumers persist whatever they derive from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID
    pub id: Uuid,

    /// Topic the event is published on
    pub topic: Topic,

    /// Producing service, absent for events decoded from a bare payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Service>,

    /// When the producer created the event
    pub occurred_at: DateTime<Utc>,

    /// Vocabulary version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Partition key; events sharing a key keep their relative order on the log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Correlation ID for tracing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Topic-specific payload
    pub payload: serde_json::Value,

    /// Additional metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_version() -> u32 {
    VOCABULARY_VERSION
}

impl Event {
    /// Create a new event.
    ///
    /// # Arguments
    ///
    /// * `topic` - The topic to publish on
    /// * `source` - The producing service
    /// * `payload` - The event payload
    pub fn new(topic: Topic, source: Service, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            topic,
            source: Some(source),
            occurred_at: Utc::now(),
            version: VOCABULARY_VERSION,
            key: None,
            correlation_id: None,
            payload,
            metadata: HashMap::new(),
        }
    }

    /// Wrap a payload that arrived without an envelope.
    pub fn from_bare(topic: Topic, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            topic,
            source: None,
            occurred_at: Utc::now(),
            version: VOCABULARY_VERSION,
            key: None,
            correlation_id: None,
            payload,
            metadata: HashMap::new(),
        }
    }

    /// Interpret a JSON document delivered on `topic`.
    ///
    /// A full envelope is used as-is, re-homed onto the delivering topic if it
    /// names a different one. An object whose only field is `value` is
    /// unwrapped first. Anything else is treated as a bare payload.
    pub fn from_json(topic: Topic, value: serde_json::Value) -> Self {
        let value = match value {
            serde_json::Value::Object(mut map) if map.len() == 1 && map.contains_key("value") => {
                map.remove("value").unwrap_or(serde_json::Value::Null)
            }
            other => other,
        };
        match Event::deserialize(&value) {
            Ok(mut event) => {
                if event.topic != topic {
                    tracing::warn!(
                        envelope_topic = %event.topic,
                        delivered_topic = %topic,
                        event_id = %event.id,
                        "Envelope topic differs from delivery topic"
                    );
                    event.topic = topic;
                }
                event
            }
            Err(_) => Event::from_bare(topic, value),
        }
    }

    /// Set the partition key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set correlation ID.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Add metadata.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Key used to place the event on a log partition.
    pub fn partition_key(&self) -> String {
        self.key.clone().unwrap_or_else(|| self.id.to_string())
    }

    /// Parse the payload into a specific type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_names_round_trip() {
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>(), Ok(topic));
        }
        assert_eq!(
            "order.shipped".parse::<Topic>(),
            Err(UnknownTopic("order.shipped".to_string()))
        );
    }

    #[test]
    fn test_topic_serializes_as_wire_name() {
        let value = serde_json::to_value(Topic::PaymentSuccessful).unwrap();
        assert_eq!(value, json!("payment.successful"));
        assert_eq!(Topic::OrderCreated.dead_letter(), "order.created.dlq");
    }

    #[test]
    fn test_event_creation() {
        let event = Event::new(
            Topic::UserCreated,
            Service::Auth,
            json!({"email": "a@example.com"}),
        )
        .with_key("user-1")
        .with_correlation_id("req-9");

        assert_eq!(event.topic, Topic::UserCreated);
        assert_eq!(event.source, Some(Service::Auth));
        assert_eq!(event.version, VOCABULARY_VERSION);
        assert_eq!(event.partition_key(), "user-1");
        assert_eq!(event.correlation_id.as_deref(), Some("req-9"));
    }

    #[test]
    fn test_from_json_accepts_envelope() {
        let original = Event::new(Topic::OrderCreated, Service::Order, json!({"orderId": "o1"}));
        let value = serde_json::to_value(&original).unwrap();

        let decoded = Event::from_json(Topic::OrderCreated, value);
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_from_json_wraps_bare_payload() {
        let decoded = Event::from_json(
            Topic::PaymentSuccessful,
            json!({"orderRef": "abc123", "amount": 5000}),
        );

        assert_eq!(decoded.topic, Topic::PaymentSuccessful);
        assert!(decoded.source.is_none());
        assert_eq!(decoded.payload["orderRef"], "abc123");
    }

    #[test]
    fn test_from_json_unwraps_lone_value_field() {
        let inner = Event::new(Topic::UserCreated, Service::Auth, json!({"username": "ada"}));
        let wrapped = json!({ "value": serde_json::to_value(&inner).unwrap() });
        let event = Event::from_json(Topic::UserCreated, wrapped);
        assert_eq!(event.id, inner.id);
        assert_eq!(event.payload["username"], "ada");

        let bare = Event::from_json(Topic::UserCreated, json!({"value": {"username": "bo"}}));
        assert!(bare.source.is_none());
        assert_eq!(bare.payload, json!({"username": "bo"}));

        // `value` next to other fields is ordinary payload
        let payload = json!({"value": 3, "unit": "kg"});
        let event = Event::from_json(Topic::ProductCreated, payload.clone());
        assert_eq!(event.payload, payload);
    }

    #[test]
    fn test_from_json_rehomes_mismatched_topic() {
        let original = Event::new(Topic::UserCreated, Service::Auth, json!({}));
        let value = serde_json::to_value(&original).unwrap();

        let decoded = Event::from_json(Topic::OrderCreated, value);
        assert_eq!(decoded.topic, Topic::OrderCreated);
        assert_eq!(decoded.id, original.id);
    }

    #[test]
    fn test_partition_key_defaults_to_event_id() {
        let event = Event::new(Topic::ProductDeleted, Service::Catalog, json!("p-1"));
        assert_eq!(event.partition_key(), event.id.to_string());
    }
}
