//! Order creation from `payment.successful`.
//!
//! A single order moves from *no record* to *created* and nowhere else.
//! Every delivery of a payment, however many times and in whatever order it
//! arrives, ends with exactly one order for its reference:
//!
//! 1. decode and validate the payment payload
//! 2. `find_or_create` on the payment's idempotency key
//! 3. publish `order.created` unless the stored order is already marked as
//!    announced, then mark it
//!
//! A persistence or publish failure is returned as an error so the transport
//! redelivers (relay) or retries and dead-letters (log) the payment. A
//! redelivery finds the stored order still unannounced and publishes again,
//! so the announcement is never lost.

use crate::order::Order;
use crate::payment::{PaymentSucceeded, PaymentValidationError};
use crate::store::{CreateOutcome, OrderStore, StoreError};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use storefront_events::{Event, EventHandler, HandlerError, Service, Topic, Transport};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Workflow errors.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Payload is not a usable payment
    #[error("invalid payment: {0}")]
    InvalidPayment(String),

    /// Order could not be persisted
    #[error(transparent)]
    Store(#[from] StoreError),

    /// `order.created` was not accepted by the bus
    #[error("failed to announce order {order_id}: {reason}")]
    Announce {
        /// Order that stays unannounced
        order_id: String,
        /// Transport failure
        reason: String,
    },
}

impl From<PaymentValidationError> for WorkflowError {
    fn from(e: PaymentValidationError) -> Self {
        WorkflowError::InvalidPayment(e.to_string())
    }
}

impl From<WorkflowError> for HandlerError {
    fn from(e: WorkflowError) -> Self {
        match e {
            WorkflowError::InvalidPayment(message) => HandlerError::InvalidPayload(message),
            e @ (WorkflowError::Store(_) | WorkflowError::Announce { .. }) => {
                HandlerError::Downstream(e.to_string())
            }
        }
    }
}

/// Turns successful payments into orders.
pub struct OrderCreationWorkflow {
    store: Arc<dyn OrderStore>,
    publisher: Option<Arc<dyn Transport>>,
}

impl OrderCreationWorkflow {
    /// Workflow persisting into `store`, without fan-out.
    pub fn new(store: Arc<dyn OrderStore>) -> Self {
        Self {
            store,
            publisher: None,
        }
    }

    /// Announce orders on `order.created` through `transport`.
    pub fn with_publisher(mut self, transport: Arc<dyn Transport>) -> Self {
        self.publisher = Some(transport);
        self
    }

    /// Order store in use.
    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.store
    }

    /// Create the order for `payment` unless it already exists.
    #[instrument(skip(self, payment), fields(order_ref = %payment.order_ref))]
    pub async fn handle_payment(
        &self,
        payment: &PaymentSucceeded,
    ) -> Result<CreateOutcome, WorkflowError> {
        payment.validate()?;

        let key = payment.idempotency_key();
        let mut outcome = self.store.find_or_create(&key, payment.to_order()).await?;

        match &outcome {
            CreateOutcome::Created(order) => {
                info!(
                    order_id = %order.id,
                    user_id = %order.user_id,
                    amount = order.amount,
                    "Order created"
                );
            }
            CreateOutcome::Existing(order) => {
                debug!(
                    order_id = %order.id,
                    announced = order.announced,
                    "Order already exists; duplicate delivery"
                );
            }
        }

        if self.announce(outcome.order()).await? {
            outcome.order_mut().announced = true;
        }
        Ok(outcome)
    }

    /// Decode a delivered event and run the workflow.
    pub async fn handle_event(&self, event: &Event) -> Result<CreateOutcome, WorkflowError> {
        let payment: PaymentSucceeded = event
            .parse_payload()
            .map_err(|e| WorkflowError::InvalidPayment(e.to_string()))?;
        self.handle_payment(&payment).await
    }

    /// Publish `order.created` if still due. Returns whether it was published.
    async fn announce(&self, order: &Order) -> Result<bool, WorkflowError> {
        let Some(publisher) = &self.publisher else {
            return Ok(false);
        };
        if order.announced {
            return Ok(false);
        }

        let event = Event::new(
            Topic::OrderCreated,
            Service::Order,
            json!({
                "orderId": order.id,
                "userId": order.user_id,
                "email": order.email,
                "amount": order.amount,
                "status": order.status,
            }),
        )
        .with_key(order.id.as_str())
        .with_correlation_id(order.idempotency_key.as_str());

        publisher.publish(event).await.map_err(|e| {
            warn!(order_id = %order.id, error = %e, "Failed to publish order.created");
            WorkflowError::Announce {
                order_id: order.id.to_string(),
                reason: e.to_string(),
            }
        })?;

        // A crash between publish and mark repeats the announcement on
        // redelivery; consumers of order.created are idempotent.
        self.store.mark_announced(&order.idempotency_key).await?;
        Ok(true)
    }
}

/// Routes `payment.successful` into the workflow.
pub struct OrderCreationHandler {
    workflow: Arc<OrderCreationWorkflow>,
}

impl OrderCreationHandler {
    /// Handler running `workflow` for every delivered payment.
    pub fn new(workflow: Arc<OrderCreationWorkflow>) -> Self {
        Self { workflow }
    }
}

#[async_trait]
impl EventHandler for OrderCreationHandler {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        self.workflow.handle_event(event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{IdempotencyKey, MonthlySummary};
    use crate::store::MemoryOrderStore;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;
    use storefront_events::{
        TopicRouter, TransportError, TransportMode, TransportResult, TransportStats,
    };

    /// Transport that records published events.
    #[derive(Default)]
    struct RecordingTransport {
        published: Mutex<Vec<Event>>,
        fail: bool,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn mode(&self) -> TransportMode {
            TransportMode::Log
        }

        async fn connect(&self) -> TransportResult<()> {
            Ok(())
        }

        async fn publish(&self, event: Event) -> TransportResult<()> {
            if self.fail {
                return Err(TransportError::PublishError {
                    topic: event.topic.to_string(),
                    reason: "broker down".to_string(),
                });
            }
            self.published.lock().unwrap().push(event);
            Ok(())
        }

        async fn subscribe(&self, _router: Arc<TopicRouter>) -> TransportResult<()> {
            Ok(())
        }

        async fn disconnect(&self) -> TransportResult<()> {
            Ok(())
        }

        fn stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    /// Store that is always down.
    struct DownStore;

    #[async_trait]
    impl OrderStore for DownStore {
        async fn find_by_key(&self, _key: &IdempotencyKey) -> Result<Option<Order>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn insert(&self, _order: Order) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn list_for_user(&self, _user_id: &str) -> Result<Vec<Order>, StoreError> {
            Ok(Vec::new())
        }

        async fn recent(&self, _limit: usize) -> Result<Vec<Order>, StoreError> {
            Ok(Vec::new())
        }

        async fn mark_announced(&self, _key: &IdempotencyKey) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn monthly_summary(
            &self,
            _now: DateTime<Utc>,
            _months: u32,
        ) -> Result<Vec<MonthlySummary>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn payment_event(reference: &str) -> Event {
        Event::new(
            Topic::PaymentSuccessful,
            Service::Payment,
            json!({
                "orderRef": reference,
                "userId": "u1",
                "email": "ada@example.com",
                "amount": 5000,
                "items": [{"name": "Lamp", "quantity": 1, "price": 5000}]
            }),
        )
    }

    #[tokio::test]
    async fn test_creates_order_and_announces_once() {
        let store = Arc::new(MemoryOrderStore::new());
        let transport = Arc::new(RecordingTransport::default());
        let workflow =
            OrderCreationWorkflow::new(store.clone()).with_publisher(transport.clone());

        let first = workflow.handle_event(&payment_event("abc123")).await.unwrap();
        let second = workflow.handle_event(&payment_event("abc123")).await.unwrap();

        assert!(first.was_created());
        assert!(first.order().announced);
        assert!(!second.was_created());
        assert_eq!(first.order().id.as_str(), "ord_abc123");
        assert_eq!(store.len().await, 1);

        let published = transport.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, Topic::OrderCreated);
        assert_eq!(published[0].payload["orderId"], "ord_abc123");
        assert_eq!(published[0].payload["email"], "ada@example.com");
        assert_eq!(published[0].payload["status"], "success");
        assert_eq!(published[0].key.as_deref(), Some("ord_abc123"));
    }

    #[tokio::test]
    async fn test_failed_announcement_is_retried_on_redelivery() {
        let store = Arc::new(MemoryOrderStore::new());
        let broken = Arc::new(RecordingTransport {
            fail: true,
            ..Default::default()
        });
        let working = Arc::new(RecordingTransport::default());
        let first_attempt = OrderCreationHandler::new(Arc::new(
            OrderCreationWorkflow::new(store.clone()).with_publisher(broken),
        ));
        let redelivery = OrderCreationHandler::new(Arc::new(
            OrderCreationWorkflow::new(store.clone()).with_publisher(working.clone()),
        ));

        assert!(matches!(
            first_attempt.handle(&payment_event("fan")).await,
            Err(HandlerError::Downstream(_))
        ));
        let stored = store.find_by_key(&IdempotencyKey::new("fan")).await.unwrap();
        assert!(!stored.unwrap().announced);

        redelivery.handle(&payment_event("fan")).await.unwrap();
        redelivery.handle(&payment_event("fan")).await.unwrap();

        assert_eq!(store.len().await, 1);
        let published = working.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload["orderId"], "ord_fan");
        drop(published);
        let stored = store.find_by_key(&IdempotencyKey::new("fan")).await.unwrap();
        assert!(stored.unwrap().announced);
    }

    #[tokio::test]
    async fn test_without_publisher_orders_stay_unannounced() {
        let store = Arc::new(MemoryOrderStore::new());
        let workflow = OrderCreationWorkflow::new(store.clone());

        let outcome = workflow.handle_event(&payment_event("quiet")).await.unwrap();

        assert!(outcome.was_created());
        assert!(!outcome.order().announced);
    }

    #[tokio::test]
    async fn test_invalid_payment_is_rejected() {
        let store = Arc::new(MemoryOrderStore::new());
        let workflow = OrderCreationWorkflow::new(store.clone());
        let handler = OrderCreationHandler::new(Arc::new(workflow));

        let negative = Event::new(
            Topic::PaymentSuccessful,
            Service::Payment,
            json!({"orderRef": "neg", "userId": "u1", "amount": -5}),
        );
        let garbage = Event::new(Topic::PaymentSuccessful, Service::Payment, json!({"foo": 1}));

        assert!(matches!(
            handler.handle(&negative).await,
            Err(HandlerError::InvalidPayload(_))
        ));
        assert!(matches!(
            handler.handle(&garbage).await,
            Err(HandlerError::InvalidPayload(_))
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_store_failure_is_surfaced() {
        let workflow = OrderCreationWorkflow::new(Arc::new(DownStore));
        let handler = OrderCreationHandler::new(Arc::new(workflow));

        assert!(matches!(
            handler.handle(&payment_event("lost")).await,
            Err(HandlerError::Downstream(_))
        ));
    }
}
