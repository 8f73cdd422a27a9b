//! # Storefront Orders
//!
//! Order service event handling: every `payment.successful` delivery becomes
//! exactly one order, however often the transport redelivers it.
//!
//! - [`PaymentSucceeded`]: inbound payment payload
//! - [`Order`]: persisted order, keyed by the payment reference
//! - [`OrderStore`]: persistence with atomic create-if-absent
//! - [`OrderCreationWorkflow`]: dedup, persist, announce `order.created`
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storefront_events::{Topic, TopicRouter};
//! use storefront_orders::{MemoryOrderStore, OrderCreationHandler, OrderCreationWorkflow};
//!
//! # fn router() -> Result<TopicRouter, storefront_events::TransportError> {
//! let workflow = Arc::new(OrderCreationWorkflow::new(Arc::new(MemoryOrderStore::new())));
//! TopicRouter::builder()
//!     .route(Topic::PaymentSuccessful, Arc::new(OrderCreationHandler::new(workflow)))
//!     .build()
//! # }
//! ```

pub mod order;
pub mod payment;
pub mod store;
pub mod workflow;

pub use order::{IdempotencyKey, LineItem, Order, OrderId, OrderStatus, ShippingAddress};
pub use payment::{PaymentSucceeded, PaymentValidationError};
pub use store::{CreateOutcome, MemoryOrderStore, OrderStore, StoreError};
pub use workflow::{OrderCreationHandler, OrderCreationWorkflow, WorkflowError};
