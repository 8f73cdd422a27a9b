//! # Storefront Notifications
//!
//! Customer emails driven by storefront events:
//!
//! - `user.created` sends a welcome email ([`WelcomeEmailHandler`])
//! - `order.created` sends an order confirmation ([`OrderConfirmationHandler`])
//!
//! Delivery goes through the [`Mailer`] trait. [`ConsoleMailer`] logs
//! instead of sending.

pub mod handlers;
pub mod mailer;

pub use handlers::{
    format_amount, OrderConfirmationHandler, OrderCreated, UserCreated, WelcomeEmailHandler,
    ORDER_SUBJECT, WELCOME_SUBJECT,
};
pub use mailer::{
    ConsoleMailer, Email, MailError, Mailer, MemoryMailer, SmtpConfig, SmtpMailer, DEFAULT_FROM,
    DEFAULT_SMTP_PORT,
};

use std::sync::Arc;
use storefront_events::{Topic, TopicRouter, TransportResult};

/// Router with every notification topic bound to `mailer`.
pub fn notification_router(mailer: Arc<dyn Mailer>) -> TransportResult<TopicRouter> {
    TopicRouter::builder()
        .route(Topic::UserCreated, Arc::new(WelcomeEmailHandler::new(mailer.clone())))
        .route(Topic::OrderCreated, Arc::new(OrderConfirmationHandler::new(mailer)))
        .build()
}
