//! Notification handlers.
//!
//! Deliveries are at-least-once, so a redelivered event may send its email
//! again. Events without a recipient are acknowledged and skipped.

use crate::mailer::{Email, MailError, Mailer};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use storefront_events::{Event, EventHandler, HandlerError};
use tracing::{debug, info};

/// Subject of the welcome email.
pub const WELCOME_SUBJECT: &str = "Welcome to Storefront";

/// Subject of the order confirmation.
pub const ORDER_SUBJECT: &str = "Order has been created";

/// `user.created` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct UserCreated {
    /// Account email
    #[serde(default)]
    pub email: Option<String>,
    /// Display name
    #[serde(default)]
    pub username: Option<String>,
}

/// `order.created` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    /// Order id
    #[serde(default)]
    pub order_id: Option<String>,
    /// Buyer email
    #[serde(default)]
    pub email: Option<String>,
    /// Amount charged in minor units
    pub amount: i64,
    /// Payment outcome
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "success".to_string()
}

/// Render minor units as a major-unit amount with two decimals.
pub fn format_amount(minor: i64) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let minor = minor.unsigned_abs();
    format!("{sign}{}.{:02}", minor / 100, minor % 100)
}

fn recipient(email: Option<&str>) -> Option<&str> {
    email.map(str::trim).filter(|email| !email.is_empty())
}

async fn deliver(mailer: &dyn Mailer, email: Email) -> Result<(), HandlerError> {
    mailer.send(&email).await.map_err(|e| match e {
        MailError::InvalidRecipient(_) => HandlerError::InvalidPayload(e.to_string()),
        MailError::Delivery(_) | MailError::Configuration(_) => {
            HandlerError::Downstream(e.to_string())
        }
    })?;
    info!(to = %email.to, subject = %email.subject, "Notification sent");
    Ok(())
}

/// Sends the welcome email for `user.created`.
pub struct WelcomeEmailHandler {
    mailer: Arc<dyn Mailer>,
}

impl WelcomeEmailHandler {
    /// Create a handler sending through `mailer`.
    ///
    /// Each `user.created` with a usable email yields one message with
    /// [`WELCOME_SUBJECT`]. A mail server failure surfaces as
    /// [`HandlerError::Downstream`] so the event is redelivered.
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl EventHandler for WelcomeEmailHandler {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let user: UserCreated = event.parse_payload()?;
        let Some(to) = recipient(user.email.as_deref()) else {
            debug!(event_id = %event.id, "user.created without email; skipping");
            return Ok(());
        };

        let name = user.username.as_deref().unwrap_or("there");
        let email = Email::new(
            to,
            WELCOME_SUBJECT,
            format!("Welcome {name}. Your account has been created!"),
        )
        .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;
        deliver(self.mailer.as_ref(), email).await
    }
}

/// Sends the order confirmation for `order.created`.
pub struct OrderConfirmationHandler {
    mailer: Arc<dyn Mailer>,
}

impl OrderConfirmationHandler {
    /// Create a handler sending through `mailer`.
    ///
    /// The confirmation carries the amount in major units and the payment
    /// status. Orders without a buyer email are acknowledged without mail.
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl EventHandler for OrderConfirmationHandler {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let order: OrderCreated = event.parse_payload()?;
        let Some(to) = recipient(order.email.as_deref()) else {
            debug!(
                event_id = %event.id,
                order_id = order.order_id.as_deref().unwrap_or_default(),
                "order.created without email; skipping"
            );
            return Ok(());
        };

        let email = Email::new(
            to,
            ORDER_SUBJECT,
            format!(
                "Hello! Your order: Amount: {}, Status: {}",
                format_amount(order.amount),
                order.status
            ),
        )
        .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;
        deliver(self.mailer.as_ref(), email).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::MemoryMailer;
    use serde_json::json;
    use storefront_events::{Service, Topic};

    fn setup() -> (Arc<MemoryMailer>, WelcomeEmailHandler, OrderConfirmationHandler) {
        let mailer = Arc::new(MemoryMailer::new());
        (
            mailer.clone(),
            WelcomeEmailHandler::new(mailer.clone()),
            OrderConfirmationHandler::new(mailer),
        )
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(5000), "50.00");
        assert_eq!(format_amount(1999), "19.99");
        assert_eq!(format_amount(5), "0.05");
        assert_eq!(format_amount(-250), "-2.50");
    }

    #[tokio::test]
    async fn test_welcome_email() {
        let (mailer, welcome, _) = setup();
        let event = Event::new(
            Topic::UserCreated,
            Service::Auth,
            json!({"email": "ada@example.com", "username": "ada"}),
        );

        welcome.handle(&event).await.unwrap();

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ada@example.com");
        assert_eq!(sent[0].subject, WELCOME_SUBJECT);
        assert_eq!(sent[0].text, "Welcome ada. Your account has been created!");
    }

    #[tokio::test]
    async fn test_order_confirmation() {
        let (mailer, _, confirmation) = setup();
        let event = Event::new(
            Topic::OrderCreated,
            Service::Order,
            json!({"orderId": "ord_abc123", "email": "ada@example.com", "amount": 5000, "status": "success"}),
        );

        confirmation.handle(&event).await.unwrap();

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, ORDER_SUBJECT);
        assert_eq!(sent[0].text, "Hello! Your order: Amount: 50.00, Status: success");
    }

    #[tokio::test]
    async fn test_missing_email_is_skipped() {
        let (mailer, welcome, confirmation) = setup();

        welcome
            .handle(&Event::from_bare(Topic::UserCreated, json!({"username": "ghost"})))
            .await
            .unwrap();
        confirmation
            .handle(&Event::from_bare(
                Topic::OrderCreated,
                json!({"email": "  ", "amount": 100}),
            ))
            .await
            .unwrap();

        assert!(mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_classified() {
        let (mailer, welcome, confirmation) = setup();

        let no_amount = Event::from_bare(Topic::OrderCreated, json!({"email": "ada@example.com"}));
        assert!(matches!(
            confirmation.handle(&no_amount).await,
            Err(HandlerError::InvalidPayload(_))
        ));

        let bad_address = Event::from_bare(Topic::UserCreated, json!({"email": "nobody"}));
        assert!(matches!(
            welcome.handle(&bad_address).await,
            Err(HandlerError::InvalidPayload(_))
        ));

        mailer.set_failing(true);
        let valid = Event::from_bare(Topic::UserCreated, json!({"email": "ada@example.com"}));
        assert!(matches!(
            welcome.handle(&valid).await,
            Err(HandlerError::Downstream(_))
        ));
    }
}
