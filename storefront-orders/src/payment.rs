//! `payment.successful` payload.
//!
//! The payment service owns this schema. Field names are camelCase; the
//! payment reference is accepted under any of the names the provider
//! integrations have used.

use crate::order::{IdempotencyKey, LineItem, Order, OrderId, OrderStatus, ShippingAddress};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Currency assumed when the payment omits one.
pub const DEFAULT_CURRENCY: &str = "usd";

/// Why a payment payload cannot become an order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentValidationError {
    /// Missing or blank payment reference
    #[error("payment reference is empty")]
    EmptyReference,

    /// Missing or blank buyer
    #[error("user id is empty")]
    EmptyUserId,

    /// Charged amount below zero
    #[error("amount must not be negative, got {0}")]
    NegativeAmount(i64),
}

/// Payload of `payment.successful`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSucceeded {
    /// Unique payment reference; the order's idempotency key
    #[serde(alias = "paymentId", alias = "sessionId")]
    pub order_ref: String,

    /// Buyer
    pub user_id: String,

    /// Buyer email
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Amount charged in minor units
    pub amount: i64,

    /// ISO currency code
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Purchased products
    #[serde(default, alias = "lineItems")]
    pub items: Vec<LineItem>,

    /// Delivery address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_address: Option<ShippingAddress>,

    /// Payment outcome reported by the provider
    #[serde(default)]
    pub status: OrderStatus,
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

impl PaymentSucceeded {
    /// Check the fields an order cannot do without.
    pub fn validate(&self) -> Result<(), PaymentValidationError> {
        if self.order_ref.trim().is_empty() {
            return Err(PaymentValidationError::EmptyReference);
        }
        if self.user_id.trim().is_empty() {
            return Err(PaymentValidationError::EmptyUserId);
        }
        if self.amount < 0 {
            return Err(PaymentValidationError::NegativeAmount(self.amount));
        }
        Ok(())
    }

    /// Idempotency key carried by this payment.
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::new(self.order_ref.trim())
    }

    /// Map the payment onto a new order.
    pub fn to_order(&self) -> Order {
        let key = self.idempotency_key();
        Order {
            id: OrderId::for_key(&key),
            idempotency_key: key,
            user_id: self.user_id.trim().to_string(),
            email: self.email.clone().filter(|email| !email.trim().is_empty()),
            amount: self.amount,
            currency: self.currency.to_ascii_lowercase(),
            status: self.status,
            line_items: self.items.clone(),
            shipping_address: self.shipping_address.clone(),
            created_at: Utc::now(),
            announced: false,
        }
    }
}
