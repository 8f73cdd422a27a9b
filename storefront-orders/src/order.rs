//! Order domain models
//!
//! An order is created exactly once per successful payment. The idempotency
//! key comes from the payment's own reference, and the order id is derived
//! from the same reference so a redelivered payment maps onto the same order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of every order id.
pub const ORDER_ID_PREFIX: &str = "ord_";

/// Identifier of the payment that triggered an order.
///
/// Two deliveries of the same payment event carry the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Key for a payment reference.
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// The payment reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Order identifier, `ord_<payment reference>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    /// Derive the order id from its idempotency key.
    ///
    /// # Examples
    ///
    /// ```
    /// use storefront_orders::{IdempotencyKey, OrderId};
    ///
    /// let id = OrderId::for_key(&IdempotencyKey::new("abc123"));
    /// assert_eq!(id.as_str(), "ord_abc123");
    /// ```
    pub fn for_key(key: &IdempotencyKey) -> Self {
        Self(format!("{ORDER_ID_PREFIX}{}", key.as_str()))
    }

    /// The id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payment outcome recorded on the order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Payment captured
    #[default]
    Success,
    /// Payment reported as failed by the provider
    Failed,
}

impl OrderStatus {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Success => "success",
            OrderStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One purchased product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    /// Catalog product id, when the payment provider passed it through
    #[serde(default, alias = "id", skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,

    /// Product name
    pub name: String,

    /// Units bought
    #[serde(default = "default_quantity")]
    pub quantity: u32,

    /// Unit price in minor units
    #[serde(default)]
    pub price: i64,
}

fn default_quantity() -> u32 {
    1
}

impl LineItem {
    /// Quantity times unit price.
    pub fn subtotal(&self) -> i64 {
        self.price.saturating_mul(i64::from(self.quantity))
    }
}

/// Where the order ships to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShippingAddress {
    /// Recipient name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// First address line
    pub line1: String,
    /// Second address line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line2: Option<String>,
    /// City
    pub city: String,
    /// State or region
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Postal code
    pub postal_code: String,
    /// ISO country code
    pub country: String,
}

/// A persisted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Order id derived from the payment reference
    pub id: OrderId,

    /// Payment reference the order was created from
    pub idempotency_key: IdempotencyKey,

    /// Buyer
    pub user_id: String,

    /// Buyer email for notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Amount charged in minor units
    pub amount: i64,

    /// ISO currency code, lowercase
    pub currency: String,

    /// Payment outcome
    pub status: OrderStatus,

    /// Purchased products
    #[serde(default)]
    pub line_items: Vec<LineItem>,

    /// Delivery address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_address: Option<ShippingAddress>,

    /// When the order was first created
    pub created_at: DateTime<Utc>,

    /// Whether `order.created` has been accepted by the bus
    #[serde(default)]
    pub announced: bool,
}

impl Order {
    /// Number of units across all line items.
    pub fn item_count(&self) -> u32 {
        self.line_items
            .iter()
            .fold(0u32, |count, item| count.saturating_add(item.quantity))
    }

    /// Sum of line item subtotals.
    ///
    /// May differ from `amount` when the provider added tax or shipping.
    pub fn items_total(&self) -> i64 {
        self.line_items
            .iter()
            .fold(0i64, |total, item| total.saturating_add(item.subtotal()))
    }
}

/// Order counts for one calendar month (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlySummary {
    /// Calendar year
    pub year: i32,
    /// Month, 1 to 12
    pub month: u32,
    /// Orders created in the month
    pub total: u64,
    /// Orders whose payment succeeded
    pub successful: u64,
}

impl MonthlySummary {
    /// Empty summary for a month.
    pub fn empty(year: i32, month: u32) -> Self {
        Self {
            year,
            month,
            total: 0,
            successful: 0,
        }
    }

    /// English month name, e.g. `"April"`.
    pub fn month_name(&self) -> &'static str {
        const NAMES: [&str; 12] = [
            "January",
            "February",
            "March",
            "April",
            "May",
            "June",
            "July",
            "August",
            "September",
            "October",
            "November",
            "December",
        ];
        NAMES
            .get(self.month.saturating_sub(1) as usize)
            .copied()
            .unwrap_or("Unknown")
    }
}
