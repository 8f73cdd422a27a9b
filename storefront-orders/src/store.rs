//! Order persistence.
//!
//! The store is the correctness backstop for duplicate delivery: `insert`
//! must be an atomic create-if-absent on the idempotency key (a unique index
//! in a database). Deduplication never relies on remembering which messages
//! were seen, so it holds across restarts and across consumer instances.

use crate::order::{IdempotencyKey, MonthlySummary, Order, OrderStatus};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An order with this key already exists
    #[error("order already exists for key {0}")]
    Conflict(IdempotencyKey),

    /// Backing store failed or is unreachable
    #[error("order store unavailable: {0}")]
    Unavailable(String),

    /// No order exists for this key
    #[error("no order for key {0}")]
    NotFound(IdempotencyKey),
}

/// Result of [`OrderStore::find_or_create`].
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// This call created the order
    Created(Order),
    /// The order already existed; returned unchanged
    Existing(Order),
}

impl CreateOutcome {
    /// The order, whichever way it was obtained.
    pub fn order(&self) -> &Order {
        match self {
            CreateOutcome::Created(order) | CreateOutcome::Existing(order) => order,
        }
    }

    /// Consume into the order.
    pub fn into_order(self) -> Order {
        match self {
            CreateOutcome::Created(order) | CreateOutcome::Existing(order) => order,
        }
    }

    pub(crate) fn order_mut(&mut self) -> &mut Order {
        match self {
            CreateOutcome::Created(order) | CreateOutcome::Existing(order) => order,
        }
    }

    /// Whether this call created the order.
    pub fn was_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Order persistence contract.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Order created for `key`, if any.
    async fn find_by_key(&self, key: &IdempotencyKey) -> Result<Option<Order>, StoreError>;

    /// Atomically insert `order` unless its key is taken.
    ///
    /// Fails with [`StoreError::Conflict`] when the key already exists.
    async fn insert(&self, order: Order) -> Result<(), StoreError>;

    /// Orders of one buyer, newest first.
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Order>, StoreError>;

    /// Most recent orders, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<Order>, StoreError>;

    /// Record that `order.created` for `key` was accepted by the bus.
    async fn mark_announced(&self, key: &IdempotencyKey) -> Result<(), StoreError>;

    /// Per-month order counts for the `months` calendar months ending with
    /// the month of `now`, oldest first. Months without orders are zero.
    async fn monthly_summary(
        &self,
        now: DateTime<Utc>,
        months: u32,
    ) -> Result<Vec<MonthlySummary>, StoreError>;

    /// Return the order for `key`, creating it from `order` if absent.
    ///
    /// Losing an insert race to a concurrent delivery is not an error: the
    /// winner's order is returned as [`CreateOutcome::Existing`].
    async fn find_or_create(
        &self,
        key: &IdempotencyKey,
        order: Order,
    ) -> Result<CreateOutcome, StoreError> {
        if let Some(existing) = self.find_by_key(key).await? {
            return Ok(CreateOutcome::Existing(existing));
        }

        match self.insert(order.clone()).await {
            Ok(()) => Ok(CreateOutcome::Created(order)),
            Err(StoreError::Conflict(_)) => {
                tracing::debug!(idempotency_key = %key, "Lost create race to concurrent delivery");
                self.find_by_key(key)
                    .await?
                    .map(CreateOutcome::Existing)
                    .ok_or_else(|| {
                        StoreError::Unavailable(format!(
                            "conflict on {key} but no order is readable"
                        ))
                    })
            }
            Err(e) => Err(e),
        }
    }
}

/// In-memory order store.
#[derive(Debug, Default)]
pub struct MemoryOrderStore {
    orders: RwLock<HashMap<IdempotencyKey, Order>>,
}

impl MemoryOrderStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored orders.
    pub async fn len(&self) -> usize {
        self.orders.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.orders.read().await.is_empty()
    }
}

/// `(year, month)` that lies `back` months before `now`'s month.
fn month_before(now: DateTime<Utc>, back: u32) -> (i32, u32) {
    let index = now.year() * 12 + now.month0() as i32 - back as i32;
    (index.div_euclid(12), index.rem_euclid(12) as u32 + 1)
}

/// Bucket `orders` into zero-filled calendar months ending at `now`.
///
/// Orders created after `now` or before the first bucket are ignored.
pub fn summarize_by_month<'a>(
    orders: impl IntoIterator<Item = &'a Order>,
    now: DateTime<Utc>,
    months: u32,
) -> Vec<MonthlySummary> {
    let mut summary: Vec<MonthlySummary> = (0..months)
        .rev()
        .map(|back| {
            let (year, month) = month_before(now, back);
            MonthlySummary::empty(year, month)
        })
        .collect();
    let Some(first) = summary.first() else {
        return summary;
    };
    let Some(window_start) = Utc
        .with_ymd_and_hms(first.year, first.month, 1, 0, 0, 0)
        .single()
    else {
        return summary;
    };

    for order in orders {
        if order.created_at < window_start || order.created_at > now {
            continue;
        }
        let (year, month) = (order.created_at.year(), order.created_at.month());
        if let Some(bucket) = summary
            .iter_mut()
            .find(|bucket| bucket.year == year && bucket.month == month)
        {
            bucket.total += 1;
            if order.status == OrderStatus::Success {
                bucket.successful += 1;
            }
        }
    }
    summary
}

fn newest_first(mut orders: Vec<Order>) -> Vec<Order> {
    orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.as_str().cmp(b.id.as_str())));
    orders
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn find_by_key(&self, key: &IdempotencyKey) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.read().await.get(key).cloned())
    }

    async fn insert(&self, order: Order) -> Result<(), StoreError> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.idempotency_key) {
            return Err(StoreError::Conflict(order.idempotency_key));
        }
        orders.insert(order.idempotency_key.clone(), order);
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Order>, StoreError> {
        let orders = self.orders.read().await;
        Ok(newest_first(
            orders
                .values()
                .filter(|order| order.user_id == user_id)
                .cloned()
                .collect(),
        ))
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Order>, StoreError> {
        let orders = self.orders.read().await;
        let mut recent = newest_first(orders.values().cloned().collect());
        recent.truncate(limit);
        Ok(recent)
    }

    async fn mark_announced(&self, key: &IdempotencyKey) -> Result<(), StoreError> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        order.announced = true;
        Ok(())
    }

    async fn monthly_summary(
        &self,
        now: DateTime<Utc>,
        months: u32,
    ) -> Result<Vec<MonthlySummary>, StoreError> {
        let orders = self.orders.read().await;
        Ok(summarize_by_month(orders.values(), now, months))
    }
}
