//! In-memory implementation of the durable voucher/order store.
//!
//! One `tokio::sync::Mutex` guards both tables, so every `create_order` call
//! runs its re-check, decrement and insert as one indivisible step. That is
//! exactly the transaction contract the trait demands, which makes this
//! double faithful enough to drive the worker in integration tests.

use chrono::{DateTime, Utc};
use flashsale_core::types::{Order, UserId, Voucher, VoucherId};
use flashsale_core::voucher_store::{MaterializeOutcome, VoucherStore, VoucherStoreError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Tables {
    vouchers: HashMap<VoucherId, Voucher>,
    orders: Vec<Order>,
}

/// Durable store backed by in-process tables.
///
/// Cloning shares the underlying tables, matching how every component holds
/// a handle to the same database.
#[derive(Debug, Clone, Default)]
pub struct InMemoryVoucherStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryVoucherStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a voucher row, replacing any existing row with the same id.
    pub async fn insert_voucher(&self, voucher: Voucher) {
        self.tables.lock().await.vouchers.insert(voucher.id, voucher);
    }

    /// Number of order rows currently materialized.
    pub async fn order_count(&self) -> usize {
        self.tables.lock().await.orders.len()
    }

    /// Snapshot of all order rows, in insertion order.
    pub async fn orders(&self) -> Vec<Order> {
        self.tables.lock().await.orders.clone()
    }

    /// Remaining durable stock for a voucher, if it exists.
    pub async fn stock(&self, id: VoucherId) -> Option<u32> {
        self.tables.lock().await.vouchers.get(&id).map(|v| v.stock)
    }
}

impl VoucherStore for InMemoryVoucherStore {
    fn voucher(
        &self,
        id: VoucherId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Voucher>, VoucherStoreError>> + Send + '_>> {
        Box::pin(async move { Ok(self.tables.lock().await.vouchers.get(&id).cloned()) })
    }

    fn create_order(
        &self,
        order: &Order,
    ) -> Pin<Box<dyn Future<Output = Result<MaterializeOutcome, VoucherStoreError>> + Send + '_>>
    {
        let order = order.clone();
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            if tables
                .orders
                .iter()
                .any(|o| o.user_id == order.user_id && o.voucher_id == order.voucher_id)
            {
                return Ok(MaterializeOutcome::DuplicateOrder);
            }
            let Some(voucher) = tables.vouchers.get_mut(&order.voucher_id) else {
                // No row to decrement behaves like an exhausted one.
                return Ok(MaterializeOutcome::StockConflict);
            };
            if voucher.stock == 0 {
                return Ok(MaterializeOutcome::StockConflict);
            }
            voucher.stock -= 1;
            tables.orders.push(order);
            Ok(MaterializeOutcome::Created)
        })
    }

    fn order_exists(
        &self,
        user_id: UserId,
        voucher_id: VoucherId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, VoucherStoreError>> + Send + '_>> {
        Box::pin(async move {
            Ok(self
                .tables
                .lock()
                .await
                .orders
                .iter()
                .any(|o| o.user_id == user_id && o.voucher_id == voucher_id))
        })
    }
}

/// Build an order row for tests.
#[must_use]
pub fn order(
    id: i64,
    user_id: u64,
    voucher_id: u64,
    create_time: DateTime<Utc>,
) -> Order {
    Order {
        id: id.into(),
        user_id: user_id.into(),
        voucher_id: voucher_id.into(),
        create_time,
    }
}
