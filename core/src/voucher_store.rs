//! Durable store trait for vouchers and orders.
//!
//! The relational schema and its query layer are outside this workspace; this
//! trait is the interface the pipeline holds against them. The contract is a
//! transactional row store with optimistic-concurrency update: any backend
//! that can run "re-check, decrement where stock > 0, insert" as one
//! transaction can implement it.
//!
//! # Implementations
//!
//! - `InMemoryVoucherStore` (in `flashsale-testing`): the shipped
//!   implementation, one async mutex as the transaction boundary.
//! - A SQL-backed implementation would slot behind the same trait without
//!   touching the worker.
//!
//! # Dyn Compatibility
//!
//! Methods return explicit `Pin<Box<dyn Future>>` instead of `async fn` so
//! the trait can be held as `Arc<dyn VoucherStore>` by the admission service
//! and the worker.

use crate::types::{Order, UserId, Voucher, VoucherId};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by a durable store implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoucherStoreError {
    /// The backend could not be reached or the transaction could not commit.
    ///
    /// The worker leaves the message pending and retries; admission surfaces
    /// it as a transient failure.
    #[error("durable store unavailable: {0}")]
    Unavailable(String),
}

/// Result of one materialization transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeOutcome {
    /// The order row was inserted and the stock decremented.
    Created,

    /// An order for this `(user, voucher)` pair already exists.
    ///
    /// Expected under at-least-once delivery: replaying a message is a no-op
    /// and must not decrement stock again.
    DuplicateOrder,

    /// The optimistic decrement (`stock > 0`) matched zero rows.
    ///
    /// Admission had reserved a unit, so durable stock should never be
    /// exhausted here: this is the `MaterializationConflict` invariant
    /// violation. The worker logs it loudly and acknowledges the message;
    /// recovery is a manual-intervention concern.
    StockConflict,
}

/// Transactional row store for vouchers and orders.
///
/// # Invariants implementations must uphold
///
/// - `create_order` executes its three steps (uniqueness re-check, optimistic
///   stock decrement, order insert) inside one transaction with rollback on
///   error. No caller may ever observe the decrement without the insert.
/// - Voucher stock is never mutated except through `create_order`.
/// - At most one order row exists per `(user_id, voucher_id)`, even under
///   concurrent `create_order` calls for the same pair.
pub trait VoucherStore: Send + Sync {
    /// Load a voucher by id.
    ///
    /// # Errors
    ///
    /// Returns [`VoucherStoreError::Unavailable`] if the backend cannot be
    /// reached.
    fn voucher(
        &self,
        id: VoucherId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Voucher>, VoucherStoreError>> + Send + '_>>;

    /// Materialize an admitted order in one transaction.
    ///
    /// Re-checks that no order exists for the `(user, voucher)` pair,
    /// decrements the voucher's stock under the `stock > 0` predicate, and
    /// inserts the order row. Never fails on duplicates or exhausted stock;
    /// those are reported through [`MaterializeOutcome`] so the worker can
    /// distinguish "retry", "no-op" and "invariant violation".
    ///
    /// # Errors
    ///
    /// Returns [`VoucherStoreError::Unavailable`] if the transaction could
    /// not run; the caller must treat the attempt as not having happened.
    fn create_order(
        &self,
        order: &Order,
    ) -> Pin<Box<dyn Future<Output = Result<MaterializeOutcome, VoucherStoreError>> + Send + '_>>;

    /// Whether an order already exists for the pair.
    ///
    /// Read-only companion to the re-check inside `create_order`, used by the
    /// admission path's warm-up and by invariant assertions in tests.
    ///
    /// # Errors
    ///
    /// Returns [`VoucherStoreError::Unavailable`] if the backend cannot be
    /// reached.
    fn order_exists(
        &self,
        user_id: UserId,
        voucher_id: VoucherId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, VoucherStoreError>> + Send + '_>>;
}
