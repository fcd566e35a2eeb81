//! Atomic scripts evaluated inside the store actor.
//!
//! Two scripts exist, and both are the load-bearing synchronization points of
//! the pipeline:
//!
//! - [`admission`]: stock check, per-user dedup and enqueue in one
//!   indivisible step. Once it returns [`AdmissionCode::Accepted`], the unit
//!   is reserved no matter what happens to the asynchronous materialization.
//! - [`compare_and_delete`]: owner-checked lock release for
//!   [`DistributedMutex`](crate::lock::DistributedMutex).

use crate::kv::ScriptCtx;
use flashsale_core::error::StoreError;
use flashsale_core::types::{OrderId, QueueMessage, UserId, VoucherId};

/// Key prefix of a voucher's remaining-stock counter.
pub const STOCK_KEY_PREFIX: &str = "seckill:stock:";
/// Key prefix of a voucher's admitted-user set.
pub const ADMITTED_KEY_PREFIX: &str = "seckill:order:";
/// Stream carrying accepted-but-not-yet-persisted orders.
pub const ORDER_STREAM: &str = "stream.orders";

/// Remaining-stock key for a voucher.
#[must_use]
pub fn stock_key(voucher_id: VoucherId) -> String {
    format!("{STOCK_KEY_PREFIX}{voucher_id}")
}

/// Admitted-user set key for a voucher.
#[must_use]
pub fn admitted_key(voucher_id: VoucherId) -> String {
    format!("{ADMITTED_KEY_PREFIX}{voucher_id}")
}

/// Wire-level admission result.
///
/// The integer codes are part of the script interface: 0 accepted, 1 out of
/// stock, 2 duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionCode {
    /// Code 0: a unit was reserved and the order message enqueued.
    Accepted,
    /// Code 1: the remaining-stock counter is exhausted.
    OutOfStock,
    /// Code 2: this user already holds a unit of this voucher.
    Duplicate,
}

impl AdmissionCode {
    /// The integer wire code.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Accepted => 0,
            Self::OutOfStock => 1,
            Self::Duplicate => 2,
        }
    }
}

/// The admission script: stock check, dedup, reserve and enqueue.
///
/// Evaluated via [`AtomicStore::eval`](crate::kv::AtomicStore::eval), so the
/// three reads/writes and the stream append are one indivisible step relative
/// to every concurrent admission attempt:
///
/// 1. remaining stock ≤ 0 (or the record was never warmed) → [`AdmissionCode::OutOfStock`]
/// 2. user already in the admitted set → [`AdmissionCode::Duplicate`]
/// 3. otherwise decrement stock, add the user, append
///    `{id, userId, voucherId}` to [`ORDER_STREAM`] → [`AdmissionCode::Accepted`]
///
/// # Errors
///
/// Only on a corrupted key space ([`StoreError::WrongType`] /
/// [`StoreError::NotAnInteger`]); never under normal operation.
pub fn admission(
    ctx: &mut ScriptCtx<'_>,
    voucher_id: VoucherId,
    user_id: UserId,
    order_id: OrderId,
) -> Result<AdmissionCode, StoreError> {
    let stock_key = stock_key(voucher_id);
    let admitted_key = admitted_key(voucher_id);

    let stock: i64 = match ctx.get(&stock_key)? {
        None => 0,
        Some(raw) => raw
            .parse()
            .map_err(|_| StoreError::NotAnInteger { key: stock_key.clone() })?,
    };
    if stock <= 0 {
        return Ok(AdmissionCode::OutOfStock);
    }
    if ctx.sismember(&admitted_key, &user_id.to_string())? {
        return Ok(AdmissionCode::Duplicate);
    }

    ctx.incr_by(&stock_key, -1)?;
    ctx.sadd(&admitted_key, user_id.to_string())?;
    let message = QueueMessage { order_id, user_id, voucher_id };
    ctx.xadd(ORDER_STREAM, message.to_fields());
    Ok(AdmissionCode::Accepted)
}

/// Owner-checked lock release: delete `key` only if it still holds `token`.
///
/// The get-and-compare and the delete happen in the same script, closing the
/// race where a TTL expiry plus a new holder's lock would be deleted by a
/// stale unlocker. Returns `true` if the lock was released.
///
/// # Errors
///
/// Only on a corrupted key space ([`StoreError::WrongType`]).
pub fn compare_and_delete(
    ctx: &mut ScriptCtx<'_>,
    key: &str,
    token: &str,
) -> Result<bool, StoreError> {
    if ctx.get(key)?.as_deref() == Some(token) {
        ctx.del(key);
        Ok(true)
    } else {
        Ok(false)
    }
}
