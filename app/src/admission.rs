//! Synchronous admission path.
//!
//! `seckill` is the hot path: one cached voucher read, a window check
//! against the clock, one id mint, one atomic script. The durable store is
//! never written here; an accepted request only reserves stock and enqueues
//! the order message, and the worker materializes it later.

use flashsale_core::environment::Clock;
use flashsale_core::error::AdmissionError;
use flashsale_core::types::{OrderId, UserId, Voucher, VoucherId};
use flashsale_core::voucher_store::VoucherStore;
use flashsale_store::cache::CacheError;
use flashsale_store::scripts::{self, AdmissionCode};
use flashsale_store::{AtomicStore, CacheClient, IdGenerator};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Cache prefix for the admission path's voucher reads (plain payloads).
const CACHE_VOUCHER: &str = "voucher";

/// Cache prefix for the detail read path (logical-expiry payloads).
///
/// Kept separate from [`CACHE_VOUCHER`]: the two strategies store different
/// wire shapes under their keys.
const CACHE_VOUCHER_DETAIL: &str = "voucher:detail";

/// Id sequence name for orders.
const ORDER_SEQUENCE: &str = "order";

/// The admission service.
///
/// Cheap to clone; every handle shares the same store, cache and generator.
#[derive(Clone)]
pub struct SeckillService {
    store: AtomicStore,
    cache: CacheClient,
    ids: IdGenerator,
    vouchers: Arc<dyn VoucherStore>,
    clock: Arc<dyn Clock>,
    voucher_ttl: Duration,
}

impl SeckillService {
    /// Assemble the service from its shared components.
    #[must_use]
    pub fn new(
        store: AtomicStore,
        cache: CacheClient,
        ids: IdGenerator,
        vouchers: Arc<dyn VoucherStore>,
        clock: Arc<dyn Clock>,
        voucher_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            ids,
            vouchers,
            clock,
            voucher_ttl,
        }
    }

    /// Attempt to claim one unit of a voucher for a user.
    ///
    /// On success the returned order id is final: the order exists from the
    /// caller's perspective even though the durable row is written
    /// asynchronously by the worker.
    ///
    /// # Errors
    ///
    /// Every rejection in the admission taxonomy; see [`AdmissionError`].
    pub async fn seckill(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
    ) -> Result<OrderId, AdmissionError> {
        let voucher = self
            .load_voucher(voucher_id)
            .await?
            .ok_or(AdmissionError::UnknownVoucher(voucher_id))?;

        let now = self.clock.now();
        if now < voucher.begin_time {
            return Err(AdmissionError::NotStarted);
        }
        if now >= voucher.end_time {
            return Err(AdmissionError::Ended);
        }

        let order_id = self.ids.next_id(ORDER_SEQUENCE).await?;
        let code = self
            .store
            .eval(move |ctx| scripts::admission(ctx, voucher_id, user_id, order_id))
            .await??;

        match code {
            AdmissionCode::Accepted => {
                info!(
                    voucher_id = %voucher_id,
                    user_id = %user_id,
                    order_id = %order_id,
                    "admission accepted"
                );
                Ok(order_id)
            }
            AdmissionCode::OutOfStock => Err(AdmissionError::OutOfStock),
            AdmissionCode::Duplicate => Err(AdmissionError::DuplicateClaim),
        }
    }

    /// Seed the admission records for a campaign before its window opens.
    ///
    /// Writes the reserved-stock counter and warms the detail cache. Until
    /// this runs, every attempt for the voucher is rejected out-of-stock.
    ///
    /// # Errors
    ///
    /// [`AdmissionError::StoreUnavailable`] if the atomic store cannot be
    /// reached.
    pub async fn warm_up(&self, voucher: &Voucher) -> Result<(), AdmissionError> {
        self.store
            .set(
                &scripts::stock_key(voucher.id),
                voucher.stock.to_string(),
                None,
            )
            .await?;
        self.cache
            .set_with_logical_expiry(CACHE_VOUCHER_DETAIL, voucher.id, voucher, self.voucher_ttl)
            .await
            .map_err(cache_error)?;
        debug!(voucher_id = %voucher.id, stock = voucher.stock, "campaign warmed up");
        Ok(())
    }

    /// Voucher detail for the read path, served stale-while-revalidate.
    ///
    /// Returns `None` for vouchers that were never warmed or no longer
    /// exist.
    ///
    /// # Errors
    ///
    /// [`AdmissionError::StoreUnavailable`] / [`AdmissionError::DurableUnavailable`].
    pub async fn voucher_detail(
        &self,
        voucher_id: VoucherId,
    ) -> Result<Option<Voucher>, AdmissionError> {
        let vouchers = self.vouchers.clone();
        self.cache
            .get_with_logical_expiry(
                CACHE_VOUCHER_DETAIL,
                voucher_id,
                self.voucher_ttl,
                move |id| async move { vouchers.voucher(id).await },
            )
            .await
            .map_err(cache_error)
    }

    async fn load_voucher(
        &self,
        voucher_id: VoucherId,
    ) -> Result<Option<Voucher>, AdmissionError> {
        let vouchers = self.vouchers.clone();
        self.cache
            .get_with_pass_through(CACHE_VOUCHER, voucher_id, self.voucher_ttl, move |id| {
                async move { vouchers.voucher(id).await }
            })
            .await
            .map_err(cache_error)
    }
}

fn cache_error(e: CacheError) -> AdmissionError {
    match e {
        CacheError::Store(e) => AdmissionError::StoreUnavailable(e),
        other => AdmissionError::DurableUnavailable(other.to_string()),
    }
}
