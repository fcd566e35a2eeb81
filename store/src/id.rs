//! Distributed order id generation.
//!
//! Ids compose a coarse time component with a per-day sequence held in the
//! atomic store:
//!
//! ```text
//! 63                              32 31                               0
//! ┌─────────────────────────────────┬─────────────────────────────────┐
//! │ seconds since 2024-09-01T00:00Z │   daily INCR of the sequence    │
//! └─────────────────────────────────┴─────────────────────────────────┘
//! ```
//!
//! The high bits give monotonic-enough ordering for FIFO display (not a
//! strict global total order under clock skew); the low bits come from an
//! atomic increment scoped to `{sequence}:{date}` so they reset daily and
//! never collide across callers. No coordination is needed beyond the store's
//! `INCR`.

use crate::kv::AtomicStore;
use flashsale_core::environment::Clock;
use flashsale_core::error::StoreError;
use flashsale_core::types::OrderId;
use std::sync::Arc;

/// Epoch offset: 2024-09-01T00:00:00Z.
const EPOCH_OFFSET: i64 = 1_725_148_800;

/// Bits reserved for the per-day sequence.
const SEQUENCE_BITS: u32 = 32;

/// Key prefix for sequence counters.
const INCR_KEY_PREFIX: &str = "incr:";

/// Issues unique, monotonic-enough 63-bit order ids.
#[derive(Clone)]
pub struct IdGenerator {
    store: AtomicStore,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator").finish_non_exhaustive()
    }
}

impl IdGenerator {
    /// Create a generator over the given store and clock.
    #[must_use]
    pub fn new(store: AtomicStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Mint the next id for a sequence name.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the atomic store cannot be reached;
    /// this is the only failure mode of id generation.
    pub async fn next_id(&self, sequence: &str) -> Result<OrderId, StoreError> {
        let now = self.clock.now();
        let timestamp = now.timestamp() - EPOCH_OFFSET;
        let date = now.format("%Y:%m:%d");
        let seq = self
            .store
            .incr(&format!("{INCR_KEY_PREFIX}{sequence}:{date}"))
            .await?;
        Ok(OrderId::new((timestamp << SEQUENCE_BITS) | seq))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy)]
    struct PinnedClock(DateTime<Utc>);

    impl Clock for PinnedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn pinned(secs_past_epoch_offset: i64) -> Arc<dyn Clock> {
        Arc::new(PinnedClock(
            Utc.timestamp_opt(EPOCH_OFFSET + secs_past_epoch_offset, 0)
                .single()
                .unwrap(),
        ))
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing_within_a_day() {
        let store = AtomicStore::spawn();
        let ids = IdGenerator::new(store, pinned(1000));
        let a = ids.next_id("order").await.unwrap();
        let b = ids.next_id("order").await.unwrap();
        let c = ids.next_id("order").await.unwrap();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn timestamp_occupies_the_high_bits() {
        let store = AtomicStore::spawn();
        let ids = IdGenerator::new(store, pinned(12345));
        let id = ids.next_id("order").await.unwrap();
        assert_eq!(id.value() >> SEQUENCE_BITS, 12345);
        assert_eq!(id.value() & i64::from(u32::MAX), 1);
    }

    #[tokio::test]
    async fn sequences_are_independent() {
        let store = AtomicStore::spawn();
        let ids = IdGenerator::new(store.clone(), pinned(5));
        let order = ids.next_id("order").await.unwrap();
        let refund = ids.next_id("refund").await.unwrap();
        // Same timestamp, both got sequence number 1.
        assert_eq!(order.value(), refund.value());
        assert_eq!(ids.next_id("order").await.unwrap().value() & 0xFFFF, 2);
    }

    #[tokio::test]
    async fn concurrent_minting_never_collides() {
        let store = AtomicStore::spawn();
        let ids = IdGenerator::new(store, pinned(77));
        let mut handles = Vec::new();
        for _ in 0..64 {
            let ids = ids.clone();
            handles.push(tokio::spawn(async move { ids.next_id("order").await }));
        }
        let mut seen = std::collections::HashSet::new();
        for h in handles {
            assert!(seen.insert(h.await.unwrap().unwrap()));
        }
        assert_eq!(seen.len(), 64);
    }

    proptest! {
        #[test]
        fn bit_layout_preserves_ordering(ts_a in 0i64..=i64::from(u32::MAX), ts_b in 0i64..=i64::from(u32::MAX), seq in 1i64..=i64::from(u32::MAX)) {
            let id_a = (ts_a << SEQUENCE_BITS) | seq;
            let id_b = (ts_b << SEQUENCE_BITS) | seq;
            prop_assert_eq!(ts_a.cmp(&ts_b), id_a.cmp(&id_b));
            prop_assert!(id_a >= 0);
        }
    }
}
