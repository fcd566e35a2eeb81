//! # Flashsale Testing
//!
//! Test doubles for the flash-sale pipeline.
//!
//! This crate provides:
//! - [`InMemoryVoucherStore`]: the durable-store trait implemented over a
//!   single async mutex, which doubles as the transaction boundary
//! - [`FixedClock`] and [`test_clock`]: deterministic time
//!
//! ## Example
//!
//! ```
//! use flashsale_core::types::{Voucher, VoucherId};
//! use flashsale_core::voucher_store::VoucherStore;
//! use flashsale_testing::{test_clock, InMemoryVoucherStore};
//! use chrono::{Duration, Utc};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = InMemoryVoucherStore::new();
//! store
//!     .insert_voucher(Voucher {
//!         id: VoucherId::new(1),
//!         stock: 100,
//!         begin_time: Utc::now() - Duration::hours(1),
//!         end_time: Utc::now() + Duration::hours(1),
//!     })
//!     .await;
//!
//! let voucher = store.voucher(VoucherId::new(1)).await.unwrap();
//! assert_eq!(voucher.map(|v| v.stock), Some(100));
//! # }
//! ```

use chrono::{DateTime, Utc};
use flashsale_core::environment::Clock;

pub mod voucher_store;

/// Clock pinned to a single instant.
///
/// Sale-window checks and generated ids stay stable across runs when the
/// clock never moves.
///
/// # Example
///
/// ```
/// use flashsale_testing::FixedClock;
/// use flashsale_core::environment::Clock;
/// use chrono::Utc;
///
/// let clock = FixedClock::new(Utc::now());
/// assert_eq!(clock.now(), clock.now());
/// ```
#[derive(Debug, Clone)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    /// Pin the clock to `time`.
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

/// The clock most tests pin to: 2025-01-01T00:00:00Z.
///
/// # Panics
///
/// Only if the pinned timestamp stopped being valid RFC 3339, which it
/// cannot.
#[must_use]
#[allow(clippy::expect_used)]
pub fn test_clock() -> FixedClock {
    FixedClock::new(
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc),
    )
}

pub use voucher_store::InMemoryVoucherStore;
