//! # Flashsale Core
//!
//! Domain types and trait seams for the flash-sale order pipeline.
//!
//! This crate defines exactly what the rest of the workspace agrees on:
//!
//! - Strongly typed identifiers and domain entities ([`types`])
//! - The error taxonomy shared by the admission path and the worker ([`error`])
//! - The [`voucher_store::VoucherStore`] trait, the seam in front of the
//!   durable row store
//! - The [`environment::Clock`] trait so time is injectable in tests
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   accept/reject    ┌───────────────────┐
//! │  Admission   │──────────────────► │      Caller       │
//! │  (sync path) │                    └───────────────────┘
//! └──────┬───────┘
//!        │ enqueue {id, userId, voucherId}
//!        ▼
//! ┌──────────────┐   one transaction  ┌───────────────────┐
//! │    Worker    │──────────────────► │   VoucherStore    │
//! │ (async path) │  re-check + decr   │  (durable rows)   │
//! └──────────────┘     + insert       └───────────────────┘
//! ```
//!
//! The admission decision is resolved synchronously against the atomic store
//! (see `flashsale-store`); the durable bookkeeping happens asynchronously and
//! is eventually consistent with the accept response.

pub mod error;
pub mod types;
pub mod voucher_store;

/// Environment traits for injectable side effects.
///
/// Only wall-clock time is abstracted here: everything else the pipeline
/// touches already sits behind a handle or a trait of its own.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Source of the current time.
    ///
    /// Production code uses [`SystemClock`]; tests pin time with a fixed
    /// implementation so sale windows and logical expiry are deterministic.
    pub trait Clock: Send + Sync {
        /// Current instant in UTC.
        fn now(&self) -> DateTime<Utc>;
    }

    /// [`Clock`] backed by the system clock.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use environment::{Clock, SystemClock};
pub use error::{AdmissionError, StoreError};
pub use types::{Order, OrderId, QueueMessage, UserId, Voucher, VoucherId};
pub use voucher_store::{MaterializeOutcome, VoucherStore, VoucherStoreError};
