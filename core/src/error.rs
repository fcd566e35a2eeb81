//! Error taxonomy shared across the pipeline.
//!
//! Two propagation regimes exist and never mix:
//!
//! - **Admission-path errors** ([`AdmissionError`]) are resolved synchronously
//!   and returned to the caller. None of them is retried by the system itself;
//!   only [`AdmissionError::StoreUnavailable`] is safe for the caller to retry.
//! - **Worker-path errors** stay inside the materialization loop: the message
//!   remains pending (or is loudly logged and acknowledged for invariant
//!   violations) and the original caller never sees them; it already received
//!   its accepted order id.

use crate::types::VoucherId;
use thiserror::Error;

/// Errors raised by the atomic store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store task is gone or the reply channel was dropped.
    ///
    /// The only infrastructure failure mode of the atomic store: surfaced to
    /// callers as a transient failure, safe to retry the whole request.
    #[error("atomic store unavailable")]
    Unavailable,

    /// `INCR` was applied to a key whose value is not an integer.
    #[error("value at '{key}' is not an integer")]
    NotAnInteger {
        /// The offending key.
        key: String,
    },

    /// A string operation hit a key holding a set (or vice versa).
    #[error("wrong value type at '{key}'")]
    WrongType {
        /// The offending key.
        key: String,
    },

    /// A consumer-group operation named a group that was never created.
    #[error("no consumer group '{group}' on stream '{stream}'")]
    NoSuchGroup {
        /// The stream key.
        stream: String,
        /// The missing group name.
        group: String,
    },
}

/// Outcome of a rejected or failed admission attempt.
///
/// Everything here is user-visible; the HTTP layer maps each variant to a
/// stable error code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// The voucher does not exist in the durable store.
    #[error("voucher {0} does not exist")]
    UnknownVoucher(VoucherId),

    /// The sale window has not opened yet. Not retryable until it does.
    #[error("sale has not started")]
    NotStarted,

    /// The sale window has closed.
    #[error("sale has ended")]
    Ended,

    /// Admission code 1: the reserved-stock counter reached zero.
    #[error("out of stock")]
    OutOfStock,

    /// Admission code 2: this user already holds a unit of this voucher.
    #[error("duplicate claim")]
    DuplicateClaim,

    /// The atomic store could not be reached; the whole request may be
    /// retried.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// The durable store could not be reached while loading the voucher.
    #[error("durable store unavailable: {0}")]
    DurableUnavailable(String),
}
