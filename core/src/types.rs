//! Strongly typed identifiers and domain entities.
//!
//! Identifiers are newtype wrappers so a user id can never be passed where a
//! voucher id is expected. All of them serialize as their inner integer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a queue message cannot be decoded from its wire fields.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseMessageError {
    /// A required field was not present in the entry.
    #[error("missing field '{0}' in queue message")]
    MissingField(&'static str),

    /// A field was present but did not parse as an integer id.
    #[error("invalid value for field '{field}': {source}")]
    InvalidField {
        /// The offending field name.
        field: &'static str,
        /// The underlying parse failure.
        source: ParseIntError,
    },
}

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident($inner:ty)) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name($inner);

        impl $name {
            /// Wrap a raw id.
            #[must_use]
            pub const fn new(id: $inner) -> Self {
                Self(id)
            }

            /// The raw inner value.
            #[must_use]
            pub const fn value(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(id: $inner) -> Self {
                Self(id)
            }
        }

        impl FromStr for $name {
            type Err = ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }
    };
}

id_type! {
    /// Identifier of an authenticated user.
    ///
    /// The auth layer is outside this workspace: callers arrive with the id
    /// already resolved.
    UserId(u64)
}

id_type! {
    /// Identifier of a voucher campaign.
    VoucherId(u64)
}

id_type! {
    /// Generator-issued order identifier.
    ///
    /// 63-bit value composed as `(seconds since epoch offset) << 32 | seq`,
    /// see `flashsale_store::id::IdGenerator`. Signed so it fits anywhere a
    /// database `BIGINT` would.
    OrderId(i64)
}

/// A promotional voucher campaign.
///
/// Owned by the durable store; the stock field is only ever mutated through
/// the optimistic decrement inside
/// [`VoucherStore::create_order`](crate::voucher_store::VoucherStore::create_order).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    /// Campaign id.
    pub id: VoucherId,
    /// Units still available in the durable store.
    pub stock: u32,
    /// Start of the sale window (inclusive).
    pub begin_time: DateTime<Utc>,
    /// End of the sale window (exclusive).
    pub end_time: DateTime<Utc>,
}

impl Voucher {
    /// Whether the sale window is open at `now`.
    #[must_use]
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        now >= self.begin_time && now < self.end_time
    }
}

/// One user's successful claim on a voucher.
///
/// Immutable once created; for a given `(user_id, voucher_id)` pair at most
/// one order ever exists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Pre-minted order id, issued by the distributed id generator at
    /// admission time.
    pub id: OrderId,
    /// The claiming user.
    pub user_id: UserId,
    /// The claimed voucher.
    pub voucher_id: VoucherId,
    /// Materialization timestamp.
    pub create_time: DateTime<Utc>,
}

/// Envelope carried on the order stream from admission to the worker.
///
/// Travels as a flat string-keyed map (`id`, `userId`, `voucherId`), the wire
/// shape of the stream entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueMessage {
    /// Pre-minted order id.
    pub order_id: OrderId,
    /// Admitted user.
    pub user_id: UserId,
    /// Voucher the unit was reserved from.
    pub voucher_id: VoucherId,
}

impl QueueMessage {
    /// Encode as the flat field list appended to the stream.
    #[must_use]
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("id".to_string(), self.order_id.to_string()),
            ("userId".to_string(), self.user_id.to_string()),
            ("voucherId".to_string(), self.voucher_id.to_string()),
        ]
    }

    /// Decode from stream entry fields.
    ///
    /// # Errors
    ///
    /// Returns [`ParseMessageError`] if a field is missing or malformed. The
    /// worker treats that as a poison entry: logged and acknowledged, never
    /// retried.
    pub fn from_fields(fields: &[(String, String)]) -> Result<Self, ParseMessageError> {
        fn field<'a>(
            fields: &'a [(String, String)],
            name: &'static str,
        ) -> Result<&'a str, ParseMessageError> {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .ok_or(ParseMessageError::MissingField(name))
        }

        fn parse<T: FromStr<Err = ParseIntError>>(
            value: &str,
            name: &'static str,
        ) -> Result<T, ParseMessageError> {
            value
                .parse()
                .map_err(|source| ParseMessageError::InvalidField { field: name, source })
        }

        Ok(Self {
            order_id: parse(field(fields, "id")?, "id")?,
            user_id: parse(field(fields, "userId")?, "userId")?,
            voucher_id: parse(field(fields, "voucherId")?, "voucherId")?,
        })
    }
}
