//! Distributed mutex over the atomic store.
//!
//! Serializes work per resource (per user, per cache key) across every
//! process sharing the store. Acquisition is a single `SETNX` with TTL, so it
//! never blocks; release goes through the owner-checked
//! [`compare_and_delete`](crate::scripts::compare_and_delete) script so a
//! holder can never release a lock it no longer owns. A plain get-then-delete
//! release is explicitly insufficient: between the get and the delete the TTL
//! can expire and another holder can acquire, and the stale delete would
//! evict them.
//!
//! The TTL bounds worst-case lock-holding after a crash.

use crate::kv::AtomicStore;
use crate::scripts;
use flashsale_core::error::StoreError;
use std::time::Duration;
use uuid::Uuid;

/// Key prefix shared by all mutex records.
pub const LOCK_KEY_PREFIX: &str = "lock:";

/// One lock attempt on one resource.
///
/// Each instance mints its own owner token; two instances for the same key
/// contend for the same record but can only ever release their own hold.
#[derive(Debug, Clone)]
pub struct DistributedMutex {
    store: AtomicStore,
    key: String,
    token: String,
}

impl DistributedMutex {
    /// Create a mutex handle for a resource key (prefixed with `lock:`).
    #[must_use]
    pub fn new(store: AtomicStore, resource: &str) -> Self {
        Self {
            store,
            key: format!("{LOCK_KEY_PREFIX}{resource}"),
            token: Uuid::new_v4().to_string(),
        }
    }

    /// Try to take the lock; `false` immediately on contention.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the store cannot be reached.
    pub async fn try_lock(&self, ttl: Duration) -> Result<bool, StoreError> {
        self.store
            .set_nx(&self.key, self.token.clone(), Some(ttl))
            .await
    }

    /// Release the lock if this instance still holds it.
    ///
    /// Returns `false` if the record was already gone or held by someone
    /// else (TTL expiry followed by re-acquisition).
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the store cannot be reached.
    pub async fn unlock(&self) -> Result<bool, StoreError> {
        let key = self.key.clone();
        let token = self.token.clone();
        self.store
            .eval(move |ctx| scripts::compare_and_delete(ctx, &key, &token))
            .await?
    }
}
