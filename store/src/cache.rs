//! Generic cache-aside client with stampede control.
//!
//! Read-through cache in front of the durable store, with three
//! interchangeable strategies:
//!
//! 1. [`CacheClient::get_with_pass_through`]: plain cache-aside plus a
//!    short-TTL negative sentinel, so repeated misses for an id that does not
//!    exist never stampede the fallback (cache penetration).
//! 2. [`CacheClient::get_with_mutex`]: a rebuild lock per key serializes
//!    fallback invocations; losers sleep and retry the whole read, bounded by
//!    a retry cap. At most one fallback is in flight per key at any instant.
//! 3. [`CacheClient::get_with_logical_expiry`]: entries never physically
//!    expire; each carries a logical expiry timestamp. Stale reads return the
//!    current value immediately and the lock winner schedules an asynchronous
//!    rebuild on a semaphore-bounded pool, so no caller ever blocks on a slow
//!    rebuild.
//!
//! Key scheme: `cache:{prefix}:{id}` for payloads, `lock:{prefix}:{id}` for
//! rebuild locks. Payloads are JSON; the negative sentinel is the empty
//! string.

use crate::kv::AtomicStore;
use crate::lock::DistributedMutex;
use chrono::{DateTime, Utc};
use flashsale_core::environment::Clock;
use flashsale_core::error::StoreError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Key prefix of cached payloads.
pub const CACHE_KEY_PREFIX: &str = "cache:";

/// TTL of the negative sentinel written for confirmed absences.
const NEGATIVE_TTL: Duration = Duration::from_secs(2 * 60);

/// TTL of a rebuild lock; bounds lock-holding if a rebuilder crashes.
const REBUILD_LOCK_TTL: Duration = Duration::from_secs(10);

/// How many times a mutex-strategy loser retries before giving up.
const MUTEX_RETRY_LIMIT: u32 = 20;

/// Sleep between mutex-strategy retries.
const MUTEX_RETRY_SLEEP: Duration = Duration::from_millis(50);

/// Size of the asynchronous rebuild pool.
const REBUILD_WORKERS: usize = 10;

/// Errors raised by cache reads.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The atomic store could not be reached.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A cached payload did not decode as the expected type.
    #[error("cache payload at '{key}' did not decode: {reason}")]
    Codec {
        /// The cache key holding the bad payload.
        key: String,
        /// Decoder diagnostic.
        reason: String,
    },

    /// The mutex strategy exhausted its retries without ever seeing the key
    /// populated. Only possible while a rebuild is badly stuck.
    #[error("rebuild of '{key}' stayed contended past the retry cap")]
    RebuildContended {
        /// The contended cache key.
        key: String,
    },

    /// The caller's fallback failed; propagated uncaught apart from lock
    /// release.
    #[error("fallback load failed: {0}")]
    Fallback(String),
}

/// Envelope for logically expiring entries.
#[derive(Debug, Serialize, Deserialize)]
struct TimedEntry<T> {
    data: T,
    expires_at: DateTime<Utc>,
}

/// Read-through cache client. Cheap to clone.
#[derive(Clone)]
pub struct CacheClient {
    store: AtomicStore,
    clock: Arc<dyn Clock>,
    rebuilds: Arc<Semaphore>,
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient").finish_non_exhaustive()
    }
}

fn cache_key(prefix: &str, id: impl Display) -> String {
    format!("{CACHE_KEY_PREFIX}{prefix}:{id}")
}

fn decode<T: DeserializeOwned>(key: &str, json: &str) -> Result<T, CacheError> {
    serde_json::from_str(json).map_err(|e| CacheError::Codec {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<String, CacheError> {
    serde_json::to_string(value).map_err(|e| CacheError::Codec {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

impl CacheClient {
    /// Create a client over the given store and clock.
    #[must_use]
    pub fn new(store: AtomicStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            rebuilds: Arc::new(Semaphore::new(REBUILD_WORKERS)),
        }
    }

    fn rebuild_lock(&self, prefix: &str, id: impl Display) -> DistributedMutex {
        DistributedMutex::new(self.store.clone(), &format!("{prefix}:{id}"))
    }

    /// Write a positive cache entry with a physical TTL.
    ///
    /// # Errors
    ///
    /// [`CacheError::Store`] if the store is unreachable, [`CacheError::Codec`]
    /// if the value does not serialize.
    pub async fn set<T: Serialize>(
        &self,
        prefix: &str,
        id: impl Display,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = cache_key(prefix, id);
        let json = encode(&key, value)?;
        self.store.set(&key, json, Some(ttl)).await?;
        Ok(())
    }

    /// Warm a logically expiring entry: physically immortal, stale after
    /// `ttl` by the entry's own timestamp.
    ///
    /// # Errors
    ///
    /// [`CacheError::Store`] if the store is unreachable, [`CacheError::Codec`]
    /// if the value does not serialize.
    pub async fn set_with_logical_expiry<T: Serialize>(
        &self,
        prefix: &str,
        id: impl Display,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = cache_key(prefix, id);
        let entry = TimedEntry {
            data: value,
            expires_at: self.clock.now()
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
        };
        let json = encode(&key, &entry)?;
        self.store.set(&key, json, None).await?;
        Ok(())
    }

    /// Strategy 1: pass-through with a negative sentinel.
    ///
    /// On miss the fallback runs; a confirmed absence is remembered with a
    /// short-TTL empty sentinel so the next misses return `None` without
    /// touching the fallback.
    ///
    /// # Errors
    ///
    /// [`CacheError::Fallback`] if the fallback fails; [`CacheError::Store`] /
    /// [`CacheError::Codec`] as usual.
    pub async fn get_with_pass_through<T, I, F, Fut, E>(
        &self,
        prefix: &str,
        id: I,
        ttl: Duration,
        fallback: F,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        I: Display + Copy,
        F: FnOnce(I) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Display,
    {
        let key = cache_key(prefix, id);
        match self.store.get(&key).await? {
            Some(json) if !json.is_empty() => return Ok(Some(decode(&key, &json)?)),
            // Negative sentinel: confirmed absent, don't hit the fallback.
            Some(_) => return Ok(None),
            None => {}
        }

        match fallback(id)
            .await
            .map_err(|e| CacheError::Fallback(e.to_string()))?
        {
            None => {
                self.store.set(&key, "", Some(NEGATIVE_TTL)).await?;
                Ok(None)
            }
            Some(value) => {
                let json = encode(&key, &value)?;
                self.store.set(&key, json, Some(ttl)).await?;
                Ok(Some(value))
            }
        }
    }

    /// Strategy 2: mutex rebuild.
    ///
    /// Guarantees at most one fallback invocation in flight per key; losers
    /// of the lock race sleep briefly and retry the read, up to a cap. The
    /// winner re-reads the key after acquisition, so a rebuild that finished
    /// between its miss and its lock never runs twice.
    ///
    /// # Errors
    ///
    /// [`CacheError::RebuildContended`] past the retry cap;
    /// [`CacheError::Fallback`] if this caller won the lock and its fallback
    /// failed (the lock is still released); [`CacheError::Store`] /
    /// [`CacheError::Codec`] as usual.
    pub async fn get_with_mutex<T, I, F, Fut, E>(
        &self,
        prefix: &str,
        id: I,
        ttl: Duration,
        fallback: F,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        I: Display + Copy,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Display,
    {
        let key = cache_key(prefix, id);
        for _ in 0..MUTEX_RETRY_LIMIT {
            match self.store.get(&key).await? {
                Some(json) if !json.is_empty() => return Ok(Some(decode(&key, &json)?)),
                Some(_) => return Ok(None),
                None => {}
            }

            let lock = self.rebuild_lock(prefix, id);
            if !lock.try_lock(REBUILD_LOCK_TTL).await? {
                // Someone else is rebuilding; retry the whole read shortly.
                tokio::time::sleep(MUTEX_RETRY_SLEEP).await;
                continue;
            }

            // Double-check after winning the lock: the previous holder may
            // have populated the key between our read and our acquisition.
            match self.store.get(&key).await {
                Ok(Some(json)) => {
                    if let Err(e) = lock.unlock().await {
                        warn!(key = %key, error = %e, "failed to release cache rebuild lock");
                    }
                    if json.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(decode(&key, &json)?));
                }
                Ok(None) => {}
                Err(e) => {
                    if let Err(e) = lock.unlock().await {
                        warn!(key = %key, error = %e, "failed to release cache rebuild lock");
                    }
                    return Err(e.into());
                }
            }

            let outcome = self.load_and_populate(&key, id, ttl, &fallback).await;
            // Release on every exit path, including fallback failure.
            if let Err(e) = lock.unlock().await {
                warn!(key = %key, error = %e, "failed to release cache rebuild lock");
            }
            return outcome;
        }
        Err(CacheError::RebuildContended { key })
    }

    async fn load_and_populate<T, I, F, Fut, E>(
        &self,
        key: &str,
        id: I,
        ttl: Duration,
        fallback: &F,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        I: Display + Copy,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Display,
    {
        match fallback(id)
            .await
            .map_err(|e| CacheError::Fallback(e.to_string()))?
        {
            None => {
                self.store.set(key, "", Some(NEGATIVE_TTL)).await?;
                Ok(None)
            }
            Some(value) => {
                let json = encode(key, &value)?;
                self.store.set(key, json, Some(ttl)).await?;
                Ok(Some(value))
            }
        }
    }

    /// Strategy 3: logical expiration with stale-while-revalidate.
    ///
    /// A miss means the entry was never warmed and returns `None`. A fresh
    /// hit returns the value. A stale hit returns the stale value to every
    /// caller immediately; the winner of the rebuild lock additionally
    /// schedules an asynchronous rebuild on a bounded pool.
    ///
    /// # Errors
    ///
    /// [`CacheError::Store`] / [`CacheError::Codec`]. Rebuild failures are
    /// logged, never surfaced: callers already have the stale value.
    pub async fn get_with_logical_expiry<T, I, F, Fut, E>(
        &self,
        prefix: &str,
        id: I,
        ttl: Duration,
        fallback: F,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        I: Display + Copy + Send + 'static,
        F: FnOnce(I) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, E>> + Send,
        E: Display + Send,
    {
        let key = cache_key(prefix, id);
        let Some(json) = self.store.get(&key).await? else {
            return Ok(None);
        };
        if json.is_empty() {
            return Ok(None);
        }
        let entry: TimedEntry<T> = decode(&key, &json)?;
        if self.clock.now() < entry.expires_at {
            return Ok(Some(entry.data));
        }

        let lock = self.rebuild_lock(prefix, id);
        if lock.try_lock(REBUILD_LOCK_TTL).await? {
            debug!(key = %key, "cache entry stale, scheduling rebuild");
            let this = self.clone();
            let key = key.clone();
            tokio::spawn(async move {
                // Bounded pool: at most REBUILD_WORKERS rebuilds at once.
                let Ok(_permit) = this.rebuilds.acquire().await else {
                    return;
                };
                match fallback(id).await {
                    Ok(Some(value)) => {
                        let entry = TimedEntry {
                            data: value,
                            expires_at: this.clock.now()
                                + chrono::Duration::from_std(ttl)
                                    .unwrap_or(chrono::Duration::MAX),
                        };
                        match encode(&key, &entry) {
                            Ok(json) => {
                                if let Err(e) = this.store.set(&key, json, None).await {
                                    warn!(key = %key, error = %e, "cache rebuild write failed");
                                }
                            }
                            Err(e) => warn!(key = %key, error = %e, "cache rebuild encode failed"),
                        }
                    }
                    Ok(None) => {
                        // The entity disappeared; drop the stale entry.
                        if let Err(e) = this.store.del(&key).await {
                            warn!(key = %key, error = %e, "cache drop failed");
                        }
                    }
                    Err(e) => warn!(key = %key, error = %e, "cache rebuild fallback failed"),
                }
                if let Err(e) = lock.unlock().await {
                    warn!(key = %key, error = %e, "failed to release cache rebuild lock");
                }
            });
        }

        // Everyone, the lock winner included, gets the stale value now.
        Ok(Some(entry.data))
    }
}
