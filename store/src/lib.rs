//! # Flashsale Store
//!
//! The atomic store and everything the admission path builds directly on it.
//!
//! This crate provides:
//! - [`AtomicStore`]: a single-threaded, in-memory keyed store whose actor
//!   task makes every command, [`AtomicStore::eval`] scripts included, one
//!   indivisible step ([`kv`])
//! - The order stream with consumer groups, acks and pending replay
//!   ([`stream`])
//! - The admission and unlock scripts ([`scripts`])
//! - The distributed id generator ([`id`])
//! - The per-resource distributed mutex ([`lock`])
//! - The cache-aside client with stampede control ([`cache`])
//!
//! # Example
//!
//! ```no_run
//! use flashsale_core::types::{OrderId, UserId, VoucherId};
//! use flashsale_store::{scripts, AtomicStore};
//!
//! # async fn example() -> Result<(), flashsale_core::error::StoreError> {
//! let store = AtomicStore::spawn();
//! store.create_group(scripts::ORDER_STREAM, "g1").await?;
//! store.set(&scripts::stock_key(VoucherId::new(7)), "100", None).await?;
//!
//! let code = store
//!     .eval(|ctx| {
//!         scripts::admission(ctx, VoucherId::new(7), UserId::new(1), OrderId::new(42))
//!     })
//!     .await??;
//! assert_eq!(code.code(), 0);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod id;
pub mod kv;
pub mod lock;
pub mod scripts;
pub mod stream;

pub use cache::{CacheClient, CacheError};
pub use id::IdGenerator;
pub use kv::{AtomicStore, ScriptCtx};
pub use lock::DistributedMutex;
pub use scripts::AdmissionCode;
pub use stream::{StreamEntry, StreamEntryId};
