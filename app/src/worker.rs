//! Asynchronous order materialization.
//!
//! One logical consumer per process drains the order stream and turns each
//! admitted message into a durable order row. The loop is two-phase:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │ main loop: blocking read_group ── parse ── handle ── ack │
//! │      │                                        │          │
//! │      └── any error ──► pending drain loop ◄───┘          │
//! │            read_pending until empty, short sleep between │
//! │            failed attempts, then back to the main loop   │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! The drain also runs once at startup, so messages a crashed predecessor
//! read but never acknowledged are recovered before new deliveries.
//!
//! Delivery is at-least-once; idempotency comes from the durable store's
//! uniqueness re-check, so replaying an already-materialized message is a
//! logged no-op. The ack always happens strictly after the transaction.

use crate::config::Config;
use flashsale_core::environment::Clock;
use flashsale_core::types::{Order, QueueMessage};
use flashsale_core::voucher_store::{MaterializeOutcome, VoucherStore};
use flashsale_store::scripts::ORDER_STREAM;
use flashsale_store::stream::StreamEntry;
use flashsale_store::{AtomicStore, DistributedMutex};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Entries requested per read.
const READ_COUNT: usize = 16;

/// Why a message could not be fully handled this attempt.
///
/// Never surfaced outside the worker: the message stays pending and a later
/// drain pass retries it.
enum HandleFailure {
    /// Another consumer (or a previous attempt) holds this user's lock.
    LockContention,
    /// The atomic store or the durable store could not be reached.
    Unavailable(String),
}

/// The materialization worker.
pub struct OrderWorker {
    store: AtomicStore,
    vouchers: Arc<dyn VoucherStore>,
    clock: Arc<dyn Clock>,
    group: String,
    consumer: String,
    read_block: Duration,
    drain_sleep: Duration,
    lock_ttl: Duration,
}

impl OrderWorker {
    /// Build a worker from the shared components and configuration.
    #[must_use]
    pub fn new(
        store: AtomicStore,
        vouchers: Arc<dyn VoucherStore>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            vouchers,
            clock,
            group: config.group.clone(),
            consumer: config.consumer.clone(),
            read_block: config.read_block,
            drain_sleep: config.drain_sleep,
            lock_ttl: config.lock_ttl,
        }
    }

    /// Spawn the worker loop; it runs until `shutdown` fires.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(group = %self.group, consumer = %self.consumer, "order worker started");
            // Messages left pending by a previous incarnation of this
            // consumer are retried before any new delivery.
            self.drain_pending(&mut shutdown).await;
            loop {
                let read = tokio::select! {
                    _ = shutdown.recv() => {
                        info!("order worker shutting down");
                        break;
                    }
                    read = self.store.read_group(
                        ORDER_STREAM,
                        &self.group,
                        &self.consumer,
                        READ_COUNT,
                        Some(self.read_block),
                    ) => read,
                };
                match read {
                    Ok(entries) => {
                        if self.handle_batch(entries).await.is_err() {
                            self.drain_pending(&mut shutdown).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "order stream read failed");
                        self.drain_pending(&mut shutdown).await;
                    }
                }
            }
        })
    }

    /// Handle a freshly delivered batch; `Err` means at least one message
    /// was left pending.
    async fn handle_batch(&self, entries: Vec<StreamEntry>) -> Result<(), ()> {
        let mut failed = false;
        for entry in entries {
            if let Err(failure) = self.handle_entry(&entry).await {
                match failure {
                    HandleFailure::LockContention => {
                        debug!(entry_id = %entry.id, "user lock contended, message left pending");
                    }
                    HandleFailure::Unavailable(reason) => {
                        warn!(entry_id = %entry.id, reason = %reason, "materialization failed, message left pending");
                    }
                }
                failed = true;
            }
        }
        if failed { Err(()) } else { Ok(()) }
    }

    /// Retry this consumer's pending messages until none remain.
    ///
    /// Mirrors the main loop but reads the pending set instead of new
    /// entries, sleeping briefly after a failed attempt so a struggling
    /// backend is not hammered.
    async fn drain_pending(&self, shutdown: &mut broadcast::Receiver<()>) {
        loop {
            if shutdown.try_recv().is_ok() {
                return;
            }
            let entries = match self
                .store
                .read_pending(ORDER_STREAM, &self.group, &self.consumer, READ_COUNT)
                .await
            {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "pending read failed");
                    tokio::time::sleep(self.drain_sleep).await;
                    continue;
                }
            };
            if entries.is_empty() {
                return;
            }
            if self.handle_batch(entries).await.is_err() {
                tokio::time::sleep(self.drain_sleep).await;
            }
        }
    }

    /// Materialize one stream entry; ack on every terminal outcome.
    async fn handle_entry(&self, entry: &StreamEntry) -> Result<(), HandleFailure> {
        let message = match QueueMessage::from_fields(&entry.fields) {
            Ok(message) => message,
            Err(e) => {
                // A malformed entry can never succeed; dropping it beats
                // poisoning the loop.
                error!(entry_id = %entry.id, error = %e, "malformed queue message, acknowledging");
                self.ack(entry).await?;
                return Ok(());
            }
        };

        let lock = DistributedMutex::new(
            self.store.clone(),
            &format!("order:{}", message.user_id),
        );
        let held = lock
            .try_lock(self.lock_ttl)
            .await
            .map_err(|e| HandleFailure::Unavailable(e.to_string()))?;
        if !held {
            return Err(HandleFailure::LockContention);
        }

        let outcome = self.materialize(&message).await;
        if let Err(e) = lock.unlock().await {
            warn!(user_id = %message.user_id, error = %e, "failed to release user lock");
        }
        match outcome? {
            MaterializeOutcome::Created => {
                info!(
                    order_id = %message.order_id,
                    user_id = %message.user_id,
                    voucher_id = %message.voucher_id,
                    "order materialized"
                );
            }
            MaterializeOutcome::DuplicateOrder => {
                debug!(
                    order_id = %message.order_id,
                    user_id = %message.user_id,
                    voucher_id = %message.voucher_id,
                    "order already materialized, replay acknowledged"
                );
            }
            MaterializeOutcome::StockConflict => {
                // Admission reserved a unit, so durable stock can never run
                // out here. Requires manual intervention.
                error!(
                    order_id = %message.order_id,
                    user_id = %message.user_id,
                    voucher_id = %message.voucher_id,
                    "durable stock exhausted for an admitted order"
                );
            }
        }
        self.ack(entry).await
    }

    async fn materialize(
        &self,
        message: &QueueMessage,
    ) -> Result<MaterializeOutcome, HandleFailure> {
        let order = Order {
            id: message.order_id,
            user_id: message.user_id,
            voucher_id: message.voucher_id,
            create_time: self.clock.now(),
        };
        self.vouchers
            .create_order(&order)
            .await
            .map_err(|e| HandleFailure::Unavailable(e.to_string()))
    }

    async fn ack(&self, entry: &StreamEntry) -> Result<(), HandleFailure> {
        self.store
            .ack(ORDER_STREAM, &self.group, entry.id)
            .await
            .map(|_| ())
            .map_err(|e| HandleFailure::Unavailable(e.to_string()))
    }
}
