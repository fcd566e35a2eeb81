//! End-to-end pipeline tests: admission through the service, materialization
//! through a live worker, assertions against the durable store.
//!
//! Run with: `cargo test --test pipeline`

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use chrono::{Duration as ChronoDuration, Utc};
use flashsale::{Config, OrderWorker, SeckillService};
use flashsale_core::environment::SystemClock;
use flashsale_core::error::AdmissionError;
use flashsale_core::types::{OrderId, QueueMessage, UserId, Voucher, VoucherId};
use flashsale_store::scripts::ORDER_STREAM;
use flashsale_store::{AtomicStore, CacheClient, DistributedMutex, IdGenerator};
use flashsale_testing::InMemoryVoucherStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

struct Pipeline {
    store: AtomicStore,
    service: SeckillService,
    vouchers: Arc<InMemoryVoucherStore>,
    config: Config,
}

impl Pipeline {
    async fn new() -> Self {
        let config = Config {
            read_block: Duration::from_millis(50),
            ..Config::default()
        };
        let store = AtomicStore::spawn();
        store.create_group(ORDER_STREAM, &config.group).await.unwrap();
        let clock = Arc::new(SystemClock);
        let vouchers = Arc::new(InMemoryVoucherStore::new());
        let service = SeckillService::new(
            store.clone(),
            CacheClient::new(store.clone(), clock.clone()),
            IdGenerator::new(store.clone(), clock.clone()),
            vouchers.clone(),
            clock,
            config.voucher_cache_ttl,
        );
        Self {
            store,
            service,
            vouchers,
            config,
        }
    }

    async fn open_campaign(&self, id: u64, stock: u32) -> Voucher {
        let now = Utc::now();
        let voucher = Voucher {
            id: VoucherId::new(id),
            stock,
            begin_time: now - ChronoDuration::hours(1),
            end_time: now + ChronoDuration::hours(1),
        };
        self.vouchers.insert_voucher(voucher.clone()).await;
        self.service.warm_up(&voucher).await.unwrap();
        voucher
    }

    fn start_worker(&self, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        OrderWorker::new(
            self.store.clone(),
            self.vouchers.clone(),
            Arc::new(SystemClock),
            &self.config,
        )
        .spawn(shutdown.subscribe())
    }

    /// Poll until the durable store holds `expected` orders, within a bound.
    async fn await_orders(&self, expected: usize) {
        for _ in 0..200 {
            if self.vouchers.order_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "durable store never reached {expected} orders (has {})",
            self.vouchers.order_count().await
        );
    }

    /// This consumer's delivered-but-unacknowledged entries.
    async fn pending(&self) -> usize {
        self.store
            .read_pending(ORDER_STREAM, &self.config.group, &self.config.consumer, 16)
            .await
            .unwrap()
            .len()
    }
}

#[tokio::test]
async fn single_unit_goes_to_exactly_one_of_two_users() {
    let pipeline = Pipeline::new().await;
    pipeline.open_campaign(1, 1).await;

    let first = pipeline.service.seckill(VoucherId::new(1), UserId::new(10)).await;
    let second = pipeline.service.seckill(VoucherId::new(1), UserId::new(20)).await;

    assert!(first.is_ok());
    assert_eq!(second.unwrap_err(), AdmissionError::OutOfStock);

    let (shutdown, _) = broadcast::channel(1);
    let worker = pipeline.start_worker(&shutdown);
    pipeline.await_orders(1).await;

    let orders = pipeline.vouchers.orders().await;
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].user_id, UserId::new(10));
    assert_eq!(pipeline.vouchers.stock(VoucherId::new(1)).await, Some(0));

    let _ = shutdown.send(());
    let _ = worker.await;
}

#[tokio::test]
async fn second_claim_by_the_same_user_never_enqueues() {
    let pipeline = Pipeline::new().await;
    pipeline.open_campaign(1, 10).await;

    pipeline
        .service
        .seckill(VoucherId::new(1), UserId::new(10))
        .await
        .unwrap();
    assert_eq!(
        pipeline
            .service
            .seckill(VoucherId::new(1), UserId::new(10))
            .await
            .unwrap_err(),
        AdmissionError::DuplicateClaim
    );

    let (shutdown, _) = broadcast::channel(1);
    let worker = pipeline.start_worker(&shutdown);
    pipeline.await_orders(1).await;
    // Give the worker a beat to prove no second order arrives.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pipeline.vouchers.order_count().await, 1);

    let _ = shutdown.send(());
    let _ = worker.await;
}

#[tokio::test]
async fn message_read_but_never_acked_is_recovered_exactly_once() {
    let pipeline = Pipeline::new().await;
    pipeline.open_campaign(1, 5).await;

    pipeline
        .service
        .seckill(VoucherId::new(1), UserId::new(10))
        .await
        .unwrap();

    // A consumer reads the message and dies before handling or acking it.
    let delivered = pipeline
        .store
        .read_group(ORDER_STREAM, &pipeline.config.group, &pipeline.config.consumer, 16, None)
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);

    // The next incarnation of the consumer drains its pending set first.
    let (shutdown, _) = broadcast::channel(1);
    let worker = pipeline.start_worker(&shutdown);
    pipeline.await_orders(1).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pipeline.vouchers.order_count().await, 1);
    assert_eq!(pipeline.vouchers.stock(VoucherId::new(1)).await, Some(4));

    let _ = shutdown.send(());
    let _ = worker.await;
}

#[tokio::test]
async fn replayed_message_materializes_one_order_and_one_decrement() {
    let pipeline = Pipeline::new().await;
    pipeline.open_campaign(1, 5).await;

    // The same admitted message delivered twice, as at-least-once allows.
    let message = QueueMessage {
        order_id: OrderId::new(4242),
        user_id: UserId::new(10),
        voucher_id: VoucherId::new(1),
    };
    pipeline
        .store
        .stream_add(ORDER_STREAM, message.to_fields())
        .await
        .unwrap();
    pipeline
        .store
        .stream_add(ORDER_STREAM, message.to_fields())
        .await
        .unwrap();

    let (shutdown, _) = broadcast::channel(1);
    let worker = pipeline.start_worker(&shutdown);
    pipeline.await_orders(1).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pipeline.vouchers.order_count().await, 1);
    assert_eq!(pipeline.vouchers.stock(VoucherId::new(1)).await, Some(4));

    let _ = shutdown.send(());
    let _ = worker.await;
}

#[tokio::test]
async fn exhausted_durable_stock_is_acknowledged_not_retried() {
    let pipeline = Pipeline::new().await;

    // The durable row holds no stock, so materializing the enqueued message
    // can never succeed.
    let now = Utc::now();
    pipeline
        .vouchers
        .insert_voucher(Voucher {
            id: VoucherId::new(1),
            stock: 0,
            begin_time: now - ChronoDuration::hours(1),
            end_time: now + ChronoDuration::hours(1),
        })
        .await;
    let conflicted = QueueMessage {
        order_id: OrderId::new(7001),
        user_id: UserId::new(10),
        voucher_id: VoucherId::new(1),
    };
    pipeline
        .store
        .stream_add(ORDER_STREAM, conflicted.to_fields())
        .await
        .unwrap();

    // A healthy campaign behind it proves the loop keeps moving.
    pipeline.open_campaign(2, 5).await;
    pipeline
        .service
        .seckill(VoucherId::new(2), UserId::new(20))
        .await
        .unwrap();

    let (shutdown, _) = broadcast::channel(1);
    let worker = pipeline.start_worker(&shutdown);
    pipeline.await_orders(1).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let orders = pipeline.vouchers.orders().await;
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].user_id, UserId::new(20));
    // The conflicted entry was acknowledged, not left for the drain.
    assert_eq!(pipeline.pending().await, 0);

    let _ = shutdown.send(());
    let _ = worker.await;
}

#[tokio::test]
async fn contended_user_lock_leaves_the_message_pending_until_released() {
    let pipeline = Pipeline::new().await;
    pipeline.open_campaign(1, 5).await;

    // Another consumer is mid-materialization for this user.
    let held = DistributedMutex::new(pipeline.store.clone(), "order:10");
    assert!(held.try_lock(Duration::from_secs(10)).await.unwrap());

    pipeline
        .service
        .seckill(VoucherId::new(1), UserId::new(10))
        .await
        .unwrap();

    let (shutdown, _) = broadcast::channel(1);
    let worker = pipeline.start_worker(&shutdown);

    // While the lock is held the message is retried but never materialized
    // and never acknowledged.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pipeline.vouchers.order_count().await, 0);
    assert_eq!(pipeline.pending().await, 1);

    held.unlock().await.unwrap();
    pipeline.await_orders(1).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pipeline.vouchers.order_count().await, 1);
    assert_eq!(pipeline.pending().await, 0);

    let _ = shutdown.send(());
    let _ = worker.await;
}

#[tokio::test]
async fn detail_read_is_served_from_cache_after_warm_up() {
    let pipeline = Pipeline::new().await;
    let voucher = pipeline.open_campaign(1, 100).await;

    assert_eq!(
        pipeline.service.voucher_detail(VoucherId::new(1)).await.unwrap(),
        Some(voucher.clone())
    );

    // Replacing the durable row does not show through a fresh cache entry.
    let mut restocked = voucher;
    restocked.stock = 1;
    pipeline.vouchers.insert_voucher(restocked).await;
    assert_eq!(
        pipeline
            .service
            .voucher_detail(VoucherId::new(1))
            .await
            .unwrap()
            .map(|v| v.stock),
        Some(100)
    );
}

#[tokio::test]
async fn malformed_entry_is_dropped_without_stalling_the_stream() {
    let pipeline = Pipeline::new().await;
    pipeline.open_campaign(1, 5).await;

    pipeline
        .store
        .stream_add(
            ORDER_STREAM,
            vec![("garbage".to_string(), "true".to_string())],
        )
        .await
        .unwrap();
    pipeline
        .service
        .seckill(VoucherId::new(1), UserId::new(10))
        .await
        .unwrap();

    let (shutdown, _) = broadcast::channel(1);
    let worker = pipeline.start_worker(&shutdown);
    pipeline.await_orders(1).await;

    let _ = shutdown.send(());
    let _ = worker.await;
}
