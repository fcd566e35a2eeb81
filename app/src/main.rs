//! Service entry point.
//!
//! Wires the store actor, the admission service, the worker and the HTTP
//! server together, then runs until ctrl-c.

use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use flashsale::{Config, OrderWorker, SeckillService};
use flashsale_core::environment::SystemClock;
use flashsale_core::types::{Voucher, VoucherId};
use flashsale_store::scripts::ORDER_STREAM;
use flashsale_store::{AtomicStore, CacheClient, IdGenerator};
use flashsale_testing::InMemoryVoucherStore;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("loading configuration")?;
    info!(bind_addr = %config.bind_addr, "starting flashsale service");

    let store = AtomicStore::spawn();
    store
        .create_group(ORDER_STREAM, &config.group)
        .await
        .context("creating the order stream consumer group")?;

    let clock = Arc::new(SystemClock);
    let (demo_store, campaigns) = demo_vouchers().await;
    let vouchers = Arc::new(demo_store);
    let service = SeckillService::new(
        store.clone(),
        CacheClient::new(store.clone(), clock.clone()),
        IdGenerator::new(store.clone(), clock.clone()),
        vouchers.clone(),
        clock.clone(),
        config.voucher_cache_ttl,
    );

    for voucher in campaigns {
        service
            .warm_up(&voucher)
            .await
            .context("warming up a campaign")?;
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let worker = OrderWorker::new(store, vouchers, clock, &config)
        .spawn(shutdown_tx.subscribe());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .context("binding the HTTP listener")?;
    axum::serve(listener, flashsale::server::router(service))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving HTTP")?;

    info!("HTTP server stopped, draining the worker");
    let _ = shutdown_tx.send(());
    let _ = worker.await;
    Ok(())
}

/// Seed a demo campaign so the service is exercisable out of the box.
///
/// A relational backend would slot in behind the same trait; the bundled
/// in-memory store keeps the binary self-contained.
async fn demo_vouchers() -> (InMemoryVoucherStore, Vec<Voucher>) {
    let vouchers = InMemoryVoucherStore::new();
    let now = Utc::now();
    let campaign = Voucher {
        id: VoucherId::new(1),
        stock: 100,
        begin_time: now,
        end_time: now + ChronoDuration::hours(24),
    };
    vouchers.insert_voucher(campaign.clone()).await;
    (vouchers, vec![campaign])
}
