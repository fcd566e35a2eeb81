//! Concurrency tests for the admission script.
//!
//! Verifies the core reservation property: with stock N, exactly N concurrent
//! attempts are accepted no matter how the race resolves.
//!
//! Run with: `cargo test --test admission_race`

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use flashsale_core::types::{OrderId, QueueMessage, UserId, VoucherId};
use flashsale_store::scripts::{self, AdmissionCode};
use flashsale_store::AtomicStore;
use std::collections::HashSet;

async fn admit(store: &AtomicStore, voucher: VoucherId, user: UserId, order: OrderId) -> AdmissionCode {
    store
        .eval(move |ctx| scripts::admission(ctx, voucher, user, order))
        .await
        .expect("store alive")
        .expect("key space intact")
}

#[tokio::test]
async fn stock_n_admits_exactly_n_distinct_users() {
    let store = AtomicStore::spawn();
    let voucher = VoucherId::new(1);
    store.create_group(scripts::ORDER_STREAM, "g1").await.unwrap();
    store
        .set(&scripts::stock_key(voucher), "20", None)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for user in 0..200u64 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            admit(
                &store,
                voucher,
                UserId::new(user),
                OrderId::new(i64::try_from(user).unwrap()),
            )
            .await
        }));
    }

    let mut accepted = 0;
    let mut out_of_stock = 0;
    for h in handles {
        match h.await.unwrap() {
            AdmissionCode::Accepted => accepted += 1,
            AdmissionCode::OutOfStock => out_of_stock += 1,
            AdmissionCode::Duplicate => panic!("distinct users can never be duplicates"),
        }
    }
    assert_eq!(accepted, 20);
    assert_eq!(out_of_stock, 180);

    // Stock bottomed out at zero, never below.
    assert_eq!(
        store.get(&scripts::stock_key(voucher)).await.unwrap(),
        Some("0".to_string())
    );

    // Exactly the accepted set was enqueued, each with a distinct user.
    let delivered = store
        .read_group(scripts::ORDER_STREAM, "g1", "c1", 100, None)
        .await
        .unwrap();
    assert_eq!(delivered.len(), 20);
    let users: HashSet<UserId> = delivered
        .iter()
        .map(|e| QueueMessage::from_fields(&e.fields).unwrap().user_id)
        .collect();
    assert_eq!(users.len(), 20);
}

#[tokio::test]
async fn stock_one_with_two_racing_users_admits_one() {
    let store = AtomicStore::spawn();
    let voucher = VoucherId::new(2);
    store.create_group(scripts::ORDER_STREAM, "g1").await.unwrap();
    store
        .set(&scripts::stock_key(voucher), "1", None)
        .await
        .unwrap();

    let a = {
        let store = store.clone();
        tokio::spawn(
            async move { admit(&store, voucher, UserId::new(1), OrderId::new(101)).await },
        )
    };
    let b = {
        let store = store.clone();
        tokio::spawn(
            async move { admit(&store, voucher, UserId::new(2), OrderId::new(102)).await },
        )
    };

    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    let codes = [a, b];
    assert!(codes.contains(&AdmissionCode::Accepted));
    assert!(codes.contains(&AdmissionCode::OutOfStock));
}

#[tokio::test]
async fn same_user_twice_is_a_duplicate_even_racing() {
    let store = AtomicStore::spawn();
    let voucher = VoucherId::new(3);
    store
        .set(&scripts::stock_key(voucher), "10", None)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for order in 0..10i64 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            admit(&store, voucher, UserId::new(42), OrderId::new(order)).await
        }));
    }

    let mut accepted = 0;
    let mut duplicate = 0;
    for h in handles {
        match h.await.unwrap() {
            AdmissionCode::Accepted => accepted += 1,
            AdmissionCode::Duplicate => duplicate += 1,
            AdmissionCode::OutOfStock => panic!("stock cannot run out here"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(duplicate, 9);
    assert_eq!(
        store.get(&scripts::stock_key(voucher)).await.unwrap(),
        Some("9".to_string())
    );
}
