//! Coordination service integration tests against Redis.
//!
//! Run with: cargo test --test sync_redis --features redis -- --ignored --nocapture
//!
//! Requires: REDIS_URI env var or Redis on localhost:6379
//!
//! Note: Tests use unique key prefixes to avoid data conflicts between runs.

mod sync;

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use rallypoint::config::SyncConfig;
use rallypoint::store::{Cursor, LogStore, RedisLogStore, StoreError};
use rallypoint::sync::{DefaultService, RunScope, Service, StartFrom};

use sync::service_tests::next_item;

fn redis_uri() -> String {
    std::env::var("REDIS_URI").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn test_scope() -> RunScope {
    let run = format!(
        "test_{}",
        &uuid::Uuid::new_v4().to_string().replace('-', "")[..8]
    );
    RunScope::new(run, "sync", "redis")
}

async fn redis_store() -> RedisLogStore {
    RedisLogStore::new(&redis_uri())
        .await
        .expect("Failed to connect to Redis")
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_service_contract() {
    println!("=== Redis Service Tests ===");
    println!("Connecting to: {}", redis_uri());

    let scope = test_scope();
    println!("Using test scope: {}", scope);

    let svc: Arc<dyn Service> = Arc::new(DefaultService::new(
        Arc::new(redis_store().await),
        SyncConfig::for_test(),
    ));

    run_sync_service_tests!(&svc, &scope);

    println!("=== All Redis Service tests PASSED ===");
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_store_primitives() {
    let scope = test_scope();
    let store = redis_store().await;
    let topic = scope.topic_key("primitives");
    let state = scope.state_key("primitives");

    assert_eq!(store.append(&topic, b"1").await.unwrap(), 1);
    assert_eq!(store.append(&topic, b"2").await.unwrap(), 2);

    assert_eq!(store.incr(&state).await.unwrap(), 1);
    let values = store
        .mget(&[state.clone(), scope.state_key("missing")])
        .await
        .unwrap();
    assert_eq!(values, vec![Some(1), None]);

    let tail = store.tail(&topic).await.unwrap();
    assert!(tail > Cursor::BEGINNING);

    let mut reader = store.open_reader().await.unwrap();
    let batches = reader
        .read(&[(topic.clone(), Cursor::BEGINNING)], 10)
        .await
        .unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].entries.len(), 2);
    assert_eq!(batches[0].entries[1].cursor, tail);
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_unblock_interrupts_read() {
    let scope = test_scope();
    let store = Arc::new(redis_store().await);
    let mut reader = store.open_reader().await.unwrap();
    let reader_id = reader.id();
    let topic = scope.topic_key("blocked");

    let handle = tokio::spawn(async move {
        reader.read(&[(topic, Cursor::BEGINNING)], 10).await
    });

    let mut unblocked = false;
    for _ in 0..100 {
        if store.unblock(reader_id).await.unwrap() {
            unblocked = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(unblocked, "reader never blocked");

    let batches = handle.await.unwrap().unwrap();
    assert!(batches.is_empty());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_subscribe_from_latest() {
    let scope = test_scope();
    let svc = DefaultService::new(Arc::new(redis_store().await), SyncConfig::for_test());
    let cx = CancellationToken::new();
    let topic = scope.topic_key("latest");

    svc.publish(&cx, &topic, &json!("before")).await.unwrap();
    let mut sub = svc
        .subscribe_from(&cx, &topic, StartFrom::Latest)
        .await
        .unwrap();
    svc.publish(&cx, &topic, &json!("after")).await.unwrap();

    assert_eq!(next_item(&mut sub).await, json!("after"));
    svc.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_mget_tolerates_non_integer_state() {
    let scope = test_scope();
    let store = redis_store().await;
    let good = scope.state_key("good");
    let bad = scope.state_key("bad");

    store.incr(&good).await.unwrap();
    let client = redis::Client::open(redis_uri()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let _: () = redis::cmd("SET")
        .arg(&bad)
        .arg("not-a-number")
        .query_async(&mut conn)
        .await
        .unwrap();

    let values = store.mget(&[bad, good]).await.unwrap();
    assert_eq!(values, vec![None, Some(1)]);
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_close_releases_connection() {
    let scope = test_scope();
    let store = redis_store().await;
    let state = scope.state_key("closing");

    assert_eq!(store.incr(&state).await.unwrap(), 1);
    store.close().await.unwrap();

    assert!(matches!(store.incr(&state).await, Err(StoreError::Closed)));
    assert!(matches!(store.open_reader().await, Err(StoreError::Closed)));
    store.close().await.unwrap();
}
