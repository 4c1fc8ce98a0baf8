//! Service contract tests.
//!
//! Every test takes a [`RunScope`] and derives its keys from it, so runs
//! against a shared Redis never see each other's data.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use rallypoint::sync::{RunScope, Service, ServiceExt, Subscription, SyncError};

pub const WAIT: Duration = Duration::from_secs(10);

pub async fn next_item(sub: &mut Subscription) -> serde_json::Value {
    tokio::time::timeout(WAIT, sub.next())
        .await
        .expect("timed out waiting for item")
        .expect("subscription ended early")
}

// =============================================================================
// Sequencing and ordering
// =============================================================================

/// Concurrent publishers get exactly the sequence numbers 1..=N.
pub async fn test_sequence_monotonicity(svc: &Arc<dyn Service>, scope: &RunScope) {
    const PUBLISHERS: i64 = 1000;
    let topic = scope.topic_key("monotonic");

    let handles = (0..PUBLISHERS).map(|n| {
        let svc = Arc::clone(svc);
        let topic = topic.clone();
        tokio::spawn(async move {
            svc.publish(&CancellationToken::new(), &topic, &json!({ "n": n }))
                .await
        })
    });

    let seqs: HashSet<i64> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("publisher panicked").expect("publish should succeed"))
        .collect();

    let expected: HashSet<i64> = (1..=PUBLISHERS).collect();
    assert_eq!(seqs, expected, "sequence numbers must be a permutation of 1..=N");
}

/// A subscriber registering after M entries sees those M in order, then
/// what came later.
pub async fn test_delivery_order(svc: &Arc<dyn Service>, scope: &RunScope) {
    let cx = CancellationToken::new();
    let topic = scope.topic_key("ordered");

    for n in 0..20 {
        svc.publish(&cx, &topic, &json!(n)).await.unwrap();
    }
    let mut sub = svc.subscribe(&cx, &topic).await.unwrap();
    for n in 20..25 {
        svc.publish(&cx, &topic, &json!(n)).await.unwrap();
    }

    for n in 0..25 {
        assert_eq!(next_item(&mut sub).await, json!(n), "item {n} out of order");
    }
    cx.cancel();
}

// =============================================================================
// Barriers
// =============================================================================

pub async fn test_barrier_zero_target(svc: &Arc<dyn Service>, scope: &RunScope) {
    let state = scope.state_key("zero");

    tokio::time::timeout(
        Duration::from_millis(100),
        svc.barrier(&CancellationToken::new(), &state, 0),
    )
    .await
    .expect("zero-target barrier should not wait")
    .expect("zero-target barrier should succeed");
}

pub async fn test_barrier_already_satisfied(svc: &Arc<dyn Service>, scope: &RunScope) {
    let cx = CancellationToken::new();
    let state = scope.state_key("satisfied");

    for _ in 0..3 {
        svc.signal_entry(&cx, &state).await.unwrap();
    }

    tokio::time::timeout(WAIT, svc.barrier(&cx, &state, 3))
        .await
        .expect("satisfied barrier should resolve")
        .unwrap();
}

/// Cancelling one waiter leaves another on the same state untouched.
pub async fn test_barrier_cancellation_isolated(svc: &Arc<dyn Service>, scope: &RunScope) {
    let state = scope.state_key("cancel");
    let cancelled_cx = CancellationToken::new();
    let other_cx = CancellationToken::new();

    let cancelled = {
        let svc = Arc::clone(svc);
        let state = state.clone();
        let cx = cancelled_cx.clone();
        tokio::spawn(async move { svc.barrier(&cx, &state, 5).await })
    };
    let other = {
        let svc = Arc::clone(svc);
        let state = state.clone();
        let cx = other_cx.clone();
        tokio::spawn(async move { svc.barrier(&cx, &state, 1).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    cancelled_cx.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), cancelled)
        .await
        .expect("cancelled barrier should return promptly")
        .unwrap();
    assert!(matches!(result, Err(SyncError::Canceled)));
    assert!(!other.is_finished());

    svc.signal_entry(&other_cx, &state).await.unwrap();
    tokio::time::timeout(WAIT, other)
        .await
        .expect("remaining barrier should resolve")
        .unwrap()
        .unwrap();
}

/// Ten callers signal and wait for ten; nobody is released early.
pub async fn test_signal_and_wait_all_parties(svc: &Arc<dyn Service>, scope: &RunScope) {
    const PARTIES: i64 = 10;
    let state = scope.state_key("ready");

    let spawn_party = |svc: Arc<dyn Service>, state: String| {
        tokio::spawn(async move {
            svc.signal_and_wait(&CancellationToken::new(), &state, PARTIES)
                .await
        })
    };

    let early: Vec<_> = (0..PARTIES - 1)
        .map(|_| spawn_party(Arc::clone(svc), state.clone()))
        .collect();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        early.iter().all(|h| !h.is_finished()),
        "no party may pass before the last one signals"
    );

    let last = spawn_party(Arc::clone(svc), state.clone());

    let mut seqs = HashSet::new();
    for handle in early.into_iter().chain(std::iter::once(last)) {
        let seq = tokio::time::timeout(WAIT, handle)
            .await
            .expect("party should be released")
            .unwrap()
            .expect("signal_and_wait should succeed");
        seqs.insert(seq);
    }
    assert_eq!(seqs, (1..=PARTIES).collect::<HashSet<_>>());
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Adding subscriptions on other topics while one topic is being delivered
/// neither drops nor duplicates its entries.
pub async fn test_subscription_isolation(svc: &Arc<dyn Service>, scope: &RunScope) {
    const ENTRIES: i64 = 200;
    let cx = CancellationToken::new();
    let busy = scope.topic_key("busy");

    let mut sub = svc.subscribe(&cx, &busy).await.unwrap();

    let publisher = {
        let svc = Arc::clone(svc);
        let busy = busy.clone();
        let cx = cx.clone();
        tokio::spawn(async move {
            for n in 0..ENTRIES {
                svc.publish(&cx, &busy, &json!(n)).await.unwrap();
            }
        })
    };

    let mut churn = Vec::new();
    for i in 0..10 {
        let other = svc
            .subscribe(&cx, &scope.topic_key(&format!("churn-{i}")))
            .await
            .unwrap();
        churn.push(other);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    for n in 0..ENTRIES {
        assert_eq!(next_item(&mut sub).await, json!(n));
    }
    publisher.await.unwrap();

    // Nothing beyond what was published.
    let extra = tokio::time::timeout(Duration::from_millis(100), sub.next()).await;
    assert!(extra.is_err(), "received a duplicate entry");
    cx.cancel();
}

/// A cancelled subscriber ends cleanly while a sibling keeps receiving.
pub async fn test_subscription_cancel_isolated(svc: &Arc<dyn Service>, scope: &RunScope) {
    let cx = CancellationToken::new();
    let topic = scope.topic_key("siblings");
    let leaving_cx = cx.child_token();

    let mut leaving = svc.subscribe(&leaving_cx, &topic).await.unwrap();
    let mut staying = svc.subscribe(&cx, &topic).await.unwrap();

    svc.publish(&cx, &topic, &json!("one")).await.unwrap();
    assert_eq!(next_item(&mut leaving).await, json!("one"));
    assert_eq!(next_item(&mut staying).await, json!("one"));

    leaving_cx.cancel();
    assert!(tokio::time::timeout(WAIT, leaving.next())
        .await
        .unwrap()
        .is_none());
    leaving.done().await.expect("cancellation is a graceful end");

    svc.publish(&cx, &topic, &json!("two")).await.unwrap();
    assert_eq!(next_item(&mut staying).await, json!("two"));
    cx.cancel();
}

#[macro_export]
macro_rules! run_sync_service_tests {
    ($svc:expr, $scope:expr) => {
        use $crate::sync::service_tests::*;

        test_sequence_monotonicity($svc, $scope).await;
        println!("  test_sequence_monotonicity: PASSED");

        test_delivery_order($svc, $scope).await;
        println!("  test_delivery_order: PASSED");

        test_barrier_zero_target($svc, $scope).await;
        println!("  test_barrier_zero_target: PASSED");

        test_barrier_already_satisfied($svc, $scope).await;
        println!("  test_barrier_already_satisfied: PASSED");

        test_barrier_cancellation_isolated($svc, $scope).await;
        println!("  test_barrier_cancellation_isolated: PASSED");

        test_signal_and_wait_all_parties($svc, $scope).await;
        println!("  test_signal_and_wait_all_parties: PASSED");

        test_subscription_isolation($svc, $scope).await;
        println!("  test_subscription_isolation: PASSED");

        test_subscription_cancel_isolated($svc, $scope).await;
        println!("  test_subscription_cancel_isolated: PASSED");
    };
}
