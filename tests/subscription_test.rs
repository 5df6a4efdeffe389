//! Persistent subscriptions end to end: catch-up, live delivery, resume
//! without redelivery, the in-flight window, nack flows with parking and
//! replay, and single-active failover.

mod common;

use std::time::Duration;

use common::{assert_no_delivery, numbered_events, recv, TestStore};
use tidelog::{ExpectedVersion, NackAction, StartFrom, SubscriptionOptions};

// =============================================================================
// Catch-Up and Live Delivery
// =============================================================================

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn catch_up_delivers_history_in_order() {
    let t = TestStore::new().await;

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("E", 5))
        .await
        .unwrap();

    let mut sub = t
        .store
        .subscribe("s", "reader", SubscriptionOptions::default())
        .await
        .unwrap();

    for expected in 1..=5u64 {
        let delivery = recv(&mut sub).await;
        assert_eq!(delivery.event.position.as_raw(), expected);
        sub.ack(delivery.token).await.unwrap();
    }

    t.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn live_deliveries_follow_appends() {
    let t = TestStore::new().await;

    // Subscribing before the stream exists is fine; events arrive once the
    // stream does.
    let mut sub = t
        .store
        .subscribe("s", "reader", SubscriptionOptions::default())
        .await
        .unwrap();

    t.store
        .append("s", ExpectedVersion::NoStream, numbered_events("E", 2))
        .await
        .unwrap();

    let first = recv(&mut sub).await;
    assert_eq!(first.event.position.as_raw(), 1);
    sub.ack(first.token).await.unwrap();

    let second = recv(&mut sub).await;
    assert_eq!(second.event.position.as_raw(), 2);
    sub.ack(second.token).await.unwrap();

    t.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn all_subscription_follows_the_global_order() {
    let t = TestStore::new().await;

    let mut sub = t
        .store
        .subscribe("$all", "auditor", SubscriptionOptions::default())
        .await
        .unwrap();

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("S", 2))
        .await
        .unwrap();
    t.store
        .append("s2", ExpectedVersion::Exact(0), numbered_events("T", 1))
        .await
        .unwrap();

    let mut streams = Vec::new();
    for expected_seq in 1..=3u64 {
        let delivery = recv(&mut sub).await;
        assert_eq!(delivery.event.global_sequence.as_raw(), expected_seq);
        assert_eq!(delivery.event.position.as_raw(), expected_seq);
        streams.push(delivery.event.stream_uuid.as_str().to_string());
        sub.ack(delivery.token).await.unwrap();
    }
    assert_eq!(streams, vec!["s", "s", "s2"]);

    t.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn start_from_current_skips_history() {
    let t = TestStore::new().await;

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("Old", 2))
        .await
        .unwrap();

    let mut sub = t
        .store
        .subscribe(
            "$all",
            "tail",
            SubscriptionOptions::default().start_from(StartFrom::Current),
        )
        .await
        .unwrap();

    t.store
        .append("s", ExpectedVersion::Exact(2), numbered_events("New", 1))
        .await
        .unwrap();

    let delivery = recv(&mut sub).await;
    assert_eq!(delivery.event.event_type, "New");
    sub.ack(delivery.token).await.unwrap();
    assert_no_delivery(&mut sub, Duration::from_millis(1500)).await;

    t.teardown().await;
}

// =============================================================================
// Resume Semantics
// =============================================================================

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn acked_events_are_not_redelivered_after_resume() {
    let t = TestStore::new().await;

    let mut sub = t
        .store
        .subscribe("$all", "X", SubscriptionOptions::default())
        .await
        .unwrap();

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("S", 2))
        .await
        .unwrap();
    t.store
        .append("s2", ExpectedVersion::Exact(0), numbered_events("T", 1))
        .await
        .unwrap();

    for _ in 0..3 {
        let delivery = recv(&mut sub).await;
        sub.ack(delivery.token).await.unwrap();
    }
    sub.unsubscribe().await.unwrap();

    // Same name resumes from the checkpoint: nothing to redeliver.
    let mut resumed = t
        .store
        .subscribe("$all", "X", SubscriptionOptions::default())
        .await
        .unwrap();
    assert_no_delivery(&mut resumed, Duration::from_millis(1500)).await;

    // New events still flow.
    t.store
        .append("s2", ExpectedVersion::Exact(1), numbered_events("T", 1))
        .await
        .unwrap();
    let delivery = recv(&mut resumed).await;
    assert_eq!(delivery.event.global_sequence.as_raw(), 4);

    t.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn checkpoint_advances_only_over_the_contiguous_acked_prefix() {
    let t = TestStore::new().await;

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("E", 3))
        .await
        .unwrap();

    let mut sub = t
        .store
        .subscribe("s", "gapped", SubscriptionOptions::default())
        .await
        .unwrap();

    let d1 = recv(&mut sub).await;
    let d2 = recv(&mut sub).await;
    let d3 = recv(&mut sub).await;

    // Ack out of order, leaving the first delivery unacked.
    sub.ack(d3.token).await.unwrap();
    sub.ack(d2.token).await.unwrap();
    let _ = d1;
    sub.unsubscribe().await.unwrap();

    // The checkpoint never crossed the unacked position 1: everything is
    // redelivered (consumers are idempotent by contract).
    let mut resumed = t
        .store
        .subscribe("s", "gapped", SubscriptionOptions::default())
        .await
        .unwrap();
    let redelivered = recv(&mut resumed).await;
    assert_eq!(redelivered.event.position.as_raw(), 1);

    t.teardown().await;
}

// =============================================================================
// In-Flight Window
// =============================================================================

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn max_in_flight_bounds_outstanding_deliveries() {
    let t = TestStore::new().await;

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("E", 3))
        .await
        .unwrap();

    let mut sub = t
        .store
        .subscribe(
            "s",
            "narrow",
            SubscriptionOptions::default().max_in_flight(2),
        )
        .await
        .unwrap();

    let d1 = recv(&mut sub).await;
    let d2 = recv(&mut sub).await;
    assert_no_delivery(&mut sub, Duration::from_millis(1500)).await;

    // Freeing one slot releases the third event.
    sub.ack(d1.token).await.unwrap();
    let d3 = recv(&mut sub).await;
    assert_eq!(d3.event.position.as_raw(), 3);

    sub.ack(d2.token).await.unwrap();
    sub.ack(d3.token).await.unwrap();
    t.teardown().await;
}

// =============================================================================
// Nacks, Parking, Replay
// =============================================================================

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn nack_retry_redelivers_with_a_fresh_token() {
    let t = TestStore::new().await;

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("E", 1))
        .await
        .unwrap();

    let mut sub = t
        .store
        .subscribe("s", "retrier", SubscriptionOptions::default())
        .await
        .unwrap();

    let first = recv(&mut sub).await;
    sub.nack(first.token, NackAction::Retry).await.unwrap();

    let second = recv(&mut sub).await;
    assert_eq!(second.event.event_id, first.event.event_id);
    assert_ne!(second.token, first.token);
    sub.ack(second.token).await.unwrap();

    t.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn exhausted_retries_park_and_replay_recovers() {
    let t = TestStore::new().await;

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("E", 2))
        .await
        .unwrap();

    // A window of one makes the delivery order deterministic: the second
    // event cannot be delivered until the first is settled.
    let mut sub = t
        .store
        .subscribe(
            "s",
            "parker",
            SubscriptionOptions::default()
                .max_retries(1)
                .max_in_flight(1),
        )
        .await
        .unwrap();

    // First delivery: one retry allowed, the second nack parks it.
    let d1 = recv(&mut sub).await;
    sub.nack(d1.token, NackAction::Retry).await.unwrap();
    let d1_retry = recv(&mut sub).await;
    assert_eq!(d1_retry.event.position.as_raw(), 1);
    sub.nack(d1_retry.token, NackAction::Retry).await.unwrap();

    // Parking advanced the window: the next event flows.
    let d2 = recv(&mut sub).await;
    assert_eq!(d2.event.position.as_raw(), 2);
    sub.ack(d2.token).await.unwrap();

    // Allow the park write to land before counting.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(t.count("subscription_parked").await, 1);

    // Manual replay delivers the parked event again; acking clears it.
    let replayed_count = t.store.replay_parked("s", "parker").await.unwrap();
    assert_eq!(replayed_count, 1);
    let replayed = recv(&mut sub).await;
    assert_eq!(replayed.event.position.as_raw(), 1);
    sub.ack(replayed.token).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(t.count("subscription_parked").await, 0);

    t.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn nack_park_holds_the_event_without_retrying() {
    let t = TestStore::new().await;

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("E", 2))
        .await
        .unwrap();

    let mut sub = t
        .store
        .subscribe("s", "parker", SubscriptionOptions::default())
        .await
        .unwrap();

    let d1 = recv(&mut sub).await;
    sub.nack(d1.token, NackAction::Park).await.unwrap();

    let d2 = recv(&mut sub).await;
    assert_eq!(d2.event.position.as_raw(), 2);
    sub.ack(d2.token).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(t.count("subscription_parked").await, 1);

    t.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn nack_skip_advances_without_redelivery() {
    let t = TestStore::new().await;

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("E", 2))
        .await
        .unwrap();

    let mut sub = t
        .store
        .subscribe("s", "skipper", SubscriptionOptions::default())
        .await
        .unwrap();

    let d1 = recv(&mut sub).await;
    sub.nack(d1.token, NackAction::Skip).await.unwrap();
    let d2 = recv(&mut sub).await;
    sub.ack(d2.token).await.unwrap();
    sub.unsubscribe().await.unwrap();

    // Skipping counted as progress: nothing is redelivered.
    let mut resumed = t
        .store
        .subscribe("s", "skipper", SubscriptionOptions::default())
        .await
        .unwrap();
    assert_no_delivery(&mut resumed, Duration::from_millis(1500)).await;
    // Nothing was parked either.
    assert_eq!(t.count("subscription_parked").await, 0);

    t.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn unacked_deliveries_are_redelivered_after_ack_timeout() {
    let t = TestStore::new().await;

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("E", 1))
        .await
        .unwrap();

    let mut sub = t
        .store
        .subscribe(
            "s",
            "slow",
            SubscriptionOptions::default()
                .max_retries(5)
                .ack_timeout(Duration::from_millis(300)),
        )
        .await
        .unwrap();

    let first = recv(&mut sub).await;
    // Never acked; the engine redelivers on its own.
    let redelivered = recv(&mut sub).await;
    assert_eq!(redelivered.event.event_id, first.event.event_id);
    assert_ne!(redelivered.token, first.token);
    sub.ack(redelivered.token).await.unwrap();

    t.teardown().await;
}

// =============================================================================
// Single-Active Failover
// =============================================================================

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn second_consumer_waits_and_takes_over_on_disconnect() {
    let t = TestStore::new().await;

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("E", 1))
        .await
        .unwrap();

    let mut active = t
        .store
        .subscribe("s", "ha", SubscriptionOptions::default())
        .await
        .unwrap();
    let mut standby = t
        .store
        .subscribe("s", "ha", SubscriptionOptions::default())
        .await
        .unwrap();

    // Only the active consumer is served.
    let delivery = recv(&mut active).await;
    assert_eq!(delivery.event.position.as_raw(), 1);
    assert_no_delivery(&mut standby, Duration::from_millis(1000)).await;

    // The active consumer leaves without acking; the standby is promoted
    // and the unacked delivery is redelivered from the checkpoint.
    active.unsubscribe().await.unwrap();
    let taken_over = recv(&mut standby).await;
    assert_eq!(taken_over.event.position.as_raw(), 1);
    standby.ack(taken_over.token).await.unwrap();

    t.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn dropping_the_handle_disconnects_and_promotes() {
    let t = TestStore::new().await;

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("E", 1))
        .await
        .unwrap();

    let active = t
        .store
        .subscribe(
            "s",
            "ha",
            SubscriptionOptions::default().consumer_timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap();
    let mut standby = t
        .store
        .subscribe(
            "s",
            "ha",
            SubscriptionOptions::default().consumer_timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap();

    // Dropping the handle closes the inbox; the worker disconnects without
    // waiting for the heartbeat timeout.
    drop(active);

    let taken_over = recv(&mut standby).await;
    assert_eq!(taken_over.event.position.as_raw(), 1);
    standby.ack(taken_over.token).await.unwrap();

    t.teardown().await;
}

// =============================================================================
// Pause / Resume and Administration
// =============================================================================

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn paused_subscriptions_hold_delivery_until_resumed() {
    let t = TestStore::new().await;

    let mut sub = t
        .store
        .subscribe("s", "pausable", SubscriptionOptions::default())
        .await
        .unwrap();
    sub.pause().await.unwrap();

    t.store
        .append("s", ExpectedVersion::NoStream, numbered_events("E", 1))
        .await
        .unwrap();
    assert_no_delivery(&mut sub, Duration::from_millis(1500)).await;

    sub.resume().await.unwrap();
    let delivery = recv(&mut sub).await;
    assert_eq!(delivery.event.position.as_raw(), 1);
    sub.ack(delivery.token).await.unwrap();

    t.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn delete_subscription_forgets_the_checkpoint() {
    let t = TestStore::new().await;

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("E", 2))
        .await
        .unwrap();

    let mut sub = t
        .store
        .subscribe("s", "doomed", SubscriptionOptions::default())
        .await
        .unwrap();
    for _ in 0..2 {
        let delivery = recv(&mut sub).await;
        sub.ack(delivery.token).await.unwrap();
    }
    sub.unsubscribe().await.unwrap();

    t.store.delete_subscription("s", "doomed").await.unwrap();

    // A fresh subscription with the same name starts over from origin.
    let mut reborn = t
        .store
        .subscribe("s", "doomed", SubscriptionOptions::default())
        .await
        .unwrap();
    let delivery = recv(&mut reborn).await;
    assert_eq!(delivery.event.position.as_raw(), 1);

    t.teardown().await;
}
