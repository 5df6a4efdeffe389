//! Soft and hard deletion: visibility rules, `$all` reconciliation, link
//! cascade on hard delete, tombstones, and stream recreation.

mod common;

use common::{numbered_events, TestStore};
use tidelog::{DeleteMode, Error, ExpectedVersion, Position};

// =============================================================================
// Soft Deletion
// =============================================================================

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn soft_delete_hides_the_stream_but_not_all() {
    let t = TestStore::new().await;

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("S", 2))
        .await
        .unwrap();
    t.store
        .append("s2", ExpectedVersion::Exact(0), numbered_events("T", 1))
        .await
        .unwrap();

    t.store
        .delete_stream("s", ExpectedVersion::Exact(2), DeleteMode::Soft)
        .await
        .unwrap();

    // Direct operations fail.
    assert!(matches!(
        t.store.read_forward("s", Position::from_raw(1), 10).await,
        Err(Error::StreamDeleted { .. })
    ));
    assert!(matches!(
        t.store
            .append("s", ExpectedVersion::Any, numbered_events("S", 1))
            .await,
        Err(Error::StreamDeleted { .. })
    ));

    // $all still sees every event.
    let all = t
        .store
        .read_all_forward(Position::ORIGIN, 10)
        .await
        .unwrap();
    assert_eq!(all.len(), 3);

    t.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn soft_delete_checks_the_expected_version() {
    let t = TestStore::new().await;

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("S", 2))
        .await
        .unwrap();

    assert!(matches!(
        t.store
            .delete_stream("s", ExpectedVersion::Exact(1), DeleteMode::Soft)
            .await,
        Err(Error::WrongExpectedVersion { actual: 2, .. })
    ));

    // Deleting twice fails on the deleted state, not the version.
    t.store
        .delete_stream("s", ExpectedVersion::Any, DeleteMode::Soft)
        .await
        .unwrap();
    assert!(matches!(
        t.store
            .delete_stream("s", ExpectedVersion::Any, DeleteMode::Soft)
            .await,
        Err(Error::StreamDeleted { .. })
    ));

    t.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn soft_deleted_events_remain_in_link_targets() {
    let t = TestStore::new().await;

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("S", 1))
        .await
        .unwrap();
    let e1 = t
        .store
        .read_forward("s", Position::from_raw(1), 1)
        .await
        .unwrap()[0]
        .event_id;
    t.store
        .link("digest", ExpectedVersion::NoStream, &[e1])
        .await
        .unwrap();

    t.store
        .delete_stream("s", ExpectedVersion::Any, DeleteMode::Soft)
        .await
        .unwrap();

    let digest = t
        .store
        .read_forward("digest", Position::from_raw(1), 10)
        .await
        .unwrap();
    assert_eq!(digest.len(), 1);
    assert_eq!(digest[0].event_id, e1);

    t.teardown().await;
}

// =============================================================================
// Hard Deletion
// =============================================================================

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn hard_delete_requires_the_opt_in() {
    let t = TestStore::new().await;

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("S", 1))
        .await
        .unwrap();

    assert!(matches!(
        t.store
            .delete_stream("s", ExpectedVersion::Any, DeleteMode::Hard)
            .await,
        Err(Error::HardDeletesDisabled)
    ));

    t.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn hard_delete_removes_events_links_and_all_entries() {
    let t = TestStore::with_config(|config| config.enable_hard_deletes(true)).await;

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("S", 2))
        .await
        .unwrap();
    t.store
        .append("s2", ExpectedVersion::Exact(0), numbered_events("T", 1))
        .await
        .unwrap();
    let e1 = t
        .store
        .read_forward("s", Position::from_raw(1), 1)
        .await
        .unwrap()[0]
        .event_id;
    t.store
        .link("s2", ExpectedVersion::Exact(1), &[e1])
        .await
        .unwrap();

    t.store
        .delete_stream("s", ExpectedVersion::Any, DeleteMode::Hard)
        .await
        .unwrap();

    // Direct reads report deletion, $all holds only the survivor.
    assert!(matches!(
        t.store.read_forward("s", Position::from_raw(1), 10).await,
        Err(Error::StreamDeleted { .. })
    ));
    let all = t
        .store
        .read_all_forward(Position::ORIGIN, 10)
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].stream_uuid.as_str(), "s2");

    // The linked copy in s2 is gone too; s2's own event survives.
    let s2 = t
        .store
        .read_forward("s2", Position::from_raw(1), 10)
        .await
        .unwrap();
    assert_eq!(s2.len(), 1);
    assert_eq!(s2[0].position.as_raw(), 1);

    // No orphaned rows behind the scenes.
    assert_eq!(t.count("events").await, 1);
    assert_eq!(t.count("stream_events").await, 1);
    assert_eq!(t.count("tombstones").await, 1);

    t.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn hard_deleted_names_can_be_recreated_from_zero() {
    let t = TestStore::with_config(|config| config.enable_hard_deletes(true)).await;

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("S", 3))
        .await
        .unwrap();
    t.store
        .delete_stream("s", ExpectedVersion::Exact(3), DeleteMode::Hard)
        .await
        .unwrap();

    // Resuming the old history is rejected; the tombstone answers instead
    // of "not found".
    assert!(matches!(
        t.store
            .append("s", ExpectedVersion::Exact(3), numbered_events("S", 1))
            .await,
        Err(Error::StreamDeleted { .. })
    ));
    assert!(matches!(
        t.store
            .append("s", ExpectedVersion::StreamExists, numbered_events("S", 1))
            .await,
        Err(Error::StreamDeleted { .. })
    ));

    // Recreation from version 0 clears the tombstone.
    let result = t
        .store
        .append("s", ExpectedVersion::NoStream, numbered_events("S", 1))
        .await
        .unwrap();
    assert_eq!(result.first_version.as_raw(), 1);

    let events = t
        .store
        .read_forward("s", Position::from_raw(1), 10)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(t.count("tombstones").await, 0);

    t.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn hard_delete_purges_a_soft_deleted_stream() {
    let t = TestStore::with_config(|config| config.enable_hard_deletes(true)).await;

    t.store
        .append("s", ExpectedVersion::Exact(0), numbered_events("S", 2))
        .await
        .unwrap();
    t.store
        .delete_stream("s", ExpectedVersion::Any, DeleteMode::Soft)
        .await
        .unwrap();

    // Soft-deleted events are still in $all until the hard delete purges
    // them.
    assert_eq!(
        t.store
            .read_all_forward(Position::ORIGIN, 10)
            .await
            .unwrap()
            .len(),
        2
    );

    t.store
        .delete_stream("s", ExpectedVersion::Any, DeleteMode::Hard)
        .await
        .unwrap();
    assert!(t
        .store
        .read_all_forward(Position::ORIGIN, 10)
        .await
        .unwrap()
        .is_empty());

    t.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set TIDELOG_TEST_DATABASE_URL)"]
async fn deleting_an_unknown_stream_fails() {
    let t = TestStore::with_config(|config| config.enable_hard_deletes(true)).await;

    for mode in [DeleteMode::Soft, DeleteMode::Hard] {
        assert!(matches!(
            t.store
                .delete_stream("ghost", ExpectedVersion::Any, mode)
                .await,
            Err(Error::StreamNotFound { .. })
        ));
    }

    t.teardown().await;
}
