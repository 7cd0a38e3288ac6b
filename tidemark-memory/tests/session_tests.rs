//! Write-pipeline behavior through real sessions over the in-memory store.

mod support;

use std::sync::Arc;
use support::{key, Account, LedgerEvent, Store};
use tidemark::errors::StoreError;
use tidemark::session::Session;
use tidemark::store::EventStore;
use tidemark::stream::Snapshot;
use tidemark::types::Version;

fn deposit(amount: u64) -> LedgerEvent {
    LedgerEvent::Deposited { amount }
}

#[tokio::test]
async fn stream_version_tracks_event_count_across_batches() {
    let store = Arc::new(Store::new());
    let mut session = Session::new(Arc::clone(&store));

    // [A], then [B, B, B], then [C, C]: the stream ends at version 6.
    session.start_stream(key("acct"), vec![deposit(1)]);
    session.save_changes().await.unwrap();
    session.append(key("acct"), vec![deposit(2), deposit(3), deposit(4)]);
    session.save_changes().await.unwrap();
    session.append(key("acct"), vec![deposit(5), deposit(6)]);
    let outcome = session.save_changes().await.unwrap();

    assert_eq!(outcome[&key("acct")], Version::new(6));
    let state = store.stream_state(&key("acct")).await.unwrap().unwrap();
    assert_eq!(state.version, Version::new(6));

    let events = store.read_stream(&key("acct"), Version::zero()).await.unwrap();
    assert_eq!(events.len(), 6);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.version, Version::new(i as u64 + 1));
    }
}

#[tokio::test]
async fn sequences_are_globally_ordered_across_streams() {
    let store = Arc::new(Store::new());
    let mut session = Session::new(Arc::clone(&store));
    session.start_stream(key("a"), vec![deposit(1), deposit(2)]);
    session.start_stream(key("b"), vec![deposit(3)]);
    session.save_changes().await.unwrap();

    let stats = store.statistics().await.unwrap();
    assert_eq!(stats.event_count, 3);
    assert_eq!(stats.max_sequence.get(), 3);

    let a = store.read_stream(&key("a"), Version::zero()).await.unwrap();
    let b = store.read_stream(&key("b"), Version::zero()).await.unwrap();
    let mut all: Vec<i64> = a.iter().chain(b.iter()).map(|e| e.sequence.get()).collect();
    all.sort_unstable();
    assert_eq!(all, vec![1, 2, 3]);
}

#[tokio::test]
async fn save_with_nothing_queued_is_a_no_op() {
    let store = Arc::new(Store::new());
    let mut session = Session::new(Arc::clone(&store));
    let outcome = session.save_changes().await.unwrap();
    assert!(outcome.is_empty());
}

#[tokio::test]
async fn append_to_unknown_stream_reports_not_found() {
    let store = Arc::new(Store::new());
    let mut session = Session::new(Arc::clone(&store));
    session.append(key("ghost"), vec![deposit(1)]);
    let err = session.save_changes().await.unwrap_err();
    assert!(matches!(err, StoreError::StreamNotFound(_)));
}

#[tokio::test]
async fn fetch_for_writing_rejects_a_stale_expected_version_immediately() {
    let store = Arc::new(Store::new());
    support::seed_stream(&store, "acct", 6).await;

    let mut session = Session::new(Arc::clone(&store));
    let handle = session
        .fetch_for_writing::<Account>(key("acct"), Some(Version::new(6)))
        .await
        .unwrap();
    assert_eq!(handle.version_at_fetch(), Version::new(6));
    assert_eq!(handle.aggregate().entries, 6);

    let err = session
        .fetch_for_writing::<Account>(key("acct"), Some(Version::new(5)))
        .await
        .unwrap_err();
    match err {
        StoreError::ConcurrencyConflict {
            aggregate_type,
            expected,
            actual,
            ..
        } => {
            assert_eq!(aggregate_type, "Account");
            assert_eq!(expected, Version::new(5));
            assert_eq!(actual, Version::new(6));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn interleaved_writer_surfaces_at_flush_time() {
    let store = Arc::new(Store::new());
    support::seed_stream(&store, "acct", 2).await;

    let mut first = Session::new(Arc::clone(&store));
    let mut second = Session::new(Arc::clone(&store));
    let mut handle_one = first
        .fetch_for_writing::<Account>(key("acct"), None)
        .await
        .unwrap();
    let mut handle_two = second
        .fetch_for_writing::<Account>(key("acct"), None)
        .await
        .unwrap();

    handle_one.append(deposit(10));
    first.queue_writes(handle_one);
    first.save_changes().await.unwrap();

    // The second session's guard is the version it observed at fetch time,
    // which the first session has since advanced past.
    handle_two.append(deposit(20));
    second.queue_writes(handle_two);
    let err = second.save_changes().await.unwrap_err();
    assert!(matches!(err, StoreError::ConcurrencyConflict { .. }));
}

#[tokio::test]
async fn conflicts_on_independent_streams_are_aggregated() {
    let store = Arc::new(Store::new());
    support::seed_stream(&store, "a", 1).await;
    support::seed_stream(&store, "b", 1).await;

    let mut session = Session::new(Arc::clone(&store));
    session.append_exact(key("a"), Version::new(5), vec![deposit(1)]);
    session.append_exact(key("b"), Version::new(9), vec![deposit(1)]);
    let err = session.save_changes().await.unwrap_err();

    assert!(err.is_conflict());
    match err {
        StoreError::ConflictBatch { conflicts } => {
            assert_eq!(conflicts.len(), 2);
            assert!(conflicts
                .iter()
                .all(|c| matches!(c, StoreError::ConcurrencyConflict { .. })));
        }
        other => panic!("expected aggregated conflicts, got: {other}"),
    }
}

#[tokio::test]
async fn starting_a_stream_twice_collides() {
    let store = Arc::new(Store::new());
    support::seed_stream(&store, "acct", 1).await;

    let mut session = Session::new(Arc::clone(&store));
    session.start_stream(key("acct"), vec![deposit(1)]);
    let err = session.save_changes().await.unwrap_err();
    assert!(matches!(err, StoreError::StreamCollision(_)));
}

#[tokio::test]
async fn failed_save_discards_the_batch() {
    let store = Arc::new(Store::new());
    support::seed_stream(&store, "acct", 1).await;

    let mut session = Session::new(Arc::clone(&store));
    session.start_stream(key("acct"), vec![deposit(1)]);
    session.save_changes().await.unwrap_err();
    assert_eq!(session.pending_actions(), 0);

    // The session keeps working after the failure.
    session.append(key("acct"), vec![deposit(2)]);
    session.save_changes().await.unwrap();
    let state = store.stream_state(&key("acct")).await.unwrap().unwrap();
    assert_eq!(state.version, Version::new(2));
}

#[tokio::test]
async fn exclusive_fetch_fails_fast_while_locked_and_succeeds_after_release() {
    let store = Arc::new(Store::new());
    support::seed_stream(&store, "acct", 3).await;

    let mut holder = Session::new(Arc::clone(&store));
    let _handle = holder
        .fetch_for_exclusive_writing::<Account>(key("acct"))
        .await
        .unwrap();

    let mut contender = Session::new(Arc::clone(&store));
    let err = contender
        .fetch_for_exclusive_writing::<Account>(key("acct"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::StreamLocked(_)));

    // Dropping the holding session releases the lock on every path.
    holder.close();
    contender
        .fetch_for_exclusive_writing::<Account>(key("acct"))
        .await
        .unwrap();
}

#[tokio::test]
async fn write_handle_folds_queued_events_into_the_aggregate() {
    let store = Arc::new(Store::new());
    support::seed_stream(&store, "acct", 2).await;

    let mut session = Session::new(Arc::clone(&store));
    let mut handle = session
        .fetch_for_writing::<Account>(key("acct"), None)
        .await
        .unwrap();
    assert_eq!(handle.aggregate().balance, 2);

    handle.append(LedgerEvent::Withdrawn { amount: 5 });
    assert_eq!(handle.aggregate().balance, -3);
    assert_eq!(handle.projected_version(), Version::new(3));

    session.queue_writes(handle);
    let outcome = session.save_changes().await.unwrap();
    assert_eq!(outcome[&key("acct")], Version::new(3));
}

#[tokio::test]
async fn fetch_starts_from_a_snapshot_and_folds_only_the_tail() {
    let store = Arc::new(Store::new());
    support::seed_stream(&store, "acct", 3).await;

    // A snapshot that deliberately disagrees with a from-scratch fold, so the
    // test can tell which starting point was used.
    store
        .store_snapshot(Snapshot {
            stream: key("acct"),
            version: Version::new(2),
            data: serde_json::to_value(Account {
                balance: 100,
                entries: 2,
            })
            .unwrap(),
        })
        .await
        .unwrap();

    let mut session = Session::new(Arc::clone(&store));
    let handle = session
        .fetch_for_writing::<Account>(key("acct"), None)
        .await
        .unwrap();
    // Snapshot state plus the one event past it.
    assert_eq!(handle.aggregate().balance, 101);
    assert_eq!(handle.aggregate().entries, 3);
    assert_eq!(handle.version_at_fetch(), Version::new(3));
}

#[tokio::test]
async fn implicit_append_uses_the_last_observed_version_as_guard() {
    let store = Arc::new(Store::new());
    support::seed_stream(&store, "acct", 1).await;

    let mut session = Session::new(Arc::clone(&store));
    // Observe version 1 through a fetch.
    let _ = session
        .fetch_for_writing::<Account>(key("acct"), None)
        .await
        .unwrap();

    // Another writer advances the stream behind this session's back.
    support::append_to_stream(&store, "acct", 1).await;

    session.append(key("acct"), vec![deposit(1)]);
    let err = session.save_changes().await.unwrap_err();
    assert!(matches!(err, StoreError::ConcurrencyConflict { .. }));
}
