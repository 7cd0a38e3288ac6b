//! The rebuild protocol: wipe, replay to a captured mark, resume.

mod support;

use std::sync::Arc;
use std::time::Duration;
use support::{key, projection_name, Store, TallyProjection};
use tidemark::agent::AgentOptions;
use tidemark::daemon::{CancellationSource, Cancellation, DaemonOptions, ProjectionDaemon};
use tidemark::errors::DaemonError;
use tidemark::high_water::HighWaterOptions;
use tidemark::loader::RetryPolicy;
use tidemark::projection::DeadLetter;
use tidemark::store::EventStore;
use tidemark::types::{Sequence, ShardName};

fn fast_options() -> DaemonOptions {
    DaemonOptions {
        high_water: HighWaterOptions {
            poll_interval: Duration::from_millis(20),
            stuck_gap_timeout: Duration::from_millis(200),
        },
        agent: AgentOptions {
            page_size: 10,
            error_backoff: Duration::from_millis(20),
        },
        retry: RetryPolicy {
            base_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        },
        rebuild_shard_timeout: Duration::from_secs(10),
    }
}

fn seq(n: i64) -> Sequence {
    Sequence::try_new(n).unwrap()
}

#[tokio::test]
async fn rebuild_replays_the_whole_log_and_lands_at_the_mark() {
    let store = Arc::new(Store::new());
    support::seed_stream(&store, "a", 6).await;
    support::seed_stream(&store, "b", 4).await;

    let daemon = ProjectionDaemon::new(Arc::clone(&store), fast_options());
    let tally = Arc::new(TallyProjection::new("tally"));
    daemon.register(Arc::clone(&tally) as _);

    daemon
        .rebuild_projection(&projection_name("tally"), &Cancellation::none())
        .await
        .unwrap();

    assert_eq!(tally.applied_count(), 10);
    let shard = ShardName::new(projection_name("tally"), 0);
    assert_eq!(store.load_progress(&shard).await.unwrap(), Some(seq(10)));
}

#[tokio::test]
async fn rebuild_discards_stale_progress_and_replays_from_zero() {
    let store = Arc::new(Store::new());
    support::seed_stream(&store, "a", 5).await;

    // A projection that already consumed the log once.
    let daemon = ProjectionDaemon::new(Arc::clone(&store), fast_options());
    let first = Arc::new(TallyProjection::new("tally"));
    daemon.register(Arc::clone(&first) as _);
    daemon.start_all().await.unwrap();
    assert!(support::wait_until(|| first.applied_count() == 5, Duration::from_secs(5)).await);
    daemon.stop_all().await;

    // Rebuild with a fresh instance: everything is delivered again.
    let fresh = Arc::new(TallyProjection::new("tally"));
    daemon.register(Arc::clone(&fresh) as _);
    daemon
        .rebuild_projection(&projection_name("tally"), &Cancellation::none())
        .await
        .unwrap();
    assert_eq!(fresh.applied_count(), 5);

    let versions: Vec<u64> = fresh
        .applied_events()
        .iter()
        .map(|e| e.version.get())
        .collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn rebuild_deletes_the_projections_dead_letters() {
    let store = Arc::new(Store::new());
    support::seed_stream(&store, "a", 2).await;

    let tally_name = projection_name("tally");
    let other_name = projection_name("other");
    let dead = DeadLetter::new(
        &ShardName::new(tally_name.clone(), 0),
        seq(1),
        key("a"),
        &tidemark::errors::ApplyError::new(seq(1), "old failure"),
    );
    store.record_dead_letter(dead.clone()).await.unwrap();
    let mut foreign = dead;
    foreign.projection = other_name.clone();
    store.record_dead_letter(foreign).await.unwrap();

    let daemon = ProjectionDaemon::new(Arc::clone(&store), fast_options());
    let tally = Arc::new(TallyProjection::new("tally"));
    daemon.register(Arc::clone(&tally) as _);
    daemon
        .rebuild_projection(&tally_name, &Cancellation::none())
        .await
        .unwrap();

    assert!(store.dead_letters_for(&tally_name).await.unwrap().is_empty());
    // Another projection's dead letters are untouched.
    assert_eq!(store.dead_letters_for(&other_name).await.unwrap().len(), 1);
}

#[tokio::test]
async fn rebuild_of_an_empty_log_is_a_quiet_no_op() {
    let store = Arc::new(Store::new());
    let daemon = ProjectionDaemon::new(Arc::clone(&store), fast_options());
    let tally = Arc::new(TallyProjection::new("tally"));
    daemon.register(Arc::clone(&tally) as _);

    daemon
        .rebuild_projection(&projection_name("tally"), &Cancellation::none())
        .await
        .unwrap();
    assert_eq!(tally.applied_count(), 0);
    let shard = ShardName::new(projection_name("tally"), 0);
    assert_eq!(store.load_progress(&shard).await.unwrap(), None);
}

#[tokio::test]
async fn rebuild_of_an_unknown_projection_fails() {
    let store = Arc::new(Store::new());
    let daemon = ProjectionDaemon::new(store, fast_options());
    let err = daemon
        .rebuild_projection(&projection_name("nobody"), &Cancellation::none())
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::UnknownProjection(_)));
}

#[tokio::test]
async fn cancelled_rebuild_stops_before_wiping_anything() {
    let store = Arc::new(Store::new());
    support::seed_stream(&store, "a", 3).await;

    let daemon = ProjectionDaemon::new(Arc::clone(&store), fast_options());
    let tally = Arc::new(TallyProjection::new("tally"));
    daemon.register(Arc::clone(&tally) as _);

    // Leave some progress behind to prove the wipe never ran.
    let shard = ShardName::new(projection_name("tally"), 0);
    store.store_progress(&shard, seq(3)).await.unwrap();

    let source = CancellationSource::new();
    source.cancel();
    let err = daemon
        .rebuild_projection(&projection_name("tally"), &source.token())
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::Cancelled));
    assert_eq!(store.load_progress(&shard).await.unwrap(), Some(seq(3)));
    assert_eq!(tally.applied_count(), 0);
}

#[tokio::test]
async fn sharded_rebuild_drains_every_shard_in_parallel() {
    let store = Arc::new(Store::new());
    for i in 0..6 {
        support::seed_stream(&store, &format!("s-{i}"), 3).await;
    }

    let daemon = ProjectionDaemon::new(Arc::clone(&store), fast_options());
    let tally = Arc::new(TallyProjection::new("tally").with_shards(3));
    daemon.register(Arc::clone(&tally) as _);
    daemon
        .rebuild_projection(&projection_name("tally"), &Cancellation::none())
        .await
        .unwrap();

    assert_eq!(tally.applied_count(), 18);
    for index in 0..3 {
        let shard = ShardName::new(projection_name("tally"), index);
        assert_eq!(store.load_progress(&shard).await.unwrap(), Some(seq(18)));
    }
}

#[tokio::test]
async fn prepare_for_rebuilds_freezes_and_refreshes_the_mark() {
    let store = Arc::new(Store::new());
    support::seed_stream(&store, "a", 4).await;

    let daemon = ProjectionDaemon::new(Arc::clone(&store), fast_options());
    daemon.start_high_water().await;

    let mark = daemon.prepare_for_rebuilds().await.unwrap();
    assert_eq!(mark, seq(4));

    // While frozen, new events do not move the published mark.
    support::seed_stream(&store, "b", 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(daemon.high_water(), seq(4));

    daemon.resume_high_water();
    assert!(support::wait_until(|| daemon.high_water() == seq(6), Duration::from_secs(2)).await);
    daemon.stop_all().await;
}

#[tokio::test]
async fn live_tailing_resumes_after_a_rebuild() {
    let store = Arc::new(Store::new());
    support::seed_stream(&store, "a", 4).await;

    let daemon = ProjectionDaemon::new(Arc::clone(&store), fast_options());
    let tally = Arc::new(TallyProjection::new("tally"));
    daemon.register(Arc::clone(&tally) as _);
    daemon.start_high_water().await;

    daemon
        .rebuild_projection(&projection_name("tally"), &Cancellation::none())
        .await
        .unwrap();
    assert_eq!(tally.applied_count(), 4);

    // Rebuild leaves the projection stopped; restart it for live tailing.
    daemon
        .start_projection(&projection_name("tally"))
        .await
        .unwrap();
    support::append_to_stream(&store, "a", 3).await;
    assert!(support::wait_until(|| tally.applied_count() == 7, Duration::from_secs(5)).await);
    daemon.stop_all().await;
}
