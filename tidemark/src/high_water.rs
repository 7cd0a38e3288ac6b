//! High-water mark detection.
//!
//! The high-water mark is the largest sequence number such that every number
//! at or below it is committed. Shard agents only ever read up to the mark,
//! which is what lets them see a gapless, stable prefix of the event log even
//! while writers are still filling in reserved sequences.

use crate::errors::StoreResult;
use crate::tracker::ShardStateTracker;
use crate::types::{ProjectionName, Sequence, ShardName};
use crate::store::EventStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Tuning for the detector's polling loop.
#[derive(Debug, Clone)]
pub struct HighWaterOptions {
    /// How often the polling loop scans for new committed events.
    pub poll_interval: Duration,
    /// How long a gap may stall the mark before it is skipped as abandoned.
    ///
    /// A sequence that was reserved but whose transaction rolled back would
    /// otherwise hold the mark back forever.
    pub stuck_gap_timeout: Duration,
}

impl Default for HighWaterOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            stuck_gap_timeout: Duration::from_secs(5),
        }
    }
}

/// Reserved progress-table row the mark is persisted under.
///
/// Picking up a persisted mark on restart keeps an already-skipped gap from
/// stalling the detector for another full stuck-gap timeout.
fn mark_shard() -> ShardName {
    let name = ProjectionName::try_new("high-water-mark")
        .expect("the reserved mark row name is non-empty");
    ShardName::new(name, 0)
}

#[derive(Debug)]
struct DetectorState {
    mark: Sequence,
    /// The gap currently holding the mark back, and when it was first seen.
    pending_gap: Option<(Sequence, tokio::time::Instant)>,
    /// Whether the persisted mark has been loaded yet.
    hydrated: bool,
}

/// Polls the store's gap scan and publishes mark advances to the tracker.
///
/// The mark never decreases. A gap younger than the stuck-gap timeout holds
/// the mark just below it; once the timeout passes the gap is declared
/// abandoned and skipped with a warning. Advances are written through to the
/// store's progress table, so a restarted detector resumes where the last
/// one left off.
#[derive(Debug)]
pub struct HighWaterDetector<S> {
    store: Arc<S>,
    tracker: Arc<ShardStateTracker>,
    options: HighWaterOptions,
    paused: AtomicBool,
    state: Mutex<DetectorState>,
}

impl<S: EventStore> HighWaterDetector<S> {
    /// Creates a detector publishing into `tracker`.
    pub fn new(store: Arc<S>, tracker: Arc<ShardStateTracker>, options: HighWaterOptions) -> Self {
        let mark = tracker.high_water();
        Self {
            store,
            tracker,
            options,
            paused: AtomicBool::new(false),
            state: Mutex::new(DetectorState {
                mark,
                pending_gap: None,
                hydrated: false,
            }),
        }
    }

    /// Runs one detection pass and returns the (possibly advanced) mark.
    ///
    /// Safe to call concurrently with the polling loop; passes serialize on
    /// the internal state.
    pub async fn check_now(&self) -> StoreResult<Sequence> {
        let mut state = self.state.lock().await;
        if !state.hydrated {
            if let Some(persisted) = self.store.load_progress(&mark_shard()).await? {
                if persisted > state.mark {
                    debug!(mark = persisted.get(), "resuming from the persisted high-water mark");
                    state.mark = persisted;
                    self.tracker.publish_high_water(persisted);
                }
            }
            state.hydrated = true;
        }
        let report = self.store.gap_report(state.mark).await?;

        let candidate = match report.first_gap {
            None => {
                state.pending_gap = None;
                report.max_sequence
            }
            Some(gap) => match state.pending_gap {
                Some((seen, since)) if seen == gap => {
                    if since.elapsed() >= self.options.stuck_gap_timeout {
                        warn!(
                            sequence = gap.get(),
                            timeout_ms = self.options.stuck_gap_timeout.as_millis() as u64,
                            "sequence gap outlived its timeout; skipping it as abandoned"
                        );
                        state.pending_gap = None;
                        // The skipped number counts as covered; anything past
                        // it gets picked up on the next pass.
                        gap
                    } else {
                        gap.prev()
                    }
                }
                _ => {
                    state.pending_gap = Some((gap, tokio::time::Instant::now()));
                    gap.prev()
                }
            },
        };

        if candidate > state.mark {
            self.store.store_progress(&mark_shard(), candidate).await?;
            debug!(from = state.mark.get(), to = candidate.get(), "high-water mark advanced");
            state.mark = candidate;
            self.tracker.publish_high_water(candidate);
        }
        Ok(state.mark)
    }

    /// The mark as of the last pass.
    pub async fn mark(&self) -> Sequence {
        self.state.lock().await.mark
    }

    /// Suspends the polling loop without tearing it down.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resumes a paused polling loop.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Whether the polling loop is currently paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Spawns the polling loop. It runs until `shutdown` turns true; store
    /// failures are logged and retried on the next tick.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                if *shutdown.borrow() {
                    break;
                }
                if self.is_paused() {
                    continue;
                }
                if let Err(err) = self.check_now().await {
                    error!(error = %err, "high-water detection pass failed");
                }
            }
            debug!("high-water polling loop stopped");
        })
    }
}
