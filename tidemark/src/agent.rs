//! Shard agents: the per-shard consumer loop of the projection daemon.

use crate::errors::{DaemonError, DaemonResult, StoreResult};
use crate::loader::ResilientLoader;
use crate::projection::{shard_for_stream, DeadLetter, ErrorHandling, Projection};
use crate::store::EventStore;
use crate::tracker::ShardStateTracker;
use crate::types::{Sequence, ShardName};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Tuning for shard agents.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Maximum events fetched per page.
    pub page_size: usize,
    /// Pause after a failed processing cycle before trying again.
    pub error_backoff: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            page_size: 500,
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// One shard's consumer: follows the high-water mark, applies its slice of
/// the log to the projection, and persists progress after every page.
///
/// Progress is written only after a page has been fully applied, so a crash
/// between pages re-delivers at-least-once from the last persisted sequence.
pub struct ShardAgent<S: EventStore> {
    shard: ShardName,
    projection: Arc<dyn Projection<Event = S::Event>>,
    store: Arc<S>,
    loader: ResilientLoader<S>,
    tracker: Arc<ShardStateTracker>,
    options: AgentOptions,
    position: Sequence,
}

impl<S: EventStore> ShardAgent<S> {
    /// Builds an agent resumed from the shard's persisted progress, or from
    /// zero on first run.
    pub async fn hydrate(
        shard: ShardName,
        projection: Arc<dyn Projection<Event = S::Event>>,
        store: Arc<S>,
        loader: ResilientLoader<S>,
        tracker: Arc<ShardStateTracker>,
        options: AgentOptions,
    ) -> StoreResult<Self> {
        let position = store.load_progress(&shard).await?.unwrap_or_else(Sequence::zero);
        info!(shard = %shard, position = position.get(), "shard agent hydrated");
        tracker.update_shard_progress(shard.clone(), position);
        Ok(Self {
            shard,
            projection,
            store,
            loader,
            tracker,
            options,
            position,
        })
    }

    /// The last fully applied sequence.
    pub fn position(&self) -> Sequence {
        self.position
    }

    /// Applies events up to `ceiling`, page by page, unless `shutdown` fires
    /// between pages.
    async fn process_up_to(
        &mut self,
        ceiling: Sequence,
        shutdown: &watch::Receiver<bool>,
    ) -> DaemonResult<()> {
        while self.position < ceiling {
            if *shutdown.borrow() {
                return Ok(());
            }
            let page = self
                .loader
                .load(&self.shard, self.position, ceiling, self.options.page_size)
                .await?;

            for event in &page.events {
                if shard_for_stream(&event.stream, self.projection.shard_count())
                    != self.shard.index()
                {
                    continue;
                }
                if let Err(apply_error) = self.projection.apply(event).await {
                    match self.projection.error_handling() {
                        ErrorHandling::Strict => {
                            error!(
                                shard = %self.shard,
                                sequence = event.sequence.get(),
                                error = %apply_error,
                                "strict projection refused an event; halting shard"
                            );
                            return Err(DaemonError::ShardHalted {
                                shard: self.shard.clone(),
                                source: apply_error,
                            });
                        }
                        ErrorHandling::DeadLetter => {
                            warn!(
                                shard = %self.shard,
                                sequence = event.sequence.get(),
                                error = %apply_error,
                                "apply failed; recording dead letter and moving on"
                            );
                            self.store
                                .record_dead_letter(DeadLetter::new(
                                    &self.shard,
                                    event.sequence,
                                    event.stream.clone(),
                                    &apply_error,
                                ))
                                .await
                                .map_err(DaemonError::Store)?;
                        }
                    }
                }
            }

            self.position = page.ceiling;
            self.store
                .store_progress(&self.shard, self.position)
                .await
                .map_err(DaemonError::Store)?;
            self.tracker
                .update_shard_progress(self.shard.clone(), self.position);
            debug!(shard = %self.shard, position = self.position.get(), "page applied");
        }
        Ok(())
    }

    /// Runs the agent until `shutdown` turns true.
    ///
    /// Transient failures (loader exhaustion, store hiccups while persisting
    /// progress) back off and retry; a strict-projection halt ends the run
    /// with the halt error. The in-flight page always finishes before a
    /// graceful stop returns.
    #[instrument(skip_all, fields(shard = %self.shard))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> DaemonResult<Sequence> {
        let mut marks = self.tracker.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let mark = *marks.borrow_and_update();
            if mark > self.position {
                match self.process_up_to(mark, &shutdown).await {
                    Ok(()) => continue,
                    Err(halt @ DaemonError::ShardHalted { .. }) => return Err(halt),
                    Err(err) => {
                        warn!(error = %err, "processing cycle failed; backing off");
                        tokio::time::sleep(self.options.error_backoff).await;
                        continue;
                    }
                }
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = marks.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(position = self.position.get(), "shard agent stopped");
        Ok(self.position)
    }

    /// Drains the shard up to a fixed ceiling and stops. Used by rebuilds.
    ///
    /// Unlike [`run`](Self::run), failures are not retried: a rebuild wants
    /// to know immediately rather than stall its timeout away.
    #[instrument(skip_all, fields(shard = %self.shard, ceiling = ceiling.get()))]
    pub async fn catch_up(
        mut self,
        ceiling: Sequence,
        shutdown: watch::Receiver<bool>,
    ) -> DaemonResult<Sequence> {
        self.process_up_to(ceiling, &shutdown).await?;
        Ok(self.position)
    }
}
