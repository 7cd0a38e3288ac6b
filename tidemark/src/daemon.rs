//! The projection daemon: supervises the high-water detector and one agent
//! per projection shard, and runs the rebuild protocol.

use crate::agent::{AgentOptions, ShardAgent};
use crate::errors::{DaemonError, DaemonResult, StoreResult};
use crate::high_water::{HighWaterDetector, HighWaterOptions};
use crate::loader::{ResilientLoader, RetryPolicy};
use crate::projection::Projection;
use crate::store::EventStore;
use crate::tracker::ShardStateTracker;
use crate::types::{ProjectionName, Sequence, ShardName};
use futures::future::try_join_all;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// A cancellation signal handed to long-running daemon operations.
///
/// Cloneable and cheap; [`Cancellation::none`] never fires, for callers that
/// have no reason to cancel.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    /// A signal that never fires.
    pub fn none() -> Self {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        Self { rx }
    }

    /// Whether the source has cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the source cancels; pends forever if it never does.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Source dropped without cancelling.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Owner side of a [`Cancellation`].
#[derive(Debug)]
pub struct CancellationSource {
    tx: watch::Sender<bool>,
}

impl CancellationSource {
    /// Creates an un-fired source.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A signal tied to this source.
    pub fn token(&self) -> Cancellation {
        Cancellation {
            rx: self.tx.subscribe(),
        }
    }

    /// Fires the signal. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Tuning for the daemon and everything it supervises.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// High-water detector tuning.
    pub high_water: HighWaterOptions,
    /// Shard agent tuning.
    pub agent: AgentOptions,
    /// Retry budget for page fetches.
    pub retry: RetryPolicy,
    /// How long a rebuild waits for each shard to drain before giving up.
    pub rebuild_shard_timeout: Duration,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            high_water: HighWaterOptions::default(),
            agent: AgentOptions::default(),
            retry: RetryPolicy::default(),
            rebuild_shard_timeout: Duration::from_secs(300),
        }
    }
}

struct RunningShard {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<DaemonResult<Sequence>>,
}

/// Supervises projections over one store.
///
/// One daemon instance owns the high-water polling loop and zero or more
/// shard agents. Agents stop gracefully (they finish their in-flight page)
/// except during a rebuild, which hard-stops them.
pub struct ProjectionDaemon<S: EventStore> {
    store: Arc<S>,
    tracker: Arc<ShardStateTracker>,
    detector: Arc<HighWaterDetector<S>>,
    options: DaemonOptions,
    projections: RwLock<HashMap<ProjectionName, Arc<dyn Projection<Event = S::Event>>>>,
    agents: Mutex<HashMap<ShardName, RunningShard>>,
    detector_loop: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl<S: EventStore> ProjectionDaemon<S> {
    /// Creates a daemon over `store`. Nothing runs until
    /// [`start_all`](Self::start_all) or the granular start calls.
    pub fn new(store: Arc<S>, options: DaemonOptions) -> Self {
        let tracker = Arc::new(ShardStateTracker::new());
        let detector = Arc::new(HighWaterDetector::new(
            Arc::clone(&store),
            Arc::clone(&tracker),
            options.high_water.clone(),
        ));
        Self {
            store,
            tracker,
            detector,
            options,
            projections: RwLock::new(HashMap::new()),
            agents: Mutex::new(HashMap::new()),
            detector_loop: Mutex::new(None),
        }
    }

    /// The shared tracker, for observing the mark and shard progress.
    pub fn tracker(&self) -> &Arc<ShardStateTracker> {
        &self.tracker
    }

    /// The current high-water mark.
    pub fn high_water(&self) -> Sequence {
        self.tracker.high_water()
    }

    /// Registers a projection. Idempotent by name; re-registering replaces
    /// the previous instance.
    pub fn register(&self, projection: Arc<dyn Projection<Event = S::Event>>) {
        let name = projection.name();
        self.projections
            .write()
            .expect("projections lock poisoned")
            .insert(name, projection);
    }

    fn lookup(&self, name: &ProjectionName) -> DaemonResult<Arc<dyn Projection<Event = S::Event>>> {
        self.projections
            .read()
            .expect("projections lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| DaemonError::UnknownProjection(name.clone()))
    }

    /// Starts the high-water polling loop if it is not already running.
    pub async fn start_high_water(&self) {
        let mut slot = self.detector_loop.lock().await;
        if slot.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        let handle = Arc::clone(&self.detector).spawn(rx);
        *slot = Some((tx, handle));
        info!("high-water polling started");
    }

    /// Stops the high-water polling loop.
    pub async fn stop_high_water(&self) {
        if let Some((tx, handle)) = self.detector_loop.lock().await.take() {
            let _ = tx.send(true);
            let _ = handle.await;
            info!("high-water polling stopped");
        }
    }

    /// Pauses high-water polling and forces one fresh detection pass, so a
    /// caller about to issue rebuilds works from a stable, current mark.
    pub async fn prepare_for_rebuilds(&self) -> StoreResult<Sequence> {
        self.detector.pause();
        self.detector.check_now().await
    }

    /// Resumes high-water polling after [`prepare_for_rebuilds`].
    ///
    /// [`prepare_for_rebuilds`]: Self::prepare_for_rebuilds
    pub fn resume_high_water(&self) {
        self.detector.resume();
    }

    async fn spawn_agent(
        &self,
        shard: ShardName,
        projection: Arc<dyn Projection<Event = S::Event>>,
    ) -> DaemonResult<()> {
        let mut agents = self.agents.lock().await;
        if agents.contains_key(&shard) {
            return Err(DaemonError::ShardAlreadyRunning(shard));
        }
        let agent = ShardAgent::hydrate(
            shard.clone(),
            projection,
            Arc::clone(&self.store),
            ResilientLoader::new(Arc::clone(&self.store), self.options.retry.clone()),
            Arc::clone(&self.tracker),
            self.options.agent.clone(),
        )
        .await?;
        let (tx, rx) = watch::channel(false);
        let join = tokio::spawn(agent.run(rx));
        agents.insert(shard, RunningShard { shutdown: tx, join });
        Ok(())
    }

    /// Starts one shard of a registered projection.
    pub async fn start_shard(&self, shard: ShardName) -> DaemonResult<()> {
        let projection = self.lookup(shard.projection())?;
        self.spawn_agent(shard, projection).await
    }

    /// Starts every shard of a registered projection.
    #[instrument(skip(self), fields(projection = %name))]
    pub async fn start_projection(&self, name: &ProjectionName) -> DaemonResult<()> {
        let projection = self.lookup(name)?;
        for index in 0..projection.shard_count().max(1) {
            let shard = ShardName::new(name.clone(), index);
            self.spawn_agent(shard, Arc::clone(&projection)).await?;
        }
        Ok(())
    }

    /// Gracefully stops one shard and returns its final position.
    ///
    /// The agent finishes its in-flight page first; progress has already
    /// been persisted for everything applied.
    pub async fn stop_shard(&self, shard: &ShardName) -> DaemonResult<Sequence> {
        let running = self
            .agents
            .lock()
            .await
            .remove(shard)
            .ok_or_else(|| DaemonError::ShardNotRunning(shard.clone()))?;
        let _ = running.shutdown.send(true);
        match running.join.await {
            Ok(result) => result,
            Err(join_error) => {
                warn!(shard = %shard, error = %join_error, "shard task did not stop cleanly");
                Err(DaemonError::Cancelled)
            }
        }
    }

    /// Gracefully stops every running shard of a projection.
    pub async fn stop_projection(&self, name: &ProjectionName) -> DaemonResult<()> {
        let shards = self.running_shards_of(name).await;
        try_join_all(shards.iter().map(|shard| self.stop_shard(shard))).await?;
        Ok(())
    }

    /// Starts high-water polling and every shard of every registered
    /// projection.
    pub async fn start_all(&self) -> DaemonResult<()> {
        self.start_high_water().await;
        let names: Vec<ProjectionName> = self
            .projections
            .read()
            .expect("projections lock poisoned")
            .keys()
            .cloned()
            .collect();
        for name in names {
            self.start_projection(&name).await?;
        }
        Ok(())
    }

    /// Gracefully stops every shard, then the polling loop.
    pub async fn stop_all(&self) {
        let shards: Vec<ShardName> = self.agents.lock().await.keys().cloned().collect();
        for shard in shards {
            if let Err(err) = self.stop_shard(&shard).await {
                warn!(shard = %shard, error = %err, "shard stopped with an error");
            }
        }
        self.stop_high_water().await;
    }

    /// Shards of `name` currently running under this daemon.
    pub async fn running_shards_of(&self, name: &ProjectionName) -> Vec<ShardName> {
        self.agents
            .lock()
            .await
            .keys()
            .filter(|shard| shard.projection() == name)
            .cloned()
            .collect()
    }

    /// Hard-stops a projection's running agents without waiting for their
    /// in-flight page. Only rebuilds do this.
    async fn hard_stop_projection(&self, name: &ProjectionName) {
        let mut agents = self.agents.lock().await;
        let shards: Vec<ShardName> = agents
            .keys()
            .filter(|shard| shard.projection() == name)
            .cloned()
            .collect();
        for shard in shards {
            if let Some(running) = agents.remove(&shard) {
                let _ = running.shutdown.send(true);
                running.join.abort();
            }
        }
    }

    /// Rebuilds a projection from the beginning of the log.
    ///
    /// The protocol: hard-stop the projection's agents; force a detection
    /// pass if the mark is still zero and abort quietly when the log is
    /// empty; delete the projection's durable progress and dead letters;
    /// then drain every shard in parallel from zero up to the mark captured
    /// at the start. Each shard gets [`DaemonOptions::rebuild_shard_timeout`]
    /// to finish. The projection's agents are left stopped; restart them
    /// with [`start_projection`](Self::start_projection) when live tailing
    /// should resume.
    #[instrument(skip(self, cancel), fields(projection = %name))]
    pub async fn rebuild_projection(
        &self,
        name: &ProjectionName,
        cancel: &Cancellation,
    ) -> DaemonResult<()> {
        let projection = self.lookup(name)?;
        self.hard_stop_projection(name).await;
        if cancel.is_cancelled() {
            return Err(DaemonError::Cancelled);
        }

        if self.tracker.high_water() == Sequence::zero() {
            self.detector.check_now().await.map_err(DaemonError::Store)?;
        }
        let mark = self.tracker.high_water();
        if mark == Sequence::zero() {
            info!("event log is empty; nothing to rebuild");
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(DaemonError::Cancelled);
        }

        self.store
            .delete_progress_for(name)
            .await
            .map_err(DaemonError::Store)?;
        self.store
            .delete_dead_letters_for(name)
            .await
            .map_err(DaemonError::Store)?;
        self.tracker.mark_as_restarted(name);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut drains = Vec::new();
        for index in 0..projection.shard_count().max(1) {
            let shard = ShardName::new(name.clone(), index);
            let agent = ShardAgent::hydrate(
                shard,
                Arc::clone(&projection),
                Arc::clone(&self.store),
                ResilientLoader::new(Arc::clone(&self.store), self.options.retry.clone()),
                Arc::clone(&self.tracker),
                self.options.agent.clone(),
            )
            .await?;
            let timeout = self.options.rebuild_shard_timeout;
            let rx = stop_rx.clone();
            drains.push(tokio::spawn(async move {
                tokio::time::timeout(timeout, agent.catch_up(mark, rx)).await
            }));
        }

        let drain_all = async {
            for drain in drains {
                match drain.await {
                    Ok(Ok(Ok(_position))) => {}
                    Ok(Ok(Err(err))) => return Err(err),
                    Ok(Err(_elapsed)) => {
                        return Err(DaemonError::RebuildTimedOut(name.clone()));
                    }
                    Err(_join_error) => return Err(DaemonError::Cancelled),
                }
            }
            Ok(())
        };

        let result = tokio::select! {
            result = drain_all => result,
            () = cancel.cancelled() => Err(DaemonError::Cancelled),
        };
        if result.is_err() {
            let _ = stop_tx.send(true);
        } else {
            info!(mark = mark.get(), "rebuild complete");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancellation_none_never_fires() {
        let cancel = Cancellation::none();
        assert!(!cancel.is_cancelled());
        let waited =
            tokio::time::timeout(Duration::from_millis(20), cancel.cancelled()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn cancellation_source_fires_all_tokens() {
        let source = CancellationSource::new();
        let a = source.token();
        let b = source.token();
        source.cancel();
        assert!(a.is_cancelled());
        tokio::time::timeout(Duration::from_millis(100), b.cancelled())
            .await
            .unwrap();
    }
}
