//! Shared in-process state for the daemon: the published high-water mark and
//! per-shard progress.

use crate::types::{ProjectionName, Sequence, ShardName};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::watch;

/// Broadcasts the high-water mark to shard agents and tracks how far each
/// shard has applied.
///
/// The mark only ever moves forward; [`publish_high_water`] with a smaller
/// value is ignored. Shard progress lives here for observability and for the
/// rebuild protocol; the durable copy is the store's progress table.
///
/// [`publish_high_water`]: Self::publish_high_water
#[derive(Debug)]
pub struct ShardStateTracker {
    high_water_tx: watch::Sender<Sequence>,
    progress: RwLock<HashMap<ShardName, Sequence>>,
}

impl ShardStateTracker {
    /// Creates a tracker with the mark at zero and no shard progress.
    pub fn new() -> Self {
        let (high_water_tx, _) = watch::channel(Sequence::zero());
        Self {
            high_water_tx,
            progress: RwLock::new(HashMap::new()),
        }
    }

    /// Publishes a new high-water mark. Values at or below the current mark
    /// are ignored; the mark never decreases.
    pub fn publish_high_water(&self, mark: Sequence) {
        self.high_water_tx.send_if_modified(|current| {
            if mark > *current {
                *current = mark;
                true
            } else {
                false
            }
        });
    }

    /// The current high-water mark.
    pub fn high_water(&self) -> Sequence {
        *self.high_water_tx.borrow()
    }

    /// Subscribes to mark advances. Receivers wake only when the mark moves.
    pub fn subscribe(&self) -> watch::Receiver<Sequence> {
        self.high_water_tx.subscribe()
    }

    /// Records how far a shard has applied.
    pub fn update_shard_progress(&self, shard: ShardName, sequence: Sequence) {
        self.progress
            .write()
            .expect("progress lock poisoned")
            .insert(shard, sequence);
    }

    /// The last recorded progress for a shard, if it has reported any.
    pub fn shard_progress(&self, shard: &ShardName) -> Option<Sequence> {
        self.progress
            .read()
            .expect("progress lock poisoned")
            .get(shard)
            .copied()
    }

    /// Resets the in-process progress of every shard of a projection, as the
    /// rebuild protocol does before replaying from zero.
    pub fn mark_as_restarted(&self, projection: &ProjectionName) {
        self.progress
            .write()
            .expect("progress lock poisoned")
            .retain(|shard, _| shard.projection() != projection);
    }

    /// Snapshot of every shard's recorded progress.
    pub fn progress_snapshot(&self) -> HashMap<ShardName, Sequence> {
        self.progress
            .read()
            .expect("progress lock poisoned")
            .clone()
    }
}

impl Default for ShardStateTracker {
    fn default() -> Self {
        Self::new()
    }
}
