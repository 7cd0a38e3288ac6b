//! Projections: log consumers fed by shard agents.

use crate::aggregate::Aggregate;
use crate::errors::ApplyError;
use crate::event::StoredEvent;
use crate::store::EventStore;
use crate::stream::Snapshot;
use crate::types::{ProjectionName, Sequence, ShardName, StreamKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

/// What a shard does when the projection refuses one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorHandling {
    /// Record a dead letter and continue past the event.
    #[default]
    DeadLetter,
    /// Halt the shard and surface the error to the daemon's supervisor.
    Strict,
}

/// One projection over the event log.
///
/// A projection with `shard_count()` of N is consumed by N agents running in
/// parallel; events are routed to shards by stream so that per-stream order
/// is preserved within a shard.
#[async_trait]
pub trait Projection: Send + Sync + 'static {
    /// The event payload type this projection consumes.
    type Event: crate::event::DomainEvent;

    /// Registered name, also the prefix of every shard identity.
    fn name(&self) -> ProjectionName;

    /// Number of independent shards consuming the log for this projection.
    fn shard_count(&self) -> u16 {
        1
    }

    /// Failure policy for single-event apply errors.
    fn error_handling(&self) -> ErrorHandling {
        ErrorHandling::default()
    }

    /// Applies one event to the materialized state.
    async fn apply(&self, event: &StoredEvent<Self::Event>) -> Result<(), ApplyError>;
}

/// Routes a stream to a shard index, keeping all of a stream's events on the
/// same shard.
pub fn shard_for_stream(stream: &StreamKey, shard_count: u16) -> u16 {
    if shard_count <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    stream.hash(&mut hasher);
    let index = hasher.finish() % u64::from(shard_count);
    u16::try_from(index).expect("a value modulo a u16 fits in a u16")
}

/// A durably recorded apply failure for one event, set aside so the shard can
/// continue past it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The projection that failed to apply the event.
    pub projection: ProjectionName,
    /// The shard that was processing it.
    pub shard: ShardName,
    /// Global sequence of the offending event.
    pub sequence: Sequence,
    /// The stream the event belongs to.
    pub stream: StreamKey,
    /// Description of the failure.
    pub error: String,
    /// When the dead letter was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Records an apply failure for the given shard and event.
    pub fn new(shard: &ShardName, sequence: Sequence, stream: StreamKey, error: &ApplyError) -> Self {
        Self {
            projection: shard.projection().clone(),
            shard: shard.clone(),
            sequence,
            stream,
            error: error.to_string(),
            recorded_at: Utc::now(),
        }
    }
}

/// An asynchronous snapshot projection: folds each stream's events into its
/// aggregate and persists the result through the store's snapshot table.
///
/// `fetch_for_writing` uses these snapshots as its starting point, folding
/// only the tail of events the daemon has not reached yet.
pub struct SnapshotProjection<A, S> {
    name: ProjectionName,
    store: Arc<S>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: Aggregate, S> SnapshotProjection<A, S> {
    /// Creates the snapshot projection for aggregate type `A`.
    pub fn new(store: Arc<S>) -> Self {
        let name = ProjectionName::try_new(format!("snapshot:{}", A::TYPE_NAME))
            .expect("aggregate type names are non-empty");
        Self {
            name,
            store,
            _aggregate: PhantomData,
        }
    }
}

#[async_trait]
impl<A, S> Projection for SnapshotProjection<A, S>
where
    A: Aggregate<Event = S::Event>,
    S: EventStore,
{
    type Event = S::Event;

    fn name(&self) -> ProjectionName {
        self.name.clone()
    }

    async fn apply(&self, event: &StoredEvent<Self::Event>) -> Result<(), ApplyError> {
        let fail = |message: String| ApplyError::new(event.sequence, message);

        let existing = self
            .store
            .load_snapshot(&event.stream)
            .await
            .map_err(|e| fail(e.to_string()))?;

        let (mut state, version) = match existing {
            Some(snapshot) => {
                // Agents deliver a stream's events in version order, so an
                // event at or below the snapshot version is a replay.
                if event.version <= snapshot.version {
                    return Ok(());
                }
                let state: A = serde_json::from_value(snapshot.data)
                    .map_err(|e| fail(format!("snapshot decode: {e}")))?;
                (state, snapshot.version)
            }
            None => (A::default(), crate::types::Version::zero()),
        };

        if event.version == version.next() {
            state.apply(&event.payload);
        } else {
            // The snapshot is behind by more than one event (for example it
            // was removed out of band); refold the missing tail from the log.
            let tail = self
                .store
                .read_stream(&event.stream, version)
                .await
                .map_err(|e| fail(e.to_string()))?;
            for stored in tail.iter().filter(|s| s.version <= event.version) {
                state.apply(&stored.payload);
            }
        }

        let data = serde_json::to_value(&state)
            .map_err(|e| fail(format!("snapshot encode: {e}")))?;
        self.store
            .store_snapshot(Snapshot {
                stream: event.stream.clone(),
                version: event.version,
                data,
            })
            .await
            .map_err(|e| fail(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_shard_routes_everything_to_zero() {
        let stream = StreamKey::try_new("any").unwrap();
        assert_eq!(shard_for_stream(&stream, 1), 0);
        assert_eq!(shard_for_stream(&stream, 0), 0);
    }

    #[test]
    fn routing_is_stable_and_within_bounds() {
        for i in 0..100 {
            let stream = StreamKey::try_new(format!("stream-{i}")).unwrap();
            let first = shard_for_stream(&stream, 4);
            assert!(first < 4);
            assert_eq!(first, shard_for_stream(&stream, 4));
        }
    }

    #[test]
    fn multiple_shards_actually_spread_streams() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            let stream = StreamKey::try_new(format!("s-{i}")).unwrap();
            seen.insert(shard_for_stream(&stream, 4));
        }
        assert!(seen.len() > 1);
    }
}
