//! The event store port.
//!
//! Everything durable goes through [`EventStore`]: transactional batches of
//! stream writes, sequence reservation, the progress and dead-letter tables,
//! advisory stream locks, and the gap scan the high-water detector polls.
//! Implementations live in the `tidemark-memory` and `tidemark-postgres`
//! crates.

use crate::errors::StoreResult;
use crate::event::{DomainEvent, EventPage, StoredEvent};
use crate::projection::DeadLetter;
use crate::sequence::SequenceBlock;
use crate::stream::{SaveOutcome, Snapshot, StoreStatistics, StreamState, StreamWrite};
use crate::types::{ProjectionName, Sequence, ShardName, StreamKey, Version};
use async_trait::async_trait;

/// What the gap scan found beyond a given sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapReport {
    /// Largest committed sequence number in the store.
    pub max_sequence: Sequence,
    /// Smallest missing sequence greater than the scan floor, if any.
    pub first_gap: Option<Sequence>,
}

/// Session-scoped advisory lock on one stream, released on drop.
///
/// The guard is the only handle to the lock; every exit path, including
/// errors, releases it. There is no explicit unlock call.
pub trait StreamLock: Send + Sync + std::fmt::Debug {}

/// Boxed advisory lock guard.
pub type LockGuard = Box<dyn StreamLock>;

/// Backing store contract: durably execute batches of writes transactionally
/// and answer the queries the write pipeline and the daemon need.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// The event payload type this store handles.
    type Event: DomainEvent;

    /// Commits a batch of stream writes in one transaction.
    ///
    /// Each write's optimistic guard is checked against the stream row;
    /// independent conflicts across the batch are collected into
    /// [`StoreError::ConflictBatch`](crate::StoreError::ConflictBatch) rather
    /// than short-circuiting on the first. A zero-row guarded update is
    /// disambiguated by an existence check into either
    /// `StreamNotFound` or `ConcurrencyConflict`.
    async fn save(&self, batch: Vec<StreamWrite<Self::Event>>) -> StoreResult<SaveOutcome>;

    /// Loads the current state of one stream, if it exists.
    async fn stream_state(&self, stream: &StreamKey) -> StoreResult<Option<StreamState>>;

    /// Reads a stream's committed events with version greater than `after`,
    /// ordered by version.
    async fn read_stream(
        &self,
        stream: &StreamKey,
        after: Version,
    ) -> StoreResult<Vec<StoredEvent<Self::Event>>>;

    /// Reads committed events with sequence in `(floor, ceiling]`, ordered by
    /// sequence, at most `limit` of them. Events of archived streams are
    /// skipped.
    async fn read_page(
        &self,
        floor: Sequence,
        ceiling: Sequence,
        limit: usize,
    ) -> StoreResult<EventPage<Self::Event>>;

    /// Reserves `count` sequence numbers from the monotonic counter in one
    /// round trip. Reserved numbers that never commit become the temporary
    /// gaps the high-water detector tolerates.
    async fn reserve_sequences(&self, count: usize) -> StoreResult<SequenceBlock>;

    /// Scans for the largest committed sequence and the first missing number
    /// greater than `after`.
    async fn gap_report(&self, after: Sequence) -> StoreResult<GapReport>;

    /// Loads the last fully applied sequence for a shard, if the shard has
    /// ever run.
    async fn load_progress(&self, shard: &ShardName) -> StoreResult<Option<Sequence>>;

    /// Persists a shard's progress. Called only after a successful
    /// apply-and-flush.
    async fn store_progress(&self, shard: &ShardName, sequence: Sequence) -> StoreResult<()>;

    /// Deletes all progress rows for a projection; a rebuild starts here.
    async fn delete_progress_for(&self, projection: &ProjectionName) -> StoreResult<()>;

    /// Durably records a single-event apply failure.
    async fn record_dead_letter(&self, dead_letter: DeadLetter) -> StoreResult<()>;

    /// Lists the recorded dead letters for a projection.
    async fn dead_letters_for(&self, projection: &ProjectionName) -> StoreResult<Vec<DeadLetter>>;

    /// Deletes a projection's dead letters; they will be replayed by the
    /// rebuild that requested the deletion.
    async fn delete_dead_letters_for(&self, projection: &ProjectionName) -> StoreResult<()>;

    /// Attempts to take the session-scoped advisory lock for a stream.
    ///
    /// Returns `None` without blocking when another session holds it.
    async fn try_lock_stream(&self, stream: &StreamKey) -> StoreResult<Option<LockGuard>>;

    /// Loads the persisted snapshot for a stream, if one exists.
    async fn load_snapshot(&self, stream: &StreamKey) -> StoreResult<Option<Snapshot>>;

    /// Persists (or replaces) a stream's snapshot.
    async fn store_snapshot(&self, snapshot: Snapshot) -> StoreResult<()>;

    /// Event count, stream count, and current max sequence.
    async fn statistics(&self) -> StoreResult<StoreStatistics>;

    /// Stable identifier of the backing database, used in loader errors and
    /// log lines.
    fn database_identifier(&self) -> String;
}
