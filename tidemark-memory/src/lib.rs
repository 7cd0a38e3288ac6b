//! In-memory [`EventStore`] adapter.
//!
//! Backs the full store contract with plain maps behind locks: transactional
//! batch saves with optimistic guards, sequence reservation (including the
//! temporary gaps that reservation-without-commit leaves behind), advisory
//! stream locks, progress and dead-letter tables, and snapshots. Intended for
//! tests and examples; nothing survives the process.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tidemark::errors::{StoreError, StoreResult};
use tidemark::event::{DomainEvent, EventPage, StoredEvent};
use tidemark::projection::DeadLetter;
use tidemark::sequence::SequenceBlock;
use tidemark::store::{EventStore, GapReport, LockGuard, StreamLock};
use tidemark::stream::{
    ActionKind, ExpectedVersion, SaveOutcome, Snapshot, StoreStatistics, StreamState, StreamWrite,
};
use tidemark::types::{ProjectionName, Sequence, ShardName, StreamKey, Version};
use tracing::debug;

#[derive(Debug)]
struct State<E> {
    /// Last reserved sequence number; committed events may trail behind it.
    counter: i64,
    /// Committed events keyed by global sequence.
    events: BTreeMap<i64, StoredEvent<E>>,
    streams: HashMap<StreamKey, StreamState>,
    progress: HashMap<ShardName, Sequence>,
    dead_letters: Vec<DeadLetter>,
    snapshots: HashMap<StreamKey, Snapshot>,
}

impl<E> Default for State<E> {
    fn default() -> Self {
        Self {
            counter: 0,
            events: BTreeMap::new(),
            streams: HashMap::new(),
            progress: HashMap::new(),
            dead_letters: Vec::new(),
            snapshots: HashMap::new(),
        }
    }
}

/// In-memory event store, cheap to clone and share across tasks.
#[derive(Debug)]
pub struct InMemoryStore<E> {
    name: String,
    state: Arc<RwLock<State<E>>>,
    locks: Arc<Mutex<HashSet<StreamKey>>>,
    /// Remaining page reads to fail, for exercising retry paths in tests.
    read_failures: Arc<AtomicU32>,
}

impl<E> Clone for InMemoryStore<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            state: Arc::clone(&self.state),
            locks: Arc::clone(&self.locks),
            read_failures: Arc::clone(&self.read_failures),
        }
    }
}

impl<E> Default for InMemoryStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> InMemoryStore<E> {
    /// Creates an empty store named `memory`.
    pub fn new() -> Self {
        Self::named("memory")
    }

    /// Creates an empty store with the given database identifier.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(RwLock::new(State::default())),
            locks: Arc::new(Mutex::new(HashSet::new())),
            read_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Makes the next `count` page reads fail with a connection error.
    ///
    /// A chaos knob for exercising the resilient loader's retry budget.
    pub fn inject_read_failures(&self, count: u32) {
        self.read_failures.store(count, Ordering::SeqCst);
    }

    /// Marks a stream as archived. Its events stop flowing to projection
    /// agents; the stream row and events themselves stay put.
    pub fn archive_stream(&self, stream: &StreamKey) -> StoreResult<()> {
        let mut state = self.state.write().expect("store lock poisoned");
        let row = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| StoreError::StreamNotFound(stream.clone()))?;
        row.is_archived = true;
        Ok(())
    }
}

/// Advisory lock guard; releases its stream on drop.
#[derive(Debug)]
struct MemoryLock {
    stream: StreamKey,
    locks: Arc<Mutex<HashSet<StreamKey>>>,
}

impl StreamLock for MemoryLock {}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        self.locks
            .lock()
            .expect("lock table poisoned")
            .remove(&self.stream);
    }
}

/// The final per-stream version each write in a batch would leave behind,
/// or the conflicts that stop it. Validation runs over a working view so a
/// batch touching one stream twice sees its own earlier writes.
fn validate_batch<E>(
    state: &State<E>,
    batch: &[StreamWrite<E>],
) -> Result<HashMap<StreamKey, Version>, StoreError> {
    let mut working: HashMap<StreamKey, Version> = HashMap::new();
    let mut conflicts: Vec<StoreError> = Vec::new();

    for write in batch {
        let existing = working
            .get(&write.stream)
            .copied()
            .or_else(|| state.streams.get(&write.stream).map(|s| s.version));

        match (write.kind, existing) {
            (ActionKind::Start, Some(_)) => {
                conflicts.push(StoreError::StreamCollision(write.stream.clone()));
            }
            (ActionKind::Start, None) => {
                working.insert(
                    write.stream.clone(),
                    Version::zero().advance(write.events.len() as u64),
                );
            }
            (ActionKind::Append, None) => {
                // A zero-row guarded update: no stream row at all means
                // not-found, not a version conflict.
                return Err(StoreError::StreamNotFound(write.stream.clone()));
            }
            (ActionKind::Append, Some(actual)) => {
                let expected = match write.expected {
                    ExpectedVersion::Exact(v) => v,
                    // The session resolves `Any` to a literal before the
                    // store sees it; treat anything else as the actual.
                    ExpectedVersion::Any => actual,
                    ExpectedVersion::NoStream => Version::zero(),
                };
                if expected == actual {
                    working.insert(
                        write.stream.clone(),
                        actual.advance(write.events.len() as u64),
                    );
                } else {
                    conflicts.push(StoreError::ConcurrencyConflict {
                        aggregate_type: write
                            .aggregate_type
                            .clone()
                            .unwrap_or_else(|| "stream".to_string()),
                        stream: write.stream.clone(),
                        expected,
                        actual,
                    });
                }
            }
        }
    }

    if conflicts.is_empty() {
        Ok(working)
    } else if conflicts.len() == 1 {
        Err(conflicts.swap_remove(0))
    } else {
        Err(StoreError::ConflictBatch { conflicts })
    }
}

#[async_trait]
impl<E: DomainEvent> EventStore for InMemoryStore<E> {
    type Event = E;

    async fn save(&self, batch: Vec<StreamWrite<E>>) -> StoreResult<SaveOutcome> {
        let mut state = self.state.write().expect("store lock poisoned");
        let outcome = validate_batch(&state, &batch)?;

        let now = Utc::now();
        for write in batch {
            let stream_row = state
                .streams
                .entry(write.stream.clone())
                .or_insert_with(|| StreamState {
                    stream: write.stream.clone(),
                    version: Version::zero(),
                    aggregate_type: write.aggregate_type.clone(),
                    created: now,
                    last_timestamp: now,
                    is_archived: false,
                    tenant: write.tenant.clone(),
                });
            if let Some(final_version) = write.final_version() {
                stream_row.version = final_version;
                stream_row.last_timestamp = now;
            }
            if stream_row.aggregate_type.is_none() {
                stream_row.aggregate_type = write.aggregate_type.clone();
            }

            for event in write.events {
                state.events.insert(
                    event.sequence.get(),
                    StoredEvent {
                        sequence: event.sequence,
                        stream: write.stream.clone(),
                        version: event.version,
                        type_name: event.event.type_name,
                        payload: event.event.payload,
                        timestamp: event.event.timestamp,
                        tenant: write.tenant.clone(),
                    },
                );
            }
        }
        debug!(streams = outcome.len(), "batch committed");
        Ok(outcome)
    }

    async fn stream_state(&self, stream: &StreamKey) -> StoreResult<Option<StreamState>> {
        let state = self.state.read().expect("store lock poisoned");
        Ok(state.streams.get(stream).cloned())
    }

    async fn read_stream(
        &self,
        stream: &StreamKey,
        after: Version,
    ) -> StoreResult<Vec<StoredEvent<E>>> {
        let state = self.state.read().expect("store lock poisoned");
        let mut events: Vec<StoredEvent<E>> = state
            .events
            .values()
            .filter(|e| &e.stream == stream && e.version > after)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn read_page(
        &self,
        floor: Sequence,
        ceiling: Sequence,
        limit: usize,
    ) -> StoreResult<EventPage<E>> {
        let remaining = self.read_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.read_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Connection(
                "injected read failure".to_string(),
            ));
        }

        let state = self.state.read().expect("store lock poisoned");
        let mut events = Vec::new();
        for event in state
            .events
            .range(floor.get() + 1..=ceiling.get())
            .map(|(_, e)| e)
        {
            let archived = state
                .streams
                .get(&event.stream)
                .is_some_and(|s| s.is_archived);
            if archived {
                continue;
            }
            events.push(event.clone());
            if events.len() == limit {
                break;
            }
        }
        // A truncated page covers only up to its last event; the caller
        // resumes from there.
        let covered = if events.len() == limit {
            events.last().map_or(ceiling, |e| e.sequence)
        } else {
            ceiling
        };
        Ok(EventPage::new(floor, covered, events))
    }

    async fn reserve_sequences(&self, count: usize) -> StoreResult<SequenceBlock> {
        let mut state = self.state.write().expect("store lock poisoned");
        let start = state.counter + 1;
        state.counter += count as i64;
        let numbers = (start..=state.counter)
            .map(|n| Sequence::try_new(n).map_err(|e| StoreError::TransactionRollback(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SequenceBlock::new(numbers))
    }

    async fn gap_report(&self, after: Sequence) -> StoreResult<GapReport> {
        let state = self.state.read().expect("store lock poisoned");
        let max_sequence = state
            .events
            .keys()
            .next_back()
            .copied()
            .map_or_else(Sequence::zero, |n| {
                Sequence::try_new(n).unwrap_or_else(|_| Sequence::zero())
            });
        let mut first_gap = None;
        for n in (after.get() + 1)..=max_sequence.get() {
            if !state.events.contains_key(&n) {
                first_gap = Sequence::try_new(n).ok();
                break;
            }
        }
        Ok(GapReport {
            max_sequence,
            first_gap,
        })
    }

    async fn load_progress(&self, shard: &ShardName) -> StoreResult<Option<Sequence>> {
        let state = self.state.read().expect("store lock poisoned");
        Ok(state.progress.get(shard).copied())
    }

    async fn store_progress(&self, shard: &ShardName, sequence: Sequence) -> StoreResult<()> {
        let mut state = self.state.write().expect("store lock poisoned");
        state.progress.insert(shard.clone(), sequence);
        Ok(())
    }

    async fn delete_progress_for(&self, projection: &ProjectionName) -> StoreResult<()> {
        let mut state = self.state.write().expect("store lock poisoned");
        state
            .progress
            .retain(|shard, _| shard.projection() != projection);
        Ok(())
    }

    async fn record_dead_letter(&self, dead_letter: DeadLetter) -> StoreResult<()> {
        let mut state = self.state.write().expect("store lock poisoned");
        state.dead_letters.push(dead_letter);
        Ok(())
    }

    async fn dead_letters_for(&self, projection: &ProjectionName) -> StoreResult<Vec<DeadLetter>> {
        let state = self.state.read().expect("store lock poisoned");
        Ok(state
            .dead_letters
            .iter()
            .filter(|d| &d.projection == projection)
            .cloned()
            .collect())
    }

    async fn delete_dead_letters_for(&self, projection: &ProjectionName) -> StoreResult<()> {
        let mut state = self.state.write().expect("store lock poisoned");
        state.dead_letters.retain(|d| &d.projection != projection);
        Ok(())
    }

    async fn try_lock_stream(&self, stream: &StreamKey) -> StoreResult<Option<LockGuard>> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        if locks.insert(stream.clone()) {
            Ok(Some(Box::new(MemoryLock {
                stream: stream.clone(),
                locks: Arc::clone(&self.locks),
            })))
        } else {
            Ok(None)
        }
    }

    async fn load_snapshot(&self, stream: &StreamKey) -> StoreResult<Option<Snapshot>> {
        let state = self.state.read().expect("store lock poisoned");
        Ok(state.snapshots.get(stream).cloned())
    }

    async fn store_snapshot(&self, snapshot: Snapshot) -> StoreResult<()> {
        let mut state = self.state.write().expect("store lock poisoned");
        state.snapshots.insert(snapshot.stream.clone(), snapshot);
        Ok(())
    }

    async fn statistics(&self) -> StoreResult<StoreStatistics> {
        let state = self.state.read().expect("store lock poisoned");
        let max_sequence = state
            .events
            .keys()
            .next_back()
            .copied()
            .and_then(|n| Sequence::try_new(n).ok())
            .unwrap_or_else(Sequence::zero);
        Ok(StoreStatistics {
            event_count: state.events.len() as u64,
            stream_count: state.streams.len() as u64,
            max_sequence,
        })
    }

    fn database_identifier(&self) -> String {
        self.name.clone()
    }
}
