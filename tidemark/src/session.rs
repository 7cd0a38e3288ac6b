//! The write-side session: queued stream actions and the save pipeline.

use crate::errors::{StoreError, StoreResult};
use crate::event::{PendingEvent, WriteEvent};
use crate::sequence::SequenceAllocator;
use crate::store::{EventStore, LockGuard};
use crate::stream::{
    ActionKind, ExpectedVersion, SaveOutcome, StreamAction, StreamState, StreamWrite,
};
use crate::types::{StreamKey, TenantId, Version};
use crate::version_tracker::VersionTracker;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// A unit-of-work session over one store.
///
/// Actions queue in memory and hit the store only when
/// [`save_changes`](Self::save_changes) runs. Sessions are single-owner and
/// never shared across threads; exclusive stream locks taken through
/// [`fetch_for_exclusive_writing`](Self::fetch_for_exclusive_writing) are
/// held until the session is dropped.
pub struct Session<S: EventStore> {
    pub(crate) store: Arc<S>,
    pub(crate) allocator: SequenceAllocator<S>,
    pub(crate) tenant: TenantId,
    pub(crate) pending: Vec<StreamAction<S::Event>>,
    pub(crate) versions: VersionTracker,
    pub(crate) locks: Vec<LockGuard>,
}

impl<S: EventStore> Session<S> {
    /// Opens a session for the default tenant.
    pub fn new(store: Arc<S>) -> Self {
        Self::for_tenant(store, TenantId::default())
    }

    /// Opens a session scoped to one tenant.
    pub fn for_tenant(store: Arc<S>, tenant: TenantId) -> Self {
        Self {
            allocator: SequenceAllocator::new(Arc::clone(&store)),
            store,
            tenant,
            pending: Vec::new(),
            versions: VersionTracker::new(),
            locks: Vec::new(),
        }
    }

    /// The per-session version cache.
    pub fn version_tracker(&mut self) -> &mut VersionTracker {
        &mut self.versions
    }

    /// Queues a start action: the stream must not already exist when the
    /// batch is saved. An existing identity surfaces as
    /// [`StoreError::StreamCollision`], never a silent merge.
    pub fn start_stream(
        &mut self,
        stream: StreamKey,
        events: impl IntoIterator<Item = S::Event>,
    ) -> &StreamAction<S::Event> {
        let pending = events.into_iter().map(PendingEvent::new).collect();
        self.pending
            .push(StreamAction::start(stream, self.tenant.clone(), pending));
        self.pending.last().expect("action was just pushed")
    }

    /// Queues an append with no explicit expected version: the flush guard
    /// uses whatever version was last observed for the stream.
    pub fn append(
        &mut self,
        stream: StreamKey,
        events: impl IntoIterator<Item = S::Event>,
    ) -> &StreamAction<S::Event> {
        self.queue_append(stream, ExpectedVersion::Any, None, events)
    }

    /// Queues an append guarded by a caller-supplied expected version.
    pub fn append_exact(
        &mut self,
        stream: StreamKey,
        expected: Version,
        events: impl IntoIterator<Item = S::Event>,
    ) -> &StreamAction<S::Event> {
        self.queue_append(stream, ExpectedVersion::Exact(expected), None, events)
    }

    pub(crate) fn queue_append(
        &mut self,
        stream: StreamKey,
        expected: ExpectedVersion,
        aggregate_type: Option<String>,
        events: impl IntoIterator<Item = S::Event>,
    ) -> &StreamAction<S::Event> {
        let pending = events.into_iter().map(PendingEvent::new).collect();
        let mut action =
            StreamAction::append(stream, self.tenant.clone(), expected, pending);
        action.aggregate_type = aggregate_type;
        self.pending.push(action);
        self.pending.last().expect("action was just pushed")
    }

    /// Number of queued, unsaved actions.
    pub fn pending_actions(&self) -> usize {
        self.pending.len()
    }

    /// Discards every queued action without touching the store.
    pub fn discard_changes(&mut self) {
        self.pending.clear();
    }

    /// Flushes all queued actions as one transactional batch.
    ///
    /// Sequences are reserved up front (one round trip), each event gets its
    /// per-stream version (old version plus its 1-based position in the
    /// batch), and the store checks every optimistic guard. Conflicts across
    /// independent streams come back aggregated in
    /// [`StoreError::ConflictBatch`]. On any error the queued actions are
    /// already discarded; the reserved sequences become gaps the high-water
    /// detector tolerates.
    #[instrument(skip(self), fields(actions = self.pending.len()))]
    pub async fn save_changes(&mut self) -> StoreResult<SaveOutcome> {
        let actions = std::mem::take(&mut self.pending);
        if actions.is_empty() {
            return Ok(SaveOutcome::new());
        }

        let total_events: usize = actions.iter().map(|a| a.events.len()).sum();
        let mut block = self.allocator.reserve(total_events).await?;

        let mut writes = Vec::with_capacity(actions.len());
        for action in actions {
            let (base, guard) = self.resolve_guard(&action).await?;
            // A later action on the same stream in this batch must observe
            // the version this one leaves behind, not the pre-batch one.
            self.versions
                .for_type::<StreamState, StreamKey>()
                .store_revision(
                    action.stream.clone(),
                    base.advance(action.events.len() as u64).get(),
                );
            let events = action
                .events
                .into_iter()
                .enumerate()
                .map(|(offset, event)| WriteEvent {
                    sequence: block
                        .pop()
                        .expect("allocator reserved one sequence per event"),
                    version: base.advance(offset as u64 + 1),
                    event,
                })
                .collect();
            writes.push(StreamWrite {
                kind: action.kind,
                stream: action.stream,
                tenant: action.tenant,
                expected: guard,
                aggregate_type: action.aggregate_type,
                events,
            });
        }

        let touched: Vec<StreamKey> = writes.iter().map(|w| w.stream.clone()).collect();
        let outcome = match self.store.save(writes).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // The speculative in-batch revisions never committed.
                let observed = self.versions.for_type::<StreamState, StreamKey>();
                for stream in touched {
                    observed.clear_revision(&stream);
                }
                return Err(err);
            }
        };

        // Refresh the per-session cache with what the store now holds.
        let observed = self.versions.for_type::<StreamState, StreamKey>();
        for (stream, version) in &outcome {
            observed.store_revision(stream.clone(), version.get());
            observed.store_version(stream.clone(), Uuid::now_v7());
        }
        debug!(streams = outcome.len(), "batch committed");
        Ok(outcome)
    }

    /// Resolves the literal guard version for one action.
    ///
    /// Starts keep their no-stream guard. Explicit expectations pass through
    /// unchanged. An implicit append uses the version this session last
    /// observed, reading it once if it has never been seen; the value is not
    /// re-read transactionally, which is exactly what makes the flush check
    /// optimistic.
    async fn resolve_guard(
        &mut self,
        action: &StreamAction<S::Event>,
    ) -> StoreResult<(Version, ExpectedVersion)> {
        match (action.kind, action.expected) {
            (ActionKind::Start, _) => Ok((Version::zero(), ExpectedVersion::NoStream)),
            (ActionKind::Append, ExpectedVersion::Exact(v)) => {
                Ok((v, ExpectedVersion::Exact(v)))
            }
            (ActionKind::Append, ExpectedVersion::NoStream) => {
                Ok((Version::zero(), ExpectedVersion::NoStream))
            }
            (ActionKind::Append, ExpectedVersion::Any) => {
                let cached = self
                    .versions
                    .for_type::<StreamState, StreamKey>()
                    .revision_for(&action.stream)
                    .map(Version::new);
                let observed = match cached {
                    Some(v) => v,
                    None => {
                        let state = self
                            .store
                            .stream_state(&action.stream)
                            .await?
                            .ok_or_else(|| StoreError::StreamNotFound(action.stream.clone()))?;
                        self.versions
                            .for_type::<StreamState, StreamKey>()
                            .store_revision(action.stream.clone(), state.version.get());
                        state.version
                    }
                };
                Ok((observed, ExpectedVersion::Exact(observed)))
            }
        }
    }

    /// Takes ownership of an advisory lock guard for the session's lifetime.
    pub(crate) fn hold_lock(&mut self, guard: LockGuard) {
        self.locks.push(guard);
    }

    /// Ends the session, releasing any exclusive stream locks.
    ///
    /// Dropping the session has the same effect; this exists to make the exit
    /// point explicit at call sites.
    pub fn close(self) {
        drop(self);
    }
}
