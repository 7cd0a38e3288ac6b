//! Fetch-for-writing: load an aggregate, observe its version, queue guarded
//! appends through the owning session.

use crate::aggregate::Aggregate;
use crate::errors::{StoreError, StoreResult};
use crate::session::Session;
use crate::store::EventStore;
use crate::stream::{ExpectedVersion, StreamState};
use crate::types::{StreamKey, Version};
use std::sync::Arc;
use tracing::{debug, instrument};

/// An aggregate loaded for writing, pinned to the version observed at fetch
/// time.
///
/// Events queued through [`append`](Self::append) fold into the in-memory
/// aggregate immediately but reach the store only when the handle is handed
/// back to the session with [`Session::queue_writes`] and the session is
/// flushed. The flush guard is the fetch-time version, so a concurrent
/// writer that slipped in between fetch and flush surfaces as a
/// [`StoreError::ConcurrencyConflict`].
#[derive(Debug)]
pub struct WriteHandle<A: Aggregate> {
    stream: StreamKey,
    aggregate: A,
    version_at_fetch: Version,
    queued: Vec<A::Event>,
}

impl<A: Aggregate> WriteHandle<A> {
    /// The stream this handle writes to.
    pub fn stream(&self) -> &StreamKey {
        &self.stream
    }

    /// The aggregate as of the fetch, plus any events queued since.
    pub fn aggregate(&self) -> &A {
        &self.aggregate
    }

    /// The stream version observed at fetch time; the flush guard.
    pub fn version_at_fetch(&self) -> Version {
        self.version_at_fetch
    }

    /// The stream version this handle's queued events would bring it to.
    pub fn projected_version(&self) -> Version {
        self.version_at_fetch.advance(self.queued.len() as u64)
    }

    /// Folds an event into the aggregate and queues it for the next flush.
    pub fn append(&mut self, event: A::Event) {
        self.aggregate.apply(&event);
        self.queued.push(event);
    }

    fn into_parts(self) -> (StreamKey, Version, Vec<A::Event>) {
        (self.stream, self.version_at_fetch, self.queued)
    }
}

impl<S: EventStore> Session<S> {
    /// Loads an aggregate for optimistic writing.
    ///
    /// When `expected` is given and the stream's actual version differs, the
    /// call fails immediately with a concurrency conflict instead of waiting
    /// for the flush to discover it. Hydration starts from the stream's
    /// snapshot when one exists and folds only the tail of newer events.
    #[instrument(skip(self), fields(aggregate = A::TYPE_NAME))]
    pub async fn fetch_for_writing<A>(
        &mut self,
        stream: StreamKey,
        expected: Option<Version>,
    ) -> StoreResult<WriteHandle<A>>
    where
        A: Aggregate<Event = S::Event>,
    {
        let state = self
            .store
            .stream_state(&stream)
            .await?
            .ok_or_else(|| StoreError::StreamNotFound(stream.clone()))?;

        if let Some(wanted) = expected {
            if wanted != state.version {
                return Err(StoreError::ConcurrencyConflict {
                    aggregate_type: A::TYPE_NAME.to_string(),
                    stream,
                    expected: wanted,
                    actual: state.version,
                });
            }
        }

        let (mut aggregate, folded_to) = match self.store.load_snapshot(&stream).await? {
            Some(snapshot) => {
                let aggregate: A = serde_json::from_value(snapshot.data)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                (aggregate, snapshot.version)
            }
            None => (A::default(), Version::zero()),
        };

        let tail = self.store.read_stream(&stream, folded_to).await?;
        debug!(
            snapshot_version = folded_to.get(),
            tail_events = tail.len(),
            "hydrated aggregate"
        );
        for event in &tail {
            aggregate.apply(&event.payload);
        }

        self.versions
            .for_type::<StreamState, StreamKey>()
            .store_revision(stream.clone(), state.version.get());

        Ok(WriteHandle {
            stream,
            aggregate,
            version_at_fetch: state.version,
            queued: Vec::new(),
        })
    }

    /// Loads an aggregate under the stream's exclusive advisory lock.
    ///
    /// Fails fast with [`StoreError::StreamLocked`] when another session
    /// holds the lock; the call never queues behind the holder. On success
    /// the lock is held until this session is dropped.
    #[instrument(skip(self), fields(aggregate = A::TYPE_NAME))]
    pub async fn fetch_for_exclusive_writing<A>(
        &mut self,
        stream: StreamKey,
    ) -> StoreResult<WriteHandle<A>>
    where
        A: Aggregate<Event = S::Event>,
    {
        match self.store.try_lock_stream(&stream).await? {
            Some(guard) => {
                self.hold_lock(guard);
                self.fetch_for_writing(stream, None).await
            }
            None => Err(StoreError::StreamLocked(stream)),
        }
    }

    /// Queues a handle's pending events as one guarded append.
    ///
    /// The guard is the handle's fetch-time version; a handle with nothing
    /// queued is a no-op.
    pub fn queue_writes<A>(&mut self, handle: WriteHandle<A>)
    where
        A: Aggregate<Event = S::Event>,
    {
        let (stream, observed, events) = handle.into_parts();
        if events.is_empty() {
            return;
        }
        self.queue_append(
            stream,
            ExpectedVersion::Exact(observed),
            Some(A::TYPE_NAME.to_string()),
            events,
        );
    }

    /// The store this session writes to.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}
