//! Stream state and the pending unit of work for one logical append.

use crate::event::{PendingEvent, WriteEvent};
use crate::types::{Sequence, StreamKey, TenantId, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Expected version of a stream at write time, the optimistic guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Whatever the stream is currently at; the guard uses the last observed
    /// version rather than a caller-supplied one.
    Any,
    /// The stream must be at exactly this version.
    Exact(Version),
    /// The stream must not exist yet.
    NoStream,
}

/// Whether an action starts a stream or appends to an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// The stream must not already exist.
    Start,
    /// The stream must already exist.
    Append,
}

/// A pending, not-yet-persisted unit of work: one stream, its expected
/// version, and the ordered events to add.
///
/// Owned exclusively by the session that created it until `save_changes`
/// either commits or discards it.
#[derive(Debug, Clone)]
pub struct StreamAction<E> {
    /// Start or append.
    pub kind: ActionKind,
    /// Target stream identity.
    pub stream: StreamKey,
    /// Tenant the stream belongs to.
    pub tenant: TenantId,
    /// Optimistic guard for this action.
    pub expected: ExpectedVersion,
    /// Aggregate type tag, when the stream is typed.
    pub aggregate_type: Option<String>,
    /// Ordered new events.
    pub events: Vec<PendingEvent<E>>,
}

impl<E> StreamAction<E> {
    /// Creates a start action; the stream must not already exist.
    pub fn start(stream: StreamKey, tenant: TenantId, events: Vec<PendingEvent<E>>) -> Self {
        Self {
            kind: ActionKind::Start,
            stream,
            tenant,
            expected: ExpectedVersion::NoStream,
            aggregate_type: None,
            events,
        }
    }

    /// Creates an append action guarded by `expected`.
    pub fn append(
        stream: StreamKey,
        tenant: TenantId,
        expected: ExpectedVersion,
        events: Vec<PendingEvent<E>>,
    ) -> Self {
        Self {
            kind: ActionKind::Append,
            stream,
            tenant,
            expected,
            aggregate_type: None,
            events,
        }
    }

    /// Tags the action with the aggregate type that owns the stream.
    #[must_use]
    pub fn with_aggregate_type(mut self, type_name: impl Into<String>) -> Self {
        self.aggregate_type = Some(type_name.into());
        self
    }
}

/// One stream's portion of a save batch, with every event stamped.
///
/// Produced by the session from a [`StreamAction`] once sequences have been
/// reserved and per-stream versions computed; this is what the store's
/// transactional `save` consumes.
#[derive(Debug, Clone)]
pub struct StreamWrite<E> {
    /// Start or append.
    pub kind: ActionKind,
    /// Target stream identity.
    pub stream: StreamKey,
    /// Tenant the stream belongs to.
    pub tenant: TenantId,
    /// The literal version the guarded update compares against, and the
    /// version the new stream row is created at for starts.
    pub expected: ExpectedVersion,
    /// Aggregate type tag, when the stream is typed.
    pub aggregate_type: Option<String>,
    /// Stamped events, in order.
    pub events: Vec<WriteEvent<E>>,
}

impl<E> StreamWrite<E> {
    /// The stream version after this write succeeds.
    pub fn final_version(&self) -> Option<Version> {
        self.events.last().map(|e| e.version)
    }
}

/// Result of a committed save batch: the new version of every stream touched.
pub type SaveOutcome = HashMap<StreamKey, Version>;

/// Current durable state of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    /// Stream identity.
    pub stream: StreamKey,
    /// Count of events ever appended; never decreases.
    pub version: Version,
    /// Aggregate type, set once a typed stream is started.
    pub aggregate_type: Option<String>,
    /// When the stream row was created.
    pub created: DateTime<Utc>,
    /// Timestamp of the most recent append.
    pub last_timestamp: DateTime<Utc>,
    /// Tombstone flag; archived streams are skipped by projection agents.
    pub is_archived: bool,
    /// Tenant the stream belongs to.
    pub tenant: TenantId,
}

/// Store-wide totals for the statistics query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStatistics {
    /// Total committed events.
    pub event_count: u64,
    /// Total streams.
    pub stream_count: u64,
    /// Largest committed sequence number.
    pub max_sequence: Sequence,
}

/// A persisted aggregate snapshot plus the version it was folded up to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The stream the snapshot belongs to.
    pub stream: StreamKey,
    /// Version of the last event folded into the snapshot.
    pub version: Version,
    /// Serialized aggregate state.
    pub data: serde_json::Value,
}
