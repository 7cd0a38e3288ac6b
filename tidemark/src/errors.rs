//! Error types for the write pipeline and the projection daemon.
//!
//! The taxonomy follows the failure modes of the system: identity collisions
//! and concurrency conflicts on the write path, lock contention on exclusive
//! fetches, transient I/O wrapped by the resilient loader, and apply failures
//! routed to dead letters on the daemon side. Nothing is swallowed silently
//! except a successfully recorded dead letter.

use crate::types::{ProjectionName, Sequence, ShardName, StreamKey, Version};
use thiserror::Error;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result alias for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Errors from the backing store and the write pipeline.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Starting a stream whose identity already exists. Never silently merged.
    #[error("stream '{0}' already exists and cannot be started again")]
    StreamCollision(StreamKey),

    /// The guarded update affected zero rows, or an explicit expected version
    /// did not match the stream's actual version.
    #[error(
        "concurrency conflict on {aggregate_type} '{stream}': expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// Aggregate type name, or `"stream"` for untyped streams.
        aggregate_type: String,
        /// The conflicted stream.
        stream: StreamKey,
        /// The version the writer expected.
        expected: Version,
        /// The version actually found.
        actual: Version,
    },

    /// An append targeted a stream that does not exist.
    #[error("stream '{0}' not found")]
    StreamNotFound(StreamKey),

    /// Another session holds the exclusive lock for this stream. Fail-fast;
    /// the call never queues behind the holder.
    #[error("stream '{0}' is locked for exclusive writing by another session")]
    StreamLocked(StreamKey),

    /// Independent conflicts from one multi-stream batch, collected rather
    /// than short-circuited on the first.
    #[error("{} conflict(s) while saving batch", conflicts.len())]
    ConflictBatch {
        /// One entry per conflicted stream.
        conflicts: Vec<StoreError>,
    },

    /// Event payload could not be serialized or deserialized.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The store is unreachable or the connection dropped.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The store rolled back the batch for a reason other than a conflict.
    #[error("transaction rolled back: {0}")]
    TransactionRollback(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether this error represents a write conflict (collision, version
    /// mismatch, or a batch of them) as opposed to an infrastructure failure.
    pub const fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::StreamCollision(_) | Self::ConcurrencyConflict { .. } | Self::ConflictBatch { .. }
        )
    }
}

/// A page fetch failed after the retry budget was exhausted.
///
/// Carries the shard and database identity so the supervisor can tell which
/// consumer on which store is struggling. Agents treat this as a transient
/// signal and back off; it never crashes the daemon.
#[derive(Debug, Error)]
#[error("event loader for shard '{shard}' on database '{database}' gave up after {attempts} attempts: {source}")]
pub struct LoaderError {
    /// The shard whose page fetch failed.
    pub shard: ShardName,
    /// Identifier of the backing database.
    pub database: String,
    /// How many attempts were made.
    pub attempts: u32,
    /// The final underlying failure.
    #[source]
    pub source: StoreError,
}

/// A projection failed to apply one event.
#[derive(Debug, Clone, Error)]
#[error("apply failed for event {sequence}: {message}")]
pub struct ApplyError {
    /// The global sequence of the offending event.
    pub sequence: Sequence,
    /// Description of the failure.
    pub message: String,
}

impl ApplyError {
    /// Creates an apply error for the given event sequence.
    pub fn new(sequence: Sequence, message: impl Into<String>) -> Self {
        Self {
            sequence,
            message: message.into(),
        }
    }
}

/// Errors surfaced by the projection daemon and its agents.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// No projection is registered under this name.
    #[error("no registered projection matches the name '{0}'")]
    UnknownProjection(ProjectionName),

    /// The shard is already running.
    #[error("shard '{0}' is already running")]
    ShardAlreadyRunning(ShardName),

    /// The shard is not running.
    #[error("shard '{0}' is not running")]
    ShardNotRunning(ShardName),

    /// A strict projection refused an event and the shard halted.
    #[error("shard '{shard}' halted: {source}")]
    ShardHalted {
        /// The halted shard.
        shard: ShardName,
        /// The apply failure that stopped it.
        #[source]
        source: ApplyError,
    },

    /// A rebuild did not drain within its shard timeout.
    #[error("rebuild of projection '{0}' timed out")]
    RebuildTimedOut(ProjectionName),

    /// The operation was cancelled before completion.
    #[error("daemon operation cancelled")]
    Cancelled,

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The resilient loader exhausted its retry budget.
    #[error(transparent)]
    Loader(#[from] LoaderError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Version;

    fn key(s: &str) -> StreamKey {
        StreamKey::try_new(s).unwrap()
    }

    #[test]
    fn conflict_classification_covers_batches() {
        let collision = StoreError::StreamCollision(key("a"));
        let conflict = StoreError::ConcurrencyConflict {
            aggregate_type: "Order".to_string(),
            stream: key("b"),
            expected: Version::new(3),
            actual: Version::new(5),
        };
        let batch = StoreError::ConflictBatch {
            conflicts: vec![collision, conflict],
        };
        assert!(batch.is_conflict());
        assert!(!StoreError::Connection("down".to_string()).is_conflict());
        assert!(!StoreError::StreamNotFound(key("c")).is_conflict());
    }

    #[test]
    fn concurrency_conflict_names_type_and_id() {
        let err = StoreError::ConcurrencyConflict {
            aggregate_type: "Order".to_string(),
            stream: key("order-7"),
            expected: Version::new(6),
            actual: Version::new(7),
        };
        let text = err.to_string();
        assert!(text.contains("Order"));
        assert!(text.contains("order-7"));
        assert!(text.contains('6'));
        assert!(text.contains('7'));
    }

    #[test]
    fn loader_error_names_shard_and_database() {
        let shard = ShardName::new(ProjectionName::try_new("orders").unwrap(), 0);
        let err = LoaderError {
            shard,
            database: "primary".to_string(),
            attempts: 3,
            source: StoreError::Connection("refused".to_string()),
        };
        let text = err.to_string();
        assert!(text.contains("orders:0"));
        assert!(text.contains("primary"));
        assert!(text.contains('3'));
    }
}
