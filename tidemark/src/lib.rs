//! Tidemark - event sourcing over a relational store.
//!
//! Tidemark appends immutable domain events into ordered streams, assigns each
//! event a globally monotonic sequence number, enforces optimistic and
//! exclusive concurrency control on stream writers, and asynchronously folds
//! the event log into materialized projections while tracking how far each
//! projection has consumed the log.
//!
//! The write path ([`Session`]) and the projection path ([`ProjectionDaemon`])
//! are decoupled: they communicate only through the durable event log and the
//! progress table of the backing [`EventStore`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod agent;
pub mod aggregate;
pub mod daemon;
pub mod errors;
pub mod event;
pub mod fetch;
pub mod high_water;
pub mod loader;
pub mod projection;
pub mod sequence;
pub mod serialization;
pub mod session;
pub mod store;
pub mod stream;
pub mod tracker;
pub mod types;
pub mod version_tracker;

pub use aggregate::Aggregate;
pub use daemon::{Cancellation, CancellationSource, DaemonOptions, ProjectionDaemon};
pub use errors::{DaemonError, DaemonResult, StoreError, StoreResult};
pub use event::{DomainEvent, EventPage, PendingEvent, StoredEvent};
pub use fetch::WriteHandle;
pub use projection::{ErrorHandling, Projection, SnapshotProjection};
pub use session::Session;
pub use store::EventStore;
pub use stream::{ExpectedVersion, StreamAction, StreamState};
pub use types::{ProjectionName, Sequence, ShardName, StreamKey, TenantId, Version};
