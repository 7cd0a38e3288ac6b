//! Aggregates: typed folds over one stream's events.

use crate::event::DomainEvent;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A materialized fold of one stream.
///
/// Dispatch over event variants is an ordinary `match` inside `apply`; the
/// set of handlers is fixed at compile time, with no per-event runtime
/// lookup.
pub trait Aggregate: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The event payload type this aggregate folds.
    type Event: DomainEvent;

    /// Stable type tag recorded on the stream row when a typed stream is
    /// started, and named in concurrency conflicts.
    const TYPE_NAME: &'static str;

    /// Folds one event into the state.
    fn apply(&mut self, event: &Self::Event);

    /// Folds a sequence of events in order.
    fn apply_all<'a>(&mut self, events: impl IntoIterator<Item = &'a Self::Event>)
    where
        Self::Event: 'a,
    {
        for event in events {
            self.apply(event);
        }
    }
}
