//! Event representations at each stage of their lifecycle.
//!
//! A payload starts as a [`PendingEvent`] queued inside a session, is stamped
//! with its global sequence and per-stream version at save time, and is read
//! back as a [`StoredEvent`] once durable. Stored events are immutable.

use crate::types::{Sequence, StreamKey, TenantId, Version};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Implemented by the application's event payload type, normally an enum over
/// all known event variants.
///
/// The `kind` tag is the stable name persisted in the event table's type
/// column; dispatch over variants happens with an ordinary `match`, resolved
/// at compile time rather than through any runtime registry.
pub trait DomainEvent:
    Send + Sync + Clone + Serialize + DeserializeOwned + 'static
{
    /// Stable type tag for this payload variant.
    fn kind(&self) -> &'static str;
}

/// An event queued in a session, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent<E> {
    /// Client-side unique id, assigned at queue time.
    pub id: Uuid,
    /// Stable type tag of the payload.
    pub type_name: String,
    /// The payload itself.
    pub payload: E,
    /// When the event was queued.
    pub timestamp: DateTime<Utc>,
}

impl<E: DomainEvent> PendingEvent<E> {
    /// Wraps a payload for queuing.
    pub fn new(payload: E) -> Self {
        Self {
            id: Uuid::now_v7(),
            type_name: payload.kind().to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// A pending event stamped with its assigned numbers, ready for the store.
///
/// The global sequence and the per-stream version are independent counters
/// and must not be confused: the sequence orders the whole log, the version
/// is the event's 1-based position within its own stream.
#[derive(Debug, Clone)]
pub struct WriteEvent<E> {
    /// Reserved global sequence number.
    pub sequence: Sequence,
    /// 1-based position within the target stream.
    pub version: Version,
    /// The queued event being written.
    pub event: PendingEvent<E>,
}

/// An event as it exists durably in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent<E> {
    /// Global, gapless-once-committed sequence number.
    pub sequence: Sequence,
    /// The stream this event belongs to.
    pub stream: StreamKey,
    /// 1-based position within its stream.
    pub version: Version,
    /// Stable type tag of the payload.
    pub type_name: String,
    /// The payload.
    pub payload: E,
    /// When the event was stored.
    pub timestamp: DateTime<Utc>,
    /// Tenant the event belongs to.
    pub tenant: TenantId,
}

/// A bounded range of the event log, as served to shard agents.
#[derive(Debug, Clone)]
pub struct EventPage<E> {
    /// First sequence covered by this page (exclusive floor).
    pub floor: Sequence,
    /// Last sequence covered by this page (inclusive ceiling).
    pub ceiling: Sequence,
    /// The committed events within the range, ordered by sequence.
    pub events: Vec<StoredEvent<E>>,
}

impl<E> EventPage<E> {
    /// Creates a page covering `(floor, ceiling]`.
    pub const fn new(floor: Sequence, ceiling: Sequence, events: Vec<StoredEvent<E>>) -> Self {
        Self {
            floor,
            ceiling,
            events,
        }
    }

    /// Whether the page carries no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events in the page.
    pub fn len(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    enum TestEvent {
        Ping,
        Pong,
    }

    impl DomainEvent for TestEvent {
        fn kind(&self) -> &'static str {
            match self {
                Self::Ping => "ping",
                Self::Pong => "pong",
            }
        }
    }

    #[test]
    fn pending_event_captures_kind_tag() {
        let ping = PendingEvent::new(TestEvent::Ping);
        let pong = PendingEvent::new(TestEvent::Pong);
        assert_eq!(ping.type_name, "ping");
        assert_eq!(pong.type_name, "pong");
        assert_ne!(ping.id, pong.id);
    }

    #[test]
    fn event_page_reports_bounds_and_size() {
        let page: EventPage<TestEvent> =
            EventPage::new(Sequence::zero(), Sequence::try_new(10).unwrap(), vec![]);
        assert!(page.is_empty());
        assert_eq!(page.len(), 0);
        assert_eq!(page.ceiling.get(), 10);
    }
}
