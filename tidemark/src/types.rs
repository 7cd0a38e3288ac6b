//! Core identifier and counter types.
//!
//! All validated types use smart constructors so that a constructed value is
//! always valid and no further checking is needed downstream.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of an event stream.
///
/// Streams may be keyed by an arbitrary string or by a UUID rendered as a
/// string; either way the key is non-empty and at most 255 characters.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct StreamKey(String);

impl StreamKey {
    /// Builds a stream key from a UUID identity.
    pub fn from_uuid(id: Uuid) -> Self {
        Self::try_new(id.to_string()).expect("a UUID renders to a non-empty key")
    }
}

/// Opaque tenant identifier carried on streams and events.
///
/// Tenancy routing is out of scope; the engine only tags rows with the tenant
/// they belong to. Single-tenant deployments use [`TenantId::default`].
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 100),
    default = "*DEFAULT*",
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct TenantId(String);

/// Name of a registered projection.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ProjectionName(String);

/// Identity of one projection shard: the projection name plus a shard index.
///
/// The string identity (`orders:2`) is what the progress table keys rows by.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardName {
    projection: ProjectionName,
    index: u16,
}

impl ShardName {
    /// Creates a shard name for the given projection and shard index.
    pub const fn new(projection: ProjectionName, index: u16) -> Self {
        Self { projection, index }
    }

    /// The projection this shard belongs to.
    pub const fn projection(&self) -> &ProjectionName {
        &self.projection
    }

    /// The shard index within its projection.
    pub const fn index(&self) -> u16 {
        self.index
    }

    /// The string identity used as the progress-table key.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.projection, self.index)
    }
}

impl std::fmt::Display for ShardName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.projection, self.index)
    }
}

/// Global event sequence number.
///
/// Sequence numbers are gapless across the whole store once committed,
/// assigned exactly once, and never reused. A reserved-but-uncommitted number
/// shows up as a temporary gap that the high-water detector tolerates.
#[nutype(
    validate(greater_or_equal = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct Sequence(i64);

impl Sequence {
    /// The sequence before any event exists (0).
    pub fn zero() -> Self {
        Self::try_new(0).expect("0 is always a valid sequence")
    }

    /// Returns the underlying number.
    pub fn get(self) -> i64 {
        self.into()
    }

    /// The next sequence number.
    #[must_use]
    pub fn next(self) -> Self {
        Self::try_new(self.get() + 1).expect("incremented sequence is always valid")
    }

    /// The previous sequence number, saturating at zero.
    #[must_use]
    pub fn prev(self) -> Self {
        Self::try_new((self.get() - 1).max(0)).expect("clamped sequence is always valid")
    }
}

/// Per-stream version: the 1-based position of the latest event in its
/// stream, or 0 for a stream with no events.
///
/// A stream's version always equals the count of events ever appended to it
/// and never decreases.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct Version(u64);

impl Version {
    /// The version of a stream with no events.
    pub fn zero() -> Self {
        Self::new(0)
    }

    /// Returns the underlying number.
    pub fn get(self) -> u64 {
        self.into()
    }

    /// The version after one more event.
    #[must_use]
    pub fn next(self) -> Self {
        Self::new(self.get() + 1)
    }

    /// The version after `count` more events.
    #[must_use]
    pub fn advance(self, count: u64) -> Self {
        Self::new(self.get() + count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn stream_key_accepts_reasonable_strings(s in "[a-zA-Z0-9_/-]{1,255}") {
            let key = StreamKey::try_new(s.clone());
            prop_assert!(key.is_ok());
            let key = key.unwrap();
            prop_assert_eq!(key.as_ref(), &s);
        }

        #[test]
        fn stream_key_rejects_blank_strings(s in " {0,20}") {
            prop_assert!(StreamKey::try_new(s).is_err());
        }

        #[test]
        fn sequence_ordering_matches_integers(a in 0i64..i64::MAX, b in 0i64..i64::MAX) {
            let sa = Sequence::try_new(a).unwrap();
            let sb = Sequence::try_new(b).unwrap();
            prop_assert_eq!(sa < sb, a < b);
            prop_assert_eq!(sa == sb, a == b);
        }

        #[test]
        fn version_advance_adds_count(v in 0u64..1_000_000, n in 0u64..1_000) {
            prop_assert_eq!(Version::new(v).advance(n).get(), v + n);
        }
    }

    #[test]
    fn sequence_rejects_negative_values() {
        assert!(Sequence::try_new(-1).is_err());
    }

    #[test]
    fn sequence_prev_saturates_at_zero() {
        assert_eq!(Sequence::zero().prev(), Sequence::zero());
        assert_eq!(Sequence::try_new(5).unwrap().prev().get(), 4);
    }

    #[test]
    fn stream_key_from_uuid_round_trips() {
        let id = Uuid::now_v7();
        assert_eq!(StreamKey::from_uuid(id).as_ref(), &id.to_string());
    }

    #[test]
    fn version_zero_counts_no_events() {
        assert_eq!(Version::zero().get(), 0);
        assert_eq!(Version::zero().next().get(), 1);
    }

    #[test]
    fn tenant_defaults_to_marker_value() {
        assert_eq!(TenantId::default().as_ref(), "*DEFAULT*");
    }

    #[test]
    fn shard_name_identity_combines_projection_and_index() {
        let shard = ShardName::new(ProjectionName::try_new("orders").unwrap(), 2);
        assert_eq!(shard.identity(), "orders:2");
        assert_eq!(shard.to_string(), "orders:2");
        assert_eq!(shard.index(), 2);
    }
}
