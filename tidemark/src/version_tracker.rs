//! Per-session memoization of last-seen stream versions and revisions.
//!
//! The tracker is a cache, never authoritative: it avoids redundant round
//! trips and lets staleness be detected before a flush. It lives and dies
//! with its owning session and is deliberately not shared across threads, so
//! it needs no synchronization of its own.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::hash::Hash;
use uuid::Uuid;

/// Cached version tokens and integer revisions for one (document type,
/// id type) pair.
#[derive(Debug, Default)]
pub struct TypedVersions<I> {
    versions: HashMap<I, Uuid>,
    revisions: HashMap<I, u64>,
}

impl<I: Eq + Hash + Clone> TypedVersions<I> {
    fn new() -> Self {
        Self {
            versions: HashMap::new(),
            revisions: HashMap::new(),
        }
    }

    /// The cached version token for `id`, if one has been observed.
    pub fn version_for(&self, id: &I) -> Option<Uuid> {
        self.versions.get(id).copied()
    }

    /// Records `version` for `id`, overwriting any previous entry.
    pub fn store_version(&mut self, id: I, version: Uuid) {
        self.versions.insert(id, version);
    }

    /// Removes exactly the version entry for `id`, leaving others untouched.
    pub fn clear_version(&mut self, id: &I) {
        self.versions.remove(id);
    }

    /// The cached integer revision for `id`, if one has been observed.
    pub fn revision_for(&self, id: &I) -> Option<u64> {
        self.revisions.get(id).copied()
    }

    /// Records `revision` for `id`, overwriting any previous entry.
    pub fn store_revision(&mut self, id: I, revision: u64) {
        self.revisions.insert(id, revision);
    }

    /// Removes exactly the revision entry for `id`.
    pub fn clear_revision(&mut self, id: &I) {
        self.revisions.remove(id);
    }
}

/// Session-scoped registry of [`TypedVersions`] maps keyed by concrete
/// (document type, id type) pairs.
///
/// Repeated calls to [`for_type`](Self::for_type) with the same pair return
/// the same map, so updates made at one call site are visible at every other.
/// Entries never expire on their own; their lifetime is the session's.
#[derive(Debug, Default)]
pub struct VersionTracker {
    maps: HashMap<(TypeId, TypeId), Box<dyn Any + Send>>,
}

impl VersionTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the map dedicated to documents of type `D` identified by `I`,
    /// creating it on first use.
    pub fn for_type<D, I>(&mut self) -> &mut TypedVersions<I>
    where
        D: 'static,
        I: Eq + Hash + Clone + Send + 'static,
    {
        self.maps
            .entry((TypeId::of::<D>(), TypeId::of::<I>()))
            .or_insert_with(|| Box::new(TypedVersions::<I>::new()))
            .downcast_mut::<TypedVersions<I>>()
            .expect("entry was registered under this (document, id) type pair")
    }

    /// Drops every cached entry.
    pub fn clear(&mut self) {
        self.maps.clear();
    }
}
