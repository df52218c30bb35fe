//! # Presence Cache
//!
//! Remembers which certificate IDs were already written, so the manager can skip
//! them before they reach a worker.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use crate::updater::IdHash;

pub trait PresenceCache: Send + Sync {
    fn contains(&self, id: &IdHash) -> bool;
    fn add_ids(&self, ids: &[IdHash]);
}

/// Never contains anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl PresenceCache for NoCache {
    fn contains(&self, _id: &IdHash) -> bool {
        false
    }

    fn add_ids(&self, _ids: &[IdHash]) {}
}

/// Unbounded set of every ID added.
#[derive(Debug, Default)]
pub struct SetCache {
    ids: RwLock<HashSet<IdHash>>,
}

impl SetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: RwLock::new(HashSet::with_capacity(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PresenceCache for SetCache {
    fn contains(&self, id: &IdHash) -> bool {
        self.ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    fn add_ids(&self, ids: &[IdHash]) {
        self.ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(ids.iter().copied());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cache_is_always_empty() {
        let cache = NoCache;
        let id = IdHash::of(b"x");
        cache.add_ids(&[id]);
        assert!(!cache.contains(&id));
    }

    #[test]
    fn test_set_cache_remembers_ids() {
        let cache = SetCache::with_capacity(4);
        let (a, b) = (IdHash::of(b"a"), IdHash::of(b"b"));
        assert!(cache.is_empty());

        cache.add_ids(&[a, a]);
        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert_eq!(cache.len(), 1);
    }
}
