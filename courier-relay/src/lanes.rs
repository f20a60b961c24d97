//! Per-key async serialization.
//!
//! [`KeyedLocks`] hands out one async mutex per key (a recipient, a room) so
//! that operations on the same key run one at a time while unrelated keys
//! proceed in parallel. Locks are held across storage I/O, hence the tokio
//! mutex. Idle entries are dropped as soon as their last guard goes away.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A sharded map of async mutexes, one per key.
pub struct KeyedLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    /// Creates an empty lock map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &K) -> KeyGuard<'_, K> {
        let mutex = Arc::clone(&*self.locks.entry(key.clone()).or_default());
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or waited on.
    #[must_use]
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive access to one key; released on drop.
pub struct KeyGuard<'a, K: Eq + Hash> {
    locks: &'a KeyedLocks<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> KeyGuard<'_, K> {
    /// The key this guard holds.
    pub const fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map itself still references the mutex: nobody holds or
        // waits for it, so the entry can go.
        self.locks
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
