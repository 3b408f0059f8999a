//! Refcounted per-pod lock table.
//!
//! Serializes operations for one pod while letting distinct pods proceed in
//! parallel. Entries are created lazily on first use and removed as soon as
//! the refcount returns to zero, so balanced call patterns leave the table
//! empty. The table's own mutex is held only for bookkeeping, never across
//! a network operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{error, warn};

struct PodLockEntry {
    /// In-flight operations (holders plus waiters) for this key; the entry
    /// is removed when this reaches zero
    refcount: usize,
    lock: Arc<AsyncMutex<()>>,
}

/// Keyed mutex pool with lazy creation and eager cleanup.
#[derive(Default)]
pub struct PodLockTable {
    pods: Mutex<HashMap<String, PodLockEntry>>,
}

impl PodLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, PodLockEntry>> {
        // A poisoned table only means another thread panicked while doing
        // bookkeeping; the map itself is still consistent.
        self.pods.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bump the refcount for `key` (creating the entry if absent) and hand
    /// back its lock for the caller to acquire and hold for the duration of
    /// the operation. Pair every call with [`release`](Self::release).
    pub fn acquire(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut pods = self.table();
        let entry = pods.entry(key.to_string()).or_insert_with(|| PodLockEntry {
            refcount: 0,
            lock: Arc::new(AsyncMutex::new(())),
        });
        entry.refcount += 1;
        entry.lock.clone()
    }

    /// Drop one reference to `key`, removing the entry at refcount zero.
    pub fn release(&self, key: &str) {
        let mut pods = self.table();
        match pods.get_mut(key) {
            None => warn!("Unbalanced pod lock unref for {}", key),
            Some(entry) if entry.refcount == 0 => {
                // Should never happen; clean up anyway
                error!("Pod lock for {} still in table with zero refcount", key);
                pods.remove(key);
            }
            Some(entry) => {
                entry.refcount -= 1;
                if entry.refcount == 0 {
                    pods.remove(key);
                }
            }
        }
    }

    /// Acquire and lock in one step; the returned guard releases the lock
    /// and the refcount when dropped, on every exit path.
    pub async fn lock(&self, key: &str) -> PodLockGuard<'_> {
        let lock = self.acquire(key);
        let guard = lock.lock_owned().await;
        PodLockGuard {
            table: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.table().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}

/// RAII pairing of a held pod lock with its refcount.
pub struct PodLockGuard<'a> {
    table: &'a PodLockTable,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PodLockGuard<'_> {
    fn drop(&mut self) {
        // Unlock before the bookkeeping; waiters hold their own refcount,
        // so the entry cannot vanish under them.
        self.guard.take();
        self.table.release(&self.key);
    }
}
