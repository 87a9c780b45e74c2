//! Keyed write locks with a bounded wait.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Serializes writers per key.
///
/// A writer that cannot acquire its key within the configured timeout gets
/// `None` back and is expected to skip its write; the next reconciliation
/// will pick up whatever it missed.
pub struct WriteLocks<K> {
    locks: Mutex<HashMap<K, Weak<AsyncMutex<()>>>>,
    timeout: Duration,
}

impl<K: Eq + Hash + Clone + Debug> WriteLocks<K> {
    pub fn new(timeout: Duration) -> Self {
        Self { locks: Mutex::new(HashMap::new()), timeout }
    }

    pub async fn acquire(&self, key: &K) -> Option<OwnedMutexGuard<()>> {
        let lock = self.lock_for(key);
        match tokio::time::timeout(self.timeout, lock.lock_owned()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::warn!(key = ?key, timeout = ?self.timeout, "Timed out waiting for write lock; skipping write");
                None
            },
        }
    }

    fn lock_for(&self, key: &K) -> Arc<AsyncMutex<()>> {
        // A poisoned map only means another thread panicked mid-insert; the
        // map itself is still usable.
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = locks.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(key.clone(), Arc::downgrade(&lock));
        lock
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}
