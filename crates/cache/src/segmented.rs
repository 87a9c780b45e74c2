//! Two-tier (hot/cold) bounded cache with single-flight population.
//!
//! New entries land in the cold tier. Touching a cold entry again promotes it
//! to the hot tier. When the cache grows past capacity, entries are evicted
//! from the cold tier first (least recently accessed first), and only then
//! from the hot tier, so a burst of one-off lookups cannot push out the
//! entries that are actually being reused. The entry being inserted is never
//! the one evicted to make room for itself.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type EvictionError = Box<dyn std::error::Error + Send + Sync>;
/// Called with every entry leaving the cache, on a spawned task.
pub type EvictionCallback<K, V> = Arc<dyn Fn(K, V) -> BoxFuture<'static, Result<(), EvictionError>> + Send + Sync>;
/// Decides whether a freshly built value is worth keeping.
pub type Admission<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Hot,
    Cold,
}

struct Slot<V> {
    value: V,
    last_access: u64,
}

struct Pending<V, E> {
    generation: u64,
    future: Shared<BoxFuture<'static, Result<V, E>>>,
}

struct Segments<K, V, E> {
    hot: HashMap<K, Slot<V>>,
    cold: HashMap<K, Slot<V>>,
    pending: HashMap<K, Pending<V, E>>,
    /// Logical clock for last-access ordering.
    clock: u64,
    generation: u64,
}

impl<K: Eq + Hash + Clone, V: Clone, E> Segments<K, V, E> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn len(&self) -> usize {
        self.hot.len() + self.cold.len()
    }

    fn touch(&mut self, key: &K) -> Option<V> {
        let now = self.tick();
        if let Some(slot) = self.hot.get_mut(key) {
            slot.last_access = now;
            return Some(slot.value.clone());
        }
        let mut slot = self.cold.remove(key)?;
        slot.last_access = now;
        let value = slot.value.clone();
        self.hot.insert(key.clone(), slot);
        Some(value)
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        // A population still in flight must not land after the removal.
        self.pending.remove(key);
        self.hot.remove(key).or_else(|| self.cold.remove(key)).map(|slot| slot.value)
    }

    /// Get back under `capacity`, sparing `keep`.
    fn compact(&mut self, capacity: usize, batch: usize, keep: &K) -> Vec<(K, V)> {
        let len = self.len();
        if len <= capacity {
            return Vec::new();
        }
        let count = batch.max(len - capacity).min(len - 1);
        let mut evicted = Self::evict_oldest(&mut self.cold, count, keep);
        let remaining = count - evicted.len();
        evicted.extend(Self::evict_oldest(&mut self.hot, remaining, keep));
        evicted
    }

    fn evict_oldest(tier: &mut HashMap<K, Slot<V>>, count: usize, keep: &K) -> Vec<(K, V)> {
        if count == 0 {
            return Vec::new();
        }
        let mut candidates: Vec<(u64, K)> = tier
            .iter()
            .filter(|(k, _)| *k != keep)
            .map(|(k, slot)| (slot.last_access, k.clone()))
            .collect();
        candidates.sort_unstable_by_key(|(last_access, _)| *last_access);
        candidates
            .into_iter()
            .take(count)
            .filter_map(|(_, key)| tier.remove(&key).map(|slot| (key, slot.value)))
            .collect()
    }
}

/// Bounded key-value cache. Every entry weighs 1.
pub struct SegmentedCache<K, V, E> {
    segments: Mutex<Segments<K, V, E>>,
    capacity: usize,
    compaction_batch: usize,
    on_evict: Option<EvictionCallback<K, V>>,
    admit: Option<Admission<V>>,
}

impl<K, V, E> SegmentedCache<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            segments: Mutex::new(Segments {
                hot: HashMap::new(),
                cold: HashMap::new(),
                pending: HashMap::new(),
                clock: 0,
                generation: 0,
            }),
            capacity: capacity.max(1),
            compaction_batch: 1,
            on_evict: None,
            admit: None,
        }
    }

    /// Evict at least `batch` entries whenever the cache overflows, instead
    /// of just enough to get back under capacity.
    pub fn with_compaction_batch(mut self, batch: usize) -> Self {
        self.compaction_batch = batch.max(1);
        self
    }

    pub fn with_eviction_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(K, V) -> BoxFuture<'static, Result<(), EvictionError>> + Send + Sync + 'static,
    {
        self.on_evict = Some(Arc::new(callback));
        self
    }

    /// Values rejected by `admit` are handed to their callers but never
    /// stored, so they cannot push anything else out.
    pub fn with_admission<F>(mut self, admit: F) -> Self
    where
        F: Fn(&V) -> bool + Send + Sync + 'static,
    {
        self.admit = Some(Arc::new(admit));
        self
    }

    fn lock(&self) -> MutexGuard<'_, Segments<K, V, E>> {
        // Nothing in here panics while holding the lock, but a poisoned
        // cache is still a consistent cache.
        self.segments.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the cached value for `key`, or build it with `factory`.
    ///
    /// Concurrent callers for the same key share one invocation of `factory`
    /// and all receive its result, error included. Errors are not cached, and
    /// neither are values the admission check rejects.
    pub async fn get_or_add<F, Fut>(&self, key: K, factory: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (generation, future) = {
            let mut segments = self.lock();
            if let Some(value) = segments.touch(&key) {
                return Ok(value);
            }
            match segments.pending.get(&key) {
                Some(pending) => (pending.generation, pending.future.clone()),
                None => {
                    segments.generation += 1;
                    let generation = segments.generation;
                    let future = factory().boxed().shared();
                    segments.pending.insert(key.clone(), Pending { generation, future: future.clone() });
                    (generation, future)
                },
            }
        };
        let result = future.await;
        let evicted = {
            let mut segments = self.lock();
            // Whoever gets here first settles the entry; the others find it
            // already gone from `pending` (or replaced by a newer population).
            let settles = segments.pending.get(&key).is_some_and(|pending| pending.generation == generation);
            match (settles, &result) {
                (true, Ok(value)) if self.admits(value) => {
                    segments.pending.remove(&key);
                    let now = segments.tick();
                    segments.cold.insert(key.clone(), Slot { value: value.clone(), last_access: now });
                    segments.compact(self.capacity, self.compaction_batch, &key)
                },
                (true, _) => {
                    segments.pending.remove(&key);
                    Vec::new()
                },
                (false, _) => Vec::new(),
            }
        };
        self.dispatch_evictions(evicted);
        result
    }

    fn admits(&self, value: &V) -> bool {
        self.admit.as_ref().is_none_or(|admit| admit(value))
    }

    /// Cached value, promoting it to the hot tier.
    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().touch(key)
    }

    /// Cached value without counting as an access.
    pub fn peek(&self, key: &K) -> Option<V> {
        let segments = self.lock();
        segments.hot.get(key).or_else(|| segments.cold.get(key)).map(|slot| slot.value.clone())
    }

    pub fn tier(&self, key: &K) -> Option<Tier> {
        let segments = self.lock();
        if segments.hot.contains_key(key) {
            return Some(Tier::Hot);
        }
        segments.cold.contains_key(key).then_some(Tier::Cold)
    }

    /// Drop an entry (and abandon any population in flight for it). The
    /// eviction callback fires for a removed value.
    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = self.lock().remove(key);
        if let Some(value) = &removed {
            self.dispatch_evictions(vec![(key.clone(), value.clone())]);
        }
        removed
    }

    /// Like [`remove`](Self::remove), but only while `predicate` holds for
    /// the value currently stored. A population in flight is left alone.
    pub fn remove_if(&self, key: &K, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        let removed = {
            let mut segments = self.lock();
            let stored = segments.hot.get(key).or_else(|| segments.cold.get(key));
            match stored.is_some_and(|slot| predicate(&slot.value)) {
                true => segments.hot.remove(key).or_else(|| segments.cold.remove(key)).map(|slot| slot.value),
                false => None,
            }
        };
        if let Some(value) = &removed {
            self.dispatch_evictions(vec![(key.clone(), value.clone())]);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hot_len(&self) -> usize {
        self.lock().hot.len()
    }

    pub fn cold_len(&self) -> usize {
        self.lock().cold.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn dispatch_evictions(&self, evicted: Vec<(K, V)>) {
        let Some(callback) = &self.on_evict else {
            return;
        };
        if evicted.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(count = evicted.len(), "No async runtime; skipping eviction callbacks");
            return;
        };
        for (key, value) in evicted {
            let callback = Arc::clone(callback);
            runtime.spawn(async move {
                match AssertUnwindSafe(async move { callback(key, value).await }).catch_unwind().await {
                    Ok(Ok(())) => {},
                    Ok(Err(err)) => tracing::warn!(error = %err, "Eviction callback failed"),
                    Err(_) => tracing::warn!("Eviction callback panicked"),
                }
            });
        }
    }
}
