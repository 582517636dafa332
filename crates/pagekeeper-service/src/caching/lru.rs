use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::utils::sync::lock;

/// The "cost" of keeping a value in a [`ByteBudgetLruCache`].
pub trait CacheWeight {
    /// The size in bytes this value counts towards the byte budget.
    fn weight(&self) -> u64;
}

impl CacheWeight for crate::types::Bitmap {
    fn weight(&self) -> u64 {
        self.byte_size()
    }
}

/// A value was not cached because it alone exceeds the byte budget.
///
/// This is not fatal, the caller still owns the value and can use it uncached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("entry of {size} bytes exceeds the cache budget of {max_bytes} bytes")]
pub struct CacheRejected {
    pub size: u64,
    pub max_bytes: u64,
}

type EvictionListener<K> = Arc<dyn Fn(&K, u64) + Send + Sync>;

struct Slot<V> {
    value: V,
    size: u64,
    tick: u64,
}

struct LruState<K, V> {
    entries: HashMap<K, Slot<V>>,
    /// Recency order, the smallest tick is the least recently used entry.
    recency: BTreeMap<u64, K>,
    next_tick: u64,
    current_bytes: u64,
    max_bytes: u64,
}

impl<K: Eq + Hash + Clone, V> LruState<K, V> {
    fn tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn remove(&mut self, key: &K) -> Option<Slot<V>> {
        let slot = self.entries.remove(key)?;
        self.recency.remove(&slot.tick);
        self.current_bytes -= slot.size;
        Some(slot)
    }

    /// Evicts least recently used entries until `current_bytes + incoming <= max_bytes`.
    fn evict_to_fit(&mut self, incoming: u64, evicted: &mut Vec<(K, u64)>) {
        while self.current_bytes + incoming > self.max_bytes {
            let Some((_, key)) = self.recency.pop_first() else {
                break;
            };
            if let Some(slot) = self.entries.remove(&key) {
                self.current_bytes -= slot.size;
                evicted.push((key, slot.size));
            }
        }
    }
}

/// A cache with a fixed byte budget that evicts least recently used entries.
///
/// Every value is weighed exactly once when it is inserted. All bookkeeping happens under a
/// single short-lived lock per cache, so no observer ever sees `size_bytes() > max_bytes()`.
///
/// The cache is cheap to clone, all clones share the same entries.
pub struct ByteBudgetLruCache<K, V> {
    name: &'static str,
    state: Arc<Mutex<LruState<K, V>>>,
    listener: Option<EvictionListener<K>>,
}

impl<K, V> Clone for ByteBudgetLruCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            state: Arc::clone(&self.state),
            listener: self.listener.clone(),
        }
    }
}

impl<K, V> fmt::Debug for ByteBudgetLruCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("ByteBudgetLruCache")
            .field("name", &self.name)
            .field("entries", &state.entries.len())
            .field("current_bytes", &state.current_bytes)
            .field("max_bytes", &state.max_bytes)
            .finish()
    }
}

impl<K, V> ByteBudgetLruCache<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: CacheWeight + Clone,
{
    pub fn new(name: &'static str, max_bytes: u64) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(LruState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_tick: 0,
                current_bytes: 0,
                max_bytes,
            })),
            listener: None,
        }
    }

    /// Registers a callback that is invoked with the key and reclaimed bytes of every evicted
    /// entry.
    ///
    /// The callback runs after the cache lock is released.
    pub fn with_eviction_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&K, u64) + Send + Sync + 'static,
    {
        self.listener = Some(Arc::new(listener));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Looks up `key`, marking it as the most recently used entry.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = lock(&self.state);
        let tick = state.tick();
        let slot = state.entries.get_mut(key)?;
        let old_tick = std::mem::replace(&mut slot.tick, tick);
        let value = slot.value.clone();
        state.recency.remove(&old_tick);
        state.recency.insert(tick, key.clone());
        Some(value)
    }

    /// Returns whether `key` is cached, without touching its recency.
    pub fn contains(&self, key: &K) -> bool {
        lock(&self.state).entries.contains_key(key)
    }

    /// Inserts `value`, evicting least recently used entries as needed.
    ///
    /// A value larger than the whole budget is rejected instead of flushing the cache for it.
    /// Replacing an existing key releases the bytes of the previous value first.
    pub fn put(&self, key: K, value: V) -> Result<(), CacheRejected> {
        let size = value.weight();
        let mut evicted = Vec::new();
        {
            let mut state = lock(&self.state);
            if size > state.max_bytes {
                let max_bytes = state.max_bytes;
                drop(state);
                tracing::debug!(cache = self.name, ?key, size, max_bytes, "Rejecting oversized entry");
                metric!(counter("caches.rejected") += 1, "cache" => self.name);
                return Err(CacheRejected { size, max_bytes });
            }

            state.remove(&key);
            state.evict_to_fit(size, &mut evicted);

            let tick = state.tick();
            state.recency.insert(tick, key.clone());
            state.entries.insert(key, Slot { value, size, tick });
            state.current_bytes += size;
        }

        self.notify_evicted(evicted);
        Ok(())
    }

    /// Removes `key` from the cache, returning its value.
    pub fn remove(&self, key: &K) -> Option<V> {
        lock(&self.state).remove(key).map(|slot| slot.value)
    }

    /// Removes every entry.
    pub fn evict_all(&self) {
        let evicted: Vec<_> = {
            let mut state = lock(&self.state);
            state.recency.clear();
            state.current_bytes = 0;
            state
                .entries
                .drain()
                .map(|(key, slot)| (key, slot.size))
                .collect()
        };
        self.notify_evicted(evicted);
    }

    /// The total size of all cached entries.
    pub fn size_bytes(&self) -> u64 {
        lock(&self.state).current_bytes
    }

    pub fn max_bytes(&self) -> u64 {
        lock(&self.state).max_bytes
    }

    /// Changes the byte budget, evicting entries right away if the new budget is smaller.
    pub fn set_max_bytes(&self, max_bytes: u64) {
        let mut evicted = Vec::new();
        {
            let mut state = lock(&self.state);
            state.max_bytes = max_bytes;
            state.evict_to_fit(0, &mut evicted);
        }
        tracing::debug!(cache = self.name, max_bytes, "Changed cache budget");
        self.notify_evicted(evicted);
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify_evicted(&self, evicted: Vec<(K, u64)>) {
        if evicted.is_empty() {
            return;
        }
        metric!(counter("caches.evictions") += evicted.len() as i64, "cache" => self.name);
        for (key, size) in evicted {
            tracing::trace!(cache = self.name, ?key, reclaimed = size, "Evicted entry");
            if let Some(listener) = &self.listener {
                listener(&key, size);
            }
        }
    }
}
