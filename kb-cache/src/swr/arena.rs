//! Fixed-capacity entry storage with least-recently-used eviction.

use std::num::NonZeroUsize;
use std::time::Duration;

use kb_core::Timestamp;
use lru::LruCache;

/// One cached value and its bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct Slot<V> {
    pub value: V,
    pub stored_at: Timestamp,
    pub ttl: Duration,
    /// Token of the outstanding revalidation, if any.
    pub revalidation: Option<u64>,
}

#[derive(Debug)]
pub(crate) struct LruArena<V> {
    slots: LruCache<String, Slot<V>>,
}

impl<V> LruArena<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.cap().get()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains(key)
    }

    /// Look up a slot and mark it most recently used.
    pub fn get(&mut self, key: &str) -> Option<&mut Slot<V>> {
        self.slots.get_mut(key)
    }

    /// Look up a slot without touching recency.
    pub fn peek_mut(&mut self, key: &str) -> Option<&mut Slot<V>> {
        self.slots.peek_mut(key)
    }

    /// Insert or overwrite. Returns the entry evicted to make room, if any.
    ///
    /// Overwriting an existing key never evicts and clears any outstanding
    /// revalidation.
    pub fn insert(
        &mut self,
        key: String,
        value: V,
        stored_at: Timestamp,
        ttl: Duration,
    ) -> Option<(String, Slot<V>)> {
        if let Some(slot) = self.slots.get_mut(&key) {
            slot.value = value;
            slot.stored_at = stored_at;
            slot.ttl = ttl;
            slot.revalidation = None;
            return None;
        }

        let slot = Slot {
            value,
            stored_at,
            ttl,
            revalidation: None,
        };
        self.slots.push(key, slot)
    }

    pub fn remove(&mut self, key: &str) -> Option<Slot<V>> {
        self.slots.pop(key)
    }

    /// Keep only slots for which `keep` returns true. Returns how many went.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&str, &Slot<V>) -> bool,
    {
        let doomed: Vec<String> = self
            .slots
            .iter()
            .filter(|(key, slot)| !keep(key, slot))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            self.slots.pop(key.as_str());
        }
        doomed.len()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}
