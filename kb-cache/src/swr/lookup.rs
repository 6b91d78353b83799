//! Result of a cache read, carrying staleness metadata.

use std::time::Duration;

use kb_core::Timestamp;

/// A cache hit.
///
/// Stale hits still carry the value: the cache serves what it has and leaves
/// the refresh to [`SwrCache::begin_revalidation`](super::SwrCache::begin_revalidation)
/// or [`SwrCache::get_or_revalidate`](super::SwrCache::get_or_revalidate).
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup<V> {
    value: V,
    stored_at: Timestamp,
    ttl: Duration,
    age: Duration,
    is_stale: bool,
    is_revalidating: bool,
}

impl<V> CacheLookup<V> {
    pub(crate) fn new(
        value: V,
        stored_at: Timestamp,
        ttl: Duration,
        age: Duration,
        is_revalidating: bool,
    ) -> Self {
        Self {
            value,
            stored_at,
            ttl,
            age,
            is_stale: age > ttl,
            is_revalidating,
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    /// True once the entry has outlived its TTL.
    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    pub fn is_fresh(&self) -> bool {
        !self.is_stale
    }

    /// True if a refresh for this key was outstanding at read time.
    pub fn is_revalidating(&self) -> bool {
        self.is_revalidating
    }

    pub fn stored_at(&self) -> Timestamp {
        self.stored_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Age of the entry when it was read.
    pub fn age(&self) -> Duration {
        self.age
    }

    /// How far past its TTL the entry was when read; zero while fresh.
    pub fn staleness(&self) -> Duration {
        self.age.saturating_sub(self.ttl)
    }

    /// When the entry turns (or turned) stale.
    pub fn expires_at(&self) -> Timestamp {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.stored_at.checked_add_signed(ttl))
            .unwrap_or(Timestamp::MAX_UTC)
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheLookup<U>
    where
        F: FnOnce(V) -> U,
    {
        CacheLookup {
            value: f(self.value),
            stored_at: self.stored_at,
            ttl: self.ttl,
            age: self.age,
            is_stale: self.is_stale,
            is_revalidating: self.is_revalidating,
        }
    }
}

impl<V> AsRef<V> for CacheLookup<V> {
    fn as_ref(&self) -> &V {
        &self.value
    }
}
