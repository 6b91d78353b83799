//! Stale-while-revalidate cache.
//!
//! Entries are served after their TTL has elapsed, flagged as stale, so the
//! caller can answer immediately while a single background refresh brings
//! the entry up to date.
//!
//! ```text
//! set ──→ fresh ── ttl elapsed ──→ stale ── begin_revalidation ──→ revalidating
//!           ▲                                                       │
//!           └──────────────── ticket.complete(value) ───────────────┘
//! ```
//!
//! Storage is bounded by `max_entries`; inserting a new key into a full cache
//! evicts the least recently used entry. Reads and writes both count as use.

mod arena;
mod lookup;
mod revalidate;

pub use lookup::CacheLookup;
pub use revalidate::{RevalidationTicket, Revalidator};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kb_core::{CacheConfig, ComponentHealth, KbResult, SharedClock, SystemClock};

use crate::maintenance::Maintained;
use crate::stats::{bump, CacheMetrics, CacheStats};
use arena::LruArena;

struct SwrInner<V> {
    arena: Mutex<LruArena<V>>,
    next_token: AtomicU64,
    config: CacheConfig,
    clock: SharedClock,
    metrics: CacheMetrics,
}

/// Bounded stale-while-revalidate cache keyed by string.
///
/// Cloning is cheap; clones share the same entries.
pub struct SwrCache<V> {
    inner: Arc<SwrInner<V>>,
}

impl<V> Clone for SwrCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> std::fmt::Debug for SwrCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwrCache")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<V> SwrCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    pub fn with_clock(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(SwrInner {
                arena: Mutex::new(LruArena::new(config.max_entries)),
                next_token: AtomicU64::new(1),
                config,
                clock,
                metrics: CacheMetrics::default(),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn arena(&self) -> MutexGuard<'_, LruArena<V>> {
        self.inner
            .arena
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Look up `key`. Stale entries are returned with `is_stale() == true`.
    pub fn get(&self, key: &str) -> Option<CacheLookup<V>> {
        let mut arena = self.arena();
        let Some(slot) = arena.get(key) else {
            bump(&self.inner.metrics.misses);
            return None;
        };
        let age = self.inner.clock.elapsed_since(slot.stored_at);
        let lookup = CacheLookup::new(
            slot.value.clone(),
            slot.stored_at,
            slot.ttl,
            age,
            slot.revalidation.is_some(),
        );
        drop(arena);

        if lookup.is_stale() {
            bump(&self.inner.metrics.stale_hits);
        } else {
            bump(&self.inner.metrics.hits);
        }
        Some(lookup)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.arena().contains(key)
    }

    pub fn len(&self) -> usize {
        self.arena().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Insert or overwrite `key`. Overwriting clears any outstanding
    /// revalidation and restarts the TTL.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let now = self.inner.clock.now();
        let evicted = self.arena().insert(key.clone(), value, now, ttl);
        if let Some((evicted_key, _)) = evicted {
            bump(&self.inner.metrics.evictions);
            tracing::debug!(key = %key, evicted = %evicted_key, "Evicted least recently used entry");
        }
    }

    /// [`set`](Self::set) with the configured default TTL.
    pub fn set_default(&self, key: impl Into<String>, value: V) {
        self.set(key, value, self.inner.config.default_ttl());
    }

    /// Remove `key`. Returns whether it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.arena().remove(key).is_some();
        if removed {
            tracing::debug!(key = %key, "Invalidated cache entry");
        }
        removed
    }

    pub fn clear(&self) {
        self.arena().clear();
        tracing::debug!("Cleared cache");
    }

    /// Remove entries older than `ttl + grace` that are not being refreshed.
    pub fn sweep_expired(&self, grace: Duration) -> usize {
        let clock = &self.inner.clock;
        let removed = self.arena().retain(|_, slot| {
            slot.revalidation.is_some()
                || clock.elapsed_since(slot.stored_at) <= slot.ttl.saturating_add(grace)
        });
        if removed > 0 {
            self.inner
                .metrics
                .expired_swept
                .fetch_add(removed as u64, Ordering::Relaxed);
            tracing::info!(removed, "Swept expired cache entries");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.len();
        self.inner.metrics.snapshot(entries)
    }

    // ========================================================================
    // REVALIDATION
    // ========================================================================

    /// Claim the refresh of a stale entry.
    ///
    /// Returns `None` when the entry is missing, still fresh, or already
    /// being refreshed.
    pub fn begin_revalidation(&self, key: &str) -> Option<RevalidationTicket<V>> {
        let mut arena = self.arena();
        let slot = arena.peek_mut(key)?;
        if self.inner.clock.elapsed_since(slot.stored_at) <= slot.ttl {
            return None;
        }
        if slot.revalidation.is_some() {
            drop(arena);
            bump(&self.inner.metrics.revalidations_skipped);
            tracing::debug!(key = %key, "Revalidation already in flight");
            return None;
        }

        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        slot.revalidation = Some(token);
        let ttl = slot.ttl;
        drop(arena);

        bump(&self.inner.metrics.revalidations_started);
        tracing::debug!(key = %key, token, "Started revalidation");
        Some(RevalidationTicket::new(
            self.clone(),
            key.to_string(),
            token,
            ttl,
        ))
    }

    /// Return the cached value; if it is stale, refresh it in the background.
    ///
    /// The refresh runs on the current tokio runtime. Outside a runtime the
    /// stale value is still returned and no refresh happens.
    pub fn get_or_revalidate<R>(&self, key: &str, revalidator: Arc<R>) -> Option<CacheLookup<V>>
    where
        R: Revalidator<V> + ?Sized + 'static,
    {
        let lookup = self.get(key)?;
        if lookup.is_stale() {
            self.spawn_revalidation(key, revalidator);
        }
        Some(lookup)
    }

    /// Like [`get_or_revalidate`](Self::get_or_revalidate), but a miss awaits
    /// `revalidator` and stores the result under `ttl`.
    ///
    /// Concurrent misses for the same key each call the loader; wrap the
    /// loader in a [`RequestDeduplicator`](crate::RequestDeduplicator) to
    /// collapse them.
    pub async fn get_or_load<R>(
        &self,
        key: &str,
        ttl: Duration,
        revalidator: Arc<R>,
    ) -> KbResult<CacheLookup<V>>
    where
        R: Revalidator<V> + ?Sized + 'static,
    {
        if let Some(lookup) = self.get_or_revalidate(key, Arc::clone(&revalidator)) {
            return Ok(lookup);
        }

        let value = revalidator.load(key).await?;
        let stored_at = self.inner.clock.now();
        self.set(key, value.clone(), ttl);
        Ok(CacheLookup::new(value, stored_at, ttl, Duration::ZERO, false))
    }

    fn spawn_revalidation<R>(&self, key: &str, revalidator: Arc<R>) -> bool
    where
        R: Revalidator<V> + ?Sized + 'static,
    {
        let Some(ticket) = self.begin_revalidation(key) else {
            return false;
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                ticket.fail("no tokio runtime available");
                return false;
            }
        };

        let key = key.to_string();
        runtime.spawn(async move {
            match revalidator.load(&key).await {
                Ok(value) => {
                    ticket.complete(value);
                }
                Err(err) => ticket.fail(err),
            }
        });
        true
    }

    pub(crate) fn finish_revalidation(&self, key: &str, token: u64, value: V, ttl: Duration) -> bool {
        let now = self.inner.clock.now();
        let mut arena = self.arena();
        let current = arena.peek_mut(key).and_then(|slot| slot.revalidation);
        if current != Some(token) {
            return false;
        }
        arena.insert(key.to_string(), value, now, ttl);
        true
    }

    pub(crate) fn abandon_revalidation(&self, key: &str, token: u64) {
        if let Some(slot) = self.arena().peek_mut(key) {
            if slot.revalidation == Some(token) {
                slot.revalidation = None;
            }
        }
    }
}

impl<V> Maintained for SwrCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn sweep(&self) -> usize {
        self.sweep_expired(self.inner.config.sweep_grace())
    }

    fn clear(&self) {
        SwrCache::clear(self)
    }

    fn health(&self, component: &str) -> ComponentHealth {
        let stats = self.stats();
        ComponentHealth::healthy(component)
            .with_detail("entries", stats.entry_count)
            .with_detail("max_entries", self.inner.config.max_entries as u64)
            .with_detail("hits", stats.hits)
            .with_detail("stale_hits", stats.stale_hits)
            .with_detail("misses", stats.misses)
            .with_detail("evictions", stats.evictions)
            .with_detail("revalidations_failed", stats.revalidations_failed)
    }
}
