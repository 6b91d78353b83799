//! Request deduplication.
//!
//! [`RequestDeduplicator::deduped_fetch`] collapses concurrent calls that share
//! a key into one upstream request. The first caller's factory runs; every
//! caller that arrives before it settles gets a handle to the same in-flight
//! result and observes the same `Ok` or `Err` value.
//!
//! # Registration lifecycle
//!
//! ```text
//! deduped_fetch(k) ── vacant ──→ register(gen = n) ──→ in flight ──→ settled ─→ removed
//!        │                                   ▲             │
//!        └── occupied & live ── join ────────┘             └─ all handles dropped ─→ removed
//! ```
//!
//! The registry holds only a weak reference to the in-flight future, so a
//! registration disappears when the request settles or when every caller has
//! dropped its handle. Removal is generation-checked: a late cleanup for an
//! older registration never removes a newer one under the same key.
//!
//! # Bounds
//!
//! - `max_pending`: when that many keys are in flight, calls for new keys run
//!   their factory unregistered (logged at `warn`).
//! - `pending_ttl`: registrations older than this are forgotten by
//!   [`RequestDeduplicator::sweep_expired`] and replaced on the next call for the
//!   same key. The original request keeps running for the callers already
//!   holding its handle.
//!
//! Neither bound produces an error; the deduplicator only ever relays the
//! factory's own result.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared, WeakShared};
use kb_core::{ComponentHealth, DedupConfig, KbError, SharedClock, SystemClock, Timestamp};

use crate::maintenance::Maintained;
use crate::stats::{bump, DedupMetrics, DedupStats};

/// Handle to a request that may be shared with other callers.
///
/// Awaiting it yields a clone of the request's result.
pub type InFlight<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

type WeakInFlight<T, E> = WeakShared<BoxFuture<'static, Result<T, E>>>;

struct PendingEntry<T, E> {
    handle: WeakInFlight<T, E>,
    generation: u64,
    registered_at: Timestamp,
}

struct DedupInner<T, E> {
    pending: DashMap<String, PendingEntry<T, E>>,
    next_generation: AtomicU64,
    config: DedupConfig,
    clock: SharedClock,
    metrics: DedupMetrics,
}

/// Collapses concurrent identical requests into one.
///
/// Cloning is cheap; clones share the same registry.
///
/// # Example
///
/// ```ignore
/// let dedup: RequestDeduplicator<Company> = RequestDeduplicator::new(DedupConfig::default());
///
/// // Both calls share one upstream query.
/// let a = dedup.deduped_fetch("company:1", || fetch_company(1));
/// let b = dedup.deduped_fetch("company:1", || fetch_company(1));
/// let (a, b) = futures_util::join!(a, b);
/// ```
pub struct RequestDeduplicator<T, E = KbError> {
    inner: Arc<DedupInner<T, E>>,
}

impl<T, E> Clone for RequestDeduplicator<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> RequestDeduplicator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create a deduplicator using the system clock.
    pub fn new(config: DedupConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    /// Create a deduplicator reading time from `clock`.
    pub fn with_clock(config: DedupConfig, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(DedupInner {
                pending: DashMap::new(),
                next_generation: AtomicU64::new(1),
                config,
                clock,
                metrics: DedupMetrics::default(),
            }),
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.inner.config
    }

    /// Run `factory` for `key` unless a request for `key` is already in flight.
    ///
    /// The factory is invoked at most once per registration, when the returned
    /// handle is first polled. It must not block; its future carries the
    /// actual work.
    pub fn deduped_fetch<F, Fut>(&self, key: impl Into<String>, factory: F) -> InFlight<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let key = key.into();
        let inner = &self.inner;

        // Checked outside the entry lock: `len` reads every shard.
        if !inner.pending.contains_key(&key) && inner.pending.len() >= inner.config.max_pending {
            bump(&inner.metrics.bypassed);
            tracing::warn!(
                key = %key,
                max_pending = inner.config.max_pending,
                "Pending request bound reached, running request without deduplication"
            );
            return async move { factory().await }.boxed().shared();
        }

        match inner.pending.entry(key) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get();
                if self.is_expired(existing) {
                    bump(&inner.metrics.expired);
                    tracing::debug!(
                        key = %occupied.key(),
                        generation = existing.generation,
                        "Replacing expired in-flight registration"
                    );
                } else if let Some(handle) = existing.handle.upgrade() {
                    bump(&inner.metrics.joined);
                    tracing::debug!(key = %occupied.key(), "Joined in-flight request");
                    return handle;
                }

                let (handle, entry) = self.register(occupied.key().clone(), factory);
                match entry {
                    Some(entry) => {
                        occupied.insert(entry);
                    }
                    None => {
                        occupied.remove();
                    }
                }
                handle
            }
            Entry::Vacant(vacant) => {
                let (handle, entry) = self.register(vacant.key().clone(), factory);
                if let Some(entry) = entry {
                    vacant.insert(entry);
                }
                handle
            }
        }
    }

    fn register<F, Fut>(
        &self,
        key: String,
        factory: F,
    ) -> (InFlight<T, E>, Option<PendingEntry<T, E>>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let settle = SettleGuard {
            registry: Arc::downgrade(&self.inner),
            key: key.clone(),
            generation,
        };

        // The guard is captured by value so that dropping an unpolled handle
        // still removes the registration.
        let handle = async move {
            let _settle = settle;
            factory().await
        }
        .boxed()
        .shared();

        bump(&self.inner.metrics.leaders);
        tracing::debug!(key = %key, generation, "Registered deduplicated request");

        let entry = handle.downgrade().map(|weak| PendingEntry {
            handle: weak,
            generation,
            registered_at: self.inner.clock.now(),
        });
        (handle, entry)
    }

    fn is_expired(&self, entry: &PendingEntry<T, E>) -> bool {
        self.inner
            .config
            .pending_ttl()
            .is_some_and(|ttl| self.inner.clock.elapsed_since(entry.registered_at) > ttl)
    }

    /// Whether a request for `key` is currently registered.
    pub fn is_pending(&self, key: &str) -> bool {
        self.inner.pending.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Forget registrations older than `pending_ttl`.
    ///
    /// Returns the number of registrations removed. Does nothing when expiry is
    /// disabled.
    pub fn sweep_expired(&self) -> usize {
        let Some(ttl) = self.inner.config.pending_ttl() else {
            return 0;
        };
        let clock = &self.inner.clock;
        let mut removed = 0usize;
        self.inner.pending.retain(|_, entry| {
            let keep = clock.elapsed_since(entry.registered_at) <= ttl;
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            self.inner
                .metrics
                .expired
                .fetch_add(removed as u64, Ordering::Relaxed);
            tracing::info!(removed, "Swept expired in-flight registrations");
        }
        removed
    }

    /// Forget every registration. Handles already given out still resolve.
    pub fn clear(&self) {
        let count = self.inner.pending.len();
        self.inner.pending.clear();
        tracing::debug!(count, "Cleared in-flight registrations");
    }

    pub fn stats(&self) -> DedupStats {
        self.inner.metrics.snapshot(self.inner.pending.len())
    }
}

impl<T, E> Maintained for RequestDeduplicator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn sweep(&self) -> usize {
        self.sweep_expired()
    }

    fn clear(&self) {
        RequestDeduplicator::clear(self)
    }

    fn health(&self, component: &str) -> ComponentHealth {
        let stats = self.stats();
        let max_pending = self.inner.config.max_pending as u64;
        let health = if stats.pending >= max_pending {
            ComponentHealth::degraded(component, "pending request bound reached")
        } else {
            ComponentHealth::healthy(component)
        };
        health
            .with_detail("pending", stats.pending)
            .with_detail("max_pending", max_pending)
            .with_detail("leaders", stats.leaders)
            .with_detail("joined", stats.joined)
            .with_detail("bypassed", stats.bypassed)
            .with_detail("expired", stats.expired)
    }
}

/// Removes its registration when the in-flight future finishes or is dropped.
struct SettleGuard<T, E> {
    registry: Weak<DedupInner<T, E>>,
    key: String,
    generation: u64,
}

impl<T, E> Drop for SettleGuard<T, E> {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            let generation = self.generation;
            if inner
                .pending
                .remove_if(&self.key, |_, entry| entry.generation == generation)
                .is_some()
            {
                tracing::trace!(key = %self.key, generation, "Settled deduplicated request");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use kb_core::{FetchError, ManualClock};
    use kb_test_utils::{wait_until, GatedFactory};
    use std::time::Duration;

    fn dedup() -> RequestDeduplicator<String, FetchError> {
        RequestDeduplicator::new(DedupConfig::default())
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_one_factory_invocation() {
        let dedup = dedup();
        let gate = GatedFactory::<String>::new();

        let first = tokio::spawn(dedup.deduped_fetch("company:1", gate.factory()));
        wait_until(|| gate.calls() == 1).await;
        let second = tokio::spawn(dedup.deduped_fetch("company:1", gate.factory()));

        gate.resolve("Acme".to_string());

        assert_eq!(first.await.unwrap(), Ok("Acme".to_string()));
        assert_eq!(second.await.unwrap(), Ok("Acme".to_string()));
        assert_eq!(gate.calls(), 1);
    }

    #[tokio::test]
    async fn test_five_callers_receive_identical_result() {
        let dedup = dedup();
        let gate = GatedFactory::<String>::new();

        let handles: Vec<_> = (0..5)
            .map(|_| tokio::spawn(dedup.deduped_fetch("company:1", gate.factory())))
            .collect();
        wait_until(|| gate.calls() == 1).await;
        gate.resolve("Acme Corp".to_string());

        let results = join_all(handles).await;
        for result in results {
            assert_eq!(result.unwrap(), Ok("Acme Corp".to_string()));
        }
        assert_eq!(gate.calls(), 1);

        let stats = dedup.stats();
        assert_eq!(stats.leaders, 1);
        assert_eq!(stats.joined, 4);
    }

    #[tokio::test]
    async fn test_settled_request_is_not_memoized() {
        let dedup = dedup();
        let gate = GatedFactory::<String>::new();
        gate.resolve("v1".to_string());

        let first = dedup.deduped_fetch("deal:7", gate.factory()).await;
        assert_eq!(first, Ok("v1".to_string()));
        assert!(!dedup.is_pending("deal:7"));

        let second = dedup.deduped_fetch("deal:7", gate.factory()).await;
        assert_eq!(second, Ok("v1".to_string()));
        assert_eq!(gate.calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter_and_clears_registration() {
        let dedup = dedup();
        let gate = GatedFactory::<String>::new();

        let a = dedup.deduped_fetch("contact:3", gate.factory());
        let b = dedup.deduped_fetch("contact:3", gate.factory());
        assert!(dedup.is_pending("contact:3"));

        gate.fail(FetchError::upstream("contact:3", "503"));
        let (a, b) = futures_util::join!(a, b);

        let expected = Err(FetchError::upstream("contact:3", "503"));
        assert_eq!(a, expected);
        assert_eq!(b, expected);
        assert_eq!(gate.calls(), 1);
        assert!(!dedup.is_pending("contact:3"));
    }

    #[tokio::test]
    async fn test_dropping_every_handle_removes_registration() {
        let dedup = dedup();
        let gate = GatedFactory::<String>::new();

        let handle = dedup.deduped_fetch("invoice:11", gate.factory());
        let joined = dedup.deduped_fetch("invoice:11", gate.factory());
        assert!(dedup.is_pending("invoice:11"));

        drop(handle);
        assert!(dedup.is_pending("invoice:11"));
        drop(joined);
        assert!(!dedup.is_pending("invoice:11"));
        assert_eq!(gate.calls(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_share() {
        let dedup = dedup();
        let gate = GatedFactory::<String>::new();
        gate.resolve("x".to_string());

        let (a, b) = futures_util::join!(
            dedup.deduped_fetch("a", gate.factory()),
            dedup.deduped_fetch("b", gate.factory())
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(gate.calls(), 2);
    }

    #[tokio::test]
    async fn test_max_pending_bypasses_registration() {
        let dedup: RequestDeduplicator<String, FetchError> =
            RequestDeduplicator::new(DedupConfig::default().with_max_pending(1));
        let gate = GatedFactory::<String>::new();

        let held = dedup.deduped_fetch("a", gate.factory());
        let bypassed = dedup.deduped_fetch("b", gate.factory());

        assert!(dedup.is_pending("a"));
        assert!(!dedup.is_pending("b"));
        assert_eq!(dedup.stats().bypassed, 1);

        // Joining an already registered key is still allowed at the bound.
        let joined = dedup.deduped_fetch("a", gate.factory());
        assert_eq!(dedup.stats().joined, 1);

        gate.resolve("ok".to_string());
        let (held, bypassed, joined) = futures_util::join!(held, bypassed, joined);
        assert_eq!(held, Ok("ok".to_string()));
        assert_eq!(bypassed, Ok("ok".to_string()));
        assert_eq!(joined, Ok("ok".to_string()));
        assert_eq!(gate.calls(), 2);
    }

    #[tokio::test]
    async fn test_expired_registration_is_replaced() {
        let clock = ManualClock::starting_now();
        let config = DedupConfig::default().with_pending_ttl(Some(Duration::from_secs(1)));
        let dedup: RequestDeduplicator<String, FetchError> =
            RequestDeduplicator::with_clock(config, clock.shared());
        let stuck = GatedFactory::<String>::new();
        let fresh = GatedFactory::<String>::new();

        let old = dedup.deduped_fetch("report:q3", stuck.factory());
        clock.advance(Duration::from_secs(2));
        let new = dedup.deduped_fetch("report:q3", fresh.factory());
        assert_eq!(dedup.stats().expired, 1);

        // Settling the old request must not remove the newer registration.
        stuck.resolve("old".to_string());
        assert_eq!(old.await, Ok("old".to_string()));
        assert!(dedup.is_pending("report:q3"));

        fresh.resolve("new".to_string());
        assert_eq!(new.await, Ok("new".to_string()));
        assert!(!dedup.is_pending("report:q3"));
    }

    #[tokio::test]
    async fn test_sweep_expired_keeps_request_running() {
        let clock = ManualClock::starting_now();
        let config = DedupConfig::default().with_pending_ttl(Some(Duration::from_secs(5)));
        let dedup: RequestDeduplicator<String, FetchError> =
            RequestDeduplicator::with_clock(config, clock.shared());
        let gate = GatedFactory::<String>::new();

        let young_gate = GatedFactory::<String>::new();
        let old = dedup.deduped_fetch("old", gate.factory());
        clock.advance(Duration::from_secs(6));
        let _young = dedup.deduped_fetch("young", young_gate.factory());

        assert_eq!(dedup.sweep_expired(), 1);
        assert!(!dedup.is_pending("old"));
        assert!(dedup.is_pending("young"));

        gate.resolve("still here".to_string());
        assert_eq!(old.await, Ok("still here".to_string()));
    }

    #[tokio::test]
    async fn test_sub_millisecond_ttl_still_expires() {
        let clock = ManualClock::starting_now();
        let config = DedupConfig::default().with_pending_ttl(Some(Duration::from_micros(500)));
        let dedup: RequestDeduplicator<String, FetchError> =
            RequestDeduplicator::with_clock(config, clock.shared());
        let gate = GatedFactory::<String>::new();

        let _handle = dedup.deduped_fetch("k", gate.factory());
        clock.advance(Duration::from_secs(3_600));
        assert_eq!(dedup.sweep_expired(), 1);
        assert!(!dedup.is_pending("k"));
    }

    #[tokio::test]
    async fn test_sweep_without_ttl_is_noop() {
        let config = DedupConfig::default().with_pending_ttl(None);
        let dedup: RequestDeduplicator<String, FetchError> = RequestDeduplicator::new(config);
        let gate = GatedFactory::<String>::new();
        let _handle = dedup.deduped_fetch("k", gate.factory());
        assert_eq!(dedup.sweep_expired(), 0);
        assert!(dedup.is_pending("k"));
    }

    #[tokio::test]
    async fn test_clear_forgets_but_handles_resolve() {
        let dedup = dedup();
        let gate = GatedFactory::<String>::new();
        let handle = dedup.deduped_fetch("k", gate.factory());
        dedup.clear();
        assert_eq!(dedup.pending_count(), 0);

        gate.resolve("done".to_string());
        assert_eq!(handle.await, Ok("done".to_string()));
    }

    #[tokio::test]
    async fn test_health_degrades_at_bound() {
        let dedup: RequestDeduplicator<String, FetchError> =
            RequestDeduplicator::new(DedupConfig::default().with_max_pending(1));
        let gate = GatedFactory::<String>::new();
        assert_eq!(
            dedup.health("dedup:companies").status,
            kb_core::HealthStatus::Healthy
        );
        let _handle = dedup.deduped_fetch("k", gate.factory());
        let health = dedup.health("dedup:companies");
        assert_eq!(health.status, kb_core::HealthStatus::Degraded);
        assert_eq!(health.details.get("pending"), Some(&1));
    }
}
