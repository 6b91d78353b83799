//! KB Test Utilities
//!
//! Shared test infrastructure for the KB workspace:
//! - Controllable upstream fakes that count invocations
//! - Async polling helpers
//! - Proptest generators for keys and TTLs
//!
//! Depends only on `kb-core`, so any workspace crate can use it as a
//! dev-dependency.

pub use kb_core::{FetchError, KbError, KbResult, ManualClock};

use futures_util::future::{BoxFuture, FutureExt};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// GATED FACTORY
// ============================================================================

/// Upstream fake whose calls stay pending until the test settles them.
///
/// Every future produced by [`GatedFactory::factory`] resolves to the outcome
/// passed to [`resolve`](GatedFactory::resolve) or [`fail`](GatedFactory::fail).
/// Once settled, later calls resolve immediately with the same outcome until
/// [`reset`](GatedFactory::reset).
#[derive(Clone)]
pub struct GatedFactory<T> {
    calls: Arc<AtomicUsize>,
    gate: Arc<watch::Sender<Option<Result<T, FetchError>>>>,
}

impl<T> GatedFactory<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (gate, _) = watch::channel(None);
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            gate: Arc::new(gate),
        }
    }

    /// Number of times a produced factory has been invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// A one-shot factory suitable for `deduped_fetch`.
    pub fn factory(
        &self,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<T, FetchError>> + Send + 'static {
        let calls = Arc::clone(&self.calls);
        let mut rx = self.gate.subscribe();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                let settled = match rx.wait_for(Option::is_some).await {
                    Ok(outcome) => (*outcome).clone(),
                    Err(_) => None,
                };
                settled.unwrap_or_else(|| {
                    Err(FetchError::Cancelled {
                        key: "gate".to_string(),
                    })
                })
            }
            .boxed()
        }
    }

    pub fn resolve(&self, value: T) {
        self.gate.send_replace(Some(Ok(value)));
    }

    pub fn fail(&self, err: FetchError) {
        self.gate.send_replace(Some(Err(err)));
    }

    /// Close the gate again; new calls block until the next settle.
    pub fn reset(&self) {
        self.gate.send_replace(None);
    }
}

impl<T> Default for GatedFactory<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// COUNTING LOADER
// ============================================================================

/// Keyed loader fake for cache revalidation tests.
///
/// [`CountingLoader::loader`] yields an `Fn(String) -> Future` closure; each
/// call is counted and waits until the loader is open.
#[derive(Clone)]
pub struct CountingLoader<V> {
    calls: Arc<AtomicUsize>,
    keys: Arc<Mutex<Vec<String>>>,
    outcome: Arc<Mutex<Result<V, FetchError>>>,
    open: Arc<watch::Sender<bool>>,
}

impl<V> CountingLoader<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn with_outcome(outcome: Result<V, FetchError>, open: bool) -> Self {
        let (tx, _) = watch::channel(open);
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            keys: Arc::new(Mutex::new(Vec::new())),
            outcome: Arc::new(Mutex::new(outcome)),
            open: Arc::new(tx),
        }
    }

    /// Loader that answers immediately with `value`.
    pub fn returning(value: V) -> Self {
        Self::with_outcome(Ok(value), true)
    }

    /// Loader that answers immediately with `err`.
    pub fn failing(err: FetchError) -> Self {
        Self::with_outcome(Err(err), true)
    }

    /// Loader that holds every call until [`release`](Self::release).
    pub fn gated(value: V) -> Self {
        Self::with_outcome(Ok(value), false)
    }

    pub fn release(&self) {
        self.open.send_replace(true);
    }

    pub fn set_outcome(&self, outcome: Result<V, FetchError>) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = outcome;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Keys requested so far, in call order.
    pub fn keys(&self) -> Vec<String> {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn loader(
        &self,
    ) -> impl Fn(String) -> BoxFuture<'static, KbResult<V>> + Send + Sync + 'static {
        let this = self.clone();
        move |key: String| {
            this.calls.fetch_add(1, Ordering::SeqCst);
            this.keys
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(key);
            let outcome = Arc::clone(&this.outcome);
            let mut rx = this.open.subscribe();
            async move {
                let _ = rx.wait_for(|open| *open).await;
                let outcome = outcome
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                outcome.map_err(KbError::from)
            }
            .boxed()
        }
    }
}

// ============================================================================
// ASYNC HELPERS
// ============================================================================

/// Poll `condition` every millisecond until it holds.
///
/// Panics after five seconds so a broken test fails instead of hanging.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..5_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not met within 5s");
}

// ============================================================================
// GENERATORS
// ============================================================================

/// Cache/dedup keys shaped like `entity:id`.
pub fn arb_key() -> impl Strategy<Value = String> {
    ("[a-z]{1,10}", 0u32..10_000).prop_map(|(entity, id)| format!("{entity}:{id}"))
}

/// A non-empty set of distinct keys.
pub fn arb_distinct_keys(max: usize) -> impl Strategy<Value = Vec<String>> {
    proptest::collection::hash_set(arb_key(), 1..=max).prop_map(|set| set.into_iter().collect())
}

/// TTLs between 1 ms and 10 minutes.
pub fn arb_ttl() -> impl Strategy<Value = Duration> {
    (1u64..600_000).prop_map(Duration::from_millis)
}

/// Span and event names.
pub fn arb_name() -> impl Strategy<Value = String> {
    "[a-z][a-z_.]{0,20}"
}
