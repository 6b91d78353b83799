//! Background refresh of stale entries.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use kb_core::{CacheError, KbResult};

use super::SwrCache;
use crate::stats::bump;

/// Loads a fresh value for a key.
///
/// Any `Fn(String) -> impl Future<Output = KbResult<V>>` closure is a
/// revalidator.
#[async_trait]
pub trait Revalidator<V>: Send + Sync {
    async fn load(&self, key: &str) -> KbResult<V>;
}

#[async_trait]
impl<V, F, Fut> Revalidator<V> for F
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = KbResult<V>> + Send + 'static,
    V: Send + 'static,
{
    async fn load(&self, key: &str) -> KbResult<V> {
        (self)(key.to_string()).await
    }
}

/// Exclusive right to refresh one stale entry.
///
/// Obtained from [`SwrCache::begin_revalidation`]. While a ticket is alive no
/// other ticket is issued for the same key. Finish it with
/// [`complete`](Self::complete) or [`fail`](Self::fail); dropping it
/// unfinished counts as a failure and frees the key for the next attempt.
#[must_use = "dropping a ticket abandons the revalidation"]
pub struct RevalidationTicket<V>
where
    V: Clone + Send + Sync + 'static,
{
    cache: SwrCache<V>,
    key: String,
    token: u64,
    ttl: Duration,
    finished: bool,
}

impl<V> RevalidationTicket<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(super) fn new(cache: SwrCache<V>, key: String, token: u64, ttl: Duration) -> Self {
        Self {
            cache,
            key,
            token,
            ttl,
            finished: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// TTL of the entry being refreshed; [`complete`](Self::complete) reuses it.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store the fresh value under the entry's existing TTL.
    ///
    /// Returns false if the entry was overwritten, invalidated or evicted
    /// while the ticket was out; the value is discarded in that case.
    pub fn complete(self, value: V) -> bool {
        let ttl = self.ttl;
        self.complete_with_ttl(value, ttl)
    }

    pub fn complete_with_ttl(mut self, value: V, ttl: Duration) -> bool {
        self.finished = true;
        let stored = self
            .cache
            .finish_revalidation(&self.key, self.token, value, ttl);
        if stored {
            tracing::debug!(key = %self.key, "Revalidated cache entry");
        } else {
            tracing::debug!(key = %self.key, "Revalidation superseded, discarding value");
        }
        stored
    }

    /// Give up on this refresh. The stale value stays in place.
    pub fn fail(mut self, reason: impl fmt::Display) {
        self.finished = true;
        let err = CacheError::RevalidationFailed {
            key: self.key.clone(),
            reason: reason.to_string(),
        };
        tracing::warn!(key = %self.key, error = %err, "Cache revalidation failed");
        self.abandon();
    }

    fn abandon(&self) {
        bump(&self.cache.inner.metrics.revalidations_failed);
        self.cache.abandon_revalidation(&self.key, self.token);
    }
}

impl<V> Drop for RevalidationTicket<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(key = %self.key, "Revalidation ticket dropped without completing");
            self.abandon();
        }
    }
}

impl<V> fmt::Debug for RevalidationTicket<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevalidationTicket")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("ttl", &self.ttl)
            .finish()
    }
}
