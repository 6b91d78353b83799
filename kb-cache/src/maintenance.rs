//! Maintenance hooks shared by the cache and the deduplicator.
//!
//! The runtime registry owns many caches and deduplicators of different value
//! types. It reaches them through this object-safe trait for periodic sweeps,
//! teardown and health reporting.

use kb_core::ComponentHealth;

pub trait Maintained: Send + Sync {
    /// Drop expired bookkeeping. Returns how many entries were removed.
    fn sweep(&self) -> usize;

    /// Forget everything (shutdown, test teardown).
    fn clear(&self);

    /// Report health under the given component name.
    fn health(&self, component: &str) -> ComponentHealth;
}
