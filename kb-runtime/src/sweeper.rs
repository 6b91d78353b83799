//! Periodic sweep of expired cache entries and stale dedup registrations.
//!
//! The task ticks every `interval`, calls `sweep` on every registered
//! component and exits when the shutdown channel flips to `true`. Missed
//! ticks are skipped rather than replayed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::registry::Registry;

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub(crate) struct SweeperMetrics {
    cycles: AtomicU64,
    entries_swept: AtomicU64,
}

impl SweeperMetrics {
    pub fn snapshot(&self) -> SweeperSnapshot {
        SweeperSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            entries_swept: self.entries_swept.load(Ordering::Relaxed),
        }
    }
}

/// Sweeper counters at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweeperSnapshot {
    /// Completed sweep cycles.
    pub cycles: u64,
    /// Entries and registrations removed across all cycles.
    pub entries_swept: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

pub(crate) struct SweeperHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<SweeperSnapshot>,
    metrics: Arc<SweeperMetrics>,
}

impl SweeperHandle {
    pub fn spawn(runtime: &Handle, registry: Arc<Registry>, period: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(SweeperMetrics::default());
        let task = runtime.spawn(sweeper_task(
            registry,
            period,
            Arc::clone(&metrics),
            shutdown_rx,
        ));
        Self {
            shutdown_tx,
            task,
            metrics,
        }
    }

    pub fn snapshot(&self) -> SweeperSnapshot {
        self.metrics.snapshot()
    }

    /// Signal shutdown and wait for the task to finish.
    pub async fn stop(self) -> Result<SweeperSnapshot, tokio::task::JoinError> {
        let _ = self.shutdown_tx.send(true);
        self.task.await
    }
}

async fn sweeper_task(
    registry: Arc<Registry>,
    period: Duration,
    metrics: Arc<SweeperMetrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> SweeperSnapshot {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; start sweeping one period in.
    ticker.tick().await;

    tracing::info!(
        interval_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
        "Sweeper started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Sweeper shutting down");
                    break;
                }
            }
            _ = ticker.tick() => {
                sweep_cycle(&registry, &metrics);
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        entries_swept = snapshot.entries_swept,
        "Sweeper stopped"
    );
    snapshot
}

fn sweep_cycle(registry: &Registry, metrics: &SweeperMetrics) {
    metrics.cycles.fetch_add(1, Ordering::Relaxed);
    let removed = registry.sweep_all();
    metrics
        .entries_swept
        .fetch_add(removed as u64, Ordering::Relaxed);

    if removed > 0 {
        tracing::info!(removed, components = registry.len(), "Sweep cycle completed");
    } else {
        tracing::trace!("Sweep cycle completed with nothing to remove");
    }
}
