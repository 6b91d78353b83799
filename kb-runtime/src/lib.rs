//! KB Runtime - one owner for the caches, deduplicators and span recorder
//!
//! [`KbRuntime`] replaces process-global maps: call sites ask it for a cache
//! or deduplicator by namespace and get a shared handle, while the runtime
//! keeps track of everything it handed out so it can sweep, clear and
//! health-check the lot.
//!
//! ```ignore
//! let runtime = KbRuntime::new(KbConfig::load(None)?)?;
//! let companies: SwrCache<Company> = runtime.cache("companies")?;
//! let fetches: RequestDeduplicator<Company> = runtime.deduplicator("companies")?;
//!
//! let span = runtime.recorder().start_span("fetch_company");
//! let company = fetches.deduped_fetch("company:1", || load_company(1)).await?;
//! companies.set_default("company:1", company);
//! span.end(SpanStatus::Ok);
//! ```

mod registry;
mod sweeper;

pub use registry::ComponentKind;
pub use sweeper::SweeperSnapshot;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kb_cache::{RequestDeduplicator, SwrCache};
use kb_core::{
    CacheError, ComponentHealth, HealthReport, KbConfig, KbResult, SharedClock, SystemClock,
};
use kb_telemetry::SpanRecorder;

use registry::Registry;
use sweeper::SweeperHandle;

/// Component name used for the span recorder in health reports.
pub const SPANS_COMPONENT: &str = "spans";

/// Component name used for the sweeper in health reports.
pub const SWEEPER_COMPONENT: &str = "sweeper";

pub struct KbRuntime {
    config: KbConfig,
    clock: SharedClock,
    registry: Arc<Registry>,
    recorder: SpanRecorder,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl KbRuntime {
    /// Validate `config` and build a runtime on the system clock.
    ///
    /// Starts the sweeper when `config.sweeper.enabled` is set and a tokio
    /// runtime is available.
    pub fn new(config: KbConfig) -> KbResult<Self> {
        Self::with_clock(config, SystemClock::shared())
    }

    pub fn with_clock(config: KbConfig, clock: SharedClock) -> KbResult<Self> {
        config.validate()?;
        let recorder = SpanRecorder::with_clock(&config.telemetry, Arc::clone(&clock));
        let runtime = Self {
            config,
            clock,
            registry: Arc::new(Registry::default()),
            recorder,
            sweeper: Mutex::new(None),
        };

        if runtime.config.sweeper.enabled && !runtime.start_sweeper() {
            tracing::warn!("Sweeper enabled but no tokio runtime is available");
        }
        tracing::info!(
            service_name = %runtime.config.telemetry.service_name,
            sweeper = runtime.config.sweeper.enabled,
            "KB runtime initialized"
        );
        Ok(runtime)
    }

    /// Load configuration from `path` (if any) and the `KB_*` environment.
    pub fn load(path: Option<&Path>) -> KbResult<Self> {
        Self::new(KbConfig::load(path)?)
    }

    pub fn config(&self) -> &KbConfig {
        &self.config
    }

    pub fn recorder(&self) -> &SpanRecorder {
        &self.recorder
    }

    // ========================================================================
    // COMPONENTS
    // ========================================================================

    /// The cache registered under `namespace`, created from the cache config
    /// on first use.
    ///
    /// Fails if `namespace` already holds a cache of another value type.
    pub fn cache<V>(&self, namespace: &str) -> KbResult<SwrCache<V>>
    where
        V: Clone + Send + Sync + 'static,
    {
        self.registry
            .get_or_insert(ComponentKind::Cache, namespace, || {
                SwrCache::with_clock(self.config.cache.clone(), Arc::clone(&self.clock))
            })
    }

    /// The deduplicator registered under `namespace`, created from the dedup
    /// config on first use.
    pub fn deduplicator<T, E>(&self, namespace: &str) -> KbResult<RequestDeduplicator<T, E>>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        self.registry
            .get_or_insert(ComponentKind::Deduplicator, namespace, || {
                RequestDeduplicator::with_clock(self.config.dedup.clone(), Arc::clone(&self.clock))
            })
    }

    /// Registered component names such as `cache:companies`, sorted.
    pub fn components(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Run one sweep over every registered component.
    pub fn sweep_now(&self) -> usize {
        self.registry.sweep_all()
    }

    /// Empty every cache, deduplicator and the span buffer.
    pub fn clear(&self) {
        self.registry.clear_all();
        self.recorder.clear();
        tracing::debug!(components = self.registry.len(), "Cleared KB runtime");
    }

    // ========================================================================
    // SWEEPER
    // ========================================================================

    fn sweeper_slot(&self) -> MutexGuard<'_, Option<SweeperHandle>> {
        self.sweeper.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the background sweeper on the current tokio runtime.
    ///
    /// Returns false if it is already running or there is no runtime.
    pub fn start_sweeper(&self) -> bool {
        let mut slot = self.sweeper_slot();
        if slot.is_some() {
            return false;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        *slot = Some(SweeperHandle::spawn(
            &handle,
            Arc::clone(&self.registry),
            self.config.sweeper.interval(),
        ));
        true
    }

    pub fn sweeper_running(&self) -> bool {
        self.sweeper_slot().is_some()
    }

    /// Stop the sweeper and return its final counters.
    ///
    /// Returns `Ok(None)` if no sweeper was running.
    pub async fn shutdown(&self) -> KbResult<Option<SweeperSnapshot>> {
        let handle = self.sweeper_slot().take();
        let Some(handle) = handle else {
            return Ok(None);
        };
        let snapshot = handle.stop().await.map_err(|e| CacheError::TaskJoin {
            reason: e.to_string(),
        })?;
        Ok(Some(snapshot))
    }

    // ========================================================================
    // HEALTH
    // ========================================================================

    /// Health of every registered component, the span buffer and the sweeper.
    pub fn health(&self) -> HealthReport {
        let mut components = self.registry.health();
        components.push(self.recorder.health(SPANS_COMPONENT));

        let sweeper = match self.sweeper_slot().as_ref() {
            Some(handle) => {
                let snapshot = handle.snapshot();
                ComponentHealth::healthy(SWEEPER_COMPONENT)
                    .with_detail("running", 1)
                    .with_detail("cycles", snapshot.cycles)
                    .with_detail("entries_swept", snapshot.entries_swept)
            }
            None => ComponentHealth::healthy(SWEEPER_COMPONENT).with_detail("running", 0),
        };
        components.push(sweeper);

        HealthReport::from_components(components)
    }
}

impl std::fmt::Debug for KbRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KbRuntime")
            .field("components", &self.registry.names())
            .field("recorder", &self.recorder)
            .field("sweeper_running", &self.sweeper_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_core::{HealthStatus, KbError};
    use kb_telemetry::SpanStatus;

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = KbConfig::default();
        config.cache.max_entries = 0;
        let err = KbRuntime::new(config).unwrap_err();
        assert!(matches!(err, KbError::Config(msg) if msg.contains("max_entries")));
    }

    #[test]
    fn test_components_are_listed() {
        let runtime = KbRuntime::new(KbConfig::default()).unwrap();
        let _: SwrCache<String> = runtime.cache("companies").unwrap();
        let _: RequestDeduplicator<String> = runtime.deduplicator("companies").unwrap();
        assert_eq!(runtime.components(), vec!["cache:companies", "dedup:companies"]);
    }

    #[test]
    fn test_sweeper_needs_tokio_runtime() {
        let mut config = KbConfig::default();
        config.sweeper.enabled = true;
        let runtime = KbRuntime::new(config).unwrap();
        assert!(!runtime.sweeper_running());
    }

    #[test]
    fn test_health_degrades_when_spans_drop() {
        let mut config = KbConfig::default();
        config.telemetry.buffer_capacity = 1;
        let runtime = KbRuntime::new(config).unwrap();
        assert!(runtime.health().is_healthy());

        runtime.recorder().start_span("a").end(SpanStatus::Ok);
        runtime.recorder().start_span("b").end(SpanStatus::Ok);

        let report = runtime.health();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(
            report.component(SPANS_COMPONENT).unwrap().status,
            HealthStatus::Degraded
        );

        runtime.clear();
        assert!(runtime.health().is_healthy());
    }

    #[tokio::test]
    async fn test_shutdown_without_sweeper() {
        let runtime = KbRuntime::new(KbConfig::default()).unwrap();
        assert_eq!(runtime.shutdown().await.unwrap(), None);
    }
}
