//! Configuration for the KB runtime.
//!
//! Configuration comes from an optional TOML file, then `KB_*` environment
//! variables override individual fields, then `validate()` rejects values the
//! utilities cannot honour. Every field has a default, so an empty file (or no
//! file) yields a working configuration.
//!
//! ```toml
//! [dedup]
//! max_pending = 5000
//! pending_ttl_ms = 60000
//!
//! [cache]
//! max_entries = 2000
//! default_ttl_ms = 30000
//!
//! [telemetry]
//! buffer_capacity = 1000
//! json_logs = true
//!
//! [sweeper]
//! enabled = true
//! interval_ms = 15000
//! ```

use crate::constants::*;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Whole milliseconds, rounded up so a non-zero duration never becomes `0`.
fn millis_ceil(d: Duration) -> u64 {
    let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
    if d.subsec_nanos() % 1_000_000 != 0 {
        ms.saturating_add(1)
    } else {
        ms
    }
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Request deduplicator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DedupConfig {
    /// In-flight registrations allowed before new keys bypass deduplication.
    pub max_pending: usize,
    /// Registrations older than this are forgotten. `0` disables expiry.
    pub pending_ttl_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_pending: DEFAULT_DEDUP_MAX_PENDING,
            pending_ttl_ms: DEFAULT_DEDUP_PENDING_TTL_MS,
        }
    }
}

impl DedupConfig {
    /// Registration expiry, or `None` when disabled.
    pub fn pending_ttl(&self) -> Option<Duration> {
        (self.pending_ttl_ms > 0).then(|| Duration::from_millis(self.pending_ttl_ms))
    }

    /// Set the pending-entry bound.
    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    /// Set the registration expiry; `None` disables it.
    pub fn with_pending_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.pending_ttl_ms = ttl.map(millis_ceil).unwrap_or(0);
        self
    }
}

/// Stale-while-revalidate cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Entries held before the least recently used one is evicted.
    pub max_entries: usize,
    /// TTL applied by `set_default`.
    pub default_ttl_ms: u64,
    /// Extra time past TTL an idle entry survives a sweep.
    pub sweep_grace_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            default_ttl_ms: DEFAULT_CACHE_TTL_MS,
            sweep_grace_ms: DEFAULT_CACHE_SWEEP_GRACE_MS,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn sweep_grace(&self) -> Duration {
        Duration::from_millis(self.sweep_grace_ms)
    }

    /// Set the entry bound.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_ms = millis_ceil(ttl);
        self
    }

    /// Set the sweep grace period.
    pub fn with_sweep_grace(mut self, grace: Duration) -> Self {
        self.sweep_grace_ms = millis_ceil(grace);
        self
    }
}

/// Span recorder and log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Closed spans retained for export.
    pub buffer_capacity: usize,
    /// Service name attached to exported spans.
    pub service_name: String,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Emit logs as JSON lines instead of human-readable text.
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_SPAN_BUFFER_CAPACITY,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            json_logs: false,
        }
    }
}

impl TelemetryConfig {
    /// Set the span buffer capacity.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }
}

/// Background sweep settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweeperConfig {
    /// Whether the runtime starts the sweeper on construction.
    pub enabled: bool,
    /// Interval between sweeps.
    pub interval_ms: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Master configuration for the KB runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KbConfig {
    pub dedup: DedupConfig,
    pub cache: CacheConfig,
    pub telemetry: TelemetryConfig,
    pub sweeper: SweeperConfig,
}

impl KbConfig {
    /// Load, override from the environment, and validate.
    ///
    /// Without a path the defaults are used as the base.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Override fields from `KB_*` process environment variables.
    ///
    /// # Environment Variables
    /// - `KB_DEDUP_MAX_PENDING`
    /// - `KB_DEDUP_PENDING_TTL_MS`
    /// - `KB_CACHE_MAX_ENTRIES`
    /// - `KB_CACHE_DEFAULT_TTL_MS`
    /// - `KB_CACHE_SWEEP_GRACE_MS`
    /// - `KB_TELEMETRY_BUFFER_CAPACITY`
    /// - `KB_TELEMETRY_SERVICE_NAME`
    /// - `KB_TELEMETRY_LOG_FILTER`
    /// - `KB_TELEMETRY_JSON_LOGS`
    /// - `KB_SWEEPER_ENABLED`
    /// - `KB_SWEEPER_INTERVAL_MS`
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    /// Override fields using an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| format!("{ENV_PREFIX}{suffix}");

        override_parsed(&lookup, &var("DEDUP_MAX_PENDING"), &mut self.dedup.max_pending)?;
        override_parsed(&lookup, &var("DEDUP_PENDING_TTL_MS"), &mut self.dedup.pending_ttl_ms)?;
        override_parsed(&lookup, &var("CACHE_MAX_ENTRIES"), &mut self.cache.max_entries)?;
        override_parsed(&lookup, &var("CACHE_DEFAULT_TTL_MS"), &mut self.cache.default_ttl_ms)?;
        override_parsed(&lookup, &var("CACHE_SWEEP_GRACE_MS"), &mut self.cache.sweep_grace_ms)?;
        override_parsed(
            &lookup,
            &var("TELEMETRY_BUFFER_CAPACITY"),
            &mut self.telemetry.buffer_capacity,
        )?;
        if let Some(name) = lookup(&var("TELEMETRY_SERVICE_NAME")) {
            self.telemetry.service_name = name;
        }
        if let Some(filter) = lookup(&var("TELEMETRY_LOG_FILTER")) {
            self.telemetry.log_filter = filter;
        }
        override_flag(&lookup, &var("TELEMETRY_JSON_LOGS"), &mut self.telemetry.json_logs)?;
        override_flag(&lookup, &var("SWEEPER_ENABLED"), &mut self.sweeper.enabled)?;
        override_parsed(&lookup, &var("SWEEPER_INTERVAL_MS"), &mut self.sweeper.interval_ms)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dedup.max_pending == 0 {
            return Err(ConfigError::InvalidValue {
                field: "dedup.max_pending",
                reason: "must be > 0".to_string(),
            });
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.max_entries",
                reason: "must be > 0".to_string(),
            });
        }
        if self.cache.default_ttl_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.default_ttl_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.telemetry.buffer_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "telemetry.buffer_capacity",
                reason: "must be > 0".to_string(),
            });
        }
        if self.telemetry.service_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "telemetry.service_name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.sweeper.enabled && self.sweeper.interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sweeper.interval_ms",
                reason: "must be > 0 when the sweeper is enabled".to_string(),
            });
        }
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, var: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(var) {
        *target = raw.trim().parse().map_err(|e: T::Err| ConfigError::Env {
            var: var.to_string(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

fn override_flag<F>(lookup: &F, var: &str, target: &mut bool) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(var) {
        *target = match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                return Err(ConfigError::Env {
                    var: var.to_string(),
                    reason: format!("expected a boolean, got '{other}'"),
                })
            }
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config = KbConfig::from_toml_str("").expect("empty config should parse");
        assert_eq!(config, KbConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = KbConfig::from_toml_str(
            r#"
            [cache]
            max_entries = 42

            [sweeper]
            enabled = true
            "#,
        )
        .expect("partial config should parse");
        assert_eq!(config.cache.max_entries, 42);
        assert_eq!(config.cache.default_ttl_ms, DEFAULT_CACHE_TTL_MS);
        assert!(config.sweeper.enabled);
        assert_eq!(config.dedup, DedupConfig::default());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = KbConfig::from_toml_str("[cache]\nmax_entrys = 3\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = KbConfig::default();
        config
            .apply_env_from(env(&[
                ("KB_CACHE_MAX_ENTRIES", "77"),
                ("KB_DEDUP_PENDING_TTL_MS", "0"),
                ("KB_TELEMETRY_JSON_LOGS", "true"),
                ("KB_TELEMETRY_SERVICE_NAME", "crm-edge"),
            ]))
            .expect("overrides should apply");
        assert_eq!(config.cache.max_entries, 77);
        assert_eq!(config.dedup.pending_ttl(), None);
        assert!(config.telemetry.json_logs);
        assert_eq!(config.telemetry.service_name, "crm-edge");
    }

    #[test]
    fn test_env_parse_error_names_variable() {
        let mut config = KbConfig::default();
        let err = config
            .apply_env_from(env(&[("KB_SWEEPER_INTERVAL_MS", "soon")]))
            .unwrap_err();
        match err {
            ConfigError::Env { var, .. } => assert_eq!(var, "KB_SWEEPER_INTERVAL_MS"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_env_bad_flag() {
        let mut config = KbConfig::default();
        let result = config.apply_env_from(env(&[("KB_SWEEPER_ENABLED", "maybe")]));
        assert!(matches!(result, Err(ConfigError::Env { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_bounds() {
        let mut config = KbConfig::default();
        config.cache.max_entries = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "cache.max_entries", .. })
        ));

        let mut config = KbConfig::default();
        config.telemetry.buffer_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "telemetry.buffer_capacity", .. })
        ));

        let mut config = KbConfig::default();
        config.dedup.max_pending = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sweeper_interval_only_checked_when_enabled() {
        let mut config = KbConfig::default();
        config.sweeper.interval_ms = 0;
        assert!(config.validate().is_ok());
        config.sweeper.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builders() {
        let dedup = DedupConfig::default()
            .with_max_pending(3)
            .with_pending_ttl(Some(Duration::from_secs(2)));
        assert_eq!(dedup.max_pending, 3);
        assert_eq!(dedup.pending_ttl(), Some(Duration::from_secs(2)));

        let cache = CacheConfig::default()
            .with_max_entries(10)
            .with_default_ttl(Duration::from_secs(5))
            .with_sweep_grace(Duration::from_secs(1));
        assert_eq!(cache.max_entries, 10);
        assert_eq!(cache.default_ttl(), Duration::from_secs(5));
        assert_eq!(cache.sweep_grace(), Duration::from_secs(1));
    }

    #[test]
    fn test_sub_millisecond_durations_round_up() {
        let dedup = DedupConfig::default().with_pending_ttl(Some(Duration::from_micros(500)));
        assert_eq!(dedup.pending_ttl(), Some(Duration::from_millis(1)));

        let cache = CacheConfig::default()
            .with_default_ttl(Duration::from_micros(1_500))
            .with_sweep_grace(Duration::ZERO);
        assert_eq!(cache.default_ttl(), Duration::from_millis(2));
        assert_eq!(cache.sweep_grace(), Duration::ZERO);
        assert!(KbConfig {
            cache,
            ..KbConfig::default()
        }
        .validate()
        .is_ok());

        let huge = DedupConfig::default().with_pending_ttl(Some(Duration::MAX));
        assert_eq!(huge.pending_ttl_ms, u64::MAX);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = KbConfig::from_path(Path::new("/definitely/not/here/kb.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
