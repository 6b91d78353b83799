//! Default values for KB configuration.
//!
//! Centralized so that config defaults, tests and docs agree.

// ============================================================================
// REQUEST DEDUPLICATION
// ============================================================================

/// Maximum number of in-flight registrations before new keys bypass dedup.
pub const DEFAULT_DEDUP_MAX_PENDING: usize = 10_000;

/// Age after which an unsettled registration is forgotten (5 minutes).
pub const DEFAULT_DEDUP_PENDING_TTL_MS: u64 = 300_000;

// ============================================================================
// STALE-WHILE-REVALIDATE CACHE
// ============================================================================

/// Maximum number of entries held by one cache before LRU eviction.
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 1_000;

/// TTL used by `set_default` (5 minutes).
pub const DEFAULT_CACHE_TTL_MS: u64 = 300_000;

/// How long past its TTL an idle entry survives a sweep (30 minutes).
pub const DEFAULT_CACHE_SWEEP_GRACE_MS: u64 = 1_800_000;

// ============================================================================
// TELEMETRY
// ============================================================================

/// Number of closed spans kept for export.
pub const DEFAULT_SPAN_BUFFER_CAPACITY: usize = 500;

/// Service name attached to exported spans.
pub const DEFAULT_SERVICE_NAME: &str = "kb-runtime";

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "kb_runtime=info,kb_cache=info,kb_telemetry=info,warn";

// ============================================================================
// SWEEPER
// ============================================================================

/// Interval between background sweeps (60 seconds).
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "KB_";
