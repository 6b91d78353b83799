//! Error types for KB runtime utilities.
//!
//! The deduplicator and the cache never invent failures of their own: they
//! relay whatever the wrapped operation produced. Those relayed failures must
//! be `Clone` because every waiter on a shared in-flight call receives its own
//! copy of the same result.

use std::path::PathBuf;
use thiserror::Error;

/// Failures produced by an upstream call (table query, AI gateway, ...).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Upstream call for {key} failed: {message}")]
    Upstream { key: String, message: String },

    #[error("Upstream returned nothing for {key}")]
    NotFound { key: String },

    #[error("Upstream call for {key} was cancelled")]
    Cancelled { key: String },
}

impl FetchError {
    /// Shorthand for an upstream failure.
    pub fn upstream(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Key of the request that failed.
    pub fn key(&self) -> &str {
        match self {
            Self::Upstream { key, .. } | Self::NotFound { key } | Self::Cancelled { key } => key,
        }
    }
}

/// Cache bookkeeping errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Revalidation of {key} failed: {reason}")]
    RevalidationFailed { key: String, reason: String },

    #[error("Background task failed to join: {reason}")]
    TaskJoin { reason: String },
}

/// Telemetry setup errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("Failed to install tracing subscriber: {reason}")]
    SubscriberInit { reason: String },
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Invalid value in environment variable {var}: {reason}")]
    Env { var: String, reason: String },
}

/// Master error type for all KB errors.
#[derive(Debug, Clone, Error)]
pub enum KbError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    /// Config errors wrap `io::Error`/`toml` errors that are not `Clone`,
    /// so only the rendered message is kept here.
    #[error("Config error: {0}")]
    Config(String),

    #[error("Namespace {namespace} is already registered as a {registered}")]
    NamespaceConflict {
        namespace: String,
        registered: &'static str,
    },
}

impl From<ConfigError> for KbError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type alias for KB operations.
pub type KbResult<T> = Result<T, KbError>;

// =============================================================================
// TESTS
// =============================================================================
