//! KB Core - shared types for the KB runtime utilities
//!
//! Error types, configuration, the clock abstraction and health reporting.
//! The cache, deduplicator and span recorder crates all depend on this one and
//! on nothing else in the workspace.

pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod health;

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{CacheConfig, DedupConfig, KbConfig, SweeperConfig, TelemetryConfig};
pub use error::{CacheError, ConfigError, FetchError, KbError, KbResult, TelemetryError};
pub use health::{ComponentHealth, HealthReport, HealthStatus};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Identifier using UUIDv7 for timestamp-sortable IDs.
pub type EntityId = Uuid;

/// Generate a new UUIDv7 identifier.
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}
