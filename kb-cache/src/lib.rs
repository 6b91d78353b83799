//! KB Cache - request deduplication and stale-while-revalidate caching
//!
//! Two independent in-memory building blocks for data-fetching call sites:
//! - [`RequestDeduplicator`] collapses concurrent identical requests
//! - [`SwrCache`] serves stale values while a single refresh runs
//!
//! Both report through [`Maintained`] so a registry can sweep, clear and
//! health-check them without knowing their value types.

pub mod dedup;
pub mod maintenance;
pub mod stats;
pub mod swr;

pub use dedup::{InFlight, RequestDeduplicator};
pub use maintenance::Maintained;
pub use stats::{CacheStats, DedupStats};

// Re-export SWR types for call sites
pub use swr::{CacheLookup, RevalidationTicket, Revalidator, SwrCache};
