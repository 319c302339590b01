//! Keyed amount cache shared by the batch runners and the coordinator

pub mod query_cache;

// Re-export for convenience
pub use query_cache::{CacheEvent, CacheStats, QueryCache};
