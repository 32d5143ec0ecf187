//! Generational cache for origin responses.
//!
//! This module provides:
//! - a storage trait with SQLite and in-memory backends
//! - a registry of named, versioned generations (one static, one dynamic)
//! - atomic all-or-nothing population of a static generation from a manifest
//! - safe retirement of superseded generations

mod populate;
mod reaper;
mod registry;
mod store;

pub use populate::Populator;
pub use reaper::reap;
pub use registry::{GenerationId, Purpose, Registry};
pub use store::{CacheStore, MemoryCacheStore, SqliteCacheStore};
