//! Response cache for offline support.
//!
//! This module provides:
//! - Versioned namespaces, one per role (static assets, dynamic responses)
//! - Request keys normalized from method, path and query
//! - Cache-first, network-first and stale-while-revalidate strategies
//! - SQLite-backed storage with atomic namespace deletion

mod layer;
pub(crate) mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStore, NoopStorage, SqliteStorage};
pub use traits::{
  CacheEntry, CacheNamespace, CacheResult, CacheRole, CacheSource, Generation, RequestKey,
};
