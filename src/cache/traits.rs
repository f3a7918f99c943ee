//! Core types for the response cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::http::{Request, Response};

/// Semantic role of a cache namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheRole {
  /// Precached shell and static assets
  Static,
  /// Responses captured at runtime (API, pages)
  Dynamic,
}

impl CacheRole {
  pub fn as_str(&self) -> &'static str {
    match self {
      CacheRole::Static => "static",
      CacheRole::Dynamic => "dynamic",
    }
  }
}

/// A versioned, independently deletable bucket of cached responses.
///
/// Namespaces are values: a version bump constructs a new namespace rather
/// than editing an existing one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheNamespace {
  /// Name without version suffix, e.g. `stride-static`
  pub name: String,
  pub version: u32,
}

impl CacheNamespace {
  pub fn new(prefix: &str, role: CacheRole, version: u32) -> Self {
    Self {
      name: format!("{}-{}", prefix, role.as_str()),
      version,
    }
  }

  /// Storage identifier, e.g. `stride-static-v3`.
  pub fn id(&self) -> String {
    format!("{}-v{}", self.name, self.version)
  }
}

impl fmt::Display for CacheNamespace {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.id())
  }
}

/// The current generation: one namespace per role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
  pub version: u32,
  pub static_ns: CacheNamespace,
  pub dynamic_ns: CacheNamespace,
}

impl Generation {
  pub fn new(prefix: &str, version: u32) -> Self {
    Self {
      version,
      static_ns: CacheNamespace::new(prefix, CacheRole::Static, version),
      dynamic_ns: CacheNamespace::new(prefix, CacheRole::Dynamic, version),
    }
  }

  pub fn namespace(&self, role: CacheRole) -> &CacheNamespace {
    match role {
      CacheRole::Static => &self.static_ns,
      CacheRole::Dynamic => &self.dynamic_ns,
    }
  }

  /// Lookup order for matching across the generation.
  pub fn namespaces(&self) -> [&CacheNamespace; 2] {
    [&self.static_ns, &self.dynamic_ns]
  }

  pub fn contains(&self, ns: &CacheNamespace) -> bool {
    ns == &self.static_ns || ns == &self.dynamic_ns
  }
}

/// Normalized request identity: method plus path and query.
///
/// Headers do not participate, so logically identical requests map to the
/// same key whatever their header order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
  pub fn from_request(request: &Request) -> Self {
    Self(format!("{} {}", request.method, request.path_and_query()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// SHA256 hash for stable, fixed-length storage keys.
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.0.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// A stored response. Entries are replaced whole, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: RequestKey,
  pub response: Response,
  pub inserted_at: DateTime<Utc>,
}

/// Response plus metadata about where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Network unavailable, serving a cached copy.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  pub fn synthesized(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Synthesized,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live network response
  Network,
  /// Cache hit served without waiting on the network
  Cache,
  /// Network failed, serving cached data
  Offline,
  /// Produced by the offline responder
  Synthesized,
}
