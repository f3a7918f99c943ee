//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::traits::{CacheEntry, CacheNamespace, Generation, RequestKey};
use crate::error::{Error, Result};
use crate::http::{Headers, Response};

/// Trait for cache storage backends.
///
/// Every operation is atomic with respect to concurrent callers: no partial
/// write or partial namespace delete is ever observable.
pub trait CacheStore: Send + Sync {
  /// Get the entry for `key` in `namespace`.
  fn get(&self, namespace: &CacheNamespace, key: &RequestKey) -> Result<Option<CacheEntry>>;

  /// Store a response, replacing any previous entry for the key.
  fn put(&self, namespace: &CacheNamespace, key: &RequestKey, response: &Response) -> Result<()>;

  /// Store a batch of responses atomically: either every entry is written
  /// or none is.
  fn put_all(&self, namespace: &CacheNamespace, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// Remove a namespace and all of its entries. Returns whether it existed.
  fn delete_namespace(&self, namespace: &CacheNamespace) -> Result<bool>;

  /// All namespaces currently holding data.
  fn list_namespaces(&self) -> Result<Vec<CacheNamespace>>;

  /// Match `key` across every namespace of a generation, static first.
  fn lookup(&self, generation: &Generation, key: &RequestKey) -> Result<Option<CacheEntry>> {
    for namespace in generation.namespaces() {
      if let Some(entry) = self.get(namespace, key)? {
        return Ok(Some(entry));
      }
    }
    Ok(None)
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStore for NoopStorage {
  fn get(&self, _namespace: &CacheNamespace, _key: &RequestKey) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn put(
    &self,
    _namespace: &CacheNamespace,
    _key: &RequestKey,
    _response: &Response,
  ) -> Result<()> {
    Ok(()) // Discard
  }

  fn put_all(
    &self,
    _namespace: &CacheNamespace,
    _entries: &[(RequestKey, Response)],
  ) -> Result<()> {
    Ok(())
  }

  fn delete_namespace(&self, _namespace: &CacheNamespace) -> Result<bool> {
    Ok(false)
  }

  fn list_namespaces(&self) -> Result<Vec<CacheNamespace>> {
    Ok(Vec::new())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::Storage(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::Storage(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Volatile cache, used when nothing needs to survive the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| Error::Storage(format!("Failed to open in-memory cache: {}", e)))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| Error::Storage(format!("Failed to run cache migrations: {}", e)))?;

    Ok(())
  }
}

impl SqliteStorage {
  /// Write every entry inside one transaction. Dropping the transaction on
  /// an error rolls back the entries already written.
  fn write_entries<'a>(
    &self,
    namespace: &CacheNamespace,
    entries: impl IntoIterator<Item = (&'a RequestKey, &'a Response)>,
  ) -> Result<()> {
    let mut conn = self.lock()?;
    let now = format_datetime(Utc::now());

    let tx = conn
      .transaction()
      .map_err(|e| Error::Storage(format!("Failed to begin transaction: {}", e)))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_namespaces (namespace_id, name, version, created_at)
       VALUES (?, ?, ?, ?)",
      params![namespace.id(), namespace.name, namespace.version, now],
    )
    .map_err(|e| Error::Storage(format!("Failed to register namespace: {}", e)))?;

    for (key, response) in entries {
      let headers = serde_json::to_string(&response.headers)?;
      tx.execute(
        "INSERT OR REPLACE INTO cache_entries
           (namespace_id, key_hash, request_key, status, headers, body, inserted_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          namespace.id(),
          key.hash(),
          key.as_str(),
          response.status,
          headers,
          response.body.as_ref(),
          now
        ],
      )
      .map_err(|e| Error::Storage(format!("Failed to store cache entry {}: {}", key, e)))?;
    }

    tx.commit()
      .map_err(|e| Error::Storage(format!("Failed to commit transaction: {}", e)))?;

    Ok(())
  }
}

#[cfg(test)]
impl SqliteStorage {
  /// Make every write of `request_key` fail, as a full disk would.
  pub(crate) fn reject_writes_of(&self, request_key: &str) {
    let sql = format!(
      "CREATE TRIGGER reject_write BEFORE INSERT ON cache_entries
       WHEN NEW.request_key = '{}'
       BEGIN SELECT RAISE(ABORT, 'database or disk is full'); END;",
      request_key
    );
    self.lock().unwrap().execute_batch(&sql).unwrap();
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS cache_namespaces (
    namespace_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    version INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_entries (
    namespace_id TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    inserted_at TEXT NOT NULL,
    PRIMARY KEY (namespace_id, key_hash),
    FOREIGN KEY (namespace_id) REFERENCES cache_namespaces(namespace_id) ON DELETE CASCADE
);
"#;

impl CacheStore for SqliteStorage {
  fn get(&self, namespace: &CacheNamespace, key: &RequestKey) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, inserted_at FROM cache_entries
         WHERE namespace_id = ? AND key_hash = ?",
        params![namespace.id(), key.hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| Error::Storage(format!("Failed to read cache entry: {}", e)))?;

    match row {
      Some((status, headers, body, inserted_at)) => {
        let headers: Headers = serde_json::from_str(&headers)?;
        Ok(Some(CacheEntry {
          key: key.clone(),
          response: Response {
            status,
            headers,
            body: body.into(),
          },
          inserted_at: parse_datetime(&inserted_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, namespace: &CacheNamespace, key: &RequestKey, response: &Response) -> Result<()> {
    self.write_entries(namespace, [(key, response)])?;
    debug!(namespace = %namespace, key = %key, status = response.status, "cached response");
    Ok(())
  }

  fn put_all(&self, namespace: &CacheNamespace, entries: &[(RequestKey, Response)]) -> Result<()> {
    self.write_entries(namespace, entries.iter().map(|(key, response)| (key, response)))?;
    debug!(namespace = %namespace, entries = entries.len(), "cached batch");
    Ok(())
  }

  fn delete_namespace(&self, namespace: &CacheNamespace) -> Result<bool> {
    let mut conn = self.lock()?;

    let tx = conn
      .transaction()
      .map_err(|e| Error::Storage(format!("Failed to begin transaction: {}", e)))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE namespace_id = ?",
      params![namespace.id()],
    )
    .map_err(|e| Error::Storage(format!("Failed to delete cache entries: {}", e)))?;

    let removed = tx
      .execute(
        "DELETE FROM cache_namespaces WHERE namespace_id = ?",
        params![namespace.id()],
      )
      .map_err(|e| Error::Storage(format!("Failed to delete namespace: {}", e)))?;

    tx.commit()
      .map_err(|e| Error::Storage(format!("Failed to commit transaction: {}", e)))?;

    Ok(removed > 0)
  }

  fn list_namespaces(&self) -> Result<Vec<CacheNamespace>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name, version FROM cache_namespaces ORDER BY namespace_id")
      .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;

    let namespaces = stmt
      .query_map([], |row| {
        Ok(CacheNamespace {
          name: row.get(0)?,
          version: row.get(1)?,
        })
      })
      .map_err(|e| Error::Storage(format!("Failed to list namespaces: {}", e)))?
      .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(namespaces)
  }
}

/// Timestamps are stored as fixed-width RFC 3339 so they sort lexically.
pub(crate) fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::Storage(format!("Failed to parse datetime '{}': {}", s, e)))
}
