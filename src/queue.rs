//! Durable retry queue for mutating requests that failed while offline.
//!
//! Mutations are persisted before the failure is reported, replayed in
//! enqueue order on a reconnect signal, and removed one by one as each
//! replay succeeds. Delivery is at-least-once: the receiving endpoint has
//! to tolerate duplicates.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::cache::storage::{format_datetime, parse_datetime};
use crate::error::{Error, Result};
use crate::http::{Headers, Method, Request};
use crate::network::Network;

/// A captured mutating request awaiting replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
  pub id: i64,
  pub target_url: String,
  pub method: Method,
  pub headers: Headers,
  pub body: Bytes,
  pub enqueued_at: DateTime<Utc>,
}

impl PendingMutation {
  /// Rebuild the original request for replay.
  pub fn to_request(&self) -> Request {
    Request {
      method: self.method.clone(),
      url: self.target_url.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

/// Trait for persistent mutation stores.
pub trait MutationStore: Send + Sync {
  /// Persist a request; returns the new mutation id.
  fn insert(&self, request: &Request, enqueued_at: DateTime<Utc>) -> Result<i64>;

  /// All pending mutations, oldest first.
  fn pending(&self) -> Result<Vec<PendingMutation>>;

  fn remove(&self, id: i64) -> Result<()>;

  /// Remove everything; returns how many mutations were dropped.
  fn clear(&self) -> Result<usize>;
}

/// SQLite-backed mutation store. Survives process restarts.
pub struct SqliteQueue {
  conn: Mutex<Connection>,
}

const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pending_mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target_url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    enqueued_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_mutations_order
    ON pending_mutations(enqueued_at, id);
"#;

impl SqliteQueue {
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::Storage(format!("Failed to create queue directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::Storage(format!(
        "Failed to open queue database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| Error::Storage(format!("Failed to open in-memory queue: {}", e)))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| Error::Storage(format!("Failed to run queue migrations: {}", e)))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))
  }
}

impl MutationStore for SqliteQueue {
  fn insert(&self, request: &Request, enqueued_at: DateTime<Utc>) -> Result<i64> {
    let conn = self.lock()?;
    let headers = serde_json::to_string(&request.headers)?;

    conn
      .execute(
        "INSERT INTO pending_mutations (target_url, method, headers, body, enqueued_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          request.url,
          request.method.as_str(),
          headers,
          request.body.as_ref(),
          format_datetime(enqueued_at)
        ],
      )
      .map_err(|e| Error::Storage(format!("Failed to persist mutation: {}", e)))?;

    Ok(conn.last_insert_rowid())
  }

  fn pending(&self) -> Result<Vec<PendingMutation>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, target_url, method, headers, body, enqueued_at FROM pending_mutations
         ORDER BY enqueued_at, id",
      )
      .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;

    let rows: Vec<(i64, String, String, String, Vec<u8>, String)> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .map_err(|e| Error::Storage(format!("Failed to read queue: {}", e)))?
      .collect::<std::result::Result<_, _>>()?;

    rows
      .into_iter()
      .map(|(id, target_url, method, headers, body, enqueued_at)| {
        Ok(PendingMutation {
          id,
          target_url,
          method: Method::parse(&method),
          headers: serde_json::from_str(&headers)?,
          body: body.into(),
          enqueued_at: parse_datetime(&enqueued_at)?,
        })
      })
      .collect()
  }

  fn remove(&self, id: i64) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM pending_mutations WHERE id = ?", params![id])
      .map_err(|e| Error::Storage(format!("Failed to remove mutation {}: {}", id, e)))?;
    Ok(())
  }

  fn clear(&self) -> Result<usize> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM pending_mutations", [])
      .map_err(|e| Error::Storage(format!("Failed to clear queue: {}", e)))?;
    Ok(removed)
  }
}

/// Result of replaying one mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
  /// Accepted by the server and removed from the queue
  Delivered { id: i64, status: u16 },
  /// Replay failed; the mutation stays queued
  Failed { id: i64, reason: String },
  /// Not attempted because an earlier mutation failed
  Deferred { id: i64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub outcomes: Vec<ReplayOutcome>,
}

impl DrainReport {
  pub fn delivered(&self) -> usize {
    self
      .outcomes
      .iter()
      .filter(|o| matches!(o, ReplayOutcome::Delivered { .. }))
      .count()
  }

  /// Mutations still queued after this pass.
  pub fn remaining(&self) -> usize {
    self.outcomes.len() - self.delivered()
  }

  pub fn is_complete(&self) -> bool {
    self.remaining() == 0
  }

  /// The failure that stopped the pass, if any.
  pub fn failure(&self) -> Option<Error> {
    self.outcomes.iter().find_map(|o| match o {
      ReplayOutcome::Failed { id, reason } => Some(Error::Replay {
        id: *id,
        reason: reason.clone(),
      }),
      _ => None,
    })
  }
}

/// Queue front-end: captures failed mutations and replays them.
pub struct RetryQueue<Q: MutationStore> {
  store: Q,
  /// Serializes drain passes so no mutation is replayed twice concurrently
  drain_lock: tokio::sync::Mutex<()>,
}

impl<Q: MutationStore> RetryQueue<Q> {
  pub fn new(store: Q) -> Self {
    Self {
      store,
      drain_lock: tokio::sync::Mutex::new(()),
    }
  }

  /// Persist the full request (method, URL, headers, body).
  pub fn enqueue(&self, request: &Request) -> Result<i64> {
    let id = self.store.insert(request, Utc::now())?;
    info!(id, method = %request.method, url = %request.url, "queued mutation for replay");
    Ok(id)
  }

  pub fn pending(&self) -> Result<Vec<PendingMutation>> {
    self.store.pending()
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.store.pending()?.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  pub fn clear(&self) -> Result<usize> {
    let removed = self.store.clear()?;
    info!(removed, "cleared retry queue");
    Ok(removed)
  }

  /// Replay every pending mutation in FIFO order.
  ///
  /// Each delivered mutation is removed as soon as the server accepts it.
  /// The first failure ends the pass: it and every later mutation stay
  /// queued, in order, for the next reconnect signal. Only storage errors
  /// are returned as `Err`.
  pub async fn drain<N: Network + ?Sized>(&self, network: &N) -> Result<DrainReport> {
    let _guard = self.drain_lock.lock().await;
    let pending = self.store.pending()?;
    let mut report = DrainReport::default();
    let mut stopped = false;

    for mutation in pending {
      if stopped {
        report.outcomes.push(ReplayOutcome::Deferred { id: mutation.id });
        continue;
      }

      match network.fetch(mutation.to_request()).await {
        Ok(response) if response.is_success() => {
          self.store.remove(mutation.id)?;
          debug!(id = mutation.id, status = response.status, "replayed mutation");
          report.outcomes.push(ReplayOutcome::Delivered {
            id: mutation.id,
            status: response.status,
          });
        }
        Ok(response) => {
          warn!(id = mutation.id, status = response.status, "replay rejected by server");
          report.outcomes.push(ReplayOutcome::Failed {
            id: mutation.id,
            reason: format!("server responded {}", response.status),
          });
          stopped = true;
        }
        Err(e) => {
          warn!(id = mutation.id, error = %e, "replay failed");
          report.outcomes.push(ReplayOutcome::Failed {
            id: mutation.id,
            reason: e.to_string(),
          });
          stopped = true;
        }
      }
    }

    info!(
      delivered = report.delivered(),
      remaining = report.remaining(),
      "drain pass finished"
    );
    Ok(report)
  }
}
