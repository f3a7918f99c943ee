//! Error types for the offline agent.

use thiserror::Error;

/// Transport-level failure: no response was received.
///
/// Timeouts raised by the transport are reported through the same type and
/// handled exactly like any other network failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("network failure: {message}")]
pub struct NetworkError {
  pub message: String,
  pub timed_out: bool,
}

impl NetworkError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      timed_out: false,
    }
  }

  pub fn timeout(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      timed_out: true,
    }
  }
}

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Network(#[from] NetworkError),

  /// The cache or the persistent queue could not be read or written.
  #[error("storage failure: {0}")]
  Storage(String),

  /// A non-GET request failed at the network layer and was persisted for replay.
  #[error("request queued for replay as mutation {id}: {source}")]
  MutationQueued { id: i64, source: NetworkError },

  #[error("replay of mutation {id} failed: {reason}")]
  Replay { id: i64, reason: String },

  #[error("illegal lifecycle transition: {0}")]
  Lifecycle(String),

  #[error("configuration error: {0}")]
  Config(String),

  #[error("agent event loop has stopped")]
  Stopped,
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self {
    Error::Storage(e.to_string())
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Error::Storage(format!("serialization: {}", e))
  }
}

pub type Result<T> = std::result::Result<T, Error>;
