//! Error types shared across the store, transport and engine.

use std::time::Duration;

use crate::intent::{Action, Category, IntentId};

/// Local persistence failed or rejected a write.
///
/// Callers of `enqueue`/`cache_put` must surface this to the user, typically as
/// "could not save this action offline".
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
  /// The underlying SQLite database failed.
  #[error("storage unavailable: {0}")]
  Sqlite(#[from] rusqlite::Error),

  /// A record could not be serialized for storage.
  #[error("could not encode record: {0}")]
  Encode(#[from] serde_json::Error),

  /// The queue already holds the configured maximum number of intents.
  #[error("offline queue is full ({limit} intents)")]
  QuotaExceeded { limit: usize },

  /// No queued intent has this id.
  #[error("no queued intent with id {0}")]
  NotFound(IntentId),

  /// A patch tried to move `retry_count` backwards.
  #[error("retry count for intent {id} cannot decrease from {current} to {requested}")]
  RetryCountDecrease {
    id: IntentId,
    current: u32,
    requested: u32,
  },

  /// Another thread panicked while holding the connection.
  #[error("storage lock poisoned")]
  Poisoned,

  /// Filesystem error while preparing the database location.
  #[error("storage I/O error: {0}")]
  Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// A mutation intent failed validation before it reached the queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
  #[error("{category} {action} requires a payload")]
  MissingBody { category: Category, action: Action },

  #[error("{category} does not support {action}")]
  UnsupportedAction { category: Category, action: Action },

  #[error("invalid endpoint {endpoint:?}: {reason}")]
  InvalidEndpoint { endpoint: String, reason: String },

  #[error("invalid {field}: {reason}")]
  Field { field: &'static str, reason: String },

  #[error("payload does not match the {category} schema: {reason}")]
  Schema { category: Category, reason: String },
}

/// Error returned by `enqueue`.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
  #[error("invalid intent: {0}")]
  Invalid(#[from] ValidationError),

  #[error(transparent)]
  Storage(#[from] StorageError),
}

/// A single delivery attempt failed. Both variants are retryable and consume
/// one retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
  /// Transport-level failure: offline, DNS, connection reset, timeout.
  #[error("network error: {0}")]
  Network(String),

  /// The endpoint answered with a non-2xx status.
  #[error("server responded {status}: {body}")]
  Server { status: u16, body: String },
}

impl DeliveryError {
  pub fn timeout(after: Duration) -> Self {
    DeliveryError::Network(format!("request timed out after {}ms", after.as_millis()))
  }
}
