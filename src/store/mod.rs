//! Durable local storage for the mutation queue and the read cache.
//!
//! Both record sets live in one SQLite database behind a single connection
//! mutex. Every public operation is one statement or one transaction, so each
//! record update is atomic even when called from concurrent tasks.

mod cache;
mod dead;
mod queue;
mod stats;

pub use cache::{CacheCategory, CachedEntry};
pub use dead::DeadLetter;
pub use queue::{FailureOutcome, IntentPatch};
pub use stats::QueueStats;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::{Clock, SystemClock};
use crate::db::Database;
use crate::error::{StorageError, StorageResult};

/// Default cap on queued intents.
pub const DEFAULT_MAX_QUEUE_LEN: usize = 10_000;

/// SQLite-backed persistent store.
pub struct Store {
  conn: Mutex<Connection>,
  clock: Arc<dyn Clock>,
  max_queue_len: usize,
}

impl Store {
  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> StorageResult<Self> {
    let db = Database::open(path)?;
    Ok(Self::from_connection(db.into_connection()))
  }

  /// Open a store that lives only as long as this value.
  pub fn open_in_memory() -> StorageResult<Self> {
    let db = Database::open_in_memory()?;
    Ok(Self::from_connection(db.into_connection()))
  }

  fn from_connection(conn: Connection) -> Self {
    Self {
      conn: Mutex::new(conn),
      clock: Arc::new(SystemClock),
      max_queue_len: DEFAULT_MAX_QUEUE_LEN,
    }
  }

  /// Replace the time source.
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Cap the number of queued intents; `enqueue` fails with
  /// `StorageError::QuotaExceeded` once reached.
  pub fn with_max_queue_len(mut self, max_queue_len: usize) -> Self {
    self.max_queue_len = max_queue_len;
    self
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  fn now_millis(&self) -> i64 {
    self.clock.now().timestamp_millis()
  }

  fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|_| StorageError::Poisoned)
  }
}
