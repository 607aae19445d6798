//! Intents that ran out of retries.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::Store;
use crate::clock::from_millis;
use crate::error::{StorageError, StorageResult};
use crate::intent::{Action, Category, IntentId, Method, Status};

/// A dropped intent, retained so the loss is visible and recoverable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
  pub id: IntentId,
  pub category: Category,
  pub action: Action,
  pub endpoint: String,
  pub method: Method,
  pub payload: Option<Value>,
  pub created_at: DateTime<Utc>,
  pub attempts: u32,
  pub last_error: Option<String>,
  pub failed_at: DateTime<Utc>,
}

fn dead_letter_from_row(row: &Row<'_>) -> rusqlite::Result<DeadLetter> {
  let payload: Option<String> = row.get(5)?;
  let payload = payload
    .map(|text| serde_json::from_str(&text))
    .transpose()
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e)))?;

  Ok(DeadLetter {
    id: IntentId(row.get(0)?),
    category: row.get(1)?,
    action: row.get(2)?,
    endpoint: row.get(3)?,
    method: row.get(4)?,
    payload,
    created_at: from_millis(row.get(6)?),
    attempts: row.get(7)?,
    last_error: row.get(8)?,
    failed_at: from_millis(row.get(9)?),
  })
}

impl Store {
  /// Dead letters, most recent failure last.
  pub fn dead_letters(&self) -> StorageResult<Vec<DeadLetter>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT id, category, action, endpoint, method, payload, created_at, attempts, last_error, failed_at
       FROM dead_letters ORDER BY failed_at ASC, id ASC",
    )?;
    let letters = stmt
      .query_map([], dead_letter_from_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(letters)
  }

  /// Put a dead letter back in the queue as a fresh `pending` intent.
  /// Subject to the same queue cap as `enqueue`.
  ///
  /// The intent keeps its id and original `created_at`, so it is replayed in
  /// its original position relative to the rest of the queue.
  pub fn requeue_dead(&self, id: IntentId) -> StorageResult<()> {
    let now = self.now_millis();
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    self.ensure_room(&tx)?;
    let moved = tx.execute(
      "INSERT INTO mutation_queue
         (id, category, action, endpoint, method, payload, created_at, updated_at, retry_count, status)
       SELECT id, category, action, endpoint, method, payload, created_at, ?, 0, ?
       FROM dead_letters WHERE id = ?",
      params![now, Status::Pending, id.0],
    )?;
    if moved == 0 {
      return Err(StorageError::NotFound(id));
    }
    tx.execute("DELETE FROM dead_letters WHERE id = ?", params![id.0])?;

    tx.commit()?;
    info!(%id, "requeued dead letter");
    Ok(())
  }

  /// Discard all dead letters. The cumulative `lost` counter is kept.
  pub fn purge_dead(&self) -> StorageResult<usize> {
    let conn = self.lock()?;
    Ok(conn.execute("DELETE FROM dead_letters", [])?)
  }
}
