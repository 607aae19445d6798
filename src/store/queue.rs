//! Mutation queue operations.

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::time::Duration;
use tracing::debug;

use super::Store;
use crate::clock::from_millis;
use crate::error::{EnqueueError, StorageError, StorageResult};
use crate::intent::{IntentId, NewIntent, QueuedIntent, Status};

const INTENT_COLUMNS: &str = "id, category, action, endpoint, method, payload, created_at, \
   updated_at, retry_count, status, last_error";

/// Partial update applied by `Store::patch`. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntentPatch {
  pub status: Option<Status>,
  pub retry_count: Option<u32>,
  /// `Some(None)` clears the error.
  pub last_error: Option<Option<String>>,
}

impl IntentPatch {
  pub fn status(status: Status) -> Self {
    Self {
      status: Some(status),
      ..Self::default()
    }
  }

  pub fn with_retry_count(mut self, retry_count: u32) -> Self {
    self.retry_count = Some(retry_count);
    self
  }

  pub fn with_last_error(mut self, last_error: Option<String>) -> Self {
    self.last_error = Some(last_error);
    self
  }
}

/// What happened to an intent after a failed attempt was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
  /// Back in the queue with status `error`.
  Retrying { retry_count: u32 },
  /// Retry budget spent; moved to the dead letters.
  Exhausted { attempts: u32 },
}

fn intent_from_row(row: &Row<'_>) -> rusqlite::Result<QueuedIntent> {
  let payload: Option<String> = row.get(5)?;
  let payload = payload
    .map(|text| serde_json::from_str(&text))
    .transpose()
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e)))?;

  Ok(QueuedIntent {
    id: IntentId(row.get(0)?),
    category: row.get(1)?,
    action: row.get(2)?,
    endpoint: row.get(3)?,
    method: row.get(4)?,
    payload,
    created_at: from_millis(row.get(6)?),
    updated_at: from_millis(row.get(7)?),
    retry_count: row.get(8)?,
    status: row.get(9)?,
    last_error: row.get(10)?,
  })
}

impl Store {
  /// Validate and persist a new intent as `pending` with zero retries.
  pub fn enqueue(&self, intent: &NewIntent) -> Result<IntentId, EnqueueError> {
    intent.validate()?;

    let payload = intent
      .mutation
      .body_json()
      .map_err(StorageError::from)?
      .map(|body| body.to_string());
    let now = self.now_millis();

    let conn = self.lock()?;

    self.ensure_room(&conn)?;

    conn
      .execute(
        "INSERT INTO mutation_queue
           (category, action, endpoint, method, payload, created_at, updated_at, retry_count, status)
         VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)",
        params![
          intent.category(),
          intent.action,
          intent.endpoint,
          intent.method,
          payload,
          now,
          now,
          Status::Pending
        ],
      )
      .map_err(StorageError::from)?;

    let id = IntentId(conn.last_insert_rowid());
    debug!(%id, category = %intent.category(), action = %intent.action, "enqueued intent");
    Ok(id)
  }

  /// Intents a sync pass should attempt, oldest first.
  pub fn list_actionable(&self, max_retries: u32) -> StorageResult<Vec<QueuedIntent>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {INTENT_COLUMNS} FROM mutation_queue
       WHERE status IN (?, ?) AND retry_count < ?
       ORDER BY created_at ASC, id ASC"
    ))?;

    let intents = stmt
      .query_map(params![Status::Pending, Status::Error, max_retries], intent_from_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(intents)
  }

  /// Every queued intent regardless of status, oldest first.
  pub fn list_all(&self) -> StorageResult<Vec<QueuedIntent>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {INTENT_COLUMNS} FROM mutation_queue ORDER BY created_at ASC, id ASC"
    ))?;

    let intents = stmt
      .query_map([], intent_from_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(intents)
  }

  pub fn get(&self, id: IntentId) -> StorageResult<Option<QueuedIntent>> {
    let conn = self.lock()?;
    let intent = conn
      .query_row(
        &format!("SELECT {INTENT_COLUMNS} FROM mutation_queue WHERE id = ?"),
        params![id.0],
        intent_from_row,
      )
      .optional()?;
    Ok(intent)
  }

  /// Update a single record in place.
  ///
  /// Moving to any status other than `error` clears `last_error` unless the
  /// patch sets it explicitly. `retry_count` may never decrease.
  pub fn patch(&self, id: IntentId, patch: &IntentPatch) -> StorageResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let current: Option<u32> = tx
      .query_row(
        "SELECT retry_count FROM mutation_queue WHERE id = ?",
        params![id.0],
        |row| row.get(0),
      )
      .optional()?;
    let current = current.ok_or(StorageError::NotFound(id))?;

    if let Some(requested) = patch.retry_count {
      if requested < current {
        return Err(StorageError::RetryCountDecrease {
          id,
          current,
          requested,
        });
      }
    }

    let last_error = match (&patch.last_error, patch.status) {
      (Some(explicit), _) => Some(explicit.clone()),
      (None, Some(status)) if status != Status::Error => Some(None),
      (None, _) => None,
    };

    tx.execute(
      "UPDATE mutation_queue SET
         status = COALESCE(?, status),
         retry_count = COALESCE(?, retry_count),
         last_error = CASE WHEN ? THEN ? ELSE last_error END,
         updated_at = ?
       WHERE id = ?",
      params![
        patch.status,
        patch.retry_count,
        last_error.is_some(),
        last_error.flatten(),
        self.now_millis(),
        id.0
      ],
    )?;

    tx.commit()?;
    Ok(())
  }

  /// Delete an intent permanently. Returns false if it was not queued.
  pub fn remove(&self, id: IntentId) -> StorageResult<bool> {
    let conn = self.lock()?;
    let removed = conn.execute("DELETE FROM mutation_queue WHERE id = ?", params![id.0])?;
    Ok(removed > 0)
  }

  /// Remove a delivered intent and count it as a success.
  pub fn mark_delivered(&self, id: IntentId) -> StorageResult<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    if tx.execute("DELETE FROM mutation_queue WHERE id = ?", params![id.0])? == 0 {
      return Err(StorageError::NotFound(id));
    }
    tx.execute(
      "UPDATE sync_counters SET value = value + 1 WHERE name = 'delivered'",
      [],
    )?;

    tx.commit()?;
    Ok(())
  }

  /// Record a failed attempt: bump `retry_count`, and either park the intent
  /// in `error` or, once the count reaches `max_retries`, move it to the dead
  /// letters.
  pub fn record_failure(
    &self,
    id: IntentId,
    max_retries: u32,
    reason: &str,
  ) -> StorageResult<FailureOutcome> {
    let now = self.now_millis();
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let current: Option<u32> = tx
      .query_row(
        "SELECT retry_count FROM mutation_queue WHERE id = ?",
        params![id.0],
        |row| row.get(0),
      )
      .optional()?;
    let retry_count = current.ok_or(StorageError::NotFound(id))? + 1;

    let outcome = if retry_count < max_retries {
      tx.execute(
        "UPDATE mutation_queue SET status = ?, retry_count = ?, last_error = ?, updated_at = ?
         WHERE id = ?",
        params![Status::Error, retry_count, reason, now, id.0],
      )?;
      FailureOutcome::Retrying { retry_count }
    } else {
      tx.execute(
        "INSERT OR REPLACE INTO dead_letters
           (id, category, action, endpoint, method, payload, created_at, attempts, last_error, failed_at)
         SELECT id, category, action, endpoint, method, payload, created_at, ?, ?, ?
         FROM mutation_queue WHERE id = ?",
        params![retry_count, reason, now, id.0],
      )?;
      tx.execute("DELETE FROM mutation_queue WHERE id = ?", params![id.0])?;
      tx.execute(
        "UPDATE sync_counters SET value = value + 1 WHERE name = 'lost'",
        [],
      )?;
      FailureOutcome::Exhausted {
        attempts: retry_count,
      }
    };

    tx.commit()?;
    Ok(outcome)
  }

  /// Move an intent from `pending` or `error` to `syncing`.
  ///
  /// Returns false if the intent is gone or another engine already holds it,
  /// so at most one attempt per intent is in flight even across processes
  /// sharing the database.
  pub fn claim(&self, id: IntentId) -> StorageResult<bool> {
    let conn = self.lock()?;
    let claimed = conn.execute(
      "UPDATE mutation_queue SET status = ?, last_error = NULL, updated_at = ?
       WHERE id = ? AND status IN (?, ?)",
      params![
        Status::Syncing,
        self.now_millis(),
        id.0,
        Status::Pending,
        Status::Error
      ],
    )?;
    Ok(claimed > 0)
  }

  /// Reset intents left in `syncing` by a process that died mid-attempt.
  ///
  /// Only rows untouched for longer than `stale_after` are reset. A live
  /// engine never keeps a row in `syncing` past its request timeout, so its
  /// in-flight intents are left alone.
  pub fn recover_interrupted(&self, stale_after: Duration) -> StorageResult<usize> {
    let now = self.now_millis();
    let cutoff = now.saturating_sub(i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX));
    let conn = self.lock()?;
    let recovered = conn.execute(
      "UPDATE mutation_queue SET status = ?, updated_at = ? WHERE status = ? AND updated_at < ?",
      params![Status::Pending, now, Status::Syncing, cutoff],
    )?;
    Ok(recovered)
  }

  /// Fails with `QuotaExceeded` once the queue holds `max_queue_len` intents.
  pub(super) fn ensure_room(&self, conn: &Connection) -> StorageResult<()> {
    let queued: i64 = conn.query_row("SELECT COUNT(*) FROM mutation_queue", [], |row| row.get(0))?;
    if usize::try_from(queued).unwrap_or(usize::MAX) >= self.max_queue_len {
      return Err(StorageError::QuotaExceeded {
        limit: self.max_queue_len,
      });
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::test_support::{cart_update, store_at};
  use chrono::Duration;

  #[test]
  fn test_enqueue_sets_initial_state() {
    let (store, _clock) = store_at(100);
    let id = store.enqueue(&cart_update("p1")).unwrap();

    let intent = store.get(id).unwrap().unwrap();
    assert_eq!(intent.status, Status::Pending);
    assert_eq!(intent.retry_count, 0);
    assert_eq!(intent.created_at.timestamp_millis(), 100);
    assert_eq!(intent.last_error, None);
    assert_eq!(
      intent.payload,
      Some(serde_json::json!({"product_id": "p1", "quantity": 1}))
    );
  }

  #[test]
  fn test_enqueue_rejects_invalid_intent() {
    let (store, _clock) = store_at(0);
    let mut intent = cart_update("p1");
    intent.endpoint = "not a url".to_string();

    assert!(matches!(store.enqueue(&intent), Err(EnqueueError::Invalid(_))));
    assert!(store.list_all().unwrap().is_empty());
  }

  #[test]
  fn test_enqueue_quota() {
    let (store, _clock) = store_at(0);
    let store = store.with_max_queue_len(1);

    store.enqueue(&cart_update("p1")).unwrap();
    let err = store.enqueue(&cart_update("p2")).unwrap_err();
    assert!(matches!(
      err,
      EnqueueError::Storage(StorageError::QuotaExceeded { limit: 1 })
    ));
  }

  #[test]
  fn test_list_actionable_orders_by_created_at() {
    let (store, clock) = store_at(300);
    let late = store.enqueue(&cart_update("late")).unwrap();
    clock.set_millis(100);
    let early = store.enqueue(&cart_update("early")).unwrap();
    clock.set_millis(200);
    let middle = store.enqueue(&cart_update("middle")).unwrap();

    let ids: Vec<_> = store
      .list_actionable(3)
      .unwrap()
      .into_iter()
      .map(|i| i.id)
      .collect();
    assert_eq!(ids, vec![early, middle, late]);
  }

  #[test]
  fn test_list_actionable_filters_status_and_retries() {
    let (store, _clock) = store_at(0);
    let pending = store.enqueue(&cart_update("a")).unwrap();
    let syncing = store.enqueue(&cart_update("b")).unwrap();
    let errored = store.enqueue(&cart_update("c")).unwrap();
    let spent = store.enqueue(&cart_update("d")).unwrap();

    store.patch(syncing, &IntentPatch::status(Status::Syncing)).unwrap();
    store
      .patch(
        errored,
        &IntentPatch::status(Status::Error)
          .with_retry_count(1)
          .with_last_error(Some("boom".into())),
      )
      .unwrap();
    store
      .patch(spent, &IntentPatch::status(Status::Error).with_retry_count(3))
      .unwrap();

    let ids: Vec<_> = store
      .list_actionable(3)
      .unwrap()
      .into_iter()
      .map(|i| i.id)
      .collect();
    assert_eq!(ids, vec![pending, errored]);
  }

  #[test]
  fn test_patch_rejects_retry_decrease_and_unknown_id() {
    let (store, _clock) = store_at(0);
    let id = store.enqueue(&cart_update("p1")).unwrap();
    store.patch(id, &IntentPatch::default().with_retry_count(2)).unwrap();

    assert!(matches!(
      store.patch(id, &IntentPatch::default().with_retry_count(1)),
      Err(StorageError::RetryCountDecrease { current: 2, requested: 1, .. })
    ));
    assert!(matches!(
      store.patch(IntentId(999), &IntentPatch::status(Status::Syncing)),
      Err(StorageError::NotFound(IntentId(999)))
    ));
  }

  #[test]
  fn test_patch_to_syncing_clears_last_error() {
    let (store, clock) = store_at(0);
    let id = store.enqueue(&cart_update("p1")).unwrap();
    store
      .patch(
        id,
        &IntentPatch::status(Status::Error).with_last_error(Some("500".into())),
      )
      .unwrap();
    clock.advance(Duration::seconds(1));
    store.patch(id, &IntentPatch::status(Status::Syncing)).unwrap();

    let intent = store.get(id).unwrap().unwrap();
    assert_eq!(intent.status, Status::Syncing);
    assert_eq!(intent.last_error, None);
    assert_eq!(intent.updated_at.timestamp_millis(), 1_000);
  }

  #[test]
  fn test_record_failure_until_exhausted() {
    let (store, _clock) = store_at(0);
    let id = store.enqueue(&cart_update("p1")).unwrap();

    assert_eq!(
      store.record_failure(id, 3, "HTTP 500").unwrap(),
      FailureOutcome::Retrying { retry_count: 1 }
    );
    let intent = store.get(id).unwrap().unwrap();
    assert_eq!(intent.status, Status::Error);
    assert_eq!(intent.last_error.as_deref(), Some("HTTP 500"));

    assert_eq!(
      store.record_failure(id, 3, "HTTP 500").unwrap(),
      FailureOutcome::Retrying { retry_count: 2 }
    );
    assert_eq!(
      store.record_failure(id, 3, "HTTP 502").unwrap(),
      FailureOutcome::Exhausted { attempts: 3 }
    );

    assert!(store.get(id).unwrap().is_none());
    let dead = store.dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, id);
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].last_error.as_deref(), Some("HTTP 502"));
  }

  #[test]
  fn test_mark_delivered_removes_and_counts() {
    let (store, _clock) = store_at(0);
    let id = store.enqueue(&cart_update("p1")).unwrap();

    store.mark_delivered(id).unwrap();
    assert!(store.get(id).unwrap().is_none());
    assert_eq!(store.stats().unwrap().success, 1);
    assert!(matches!(
      store.mark_delivered(id),
      Err(StorageError::NotFound(_))
    ));
  }

  #[test]
  fn test_remove() {
    let (store, _clock) = store_at(0);
    let id = store.enqueue(&cart_update("p1")).unwrap();
    assert!(store.remove(id).unwrap());
    assert!(!store.remove(id).unwrap());
  }

  #[test]
  fn test_recover_interrupted_only_resets_stale_rows() {
    let (store, clock) = store_at(0);
    let id = store.enqueue(&cart_update("p1")).unwrap();
    store.patch(id, &IntentPatch::status(Status::Syncing)).unwrap();

    clock.set_millis(5_000);
    assert_eq!(store.recover_interrupted(std::time::Duration::from_secs(10)).unwrap(), 0);
    assert_eq!(store.get(id).unwrap().unwrap().status, Status::Syncing);

    clock.set_millis(30_000);
    assert_eq!(store.recover_interrupted(std::time::Duration::from_secs(10)).unwrap(), 1);
    assert_eq!(store.get(id).unwrap().unwrap().status, Status::Pending);
  }

  #[test]
  fn test_claim_is_exclusive() {
    let (store, _clock) = store_at(0);
    let id = store.enqueue(&cart_update("p1")).unwrap();

    assert!(store.claim(id).unwrap());
    assert!(!store.claim(id).unwrap());
    assert_eq!(store.get(id).unwrap().unwrap().status, Status::Syncing);

    store.record_failure(id, 3, "boom").unwrap();
    assert!(store.claim(id).unwrap());
    assert_eq!(store.get(id).unwrap().unwrap().last_error, None);

    store.remove(id).unwrap();
    assert!(!store.claim(id).unwrap());
  }

  #[test]
  fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");

    let id = {
      let store = Store::open(&path).unwrap();
      store.enqueue(&cart_update("p1")).unwrap()
    };

    let store = Store::open(&path).unwrap();
    let intents = store.list_actionable(3).unwrap();
    assert_eq!(intents.len(), 1);
    assert_eq!(intents[0].id, id);
  }
}
