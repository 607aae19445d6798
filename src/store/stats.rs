use serde::Serialize;

use super::Store;
use crate::error::StorageResult;
use crate::intent::Status;

/// Point-in-time queue counts for display.
///
/// `total`, `pending`, `syncing` and `error` count live queue rows. Delivered
/// intents are deleted immediately, so `success` is the cumulative number of
/// deliveries since the store was created. `dead` counts retained dead
/// letters and `lost` every intent that ever exhausted its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
  pub total: u64,
  pub pending: u64,
  pub syncing: u64,
  pub error: u64,
  pub success: u64,
  pub dead: u64,
  pub lost: u64,
}

impl Store {
  pub fn stats(&self) -> StorageResult<QueueStats> {
    let conn = self.lock()?;
    let mut stats = QueueStats::default();

    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM mutation_queue GROUP BY status")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, Status>(0)?, row.get::<_, u64>(1)?)))?;
    for row in rows {
      let (status, count) = row?;
      stats.total += count;
      match status {
        Status::Pending => stats.pending += count,
        Status::Syncing => stats.syncing += count,
        Status::Error => stats.error += count,
        Status::Success => stats.success += count,
      }
    }

    let counter = |name: &str| -> rusqlite::Result<u64> {
      conn.query_row(
        "SELECT value FROM sync_counters WHERE name = ?",
        [name],
        |row| row.get(0),
      )
    };
    stats.success += counter("delivered")?;
    stats.lost = counter("lost")?;
    stats.dead = conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;

    Ok(stats)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::test_support::{cart_update, store_at};
  use crate::store::IntentPatch;

  #[test]
  fn test_stats_counts_by_status() {
    let (store, _clock) = store_at(0);
    let a = store.enqueue(&cart_update("a")).unwrap();
    let b = store.enqueue(&cart_update("b")).unwrap();
    let c = store.enqueue(&cart_update("c")).unwrap();
    store.enqueue(&cart_update("d")).unwrap();

    store.patch(a, &IntentPatch::status(Status::Syncing)).unwrap();
    store.record_failure(b, 3, "HTTP 500").unwrap();
    store.mark_delivered(c).unwrap();

    assert_eq!(
      store.stats().unwrap(),
      QueueStats {
        total: 3,
        pending: 1,
        syncing: 1,
        error: 1,
        success: 1,
        dead: 0,
        lost: 0,
      }
    );
  }
}
