//! Read-only queue status for display.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::engine::MIN_PERIOD;
use crate::error::StorageResult;
use crate::store::{QueueStats, Store};

/// Publishes `QueueStats` snapshots, either on demand or on a fixed interval.
/// Never modifies the queue.
#[derive(Clone)]
pub struct StatusReporter {
  store: Arc<Store>,
  tx: Arc<watch::Sender<QueueStats>>,
}

impl StatusReporter {
  pub fn new(store: Arc<Store>) -> Self {
    let (tx, _rx) = watch::channel(QueueStats::default());
    Self {
      store,
      tx: Arc::new(tx),
    }
  }

  /// Current counts, read straight from the store.
  pub fn snapshot(&self) -> StorageResult<QueueStats> {
    self.store.stats()
  }

  /// Recompute and publish to watchers, e.g. right after a manual sync.
  pub fn refresh(&self) -> StorageResult<QueueStats> {
    let stats = self.snapshot()?;
    self.tx.send_replace(stats);
    Ok(stats)
  }

  /// Latest published snapshot.
  pub fn watch(&self) -> watch::Receiver<QueueStats> {
    self.tx.subscribe()
  }

  /// Refresh every `interval` until the handle is aborted. A zero interval is
  /// raised to [`MIN_PERIOD`].
  pub fn spawn(&self, interval: Duration) -> JoinHandle<()> {
    let reporter = self.clone();
    let interval = interval.max(MIN_PERIOD);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      loop {
        ticker.tick().await;
        if let Err(e) = reporter.refresh() {
          warn!(error = %e, "failed to refresh queue status");
        }
      }
    })
  }
}
