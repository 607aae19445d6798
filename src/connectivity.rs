//! Reachability signal consumed by the sync engine.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::MIN_PERIOD;

/// Source of online/offline transitions.
///
/// Subscribers receive a `watch` receiver; dropping it unsubscribes.
pub trait ConnectivityObserver: Send + Sync {
  fn is_online(&self) -> bool;

  fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Holds the current reachability and relays transitions to subscribers.
#[derive(Debug)]
pub struct ConnectivityMonitor {
  tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx }
  }

  /// Record the current reachability. Subscribers are only woken when the
  /// value actually changes.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });

    if changed {
      info!(online, "connectivity changed");
    }
  }
}

impl ConnectivityObserver for ConnectivityMonitor {
  fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

/// Polls a URL with HEAD requests and feeds the result into a monitor.
///
/// Any HTTP response counts as online; only transport failures count as
/// offline.
pub struct HttpProbe {
  client: reqwest::Client,
  url: url::Url,
  interval: Duration,
}

impl HttpProbe {
  pub fn new(url: url::Url, interval: Duration) -> reqwest::Result<Self> {
    let interval = interval.max(MIN_PERIOD);
    let client = reqwest::Client::builder()
      .timeout(interval.clamp(Duration::from_secs(1), Duration::from_secs(5)))
      .build()?;
    Ok(Self {
      client,
      url,
      interval,
    })
  }

  pub async fn check(&self) -> bool {
    match self.client.head(self.url.clone()).send().await {
      Ok(_) => true,
      Err(e) => {
        debug!(error = %e, url = %self.url, "connectivity probe failed");
        false
      }
    }
  }

  /// Probe forever on the configured interval. Abort the handle to stop.
  pub fn spawn(self, monitor: Arc<ConnectivityMonitor>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        monitor.set_online(self.check().await);
      }
    })
  }
}
