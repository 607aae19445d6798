//! Sync engine: drains the mutation queue against the transport.
//!
//! Passes are single-flight. A pass requested while another is running is
//! dropped, not queued. Within a pass intents are delivered one at a time in
//! `created_at` order.
//!
//! Passes are triggered by:
//! - the periodic timer (only while online)
//! - an offline -> online transition
//! - `sync_now`
//! - a short delay after `enqueue` while online

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connectivity::ConnectivityObserver;
use crate::error::{DeliveryError, EnqueueError, StorageError, StorageResult};
use crate::intent::{IntentId, NewIntent, Status};
use crate::store::{FailureOutcome, IntentPatch, Store};
use crate::transport::{DeliveryRequest, Transport};

/// Floor applied to timer periods.
pub const MIN_PERIOD: Duration = Duration::from_millis(10);

/// Tunables for an engine instance. Zero timer periods are raised to
/// [`MIN_PERIOD`].
#[derive(Debug, Clone)]
pub struct SyncSettings {
  /// Delivery attempts per intent before it is dropped to the dead letters
  pub max_retries: u32,
  /// Period of the auto-sync timer
  pub interval: Duration,
  /// Upper bound on a single delivery attempt
  pub request_timeout: Duration,
  /// Delay between an enqueue and the pass it triggers
  pub nudge_delay: Duration,
  /// Period of the expired cache entry sweep
  pub cache_sweep_interval: Duration,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      max_retries: 3,
      interval: Duration::from_secs(30),
      request_timeout: Duration::from_secs(10),
      nudge_delay: Duration::from_millis(500),
      cache_sweep_interval: Duration::from_secs(60),
    }
  }
}

impl From<&Config> for SyncSettings {
  fn from(config: &Config) -> Self {
    Self {
      max_retries: config.sync.max_retries,
      interval: config.sync.interval(),
      request_timeout: config.sync.request_timeout(),
      nudge_delay: config.sync.nudge_delay(),
      cache_sweep_interval: Duration::from_secs(config.cache.sweep_interval_secs),
    }
  }
}

/// Tally of one completed pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
  pub attempted: usize,
  pub delivered: usize,
  /// Failed and will be retried
  pub failed: usize,
  /// Failed for the last time and moved to the dead letters
  pub lost: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
  Completed(PassReport),
  /// Another pass was in progress; this request was coalesced into it.
  AlreadyRunning,
  /// Offline; nothing was attempted and no retries were spent.
  Offline,
}

/// Progress notifications for observers such as a UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
  PassStarted { queued: usize },
  Delivered { id: IntentId },
  Failed { id: IntentId, retry_count: u32, reason: String },
  /// The intent exhausted its retries and left the queue.
  Lost { id: IntentId, attempts: u32, reason: String },
  PassFinished(PassReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
  Startup,
  Timer,
  Reconnect,
  Enqueue,
  Manual,
}

impl Trigger {
  fn as_str(self) -> &'static str {
    match self {
      Trigger::Startup => "startup",
      Trigger::Timer => "timer",
      Trigger::Reconnect => "reconnect",
      Trigger::Enqueue => "enqueue",
      Trigger::Manual => "manual",
    }
  }
}

/// Clears the in-progress flag on every exit path of a pass.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| PassGuard(flag))
  }
}

impl Drop for PassGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

struct Shared {
  store: Arc<Store>,
  transport: Arc<dyn Transport>,
  connectivity: Arc<dyn ConnectivityObserver>,
  settings: SyncSettings,
  in_progress: AtomicBool,
  events: broadcast::Sender<SyncEvent>,
  nudge: Notify,
}

struct AutoSync {
  shutdown: oneshot::Sender<()>,
  handle: JoinHandle<()>,
}

/// One engine per client. Owns its single-flight flag and its timer task, so
/// independent engines never share state.
pub struct SyncEngine {
  shared: Arc<Shared>,
  auto: Mutex<Option<AutoSync>>,
}

impl SyncEngine {
  /// Build an engine. Intents left `syncing` by a process that died
  /// mid-delivery are reset to `pending` first; intents another live engine is
  /// delivering are left alone.
  pub fn new(
    store: Arc<Store>,
    transport: Arc<dyn Transport>,
    connectivity: Arc<dyn ConnectivityObserver>,
    settings: SyncSettings,
  ) -> StorageResult<Self> {
    // Deliveries are capped at `request_timeout`, so anything older belongs to
    // a dead process
    let recovered = store.recover_interrupted(settings.request_timeout * 2)?;
    if recovered > 0 {
      warn!(recovered, "reset intents interrupted mid-delivery");
    }

    let (events, _) = broadcast::channel(64);

    Ok(Self {
      shared: Arc::new(Shared {
        store,
        transport,
        connectivity,
        settings,
        in_progress: AtomicBool::new(false),
        events,
        nudge: Notify::new(),
      }),
      auto: Mutex::new(None),
    })
  }

  pub fn store(&self) -> &Arc<Store> {
    &self.shared.store
  }

  pub fn settings(&self) -> &SyncSettings {
    &self.shared.settings
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.shared.events.subscribe()
  }

  /// Whether a pass is executing right now.
  pub fn is_syncing(&self) -> bool {
    self.shared.in_progress.load(Ordering::Acquire)
  }

  /// Persist an intent and, if online, schedule a pass shortly after.
  pub fn enqueue(&self, intent: &NewIntent) -> Result<IntentId, EnqueueError> {
    let id = self.shared.store.enqueue(intent)?;
    if self.shared.connectivity.is_online() {
      self.shared.nudge.notify_one();
    }
    Ok(id)
  }

  /// Run a pass now unless one is already running or the client is offline.
  pub async fn sync_now(&self) -> StorageResult<PassOutcome> {
    self.shared.run_pass(Trigger::Manual).await
  }

  /// Start the auto-sync task. Returns false if it was already running.
  pub fn start(&self) -> bool {
    let mut auto = self.auto.lock().unwrap_or_else(PoisonError::into_inner);
    if auto.as_ref().is_some_and(|a| !a.handle.is_finished()) {
      warn!("auto-sync already running");
      return false;
    }

    let (shutdown, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(auto_sync_loop(self.shared.clone(), shutdown_rx));
    *auto = Some(AutoSync { shutdown, handle });
    true
  }

  /// Stop the auto-sync task, waiting for an in-flight pass to finish.
  /// Returns false if it was not running.
  pub async fn stop(&self) -> bool {
    let auto = self
      .auto
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();

    let Some(auto) = auto else {
      return false;
    };

    let _ = auto.shutdown.send(());
    if let Err(e) = auto.handle.await {
      error!(error = %e, "auto-sync task ended abnormally");
    }
    info!("auto-sync stopped");
    true
  }

  pub fn is_running(&self) -> bool {
    self
      .auto
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .as_ref()
      .is_some_and(|a| !a.handle.is_finished())
  }
}

impl Drop for SyncEngine {
  fn drop(&mut self) {
    let auto = self
      .auto
      .get_mut()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(auto) = auto {
      auto.handle.abort();
    }
  }
}

impl Shared {
  async fn run_pass(&self, trigger: Trigger) -> StorageResult<PassOutcome> {
    if !self.connectivity.is_online() {
      debug!(trigger = trigger.as_str(), "offline, skipping sync pass");
      return Ok(PassOutcome::Offline);
    }

    let Some(_guard) = PassGuard::acquire(&self.in_progress) else {
      debug!(trigger = trigger.as_str(), "sync pass already running");
      return Ok(PassOutcome::AlreadyRunning);
    };

    let intents = self.store.list_actionable(self.settings.max_retries)?;
    if !intents.is_empty() {
      info!(trigger = trigger.as_str(), queued = intents.len(), "sync pass started");
    }
    self.emit(SyncEvent::PassStarted {
      queued: intents.len(),
    });

    let mut report = PassReport::default();
    for intent in &intents {
      match self.store.claim(intent.id) {
        Ok(true) => {}
        Ok(false) => {
          debug!(id = %intent.id, "intent removed or claimed elsewhere, skipping");
          continue;
        }
        Err(e) => {
          error!(id = %intent.id, error = %e, "could not claim intent, skipping");
          continue;
        }
      }

      report.attempted += 1;
      let request = DeliveryRequest::from(intent);
      match self.deliver(&request).await {
        Ok(()) => {
          match self.store.mark_delivered(intent.id) {
            Ok(()) => {}
            Err(StorageError::NotFound(id)) => {
              debug!(%id, "intent removed while in flight");
            }
            Err(e) => {
              error!(id = %intent.id, error = %e, "delivered but could not record it");
              // At-least-once: the row must not stay `syncing`
              self.release(intent.id, IntentPatch::status(Status::Pending));
            }
          }
          report.delivered += 1;
          debug!(id = %intent.id, endpoint = %intent.endpoint, "delivered intent");
          self.emit(SyncEvent::Delivered { id: intent.id });
        }
        Err(e) => {
          let reason = e.to_string();
          let outcome = match self
            .store
            .record_failure(intent.id, self.settings.max_retries, &reason)
          {
            Ok(outcome) => outcome,
            Err(StorageError::NotFound(id)) => {
              debug!(%id, error = %reason, "intent removed while in flight");
              continue;
            }
            Err(storage) => {
              error!(id = %intent.id, error = %storage, "could not record failed attempt");
              self.release(
                intent.id,
                IntentPatch::status(Status::Error).with_last_error(Some(reason)),
              );
              report.failed += 1;
              continue;
            }
          };

          match outcome {
            FailureOutcome::Retrying { retry_count } => {
              report.failed += 1;
              warn!(
                id = %intent.id,
                endpoint = %intent.endpoint,
                retry_count,
                error = %reason,
                "delivery failed, will retry"
              );
              self.emit(SyncEvent::Failed {
                id: intent.id,
                retry_count,
                reason,
              });
            }
            FailureOutcome::Exhausted { attempts } => {
              report.lost += 1;
              error!(
                id = %intent.id,
                category = %intent.category,
                action = %intent.action,
                endpoint = %intent.endpoint,
                attempts,
                error = %reason,
                "intent dropped after exhausting retries"
              );
              self.emit(SyncEvent::Lost {
                id: intent.id,
                attempts,
                reason,
              });
            }
          }
        }
      }
    }

    if report.attempted > 0 {
      info!(
        attempted = report.attempted,
        delivered = report.delivered,
        failed = report.failed,
        lost = report.lost,
        "sync pass finished"
      );
    }
    self.emit(SyncEvent::PassFinished(report));

    Ok(PassOutcome::Completed(report))
  }

  async fn deliver(&self, request: &DeliveryRequest) -> Result<(), DeliveryError> {
    let timeout = self.settings.request_timeout;
    match tokio::time::timeout(timeout, self.transport.deliver(request)).await {
      Ok(result) => result,
      Err(_) => Err(DeliveryError::timeout(timeout)),
    }
  }

  /// Take an intent out of `syncing` after the store refused the normal
  /// transition, so a later pass can pick it up.
  fn release(&self, id: IntentId, patch: IntentPatch) {
    match self.store.patch(id, &patch) {
      Ok(()) | Err(StorageError::NotFound(_)) => {}
      Err(e) => error!(%id, error = %e, "intent left syncing until recovered"),
    }
  }

  async fn trigger(&self, trigger: Trigger) {
    if let Err(e) = self.run_pass(trigger).await {
      error!(trigger = trigger.as_str(), error = %e, "sync pass aborted");
    }
  }

  fn sweep_cache(&self) {
    match self.store.cache_sweep_expired() {
      Ok(0) => {}
      Ok(swept) => debug!(swept, "swept expired cache entries"),
      Err(e) => warn!(error = %e, "cache sweep failed"),
    }
  }

  fn emit(&self, event: SyncEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }
}

async fn auto_sync_loop(shared: Arc<Shared>, mut shutdown: oneshot::Receiver<()>) {
  let settings = shared.settings.clone();
  let mut online_rx = shared.connectivity.subscribe();
  let mut was_online = *online_rx.borrow_and_update();
  let mut watching = true;

  // tokio intervals panic on a zero period
  let interval = settings.interval.max(MIN_PERIOD);
  let sweep_interval = settings.cache_sweep_interval.max(MIN_PERIOD);

  let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  let mut sweeper = tokio::time::interval_at(Instant::now() + sweep_interval, sweep_interval);
  sweeper.set_missed_tick_behavior(MissedTickBehavior::Delay);

  info!(interval_ms = interval.as_millis() as u64, online = was_online, "auto-sync started");

  if was_online {
    shared.trigger(Trigger::Startup).await;
  }

  loop {
    tokio::select! {
      _ = &mut shutdown => break,
      _ = ticker.tick() => shared.trigger(Trigger::Timer).await,
      changed = online_rx.changed(), if watching => {
        if changed.is_err() {
          warn!("connectivity source closed, reconnect triggers disabled");
          watching = false;
          continue;
        }
        let online = *online_rx.borrow_and_update();
        if online && !was_online {
          shared.trigger(Trigger::Reconnect).await;
        }
        was_online = online;
      }
      _ = shared.nudge.notified() => {
        tokio::time::sleep(settings.nudge_delay).await;
        shared.trigger(Trigger::Enqueue).await;
      }
      _ = sweeper.tick() => shared.sweep_cache(),
    }
  }
}
