//! Cache layer that orchestrates caching logic with network fetching.

use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::traits::CacheResult;
use crate::config::Config;
use crate::store::{CacheCategory, Store};

/// TTL used when neither the caller nor the config sets one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Cache layer that manages caching logic and network fetching.
#[derive(Clone)]
pub struct CacheLayer {
  store: Arc<Store>,
  /// TTL used by `fetch`
  default_ttl: Duration,
}

impl CacheLayer {
  /// Create a new cache layer over the given store.
  pub fn new(store: Arc<Store>) -> Self {
    Self {
      store,
      default_ttl: DEFAULT_TTL,
    }
  }

  /// Cache layer using `cache.default_ttl_secs`.
  pub fn from_config(store: Arc<Store>, config: &Config) -> Self {
    Self::new(store).with_default_ttl(config.cache.default_ttl())
  }

  /// Set the TTL used when none is given.
  pub fn with_default_ttl(mut self, default_ttl: Duration) -> Self {
    self.default_ttl = default_ttl;
    self
  }

  /// Fetch with the default TTL.
  pub async fn fetch<T, F, Fut>(
    &self,
    key: &str,
    category: CacheCategory,
    fetcher: F,
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    self
      .fetch_with_ttl(key, category, self.default_ttl, fetcher)
      .await
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Check cache - if live, return immediately
  /// 2. If missing or expired, fetch from network
  /// 3. Store the fresh value for `ttl`
  ///
  /// Fetch errors are returned as-is; nothing is cached for them.
  pub async fn fetch_with_ttl<T, F, Fut>(
    &self,
    key: &str,
    category: CacheCategory,
    ttl: Duration,
    fetcher: F,
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    // Check cache first
    if let Some(entry) = self.store.cache_entry(key)? {
      match serde_json::from_value::<T>(entry.value) {
        Ok(data) => return Ok(CacheResult::from_cache(data, entry.cached_at)),
        Err(e) => {
          // Shape changed since it was cached; refetch and overwrite
          warn!(key, error = %e, "discarding undecodable cache entry");
        }
      }
    }

    let data = fetcher().await?;
    let value = serde_json::to_value(&data)?;
    self.store.cache_put(key, category, &value, ttl)?;
    Ok(CacheResult::from_network(data))
  }

  /// Drop a cached key, e.g. after a local mutation made it stale.
  pub fn invalidate(&self, key: &str) -> Result<bool> {
    Ok(self.store.cache_remove(key)?)
  }
}
