//! TTL-bounded read cache.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::time::Duration;

use super::Store;
use crate::clock::from_millis;
use crate::error::StorageResult;

text_enum! {
  /// What kind of data a cache entry holds. Informational only.
  pub enum CacheCategory as "cache category" {
    Product => "product",
    Page => "page",
    Category => "category",
    User => "user",
  }
}

/// A single cached value.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry {
  pub key: String,
  pub category: CacheCategory,
  pub value: Value,
  pub cached_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl CachedEntry {
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    now > self.expires_at
  }
}

fn ttl_millis(ttl: Duration) -> i64 {
  i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

impl Store {
  /// Store `value` under `key`, replacing any previous entry.
  pub fn cache_put(
    &self,
    key: &str,
    category: CacheCategory,
    value: &Value,
    ttl: Duration,
  ) -> StorageResult<()> {
    let cached_at = self.now_millis();
    let expires_at = cached_at.saturating_add(ttl_millis(ttl));
    let value = serde_json::to_string(value)?;

    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO cache_entries (key, category, value, cached_at, expires_at)
       VALUES (?, ?, ?, ?, ?)",
      params![key, category, value, cached_at, expires_at],
    )?;
    Ok(())
  }

  /// Look up a live entry. An expired entry is deleted and reported as a miss.
  pub fn cache_entry(&self, key: &str) -> StorageResult<Option<CachedEntry>> {
    let now = self.now_millis();
    let conn = self.lock()?;

    let row: Option<(CacheCategory, String, i64, i64)> = conn
      .query_row(
        "SELECT category, value, cached_at, expires_at FROM cache_entries WHERE key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    let Some((category, value, cached_at, expires_at)) = row else {
      return Ok(None);
    };

    if now > expires_at {
      // Only delete the row we looked at; a concurrent put may have replaced it
      conn.execute(
        "DELETE FROM cache_entries WHERE key = ? AND expires_at = ?",
        params![key, expires_at],
      )?;
      return Ok(None);
    }

    Ok(Some(CachedEntry {
      key: key.to_string(),
      category,
      value: serde_json::from_str(&value)?,
      cached_at: from_millis(cached_at),
      expires_at: from_millis(expires_at),
    }))
  }

  /// Value stored under `key`, or `None` on a miss or after expiry.
  pub fn cache_get(&self, key: &str) -> StorageResult<Option<Value>> {
    Ok(self.cache_entry(key)?.map(|entry| entry.value))
  }

  pub fn cache_remove(&self, key: &str) -> StorageResult<bool> {
    let conn = self.lock()?;
    Ok(conn.execute("DELETE FROM cache_entries WHERE key = ?", params![key])? > 0)
  }

  /// Delete every entry whose expiry has passed. Returns how many were removed.
  pub fn cache_sweep_expired(&self) -> StorageResult<usize> {
    let now = self.now_millis();
    let conn = self.lock()?;
    let swept = conn.execute(
      "DELETE FROM cache_entries WHERE expires_at < ?",
      params![now],
    )?;
    Ok(swept)
  }

  /// Keys currently stored, expired or not, in key order.
  pub fn cache_keys(&self) -> StorageResult<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT key FROM cache_entries ORDER BY key")?;
    let keys = stmt
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::test_support::store_at;
  use serde_json::json;

  #[test]
  fn test_cache_round_trip_and_expiry() {
    let (store, clock) = store_at(0);
    let value = json!({"name": "Teapot", "price": 1999});

    store
      .cache_put("p1", CacheCategory::Product, &value, Duration::from_millis(1000))
      .unwrap();
    assert_eq!(store.cache_get("p1").unwrap(), Some(value));

    // Still live exactly at expires_at
    clock.set_millis(1000);
    assert!(store.cache_get("p1").unwrap().is_some());

    clock.set_millis(1001);
    assert_eq!(store.cache_get("p1").unwrap(), None);
    assert!(store.cache_keys().unwrap().is_empty());
  }

  #[test]
  fn test_cache_put_replaces_entry() {
    let (store, clock) = store_at(0);
    store
      .cache_put("home", CacheCategory::Page, &json!("v1"), Duration::from_secs(1))
      .unwrap();
    clock.set_millis(500);
    store
      .cache_put("home", CacheCategory::Page, &json!("v2"), Duration::from_secs(1))
      .unwrap();

    clock.set_millis(1_200);
    let entry = store.cache_entry("home").unwrap().unwrap();
    assert_eq!(entry.value, json!("v2"));
    assert_eq!(entry.cached_at.timestamp_millis(), 500);
    assert_eq!(entry.expires_at.timestamp_millis(), 1_500);
    assert_eq!(store.cache_keys().unwrap(), vec!["home".to_string()]);
  }

  #[test]
  fn test_sweep_expired() {
    let (store, clock) = store_at(0);
    store
      .cache_put("short", CacheCategory::User, &json!(1), Duration::from_millis(10))
      .unwrap();
    store
      .cache_put("long", CacheCategory::Category, &json!(2), Duration::from_secs(60))
      .unwrap();

    clock.set_millis(100);
    assert_eq!(store.cache_sweep_expired().unwrap(), 1);
    assert_eq!(store.cache_keys().unwrap(), vec!["long".to_string()]);
  }

  #[test]
  fn test_cache_is_independent_of_queue() {
    let (store, _clock) = store_at(0);
    store
      .cache_put("p1", CacheCategory::Product, &json!(null), Duration::from_secs(5))
      .unwrap();
    assert_eq!(store.stats().unwrap().total, 0);
    assert!(store.cache_remove("p1").unwrap());
  }
}
