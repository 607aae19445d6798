use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL relative endpoints are resolved against (e.g. "https://shop.example.com")
  pub base_url: Option<String>,
  /// SQLite file holding the queue and cache (defaults to the user data dir)
  pub database_path: Option<PathBuf>,
  /// Extra headers sent with every replayed request
  pub headers: BTreeMap<String, String>,
  /// Directory for daily-rolling log files; logs go to stderr when unset
  pub log_dir: Option<PathBuf>,
  pub sync: SyncConfig,
  pub status: StatusConfig,
  pub cache: CacheConfig,
  pub connectivity: ConnectivityConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Attempts per intent before it is moved to the dead letters
  pub max_retries: u32,
  pub interval_secs: u64,
  pub request_timeout_secs: u64,
  /// Delay between an enqueue and the pass it triggers
  pub nudge_delay_ms: u64,
  pub max_queue_len: usize,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      interval_secs: 30,
      request_timeout_secs: 10,
      nudge_delay_ms: 500,
      max_queue_len: crate::store::DEFAULT_MAX_QUEUE_LEN,
    }
  }
}

impl SyncConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn nudge_delay(&self) -> Duration {
    Duration::from_millis(self.nudge_delay_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
  pub refresh_secs: u64,
}

impl Default for StatusConfig {
  fn default() -> Self {
    Self { refresh_secs: 5 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub default_ttl_secs: u64,
  pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_secs: crate::cache::DEFAULT_TTL.as_secs(),
      sweep_interval_secs: 60,
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.default_ttl_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// URL probed with HEAD requests; without it the client is assumed online
  pub probe_url: Option<String>,
  pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      probe_interval_secs: 15,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shopsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shopsync/config.yaml
  ///
  /// Without an explicit path, a missing file yields the defaults.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shopsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shopsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.base_url()?;
    if let Some(probe) = &self.connectivity.probe_url {
      Url::parse(probe).map_err(|e| eyre!("Invalid connectivity.probe_url {}: {}", probe, e))?;
    }
    if self.sync.max_retries == 0 {
      return Err(eyre!("sync.max_retries must be at least 1"));
    }
    let periods = [
      ("sync.request_timeout_secs", self.sync.request_timeout_secs),
      ("sync.interval_secs", self.sync.interval_secs),
      ("status.refresh_secs", self.status.refresh_secs),
      ("cache.sweep_interval_secs", self.cache.sweep_interval_secs),
      ("connectivity.probe_interval_secs", self.connectivity.probe_interval_secs),
    ];
    for (name, secs) in periods {
      if secs == 0 {
        return Err(eyre!("{} must be at least 1", name));
      }
    }
    Ok(())
  }

  /// Parsed `base_url`, if configured.
  pub fn base_url(&self) -> Result<Option<Url>> {
    self
      .base_url
      .as_deref()
      .map(|raw| Url::parse(raw).map_err(|e| eyre!("Invalid base_url {}: {}", raw, e)))
      .transpose()
  }

  /// Database location: configured path or `<data dir>/shopsync/offline.db`.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database_path {
      Some(path) => Ok(path.clone()),
      None => crate::db::Database::default_path().map_err(|e| eyre!("{}", e)),
    }
  }

  /// Bearer token for replayed requests.
  ///
  /// Checks SHOPSYNC_AUTH_TOKEN. The caller owns the session; this only
  /// forwards a token it has already obtained.
  pub fn auth_token() -> Option<String> {
    std::env::var("SHOPSYNC_AUTH_TOKEN")
      .ok()
      .filter(|token| !token.is_empty())
  }
}
