use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::RetryPolicy;

/// Upper bound for every duration given in seconds (one week).
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Seconds as a chrono duration, clamped to [`MAX_DURATION_SECS`].
fn chrono_secs(secs: u64) -> chrono::Duration {
  chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Root URL of the billing API
  pub url: String,
  /// Account email used when no identity session is supplied on the command line
  pub email: Option<String>,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// How long a read response may be served from cache
  pub ttl_secs: u64,
  /// Additional attempts after a transport failure or 5xx
  pub retries: u32,
  /// Wait between attempts
  pub backoff_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: 30,
      retries: 2,
      backoff_ms: 1000,
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> chrono::Duration {
    chrono_secs(self.ttl_secs)
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      retries: self.retries,
      backoff: Duration::from_millis(self.backoff_ms),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// A local edit younger than this beats the backend's pending list
  pub recency_window_secs: u64,
  /// Quiet period before a burst of refresh triggers runs
  pub debounce_ms: u64,
  /// Delays after a payment return at which the backend is re-read
  pub poll_delays_secs: Vec<u64>,
  /// Page size for paginated reads
  pub page_size: u32,
  /// Payment handoff records older than this are ignored
  pub handoff_ttl_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      recency_window_secs: 5,
      debounce_ms: 300,
      poll_delays_secs: vec![3, 5, 8],
      page_size: 100,
      handoff_ttl_secs: 15 * 60,
    }
  }
}

impl SyncConfig {
  pub fn recency_window(&self) -> chrono::Duration {
    chrono_secs(self.recency_window_secs)
  }

  pub fn handoff_ttl(&self) -> chrono::Duration {
    chrono_secs(self.handoff_ttl_secs)
  }
}

fn default_timeout_secs() -> u64 {
  15
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./billsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/billsync/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/billsync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("billsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("billsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.sync.poll_delays_secs.is_empty() {
      return Err(eyre!("sync.poll_delays_secs must list at least one delay"));
    }

    let mut bounded = vec![
      ("api.timeout_secs", self.api.timeout_secs),
      ("cache.ttl_secs", self.cache.ttl_secs),
      ("cache.backoff_ms", self.cache.backoff_ms / 1000),
      ("sync.recency_window_secs", self.sync.recency_window_secs),
      ("sync.debounce_ms", self.sync.debounce_ms / 1000),
      ("sync.handoff_ttl_secs", self.sync.handoff_ttl_secs),
    ];
    bounded.extend(self.sync.poll_delays_secs.iter().map(|d| ("sync.poll_delays_secs", *d)));

    for (name, secs) in bounded {
      if secs > MAX_DURATION_SECS {
        return Err(eyre!(
          "{} is out of range: at most {} seconds allowed",
          name,
          MAX_DURATION_SECS
        ));
      }
    }
    Ok(())
  }

  /// Get the billing API token from the environment.
  ///
  /// Checks BILLSYNC_API_TOKEN. The API may also be reachable without one.
  pub fn get_api_token() -> Option<String> {
    std::env::var("BILLSYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }

  #[cfg(test)]
  pub fn for_api(url: &str, email: &str) -> Self {
    Self {
      api: ApiConfig {
        url: url.to_string(),
        email: Some(email.to_string()),
        timeout_secs: default_timeout_secs(),
      },
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
    }
  }
}
