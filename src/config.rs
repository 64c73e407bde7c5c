use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hard ceiling for the periodic flush interval. The periodic timer is a
/// fallback for platforms without event-driven deferred execution, and a
/// longer interval than this would leave queued mutations undelivered for
/// too long after connectivity silently returns.
pub const MAX_POLL_INTERVAL_SECS: u64 = 900;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Base URL of the Dialtone backend (e.g. "https://notes.example.org")
  pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Storage ceiling for cached response snapshots, in bytes
  pub quota_bytes: u64,
  /// Fraction of the quota above which a cleanup pass runs
  pub cleanup_threshold: f64,
  /// Fraction of entries removed per namespace during a cleanup pass
  pub evict_fraction: f64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      quota_bytes: 50 * 1024 * 1024,
      cleanup_threshold: 0.8,
      evict_fraction: 0.25,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Maximum queued mutations; inserting past this evicts the oldest entry
  pub max_entries: usize,
  /// Replay attempts before an entry is marked failed
  pub max_attempts: u32,
  /// Retry delays in seconds; the last delay is reused for later attempts
  pub backoff_secs: Vec<u64>,
  /// Entries older than this are removed regardless of status
  pub max_age_days: i64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_entries: 100,
      max_attempts: 3,
      backoff_secs: vec![1, 5, 15],
      max_age_days: 7,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Periodic flush interval in seconds, used only when the platform offers
  /// no event-driven deferred execution. Clamped to MAX_POLL_INTERVAL_SECS.
  pub poll_interval_secs: u64,
  /// Whether the user granted permission for sync summary notifications
  pub notifications: bool,
  /// Application asset paths fetched into the cache at install time
  pub precache: Vec<String>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      poll_interval_secs: 60,
      notifications: false,
      precache: vec!["/".to_string(), "/manifest.json".to_string()],
    }
  }
}

impl SyncConfig {
  /// Effective poll interval with the documented ceiling applied.
  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval_secs.min(MAX_POLL_INTERVAL_SECS))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./dialtone-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/dialtone/offline.yaml
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
        "No configuration file found. Create one at ~/.config/dialtone/offline.yaml\n\
                 See offline.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("dialtone-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("dialtone").join("offline.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config: Config = serde_yaml::from_str("backend:\n  url: http://localhost:8000\n").unwrap();
    assert_eq!(config.queue.max_entries, 100);
    assert_eq!(config.queue.backoff_secs, vec![1, 5, 15]);
    assert_eq!(config.cache.cleanup_threshold, 0.8);
    assert!(!config.sync.notifications);
  }

  #[test]
  fn test_poll_interval_ceiling() {
    let sync = SyncConfig {
      poll_interval_secs: 86400,
      ..SyncConfig::default()
    };
    assert_eq!(
      sync.poll_interval(),
      Duration::from_secs(MAX_POLL_INTERVAL_SECS)
    );
  }
}
