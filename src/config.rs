use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub origin: OriginConfig,
  pub cache: CacheConfig,
  #[serde(default)]
  pub queue: QueueSettings,
  /// Override for the data directory (cache database, queue database, logs)
  pub data_dir: Option<PathBuf>,
  /// Title used for notifications (defaults to the origin host if not set)
  pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OriginConfig {
  /// Base URL of the single origin this worker serves
  pub url: String,
  /// Endpoint deferred writes are delivered to, relative to the origin
  #[serde(default = "default_write_endpoint")]
  pub write_endpoint: String,
  /// Upper bound on a single network fetch before it counts as failed
  #[serde(default = "default_fetch_timeout_ms")]
  pub fetch_timeout_ms: u64,
  /// Fetches slower than this are logged at WARN
  #[serde(default = "default_slow_fetch_warn_ms")]
  pub slow_fetch_warn_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Deployment version, stamped into generation names (e.g. "v1")
  pub version: String,
  /// Paths (or absolute URLs) installed into the static generation
  pub manifest: Vec<String>,
  /// Document served to navigation requests when the network is down
  #[serde(default = "default_offline_fallback")]
  pub offline_fallback: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
  /// Delivery attempts before a write is marked failed
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  /// Base delay for exponential backoff between attempts
  #[serde(default = "default_backoff_base_ms")]
  pub backoff_base_ms: u64,
  /// Upper bound on the backoff delay
  #[serde(default = "default_backoff_cap_ms")]
  pub backoff_cap_ms: u64,
  /// Tag used when registering for wake signals from the host
  #[serde(default = "default_wake_tag")]
  pub wake_tag: String,
}

impl Default for QueueSettings {
  fn default() -> Self {
    Self {
      max_attempts: default_max_attempts(),
      backoff_base_ms: default_backoff_base_ms(),
      backoff_cap_ms: default_backoff_cap_ms(),
      wake_tag: default_wake_tag(),
    }
  }
}

fn default_write_endpoint() -> String {
  "/api/submit-form".to_string()
}

fn default_fetch_timeout_ms() -> u64 {
  5_000
}

fn default_slow_fetch_warn_ms() -> u64 {
  1_000
}

fn default_offline_fallback() -> String {
  "/index.html".to_string()
}

fn default_max_attempts() -> u32 {
  5
}

fn default_backoff_base_ms() -> u64 {
  1_000
}

fn default_backoff_cap_ms() -> u64 {
  900_000
}

fn default_wake_tag() -> String {
  "deferred-writes".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./doorman.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/doorman/config.yaml
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
        "No configuration file found. Create one at ~/.config/doorman/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("doorman.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("doorman").join("config.yaml");
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

  /// Parse configuration from a YAML string.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Invalid configuration: {}", e))?;

    if config.cache.manifest.is_empty() {
      return Err(eyre!("cache.manifest must list at least one asset"));
    }

    Ok(config)
  }

  /// The origin base URL, validated.
  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin.url).map_err(|e| eyre!("Invalid origin url {}: {}", self.origin.url, e))
  }

  /// Resolve the data directory (cache database, queue database, logs).
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("doorman"))
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_millis(self.origin.fetch_timeout_ms)
  }

  pub fn slow_fetch_warn(&self) -> Duration {
    Duration::from_millis(self.origin.slow_fetch_warn_ms)
  }

  /// Title shown on notifications.
  pub fn notification_title(&self) -> String {
    if let Some(title) = &self.title {
      return title.clone();
    }

    self
      .origin_url()
      .ok()
      .and_then(|u| u.host_str().map(String::from))
      .unwrap_or_else(|| "doorman".to_string())
  }
}
