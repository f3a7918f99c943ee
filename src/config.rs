use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::Generation;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL relative request paths resolve against
  pub origin: String,
  pub cache: CacheConfig,
  pub routes: RoutesConfig,
  /// Endpoint workout logs are submitted to
  pub sync_endpoint: String,
  pub network: NetworkConfig,
  pub lifecycle: LifecycleConfig,
  /// Directory for cache.db, queue.db and logs (defaults to $XDG_DATA_HOME/paceline)
  pub data_dir: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://127.0.0.1:5000".to_string(),
      cache: CacheConfig::default(),
      routes: RoutesConfig::default(),
      sync_endpoint: "/api/sync-workout".to_string(),
      network: NetworkConfig::default(),
      lifecycle: LifecycleConfig::default(),
      data_dir: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Namespace name prefix, e.g. "stride" gives "stride-static-v1"
  pub prefix: String,
  /// Current cache generation; bump to invalidate every namespace on activate
  pub version: u32,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "stride".to_string(),
      version: 1,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// Exact paths precached on install and served cache-first
  pub static_assets: Vec<String>,
  pub api_prefixes: Vec<String>,
  /// Always served stale-while-revalidate
  pub weather_path: String,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      static_assets: [
        "/",
        "/offline",
        "/static/css/style.css",
        "/static/js/app.js",
        "/static/manifest.json",
        "/static/icons/icon-192.png",
        "/static/icons/icon-512.png",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      api_prefixes: vec!["/api/".to_string()],
      weather_path: "/api/weather".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 10 }
  }
}

impl NetworkConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
  /// Activate as soon as install finishes instead of waiting for old clients
  pub skip_waiting: bool,
  /// Take control of already-open clients on activation
  pub claim_clients: bool,
}

impl Default for LifecycleConfig {
  fn default() -> Self {
    Self {
      skip_waiting: true,
      claim_clients: true,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./paceline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/paceline/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("paceline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("paceline").join("config.yaml");
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
    if config.cache.prefix.is_empty() {
      return Err(eyre!("cache.prefix must not be empty"));
    }
    Ok(config)
  }

  /// The cache generation this process publishes.
  pub fn generation(&self) -> Generation {
    Generation::new(&self.cache.prefix, self.cache.version)
  }

  /// Directory holding the databases and log files.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("paceline"))
  }
}
