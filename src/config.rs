use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the worker is registered for (e.g. "https://app.example.com")
  pub origin: String,
  #[serde(default)]
  pub worker: WorkerConfig,
  /// Cache database location (defaults to $XDG_DATA_HOME/swcache/cache.db)
  pub database: Option<PathBuf>,
  #[serde(default)]
  pub http: HttpConfig,
}

/// Immutable worker configuration, one per cache generation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkerConfig {
  /// Cache generation tag. Bumping it drops every older cache on the next activate.
  #[serde(default = "default_version")]
  pub version: String,
  /// Paths that are always cached on install, in order
  #[serde(default = "default_core")]
  pub core: Vec<String>,
  /// Path prefix routed network-first
  #[serde(default = "default_api_prefix")]
  pub api_prefix: String,
  /// Cached path served when a network-first request fails
  #[serde(default = "default_offline_fallback")]
  pub offline_fallback: String,
  /// Request skip-waiting as soon as install completes
  #[serde(default = "default_true")]
  pub skip_waiting_on_install: bool,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      version: default_version(),
      core: default_core(),
      api_prefix: default_api_prefix(),
      offline_fallback: default_offline_fallback(),
      skip_waiting_on_install: true,
    }
  }
}

fn default_version() -> String {
  "v1".to_string()
}

fn default_core() -> Vec<String> {
  vec!["/".to_string(), "/api/health".to_string()]
}

fn default_api_prefix() -> String {
  "/api/".to_string()
}

fn default_offline_fallback() -> String {
  "/api/health".to_string()
}

fn default_true() -> bool {
  true
}

impl WorkerConfig {
  pub fn validate(&self) -> Result<()> {
    if self.version.trim().is_empty() {
      return Err(eyre!("worker.version must not be empty"));
    }
    if !self.api_prefix.starts_with('/') {
      return Err(eyre!(
        "worker.api_prefix must start with '/': {}",
        self.api_prefix
      ));
    }
    if !is_origin_path(&self.offline_fallback) {
      return Err(eyre!(
        "worker.offline_fallback must be a path on the origin: {}",
        self.offline_fallback
      ));
    }
    if let Some(bad) = self.core.iter().find(|p| !is_origin_path(p)) {
      return Err(eyre!("worker.core entries must be paths on the origin: {}", bad));
    }
    Ok(())
  }
}

/// `//host/x` would join as a protocol-relative URL on another host.
fn is_origin_path(path: &str) -> bool {
  path.starts_with('/') && !path.starts_with("//")
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
  #[serde(default = "default_user_agent")]
  pub user_agent: String,
  /// Overall request timeout; unset leaves it to the network stack
  pub timeout_secs: Option<u64>,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      user_agent: default_user_agent(),
      timeout_secs: None,
    }
  }
}

fn default_user_agent() -> String {
  concat!("swcache/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Config {
  /// Build a configuration with defaults for everything but the origin.
  pub fn with_origin(origin: impl Into<String>) -> Self {
    Self {
      origin: origin.into(),
      worker: WorkerConfig::default(),
      database: None,
      http: HttpConfig::default(),
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swcache/config.yaml
  ///
  /// An origin passed on the command line overrides the file, and is enough
  /// on its own when no file exists.
  pub fn load(explicit_path: Option<&Path>, origin: Option<String>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match (path, origin) {
      (Some(p), origin) => {
        let config = Self::load_from_path(&p)?;
        match origin {
          Some(origin) => Config { origin, ..config },
          None => config,
        }
      }
      (None, Some(origin)) => Self::with_origin(origin),
      (None, None) => {
        return Err(eyre!(
          "No configuration file found and no --origin given. \
           Create one at ~/.config/swcache/config.yaml"
        ))
      }
    };

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("swcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swcache").join("config.yaml");
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
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  pub fn validate(&self) -> Result<()> {
    self.origin_url()?;
    self.worker.validate()
  }

  /// The origin as a URL, restricted to http(s).
  pub fn origin_url(&self) -> Result<Url> {
    let url =
      Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;
    match url.scheme() {
      "http" | "https" => Ok(url),
      other => Err(eyre!("Origin must be http or https, got {}", other)),
    }
  }

  /// Where the cache database lives.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("swcache").join("cache.db"))
  }
}
