use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::validate::WhitelistRule;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Payload rules the server is known to enforce
  #[serde(default)]
  pub validation: Vec<WhitelistRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  /// Transport timeout; a timed-out request counts as a network failure
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
  /// SQLite file (defaults to $XDG_DATA_HOME/optisync/sync.db)
  pub path: Option<PathBuf>,
  #[serde(default = "default_prefix")]
  pub prefix: String,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      path: None,
      prefix: default_prefix(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Failed replays before an operation is abandoned
  pub max_attempts: u32,
  /// Backoff unit: retry after `backoff_base_secs * 2^attempts`
  pub backoff_base_secs: u64,
  pub temp_id_prefix: String,
  /// Snapshot fields that hold record lists
  pub list_fields: Vec<String>,
  /// Cache key of the user's profile snapshot
  pub profile_cache_key: Option<String>,
  /// Profile fields copied into records created offline
  pub profile_fields: Vec<String>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      backoff_base_secs: 1,
      temp_id_prefix: "local-".to_string(),
      list_fields: vec!["items".to_string(), "pending".to_string(), "all".to_string()],
      profile_cache_key: Some("profile".to_string()),
      profile_fields: vec!["currency".to_string()],
    }
  }
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_prefix() -> String {
  "optisync".to_string()
}

impl Config {
  /// Config pointing at `base_url` with every other setting defaulted.
  pub fn with_base_url(base_url: impl Into<String>) -> Self {
    Self {
      api: ApiConfig {
        base_url: base_url.into(),
        timeout_secs: default_timeout_secs(),
      },
      storage: StorageConfig::default(),
      sync: SyncConfig::default(),
      validation: Vec::new(),
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./optisync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/optisync/config.yaml
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
        "No configuration file found. Create one at ~/.config/optisync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("optisync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("optisync").join("config.yaml");
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

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;

    if config.sync.max_attempts == 0 {
      return Err(eyre!("sync.max_attempts must be at least 1"));
    }
    url::Url::parse(&config.api.base_url)
      .map_err(|e| eyre!("api.base_url is not a valid URL: {}", e))?;

    Ok(config)
  }

  /// Get the API token from the environment, if one is set.
  ///
  /// Checks OPTISYNC_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("OPTISYNC_API_TOKEN").ok()
  }

  /// Get the acting user's identity from the environment, if one is set.
  ///
  /// Checks OPTISYNC_USER.
  pub fn get_identity() -> Option<String> {
    std::env::var("OPTISYNC_USER").ok()
  }
}
