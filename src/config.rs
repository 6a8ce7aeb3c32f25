use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use syncstore::remote::{PaginationPolicy, DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_PAGES};
use syncstore::FetcherConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub fetch: FetchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  /// Key holding the record array when responses are wrapped in an object
  pub envelope: Option<String>,
  /// Sent as `per_page` on the first request
  pub page_size: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Database file (defaults to the user data directory)
  pub path: Option<PathBuf>,
  /// Seconds before cached data is refetched
  pub ttl_secs: Option<u64>,
}

impl CacheConfig {
  pub fn ttl(&self) -> Option<Duration> {
    self.ttl_secs.map(Duration::from_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
  #[serde(default = "default_max_pages")]
  pub max_pages: usize,
  #[serde(default = "default_max_concurrent")]
  pub max_concurrent: usize,
  #[serde(default)]
  pub pagination: PaginationPolicy,
}

fn default_max_pages() -> usize {
  DEFAULT_MAX_PAGES
}

fn default_max_concurrent() -> usize {
  DEFAULT_MAX_CONCURRENT
}

impl Default for FetchConfig {
  fn default() -> Self {
    Self {
      max_pages: DEFAULT_MAX_PAGES,
      max_concurrent: DEFAULT_MAX_CONCURRENT,
      pagination: PaginationPolicy::default(),
    }
  }
}

impl From<&FetchConfig> for FetcherConfig {
  fn from(config: &FetchConfig) -> Self {
    FetcherConfig {
      max_pages: config.max_pages,
      max_concurrent: config.max_concurrent,
      pagination: config.pagination,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./syncstore.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/syncstore/config.yaml
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
        "No configuration file found. Create one at ~/.config/syncstore/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("syncstore.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("syncstore").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Get the API token from the environment, if one is set.
  ///
  /// Checks SYNCSTORE_API_TOKEN.
  pub fn api_token() -> Option<String> {
    std::env::var("SYNCSTORE_API_TOKEN").ok().filter(|t| !t.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("api:\n  base_url: https://school.example.com/api/v1/\n").unwrap();
    assert_eq!(config.fetch.max_pages, DEFAULT_MAX_PAGES);
    assert_eq!(config.fetch.pagination, PaginationPolicy::Accumulate);
    assert!(config.cache.path.is_none());
    assert!(config.cache.ttl().is_none());
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
api:
  base_url: https://school.example.com/api/v1/
  envelope: data
  page_size: 50
cache:
  path: /tmp/cache.db
  ttl_secs: 600
fetch:
  max_pages: 10
  max_concurrent: 2
  pagination: incremental
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.api.envelope.as_deref(), Some("data"));
    assert_eq!(config.cache.ttl(), Some(Duration::from_secs(600)));
    let fetcher = FetcherConfig::from(&config.fetch);
    assert_eq!(fetcher.max_concurrent, 2);
    assert_eq!(fetcher.pagination, PaginationPolicy::Incremental);
  }
}
