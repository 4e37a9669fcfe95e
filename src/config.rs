use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::Resource;

/// Environment variable consulted for the API token unless overridden
pub const DEFAULT_TOKEN_ENV: &str = "RESTQ_API_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  /// REST resources exposed through the cache
  #[serde(default)]
  pub resources: Vec<Resource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  /// Name of the environment variable holding a bearer token
  pub token_env: Option<String>,
}

impl ApiConfig {
  /// Bearer token from the environment, if one is set.
  pub fn api_token(&self) -> Option<String> {
    let var = self.token_env.as_deref().unwrap_or(DEFAULT_TOKEN_ENV);
    std::env::var(var).ok().filter(|t| !t.is_empty())
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Seconds an unused entry survives before eviction
  #[serde(default = "default_keep_unused_for_secs")]
  pub keep_unused_for_secs: u64,
  /// Let per-item tags on a collection invalidate the collection itself
  #[serde(default)]
  pub member_tags_invalidate_collections: bool,
}

fn default_keep_unused_for_secs() -> u64 {
  60
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      keep_unused_for_secs: default_keep_unused_for_secs(),
      member_tags_invalidate_collections: false,
    }
  }
}

impl CacheConfig {
  pub fn keep_unused_for(&self) -> Duration {
    Duration::from_secs(self.keep_unused_for_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./restq.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/restq/config.yaml
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
        "No configuration file found. Create one at ~/.config/restq/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("restq.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("restq").join("config.yaml");
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

  /// Look up a configured resource by name.
  pub fn resource(&self, name: &str) -> Result<&Resource> {
    self
      .resources
      .iter()
      .find(|r| r.name == name)
      .ok_or_else(|| eyre!("Unknown resource: {}", name))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SAMPLE: &str = r#"
api:
  base_url: https://example.com/api
  token_env: EXAMPLE_TOKEN
cache:
  keep_unused_for_secs: 5
resources:
  - name: users
    entity_type: User
    path: users
    paginated: true
    items_field: results
  - name: tags
    entity_type: Tag
    path: tags
"#;

  #[test]
  fn test_parse_sample() {
    let config = Config::from_yaml(SAMPLE).unwrap();
    assert_eq!(config.api.token_env.as_deref(), Some("EXAMPLE_TOKEN"));
    assert_eq!(config.cache.keep_unused_for(), Duration::from_secs(5));
    assert!(!config.cache.member_tags_invalidate_collections);

    let users = config.resource("users").unwrap();
    assert!(users.paginated);
    assert_eq!(users.items_field.as_deref(), Some("results"));
    assert_eq!(users.id_field, "id");
    assert!(!config.resource("tags").unwrap().paginated);
    assert!(config.resource("posts").is_err());
  }

  #[test]
  fn test_cache_defaults() {
    let config = Config::from_yaml("api:\n  base_url: http://localhost\n").unwrap();
    assert_eq!(config.cache.keep_unused_for_secs, 60);
    assert!(config.resources.is_empty());
  }
}
