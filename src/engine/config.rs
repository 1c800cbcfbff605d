//! LiveBundle Configuration Module
//! Handles loading and validating livebundle.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::error::UpdateError;
use super::updater::{
    BundleCache, BundleFlavor, BundleVerifier, CoordinatorOptions, Platform, RetentionPolicy,
    StorageClient, StorageLocation,
};

pub const CONFIG_FILE: &str = "livebundle.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Update(#[from] UpdateError),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Update(e) => e.code(),
            _ => "ConfigError",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub dev_menu: DevMenuConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub url: String,
    /// Appended to every URL, typically a SAS token query string
    #[serde(default)]
    pub url_suffix: Option<String>,
    pub package_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Defaults to the platform data directory
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_max_versions")]
    pub max_versions: usize,
    #[serde(default)]
    pub max_bytes: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_versions: default_max_versions(),
            max_bytes: None,
        }
    }
}

/// When a freshly activated bundle starts running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationPolicy {
    /// Reload the engine right after activation
    Immediate,
    /// Keep running the current bundle until the next launch
    #[default]
    OnNextLaunch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default)]
    pub check_on_startup: bool,
    #[serde(default)]
    pub activation: ActivationPolicy,
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub flavor: BundleFlavor,
    #[serde(default = "default_max_failed_launches")]
    pub max_failed_launches: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Hex-encoded ed25519 key; metadata must be signed when set
    #[serde(default)]
    pub public_key: Option<String>,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            check_on_startup: false,
            activation: ActivationPolicy::default(),
            platform: None,
            flavor: BundleFlavor::default(),
            max_failed_launches: default_max_failed_launches(),
            connect_timeout_ms: default_connect_timeout_ms(),
            public_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevMenuConfig {
    #[serde(default = "default_dev_menu_enabled")]
    pub enabled: bool,
    #[serde(default = "default_dev_menu_title")]
    pub title: String,
}

impl Default for DevMenuConfig {
    fn default() -> Self {
        Self {
            enabled: default_dev_menu_enabled(),
            title: default_dev_menu_title(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

fn default_max_versions() -> usize {
    RetentionPolicy::default().max_versions
}

fn default_max_failed_launches() -> u32 {
    3
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_dev_menu_enabled() -> bool {
    cfg!(debug_assertions)
}

fn default_dev_menu_title() -> String {
    "LiveBundle".to_string()
}

fn default_port() -> u16 {
    54322
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Config {
    pub fn load(project_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = project_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, project_dir: &Path) -> Result<(), ConfigError> {
        let config_path = project_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn default_for_location(url: &str, url_suffix: Option<&str>, package_id: &str) -> Self {
        Self {
            storage: StorageConfig {
                url: url.to_string(),
                url_suffix: url_suffix.map(str::to_string),
                package_id: package_id.to_string(),
            },
            cache: CacheConfig::default(),
            update: UpdateConfig::default(),
            dev_menu: DevMenuConfig::default(),
            api: ApiConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage_location()?;
        if self.storage.package_id.trim().is_empty() {
            return Err(ConfigError::Invalid("storage.package_id is empty".to_string()));
        }
        if self.cache.max_versions == 0 {
            return Err(ConfigError::Invalid("cache.max_versions must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn storage_location(&self) -> Result<StorageLocation, ConfigError> {
        Ok(StorageLocation::new(
            &self.storage.url,
            self.storage.url_suffix.as_deref(),
        )?)
    }

    /// Configured cache directory, or `{data dir}/livebundle/{package}`
    pub fn cache_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.cache.dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| ConfigError::Invalid("no local data directory on this platform".to_string()))?;
        Ok(data_dir.join("livebundle").join(&self.storage.package_id))
    }

    pub fn open_cache(&self) -> Result<BundleCache, ConfigError> {
        let cache = BundleCache::open(&self.cache_dir()?)?.with_max_bytes(self.cache.max_bytes);
        Ok(cache)
    }

    pub fn storage_client(&self) -> Result<StorageClient, ConfigError> {
        let verifier = match &self.update.public_key {
            Some(key) => BundleVerifier::with_public_key_hex(key)?,
            None => BundleVerifier::new(),
        };
        let client = StorageClient::new(self.storage_location()?, &self.storage.package_id)?
            .with_connect_timeout(Duration::from_millis(self.update.connect_timeout_ms))?
            .with_selection(
                self.update.platform.unwrap_or_else(Platform::current),
                self.update.flavor,
            )
            .with_verifier(verifier);
        Ok(client)
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            retention: RetentionPolicy {
                max_versions: self.cache.max_versions,
            },
            max_failed_launches: self.update.max_failed_launches,
        }
    }
}
