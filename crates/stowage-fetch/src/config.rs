//! Acquisition settings
//!
//! Stored in `~/.config/stowage/config.yaml`. Every field has a default, so a
//! missing file is equivalent to an empty one.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FetchError, Result};

/// Acquisition configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchConfig {
    /// API version
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Root of the package cache (defaults to the platform cache directory)
    #[serde(default)]
    pub cache_root: Option<PathBuf>,

    /// Download attempts per package
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed wait between attempts
    #[serde(default = "default_backoff", with = "humantime_serde")]
    pub backoff: Duration,

    /// Per-request HTTP timeout
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub http_timeout: Duration,

    /// User-Agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Hand registry credentials to the container engine through the
    /// encrypted credential helper instead of its own config file
    #[serde(default = "default_true")]
    pub use_credential_helper: bool,

    /// Container engine executable
    #[serde(default = "default_docker_executable")]
    pub docker_executable: String,

    /// Override for the ECR API endpoint (testing, private endpoints)
    #[serde(default)]
    pub ecr_endpoint: Option<String>,
}

fn default_api_version() -> String {
    "stowage.io/v1".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(100)
}

fn default_user_agent() -> String {
    format!("stowage/{}", env!("CARGO_PKG_VERSION"))
}

fn default_true() -> bool {
    true
}

fn default_docker_executable() -> String {
    "docker".to_string()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            cache_root: None,
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
            http_timeout: default_http_timeout(),
            user_agent: default_user_agent(),
            use_credential_helper: true,
            docker_executable: default_docker_executable(),
            ecr_endpoint: None,
        }
    }
}

impl FetchConfig {
    /// Load configuration from default location
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        if config.max_attempts == 0 {
            return Err(FetchError::InvalidConfig {
                message: "maxAttempts must be at least 1".to_string(),
            });
        }
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get default configuration path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| FetchError::InvalidConfig {
            message: "Could not determine config directory".to_string(),
        })?;
        Ok(config_dir.join("stowage").join("config.yaml"))
    }

    /// Resolved cache root
    pub fn cache_root(&self) -> Result<PathBuf> {
        if let Some(root) = &self.cache_root {
            return Ok(root.clone());
        }
        let cache_dir = dirs::cache_dir().ok_or_else(|| FetchError::InvalidConfig {
            message: "Could not determine cache directory".to_string(),
        })?;
        Ok(cache_dir.join("stowage").join("packages"))
    }
}
