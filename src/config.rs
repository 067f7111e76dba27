//! Configuration for stevedore

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default directory for run artifacts and resume files
pub fn default_output_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stevedore")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the resource store API
    #[serde(default = "default_store_url")]
    pub store_url: String,

    /// Base URL for asset ingest, when it is a separate service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_url: Option<String>,

    /// Bearer token for authenticated stores
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// How many times idempotent GETs are retried (writes never are)
    #[serde(default = "default_get_retries")]
    pub get_retries: u32,

    /// Directory run artifacts are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Base directory for relative bitstream paths
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets_dir: Option<PathBuf>,

    /// Capture per-step timing rows
    #[serde(default)]
    pub save_timings: bool,
}

fn default_store_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_get_retries() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_url: default_store_url(),
            asset_url: None,
            token: None,
            timeout_secs: 60,
            get_retries: 3,
            output_dir: default_output_dir(),
            assets_dir: None,
            save_timings: false,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stevedore")
            .join("config.toml")
    }

    /// Base URL asset uploads go to
    pub fn asset_base(&self) -> &str {
        self.asset_url.as_deref().unwrap_or(&self.store_url)
    }

    /// Short host label used to tag artifact file names
    pub fn server_label(&self) -> String {
        url::Url::parse(&self.store_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "store".to_string())
    }
}
