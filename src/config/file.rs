//! File-based configuration loading
//!
//! Loads the server section and the upstream channels from a JSON file

use crate::models::channel::Channel;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable pointing at an explicit config file
pub const CONFIG_ENV: &str = "AIRELAY_CONFIG";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen host (default: "127.0.0.1" - localhost only)
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port (default: 8082)
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8082
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Application configuration loaded from JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration (optional, defaults to localhost:8082)
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream channels, in priority tie-break order
    pub channels: Vec<Channel>,
}

impl AppConfig {
    /// Load configuration from JSON file
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration from: {:?}", path);

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_json(&content)?;
        debug!("Loaded {} channels", config.channels.len());
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_json(content: &str) -> Result<Self> {
        let config: AppConfig =
            serde_json::from_str(content).with_context(|| "Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Candidate config locations, in search order
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            if !explicit.trim().is_empty() {
                paths.push(PathBuf::from(explicit));
            }
        }
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("airelay").join("airelay.json"));
        }
        paths.push(PathBuf::from("airelay.json"));
        paths
    }

    /// Load configuration from default locations
    /// Searches in order:
    /// 1. $AIRELAY_CONFIG
    /// 2. ~/.config/airelay/airelay.json
    /// 3. ./airelay.json
    ///
    /// Returns error if no configuration file is found.
    pub fn load_default() -> Result<Self> {
        for path in Self::search_paths() {
            if path.exists() {
                return Self::load(&path);
            }
        }

        anyhow::bail!(
            "Configuration file not found. Please create one at:\n\
             - the path in ${}\n\
             - ~/.config/airelay/airelay.json (recommended)\n\
             - ./airelay.json (current directory)\n\
             \n\
             See airelay.example.json for reference.",
            CONFIG_ENV
        )
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            anyhow::bail!("At least one channel must be configured");
        }

        let mut ids = HashSet::new();
        for channel in &self.channels {
            if !ids.insert(channel.id) {
                anyhow::bail!("Duplicate channel id {}", channel.id);
            }

            let url = &channel.base_url;
            if !url.is_empty() && !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!(
                    "Invalid base URL for channel {} ({}): {}",
                    channel.id,
                    channel.name,
                    channel.base_url
                );
            }

            if channel.models.iter().any(|m| m.trim().is_empty()) {
                anyhow::bail!(
                    "Channel {} ({}) lists an empty model name",
                    channel.id,
                    channel.name
                );
            }

            for (origin, actual) in &channel.model_mapping {
                if origin.trim().is_empty() || actual.trim().is_empty() {
                    anyhow::bail!(
                        "Channel {} ({}) has an empty model mapping entry",
                        channel.id,
                        channel.name
                    );
                }
            }
        }

        Ok(())
    }

    /// Look up a channel by id
    pub fn channel(&self, id: u32) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }
}
