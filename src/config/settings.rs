//! Runtime settings from the environment
//!
//! Timeouts, limits, CORS and logging. The listen address and the channels
//! come from the JSON config file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment-driven settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Request configuration
    pub request: RequestConfig,
    /// Security configuration
    pub security: SecurityConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Request configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Maximum request size in bytes
    pub max_request_size: usize,
    /// Upstream timeout for non-streaming calls, in seconds
    pub timeout: u64,
    /// Upstream timeout for streaming calls, in seconds
    pub stream_timeout: u64,
    /// Capacity of the per-request frame channel
    pub stream_buffer: usize,
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Allowed origins for CORS
    pub allowed_origins: Vec<String>,
    /// Whether CORS is enabled
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (text/json)
    pub format: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            request: RequestConfig {
                max_request_size: 10 * 1024 * 1024,
                timeout: 60,
                stream_timeout: 600,
                stream_buffer: 64,
            },
            security: SecurityConfig {
                allowed_origins: vec!["*".to_string()],
                cors_enabled: true,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl Settings {
    /// Create a new configuration instance
    pub fn new() -> Result<Self> {
        // Load .env file if it exists
        dotenv::dotenv().ok();

        let settings = Self {
            request: RequestConfig {
                max_request_size: get_env_or_default("MAX_REQUEST_SIZE", "10485760")
                    .parse()
                    .context("Invalid maximum request size")?,
                timeout: get_env_or_default("REQUEST_TIMEOUT", "60")
                    .parse()
                    .context("Invalid request timeout")?,
                stream_timeout: get_env_or_default("STREAM_TIMEOUT", "600")
                    .parse()
                    .context("Invalid stream timeout")?,
                stream_buffer: get_env_or_default("STREAM_BUFFER", "64")
                    .parse()
                    .context("Invalid stream buffer size")?,
            },
            security: SecurityConfig {
                allowed_origins: get_env_or_default("ALLOWED_ORIGINS", "*")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                cors_enabled: get_env_or_default("CORS_ENABLED", "true")
                    .parse()
                    .context("Invalid CORS enabled flag")?,
            },
            logging: LoggingConfig {
                level: get_env_or_default("RUST_LOG", "info"),
                format: get_env_or_default("LOG_FORMAT", "text"),
            },
        };

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration validity
    pub fn validate(&self) -> Result<()> {
        if self.request.timeout == 0 || self.request.stream_timeout == 0 {
            anyhow::bail!("Timeout values cannot be 0");
        }

        if self.request.max_request_size == 0 {
            anyhow::bail!("Maximum request size cannot be 0");
        }

        if self.request.stream_buffer == 0 {
            anyhow::bail!("Stream buffer size cannot be 0");
        }

        // RUST_LOG may hold a full filter directive such as "airelay=debug"
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        let level = self.logging.level.as_str();
        if !level.contains('=') && !valid_levels.contains(&level) {
            anyhow::bail!("Invalid log level: {}", self.logging.level);
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            anyhow::bail!("Invalid log format: {}", self.logging.format);
        }

        Ok(())
    }
}

/// Get environment variable or default value
fn get_env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert!(settings.request.stream_timeout > settings.request.timeout);
    }

    #[test]
    fn test_validation_failures() {
        let mut settings = Settings::default();
        settings.request.timeout = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.logging.format = "xml".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.logging.level = "airelay=debug,tower_http=info".to_string();
        assert!(settings.validate().is_ok());
    }
}
