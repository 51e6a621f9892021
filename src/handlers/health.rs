//! Health check handlers
//!
//! Provides application health status check endpoints

use crate::handlers::AppState;
use axum::{extract::State, http::StatusCode, response::Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const SERVICE_NAME: &str = "airelay";

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service name
    pub service: String,
    /// Version information
    pub version: String,
    /// Timestamp
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HealthDetails>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthDetails {
    /// Enabled channels out of the configured ones
    pub channels: String,
    /// Models reachable through enabled channels
    pub models: usize,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<MemoryUsage>,
}

/// Memory usage information
#[derive(Debug, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Resident memory in bytes
    pub used_bytes: u64,
    /// Virtual memory in bytes
    pub total_bytes: u64,
    pub usage_percent: f64,
}

fn details(state: &AppState) -> HealthDetails {
    let channels = state.relay.channels();
    let enabled = channels.iter().filter(|c| c.is_enabled()).count();
    HealthDetails {
        channels: format!("{}/{} enabled", enabled, channels.len()),
        models: state.relay.list_models().len(),
        uptime_seconds: get_uptime_seconds(),
        memory_usage: get_memory_usage(),
    }
}

fn response(status: &str, details: Option<HealthDetails>) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        details,
    }
}

/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    debug!("Executing health check");
    Json(response("healthy", Some(details(&state))))
}

/// Readiness check
///
/// GET /health/ready
/// Ready once at least one enabled channel serves a model
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<HealthResponse>, StatusCode> {
    debug!("Executing readiness check");

    let details = details(&state);
    if details.models == 0 {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(response("ready", Some(details))))
}

/// Liveness check
///
/// GET /health/live
/// Does not look at channels
pub async fn liveness_check() -> Json<HealthResponse> {
    debug!("Executing liveness check");
    Json(response("alive", None))
}

/// Get service uptime in seconds
pub fn get_uptime_seconds() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static START_TIME: OnceLock<Instant> = OnceLock::new();
    START_TIME.get_or_init(Instant::now).elapsed().as_secs()
}

/// Get memory usage information from /proc
#[cfg(target_os = "linux")]
fn get_memory_usage() -> Option<MemoryUsage> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let read_kb = |prefix: &str| {
        status
            .lines()
            .find(|line| line.starts_with(prefix))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
    };

    let used = read_kb("VmRSS:")?;
    let total = read_kb("VmSize:")?;
    let usage_percent = if total > 0 {
        (used as f64 / total as f64) * 100.0
    } else {
        0.0
    };

    Some(MemoryUsage {
        used_bytes: used,
        total_bytes: total,
        usage_percent,
    })
}

#[cfg(not(target_os = "linux"))]
fn get_memory_usage() -> Option<MemoryUsage> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptors::HttpClients;
    use crate::config::Settings;
    use crate::models::channel::{Channel, ChannelStatus, ChannelType};
    use crate::services::{AdaptorRegistry, Relay};
    use crate::utils::token_cache::TokenCache;

    fn create_test_state(channels: Vec<Channel>) -> Arc<AppState> {
        let registry = AdaptorRegistry::new(
            HttpClients::with_timeouts(5, 5).unwrap(),
            Arc::new(TokenCache::with_system_clock()),
        );
        Arc::new(AppState {
            settings: Settings::default(),
            relay: Arc::new(Relay::new(registry, channels).unwrap()),
        })
    }

    #[tokio::test]
    async fn test_health_check() {
        let state = create_test_state(vec![Channel::new(1, ChannelType::Moonshot, "sk")]);
        let response = health_check(State(state)).await.0;

        assert_eq!(response.status, "healthy");
        assert_eq!(response.service, "airelay");
        let details = response.details.unwrap();
        assert_eq!(details.channels, "1/1 enabled");
        assert!(details.models > 0);
    }

    #[tokio::test]
    async fn test_readiness_without_enabled_channels() {
        let mut channel = Channel::new(1, ChannelType::Moonshot, "sk");
        channel.status = ChannelStatus::Disabled;
        let state = create_test_state(vec![channel]);

        let result = readiness_check(State(state)).await;
        assert_eq!(result.unwrap_err(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_liveness_check() {
        let response = liveness_check().await.0;
        assert_eq!(response.status, "alive");
        assert!(response.details.is_none());
    }

    #[test]
    fn test_uptime_calculation() {
        let uptime1 = get_uptime_seconds();
        std::thread::sleep(std::time::Duration::from_millis(100));
        let uptime2 = get_uptime_seconds();
        assert!(uptime2 >= uptime1);
    }
}
