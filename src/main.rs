//! airelay server
//!
//! OpenAI-compatible relay in front of the upstream channels listed in the
//! JSON configuration

use airelay::utils::tokenizer;
use airelay::{create_router, AdaptorRegistry, AppConfig, HttpClients, Relay, Settings, TokenCache};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Environment settings first, they carry the log level and format
    let settings = Settings::new().context("Failed to load server settings")?;
    init_logging(&settings.logging.level, &settings.logging.format)?;
    info!("{}", airelay::version_info());

    let app_config = AppConfig::load_default().context("Failed to load channel configuration")?;
    info!("📁 {} channels configured", app_config.channels.len());

    let clients =
        HttpClients::with_timeouts(settings.request.timeout, settings.request.stream_timeout)?;
    let tokens = Arc::new(TokenCache::with_system_clock());
    let registry = AdaptorRegistry::new(clients, tokens);
    let relay = Relay::new(registry, app_config.channels.clone())
        .context("Invalid channel configuration")?;

    // Loading the BPE tables takes a moment; do it before the first request
    tokenizer::preload();

    let app = create_router(settings, Arc::new(relay));

    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("🚀 airelay listening on http://{}", addr);
    info!("📝 Health check: http://{}/health", addr);
    info!("🔄 Relay endpoint: http://{}/v1/chat/completions", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}

/// Initialize logging system
fn init_logging(level: &str, format: &str) -> Result<()> {
    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if format == "json" {
        Box::new(
            tracing_subscriber::fmt()
                .with_env_filter(level)
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .finish(),
        )
    } else {
        Box::new(
            tracing_subscriber::fmt()
                .with_env_filter(level)
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .finish(),
        )
    };

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
