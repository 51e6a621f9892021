//! HTTP handlers module
//!
//! Contains all HTTP endpoint handling logic

pub mod health;
pub mod models;
pub mod relay;

use crate::config::Settings;
use crate::middleware::request_logging_middleware;
use crate::services::Relay;
use crate::utils::error::AppError;
use axum::{
    http::{HeaderValue, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};
use tracing::warn;

/// Application state
pub struct AppState {
    pub settings: Settings,
    pub relay: Arc<Relay>,
}

/// Relay routes; the handler derives the mode from the path
const RELAY_ROUTES: [&str; 12] = [
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/embeddings",
    "/v1/engines/:model/embeddings",
    "/v1/moderations",
    "/v1/images/generations",
    "/v1/edits",
    "/v1/audio/speech",
    "/v1/audio/transcriptions",
    "/v1/audio/translations",
    "/v1/rerank",
    "/v1/parse/pdf",
];

/// Create application router
pub fn create_router(settings: Settings, relay: Arc<Relay>) -> Router {
    let body_limit = settings.request.max_request_size;
    let cors = cors_layer(&settings);

    let app_state = Arc::new(AppState { settings, relay });

    let mut router = RELAY_ROUTES
        .iter()
        .fold(Router::new(), |router, path| router.route(path, post(relay::relay_handler)))
        .route("/v1/models", get(models::list_models))
        .route("/v1/models/:model", get(models::retrieve_model))
        .route("/v1/channels/:id/balance", get(models::channel_balance))
        .route("/health", get(health::health_check))
        .route("/health/ready", get(health::readiness_check))
        .route("/health/live", get(health::liveness_check))
        .fallback(not_found)
        .with_state(app_state);

    if let Some(cors) = cors {
        router = router.layer(cors);
    }

    router.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(request_logging_middleware))
            .layer(RequestBodyLimitLayer::new(body_limit)),
    )
}

fn cors_layer(settings: &Settings) -> Option<CorsLayer> {
    if !settings.security.cors_enabled {
        return None;
    }

    let origins = &settings.security.allowed_origins;
    let allow_origin = if origins.is_empty() || origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let values: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring invalid CORS origin: {}", origin);
                    None
                }
            })
            .collect();
        AllowOrigin::list(values)
    };

    Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

async fn not_found(uri: Uri) -> Response {
    AppError::NotFound(format!("no route for {}", uri.path())).into_response()
}
