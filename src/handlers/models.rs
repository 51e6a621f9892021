//! Model listing handlers

use crate::handlers::AppState;
use crate::models::channel::ModelConfig;
use crate::utils::error::{AppError, AppResult};
use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::Serialize;
use std::sync::Arc;

/// One entry of `GET /v1/models`
#[derive(Debug, Serialize)]
pub struct ModelObject {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: String,
    /// Serving channel type
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ModelConfig>,
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelObject>,
}

/// GET /v1/models
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    let data = state
        .relay
        .list_models()
        .into_iter()
        .map(|entry| ModelObject {
            owned_by: entry
                .config
                .as_ref()
                .map(|c| c.owner.to_string())
                .unwrap_or_else(|| entry.channel.clone()),
            id: entry.id,
            object: "model",
            created: 0,
            channel: entry.channel,
            config: entry.config,
        })
        .collect();

    Json(ModelList { object: "list", data })
}

/// GET /v1/models/:model
pub async fn retrieve_model(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
) -> AppResult<Json<ModelObject>> {
    let Json(list) = list_models(State(state)).await;
    list.data
        .into_iter()
        .find(|m| m.id == model)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("model '{}' not found", model)))
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub channel_id: u32,
    pub balance: f64,
}

/// GET /v1/channels/:id/balance
pub async fn channel_balance(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<u32>,
) -> AppResult<Json<BalanceResponse>> {
    let balance = state.relay.channel_balance(channel_id).await?;
    Ok(Json(BalanceResponse { channel_id, balance }))
}
