//! Baidu ERNIE adaptor
//!
//! Channel keys are `ak|sk` pairs that are exchanged for an OAuth access
//! token, cached in the shared [`TokenCache`]. Errors come back with a 200
//! status and an `error_code` field, and streams end on `is_end` instead of
//! a `[DONE]` marker.

use super::{
    decode, ensure_success, read_body, unsupported, Adaptor, HttpClients, KeyValidator,
    UpstreamBody,
};
use crate::models::channel::ModelConfig;
use crate::models::meta::Meta;
use crate::models::mode::Mode;
use crate::models::openai::{
    Delta, EmbeddingResponse, GeneralOpenAIRequest, Message, RelayRequest, StreamChunk,
    TextResponse, Usage, FINISH_LENGTH, FINISH_STOP, ROLE_ASSISTANT, ROLE_SYSTEM,
};
use crate::services::stream::{normalize_stream, Framing, StreamStep};
use crate::services::usage::{resolve_input_usage, resolve_usage};
use crate::services::writer::RelayWriter;
use crate::utils::error::{AppError, AppResult};
use crate::utils::token_cache::{TokenCache, TokenGrant};
use async_trait::async_trait;
use axum::http::StatusCode;
use once_cell::sync::Lazy;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

const TOKEN_REFRESH_WINDOW_SECS: i64 = 3600;
const SAMPLING_MIN: f64 = 0.01;
const SAMPLING_MAX: f64 = 0.99;

static MODEL_LIST: Lazy<Vec<ModelConfig>> = Lazy::new(|| {
    vec![
        ModelConfig::new("ERNIE-4.0-8K", Mode::ChatCompletions, "baidu")
            .price(0.03, 0.09)
            .context(8_192, 2_048),
        ModelConfig::new("ERNIE-3.5-8K", Mode::ChatCompletions, "baidu")
            .price(0.0008, 0.002)
            .context(8_192, 2_048),
        ModelConfig::new("ERNIE-Speed-8K", Mode::ChatCompletions, "baidu").context(8_192, 2_048),
        ModelConfig::new("ERNIE-Speed-128K", Mode::ChatCompletions, "baidu")
            .context(131_072, 4_096),
        ModelConfig::new("ERNIE-Lite-8K", Mode::ChatCompletions, "baidu").context(8_192, 2_048),
        ModelConfig::new("ERNIE-Tiny-8K", Mode::ChatCompletions, "baidu").context(8_192, 2_048),
        ModelConfig::new("Embedding-V1", Mode::Embeddings, "baidu")
            .price(0.0005, 0.0)
            .max_input(384),
        ModelConfig::new("bge-large-zh", Mode::Embeddings, "baidu")
            .price(0.0005, 0.0)
            .max_input(512),
        ModelConfig::new("bge-large-en", Mode::Embeddings, "baidu")
            .price(0.0005, 0.0)
            .max_input(512),
        ModelConfig::new("tao-8k", Mode::Embeddings, "baidu")
            .price(0.0005, 0.0)
            .max_input(8_192),
    ]
});

/// Endpoint segment for a model name
fn model_endpoint(model: &str) -> String {
    match model {
        "ERNIE-4.0-8K" => "completions_pro".to_string(),
        "ERNIE-3.5-8K" => "completions".to_string(),
        "ERNIE-Speed-8K" => "ernie_speed".to_string(),
        "ERNIE-Speed-128K" => "ernie-speed-128k".to_string(),
        "ERNIE-Lite-8K" => "ernie-lite-8k".to_string(),
        "ERNIE-Tiny-8K" => "ernie-tiny-8k".to_string(),
        "Embedding-V1" => "embedding-v1".to_string(),
        "bge-large-zh" => "bge_large_zh".to_string(),
        "bge-large-en" => "bge_large_en".to_string(),
        "tao-8k" => "tao_8k".to_string(),
        other => other.to_lowercase(),
    }
}

fn split_key(key: &str) -> AppResult<(&str, &str)> {
    match key.split_once('|') {
        Some((ak, sk)) if !ak.is_empty() && !sk.is_empty() && !sk.contains('|') => Ok((ak, sk)),
        _ => Err(AppError::Credential(
            "baidu key must be in the form 'api_key|secret_key'".to_string(),
        )),
    }
}

/// Cache identity for a channel's access token: the whole credential and the
/// endpoint it is exchanged at
fn token_cache_key(meta: &Meta) -> String {
    format!("baidu|{}|{}", meta.base_url(), meta.channel.key)
}

fn clamp_sampling(value: Option<f64>) -> Option<f64> {
    value.map(|v| v.clamp(SAMPLING_MIN, SAMPLING_MAX))
}

#[derive(Debug, Serialize)]
struct BaiduMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    messages: Vec<BaiduMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    penalty_score: Option<f64>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    input: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorFields {
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    error_msg: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    result: String,
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    is_end: bool,
    usage: Option<Usage>,
    #[serde(flatten)]
    error: ErrorFields,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponseBody {
    #[serde(default)]
    data: Vec<EmbeddingData>,
    usage: Option<Usage>,
    #[serde(flatten)]
    error: ErrorFields,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: i64,
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

fn convert_chat_request(request: &GeneralOpenAIRequest) -> AppResult<ChatRequest> {
    if request.tools.as_ref().is_some_and(|t| !t.is_empty()) {
        return Err(AppError::Conversion("baidu does not support tools".to_string()));
    }

    let mut system = Vec::new();
    let mut messages = Vec::new();
    for message in &request.messages {
        if message.content.as_ref().is_some_and(|c| c.has_images()) {
            return Err(AppError::Conversion("baidu does not support image input".to_string()));
        }
        if message.role == ROLE_SYSTEM {
            system.push(message.text());
        } else {
            messages.push(BaiduMessage {
                role: message.role.clone(),
                content: message.text(),
            });
        }
    }

    Ok(ChatRequest {
        messages,
        temperature: clamp_sampling(request.temperature),
        top_p: clamp_sampling(request.top_p),
        penalty_score: request.frequency_penalty,
        stream: request.stream,
        system: (!system.is_empty()).then(|| system.join("\n")),
        stop: request.stop_sequences(),
        max_output_tokens: request.output_limit(),
        user_id: request.user.clone(),
    })
}

fn finish_reason(truncated: bool) -> String {
    if truncated {
        FINISH_LENGTH.to_string()
    } else {
        FINISH_STOP.to_string()
    }
}

/// Map one `data:` record of a Baidu stream
fn map_stream_record(record: &str, created: i64) -> anyhow::Result<StreamStep> {
    let event: ChatResponse = serde_json::from_str(record)?;
    if event.error.error_code != 0 {
        warn!("Baidu stream error {}: {}", event.error.error_code, event.error.error_msg);
        return Ok(StreamStep::done());
    }

    let finish = event.is_end.then(|| finish_reason(event.is_truncated));
    let mut chunk =
        StreamChunk::new(event.id, "", created).with_delta(Delta::text(event.result), finish);
    let mut step = StreamStep::default();
    if let Some(usage) = event.usage.filter(|u| !u.is_empty()) {
        chunk = chunk.with_usage(usage);
        step = step.with_usage(usage);
    }
    step.chunk = Some(chunk);
    Ok(if event.is_end { step.with_done() } else { step })
}

/// Baidu adaptor
pub struct BaiduAdaptor {
    clients: HttpClients,
    tokens: Arc<TokenCache>,
}

impl BaiduAdaptor {
    pub fn new(clients: HttpClients, tokens: Arc<TokenCache>) -> Self {
        Self { clients, tokens }
    }

    fn check_mode(&self, mode: Mode) -> AppResult<()> {
        match mode {
            Mode::ChatCompletions | Mode::Embeddings => Ok(()),
            other => Err(unsupported(self.channel_name(), other)),
        }
    }

    /// Cached OAuth access token for the channel key
    async fn access_token(&self, meta: &Meta) -> AppResult<String> {
        let (ak, sk) = split_key(&meta.channel.key)?;
        let url = format!(
            "{}/oauth/2.0/token?grant_type=client_credentials&client_id={}&client_secret={}",
            meta.base_url(),
            urlencoding::encode(ak),
            urlencoding::encode(sk)
        );
        let client = self.clients.client.clone();
        let window = chrono::Duration::seconds(TOKEN_REFRESH_WINDOW_SECS);
        let issued_at = self.tokens.now();

        self.tokens
            .get_or_refresh(&token_cache_key(meta), window, move || {
                fetch_access_token(client, url, issued_at)
            })
            .await
    }

    /// Turn an `error_code` body into an error, dropping the cached token on auth failures
    fn body_error(&self, meta: &Meta, error: &ErrorFields) -> AppError {
        match error.error_code {
            110 | 111 => {
                self.tokens.invalidate(&token_cache_key(meta));
                AppError::Credential(format!("baidu access token rejected: {}", error.error_msg))
            }
            code => AppError::Upstream {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: error.error_msg.clone(),
                error_type: "baidu_error".to_string(),
                code: Some(code.into()),
            },
        }
    }

    async fn chat_response(
        &self,
        meta: &Meta,
        response: Response,
        writer: &RelayWriter,
    ) -> AppResult<Usage> {
        let body: ChatResponse = decode(&read_body(response).await?)?;
        if body.error.error_code != 0 {
            return Err(self.body_error(meta, &body.error));
        }

        let usage = resolve_usage(body.usage, &body.result, meta);
        let id = if body.id.is_empty() {
            format!("chatcmpl-{}", meta.request_id)
        } else {
            body.id.clone()
        };
        let converted = TextResponse::single(
            id,
            meta.origin_model.clone(),
            Message::new(ROLE_ASSISTANT, body.result.clone()),
            Some(finish_reason(body.is_truncated)),
            usage,
        );
        writer.write_json(StatusCode::OK, &converted).await?;
        Ok(usage)
    }

    async fn stream_response(
        &self,
        meta: &Meta,
        response: Response,
        writer: &RelayWriter,
    ) -> AppResult<Usage> {
        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if !is_event_stream {
            // errors on a streaming call arrive as a plain JSON body
            let body: ChatResponse = decode(&read_body(response).await?)?;
            return Err(self.body_error(meta, &body.error));
        }

        let created = chrono::Utc::now().timestamp();
        normalize_stream(meta, response, Framing::Sse, writer, |record| {
            map_stream_record(record, created)
        })
        .await
    }

    async fn embedding_response(
        &self,
        meta: &Meta,
        response: Response,
        writer: &RelayWriter,
    ) -> AppResult<Usage> {
        let body: EmbeddingResponseBody = decode(&read_body(response).await?)?;
        if body.error.error_code != 0 {
            return Err(self.body_error(meta, &body.error));
        }

        let usage = resolve_input_usage(body.usage, meta);
        let vectors = body.data.into_iter().map(|d| d.embedding).collect();
        let converted = EmbeddingResponse::new(meta.origin_model.clone(), vectors, usage);
        writer.write_json(StatusCode::OK, &converted).await?;
        Ok(usage)
    }
}

async fn fetch_access_token(
    client: Client,
    url: String,
    issued_at: chrono::DateTime<chrono::Utc>,
) -> AppResult<TokenGrant> {
    debug!("Requesting baidu access token");
    let response = ensure_success(client.post(&url).send().await?).await?;
    let body: TokenResponse = decode(&read_body(response).await?)?;

    if !body.error.is_empty() || body.access_token.is_empty() {
        return Err(AppError::Credential(format!(
            "baidu token exchange failed: {} {}",
            body.error, body.error_description
        )));
    }

    info!("Obtained baidu access token valid for {}s", body.expires_in);
    Ok(TokenGrant::expiring_in(body.access_token, issued_at, body.expires_in))
}

impl KeyValidator for BaiduAdaptor {
    fn validate_key(&self, key: &str) -> AppResult<()> {
        split_key(key).map(|_| ())
    }
}

#[async_trait]
impl Adaptor for BaiduAdaptor {
    fn channel_name(&self) -> &'static str {
        "baidu"
    }

    fn default_base_url(&self) -> &'static str {
        "https://aip.baidubce.com"
    }

    fn model_list(&self) -> &[ModelConfig] {
        &MODEL_LIST
    }

    fn http_clients(&self) -> &HttpClients {
        &self.clients
    }

    async fn get_request_url(&self, meta: &Meta) -> AppResult<String> {
        self.check_mode(meta.mode)?;
        let kind = if meta.mode == Mode::Embeddings { "embeddings" } else { "chat" };
        let token = self.access_token(meta).await?;
        Ok(format!(
            "{}/rpc/2.0/ai_custom/v1/wenxinworkshop/{}/{}?access_token={}",
            meta.base_url(),
            kind,
            model_endpoint(&meta.actual_model),
            urlencoding::encode(&token)
        ))
    }

    async fn setup_request_header(
        &self,
        _meta: &Meta,
        builder: RequestBuilder,
    ) -> AppResult<RequestBuilder> {
        Ok(builder)
    }

    fn convert_request(&self, meta: &Meta, request: &RelayRequest) -> AppResult<UpstreamBody> {
        self.check_mode(meta.mode)?;
        let RelayRequest::General(general) = request else {
            return Err(unsupported(self.channel_name(), meta.mode));
        };

        let body = match meta.mode {
            Mode::Embeddings => serde_json::to_value(EmbeddingRequest {
                input: general.input_texts(),
            })?,
            _ => serde_json::to_value(convert_chat_request(general)?)?,
        };
        Ok(UpstreamBody::Json(body))
    }

    async fn do_response(
        &self,
        meta: &Meta,
        response: Response,
        writer: &RelayWriter,
    ) -> AppResult<Usage> {
        self.check_mode(meta.mode)?;
        let response = ensure_success(response).await?;

        match meta.mode {
            Mode::Embeddings => self.embedding_response(meta, response, writer).await,
            _ if meta.is_stream => self.stream_response(meta, response, writer).await,
            _ => self.chat_response(meta, response, writer).await,
        }
    }

    fn key_validator(&self) -> Option<&dyn KeyValidator> {
        Some(self)
    }
}
