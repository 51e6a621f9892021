//! OpenAI adaptor
//!
//! The canonical schema is OpenAI's, so requests pass through with the model
//! replaced and responses are patched for usage and model name. The response
//! handlers here are reused by the OpenAI-compatible adaptors.

use super::{
    decode, ensure_success, read_body, unsupported, validate_bearer_key, Adaptor, Balancer,
    HttpClients, KeyValidator, UpstreamBody,
};
use crate::models::channel::{Channel, ModelConfig};
use crate::models::meta::Meta;
use crate::models::mode::Mode;
use crate::models::openai::{RelayRequest, StreamChunk, StreamOptions, Usage};
use crate::services::stream::{normalize_stream, Framing, StreamStep};
use crate::services::usage::{resolve_input_usage, resolve_usage};
use crate::services::writer::RelayWriter;
use crate::utils::error::{AppError, AppResult};
use crate::utils::think::{split_think, ThinkSplitter};
use crate::utils::tokenizer::count_text_tokens;
use async_trait::async_trait;
use axum::http::StatusCode;
use once_cell::sync::Lazy;
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

static MODEL_LIST: Lazy<Vec<ModelConfig>> = Lazy::new(|| {
    vec![
        ModelConfig::new("gpt-4o", Mode::ChatCompletions, "openai")
            .price(0.0025, 0.01)
            .context(128_000, 16_384)
            .vision()
            .tools(),
        ModelConfig::new("gpt-4o-mini", Mode::ChatCompletions, "openai")
            .price(0.00015, 0.0006)
            .context(128_000, 16_384)
            .vision()
            .tools(),
        ModelConfig::new("gpt-4.1", Mode::ChatCompletions, "openai")
            .price(0.002, 0.008)
            .context(1_047_576, 32_768)
            .vision()
            .tools(),
        ModelConfig::new("o3-mini", Mode::ChatCompletions, "openai")
            .price(0.0011, 0.0044)
            .context(200_000, 100_000)
            .tools(),
        ModelConfig::new("gpt-3.5-turbo-instruct", Mode::Completions, "openai")
            .price(0.0015, 0.002)
            .context(4_096, 4_096),
        ModelConfig::new("text-embedding-3-small", Mode::Embeddings, "openai")
            .price(0.00002, 0.0)
            .max_input(8_191),
        ModelConfig::new("text-embedding-3-large", Mode::Embeddings, "openai")
            .price(0.00013, 0.0)
            .max_input(8_191),
        ModelConfig::new("omni-moderation-latest", Mode::Moderations, "openai"),
        ModelConfig::new("text-davinci-edit-001", Mode::Edits, "openai").price(0.02, 0.02),
        ModelConfig::new("dall-e-2", Mode::ImagesGenerations, "openai").image_prices(&[
            ("256x256", 0.016),
            ("512x512", 0.018),
            ("1024x1024", 0.02),
        ]),
        ModelConfig::new("dall-e-3", Mode::ImagesGenerations, "openai").image_prices(&[
            ("1024x1024", 0.04),
            ("1024x1792", 0.08),
            ("1792x1024", 0.08),
        ]),
        ModelConfig::new("tts-1", Mode::AudioSpeech, "openai")
            .price(0.015, 0.0)
            .voices(&["alloy", "echo", "fable", "onyx", "nova", "shimmer"]),
        ModelConfig::new("tts-1-hd", Mode::AudioSpeech, "openai")
            .price(0.03, 0.0)
            .voices(&["alloy", "echo", "fable", "onyx", "nova", "shimmer"]),
        ModelConfig::new("whisper-1", Mode::AudioTranscription, "openai").price(0.006, 0.0),
    ]
});

/// Upstream path of each supported mode
pub(crate) fn request_path(mode: Mode) -> Option<&'static str> {
    match mode {
        Mode::ChatCompletions => Some("/v1/chat/completions"),
        Mode::Completions => Some("/v1/completions"),
        Mode::Embeddings => Some("/v1/embeddings"),
        Mode::Moderations => Some("/v1/moderations"),
        Mode::ImagesGenerations => Some("/v1/images/generations"),
        Mode::Edits => Some("/v1/edits"),
        Mode::AudioSpeech => Some("/v1/audio/speech"),
        Mode::AudioTranscription => Some("/v1/audio/transcriptions"),
        Mode::AudioTranslation => Some("/v1/audio/translations"),
        Mode::Rerank => Some("/v1/rerank"),
        Mode::ParsePdf | Mode::Unknown => None,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> AppResult<UpstreamBody> {
    Ok(UpstreamBody::Json(serde_json::to_value(value)?))
}

/// OpenAI-schema request body with the upstream model substituted
pub(crate) fn convert_openai_request(
    meta: &Meta,
    request: &RelayRequest,
) -> AppResult<UpstreamBody> {
    match request {
        RelayRequest::General(general) => {
            let mut general = general.clone();
            general.model = meta.actual_model.clone();
            if general.stream && meta.mode.supports_stream() {
                general.stream_options = Some(StreamOptions { include_usage: true });
            } else if !meta.mode.supports_stream() {
                general.stream = false;
                general.stream_options = None;
            }
            to_json(&general)
        }
        RelayRequest::Image(image) => {
            let mut image = image.clone();
            image.model = meta.actual_model.clone();
            to_json(&image)
        }
        RelayRequest::Speech(speech) => {
            let mut speech = speech.clone();
            speech.model = meta.actual_model.clone();
            to_json(&speech)
        }
        RelayRequest::Rerank(rerank) => {
            let mut rerank = rerank.clone();
            rerank.model = meta.actual_model.clone();
            to_json(&rerank)
        }
        RelayRequest::Transcription(upload) => {
            let mut part = Part::bytes(upload.file.to_vec()).file_name(upload.file_name.clone());
            if let Some(content_type) = &upload.content_type {
                part = part.mime_str(content_type).map_err(|e| {
                    AppError::Conversion(format!("invalid file content type: {}", e))
                })?;
            }
            let mut form = Form::new().text("model", meta.actual_model.clone()).part("file", part);
            if let Some(language) = &upload.language {
                form = form.text("language", language.clone());
            }
            if let Some(prompt) = &upload.prompt {
                form = form.text("prompt", prompt.clone());
            }
            if let Some(format) = &upload.response_format {
                form = form.text("response_format", format.clone());
            }
            if let Some(temperature) = upload.temperature {
                form = form.text("temperature", temperature.to_string());
            }
            Ok(UpstreamBody::Multipart(form))
        }
        RelayRequest::Document(_) => Err(unsupported("openai", meta.mode)),
    }
}

/// Error reported inside a successful response body
pub(crate) fn embedded_error(value: &Value) -> Option<AppError> {
    let error = value.get("error")?;
    let error_type = error.get("type").and_then(Value::as_str).filter(|t| !t.is_empty())?;
    Some(AppError::Upstream {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("upstream reported an error")
            .to_string(),
        error_type: error_type.to_string(),
        code: error.get("code").cloned(),
    })
}

fn completion_text(value: &Value) -> String {
    value
        .get("choices")
        .and_then(Value::as_array)
        .map(|choices| {
            choices
                .iter()
                .filter_map(|choice| {
                    choice
                        .pointer("/message/content")
                        .and_then(Value::as_str)
                        .or_else(|| choice.get("text").and_then(Value::as_str))
                })
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn reported_usage(value: &Value) -> Option<Usage> {
    value
        .get("usage")
        .filter(|u| !u.is_null())
        .and_then(|u| serde_json::from_value(u.clone()).ok())
}

fn has_reasoning(chunk: &StreamChunk) -> bool {
    chunk.choices.iter().any(|choice| {
        choice
            .delta
            .as_ref()
            .and_then(|d| d.reasoning_content.as_deref())
            .is_some_and(|r| !r.is_empty())
    })
}

/// Route the inline think block of a single-choice chunk to `reasoning_content`
fn split_think_delta(splitter: &mut ThinkSplitter, chunk: &mut StreamChunk) {
    let [choice] = chunk.choices.as_mut_slice() else {
        return;
    };
    let finished = choice.finish_reason.is_some();
    let Some(delta) = choice.delta.as_mut() else {
        return;
    };

    let had_content = delta.content.is_some();
    let (mut reasoning, mut content) =
        splitter.process(delta.content.as_deref().unwrap_or_default());
    if finished {
        let (rest_reasoning, rest_content) = splitter.finish();
        reasoning.push_str(&rest_reasoning);
        content.push_str(&rest_content);
    }

    delta.reasoning_content = (!reasoning.is_empty()).then_some(reasoning);
    delta.content = (had_content || !content.is_empty()).then_some(content);
}

/// Relay an OpenAI-compatible event stream
pub(crate) async fn stream_handler(
    meta: &Meta,
    response: Response,
    writer: &RelayWriter,
) -> AppResult<Usage> {
    let response = ensure_success(response).await?;
    let mut splitter = meta.channel.config.split_think.then(ThinkSplitter::new);
    normalize_stream(meta, response, Framing::Sse, writer, |record| {
        let mut chunk: StreamChunk = serde_json::from_str(record)?;
        // upstream already separates reasoning
        if has_reasoning(&chunk) {
            splitter = None;
        }
        if let Some(splitter) = splitter.as_mut() {
            split_think_delta(splitter, &mut chunk);
        }

        let usage = chunk.usage;
        let step = StreamStep::chunk(chunk);
        Ok(match usage {
            Some(usage) => step.with_usage(usage),
            None => step,
        })
    })
    .await
}

/// Move leading think blocks of every choice message into `reasoning_content`
fn split_think_messages(value: &mut Value) {
    let Some(choices) = value.get_mut("choices").and_then(Value::as_array_mut) else {
        return;
    };
    for message in choices.iter_mut().filter_map(|c| c.get_mut("message")) {
        let has_reasoning = message
            .get("reasoning_content")
            .and_then(Value::as_str)
            .is_some_and(|r| !r.is_empty());
        let Some(text) = message.get("content").and_then(Value::as_str) else {
            continue;
        };
        if has_reasoning {
            continue;
        }
        let (reasoning, content) = split_think(text);
        if let Some(message) = message.as_object_mut() {
            message.insert("reasoning_content".to_string(), Value::String(reasoning));
            message.insert("content".to_string(), Value::String(content));
        }
    }
}

/// Relay an OpenAI-compatible chat or completion body
pub(crate) async fn text_handler(
    meta: &Meta,
    response: Response,
    writer: &RelayWriter,
) -> AppResult<Usage> {
    let response = ensure_success(response).await?;
    let body = read_body(response).await?;
    let mut value: Value = decode(&body)?;
    if let Some(error) = embedded_error(&value) {
        return Err(error);
    }

    let usage = resolve_usage(reported_usage(&value), &completion_text(&value), meta);
    if meta.channel.config.split_think {
        split_think_messages(&mut value);
    }
    if let Some(object) = value.as_object_mut() {
        object.insert("usage".to_string(), serde_json::to_value(usage)?);
        object.insert("model".to_string(), Value::String(meta.origin_model.clone()));
    }

    writer.write_json(StatusCode::OK, &value).await?;
    Ok(usage)
}

/// Relay embeddings, moderations and rerank bodies as they are
pub(crate) async fn passthrough_handler(
    meta: &Meta,
    response: Response,
    writer: &RelayWriter,
) -> AppResult<Usage> {
    let response = ensure_success(response).await?;
    let body = read_body(response).await?;
    let mut value: Value = decode(&body)?;
    if let Some(error) = embedded_error(&value) {
        return Err(error);
    }

    let usage = resolve_input_usage(reported_usage(&value), meta);
    if let Some(object) = value.as_object_mut() {
        if object.contains_key("model") {
            object.insert("model".to_string(), Value::String(meta.origin_model.clone()));
        }
        if object.contains_key("usage") {
            object.insert("usage".to_string(), serde_json::to_value(usage)?);
        }
    }

    writer.write_json(StatusCode::OK, &value).await?;
    Ok(usage)
}

#[derive(Deserialize)]
struct ImageUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

async fn image_handler(response: Response, writer: &RelayWriter) -> AppResult<Usage> {
    let response = ensure_success(response).await?;
    let body = read_body(response).await?;
    let value: Value = decode(&body)?;
    if let Some(error) = embedded_error(&value) {
        return Err(error);
    }

    let usage = match value
        .get("usage")
        .and_then(|u| serde_json::from_value::<ImageUsage>(u.clone()).ok())
    {
        Some(usage) if usage.input_tokens.saturating_add(usage.output_tokens) > 0 => {
            Usage::new(usage.input_tokens, usage.output_tokens)
        }
        _ => {
            let images = value.get("data").and_then(Value::as_array).map_or(0, Vec::len);
            Usage::substitute(images as u32)
        }
    };

    writer.write_json(StatusCode::OK, &value).await?;
    Ok(usage)
}

fn content_type_of(response: &Response, default: &str) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(default)
        .to_string()
}

async fn speech_handler(response: Response, writer: &RelayWriter) -> AppResult<Usage> {
    let response = ensure_success(response).await?;
    let content_type = content_type_of(&response, "audio/mpeg");
    let audio = read_body(response).await?;
    let usage = Usage::substitute(audio.len() as u32);

    writer.write_bytes(StatusCode::OK, &content_type, audio).await?;
    Ok(usage)
}

async fn transcription_handler(
    meta: &Meta,
    response: Response,
    writer: &RelayWriter,
) -> AppResult<Usage> {
    let response = ensure_success(response).await?;
    let content_type = content_type_of(&response, "application/json");
    let body = read_body(response).await?;

    let text = if content_type.starts_with("application/json") {
        let value: Value = decode(&body)?;
        if let Some(error) = embedded_error(&value) {
            return Err(error);
        }
        value.get("text").and_then(Value::as_str).unwrap_or_default().to_string()
    } else {
        String::from_utf8_lossy(&body).to_string()
    };
    let usage = Usage::new(meta.input_tokens, count_text_tokens(&text, &meta.actual_model));

    writer.write_bytes(StatusCode::OK, &content_type, body).await?;
    Ok(usage)
}

/// OpenAI adaptor
pub struct OpenAIAdaptor {
    clients: HttpClients,
}

impl OpenAIAdaptor {
    pub fn new(clients: HttpClients) -> Self {
        Self { clients }
    }
}

impl KeyValidator for OpenAIAdaptor {
    fn validate_key(&self, key: &str) -> AppResult<()> {
        validate_bearer_key(key)
    }
}

#[derive(Deserialize)]
struct CreditGrants {
    total_available: f64,
}

#[async_trait]
impl Balancer for OpenAIAdaptor {
    async fn get_balance(&self, channel: &Channel) -> AppResult<f64> {
        let url = format!("{}/dashboard/billing/credit_grants", channel.base_url());
        let response = self.clients.client.get(&url).bearer_auth(&channel.key).send().await?;
        let response = ensure_success(response).await?;
        let grants: CreditGrants = decode(&read_body(response).await?)?;
        debug!("Channel {} balance: {}", channel.id, grants.total_available);
        Ok(grants.total_available)
    }
}

#[async_trait]
impl Adaptor for OpenAIAdaptor {
    fn channel_name(&self) -> &'static str {
        "openai"
    }

    fn default_base_url(&self) -> &'static str {
        "https://api.openai.com"
    }

    fn model_list(&self) -> &[ModelConfig] {
        &MODEL_LIST
    }

    fn http_clients(&self) -> &HttpClients {
        &self.clients
    }

    async fn get_request_url(&self, meta: &Meta) -> AppResult<String> {
        let path = request_path(meta.mode)
            .ok_or_else(|| unsupported(self.channel_name(), meta.mode))?;
        Ok(format!("{}{}", meta.base_url(), path))
    }

    async fn setup_request_header(
        &self,
        meta: &Meta,
        builder: RequestBuilder,
    ) -> AppResult<RequestBuilder> {
        let builder = builder.bearer_auth(&meta.channel.key);
        Ok(if meta.is_stream {
            builder.header("Accept", "text/event-stream")
        } else {
            builder
        })
    }

    fn convert_request(&self, meta: &Meta, request: &RelayRequest) -> AppResult<UpstreamBody> {
        if request_path(meta.mode).is_none() {
            return Err(unsupported(self.channel_name(), meta.mode));
        }
        convert_openai_request(meta, request)
    }

    async fn do_response(
        &self,
        meta: &Meta,
        response: Response,
        writer: &RelayWriter,
    ) -> AppResult<Usage> {
        match meta.mode {
            Mode::ChatCompletions | Mode::Completions if meta.is_stream => {
                stream_handler(meta, response, writer).await
            }
            Mode::ChatCompletions | Mode::Completions | Mode::Edits => {
                text_handler(meta, response, writer).await
            }
            Mode::Embeddings | Mode::Moderations | Mode::Rerank => {
                passthrough_handler(meta, response, writer).await
            }
            Mode::ImagesGenerations => image_handler(response, writer).await,
            Mode::AudioSpeech => speech_handler(response, writer).await,
            Mode::AudioTranscription | Mode::AudioTranslation => {
                transcription_handler(meta, response, writer).await
            }
            Mode::ParsePdf | Mode::Unknown => Err(unsupported(self.channel_name(), meta.mode)),
        }
    }

    fn key_validator(&self) -> Option<&dyn KeyValidator> {
        Some(self)
    }

    fn balancer(&self) -> Option<&dyn Balancer> {
        Some(self)
    }
}
