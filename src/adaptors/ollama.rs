//! Ollama adaptor
//!
//! Chat and embeddings against a local Ollama server. Streams are
//! newline-delimited JSON rather than server-sent events.

use super::{decode, ensure_success, read_body, unsupported, Adaptor, HttpClients, UpstreamBody};
use crate::models::channel::ModelConfig;
use crate::models::meta::Meta;
use crate::models::mode::Mode;
use crate::models::openai::{
    ContentPart, Delta, EmbeddingResponse, GeneralOpenAIRequest, Message, MessageContent,
    RelayRequest, StreamChunk, TextResponse, Tool, ToolCall, Usage, FINISH_STOP, FINISH_TOOL_CALLS,
    ROLE_ASSISTANT,
};
use crate::services::stream::{normalize_stream, Framing, StreamStep};
use crate::services::usage::{resolve_input_usage, resolve_usage};
use crate::services::writer::RelayWriter;
use crate::utils::error::{AppError, AppResult};
use crate::utils::image::{is_data_url, parse_data_url};
use async_trait::async_trait;
use axum::http::StatusCode;
use once_cell::sync::Lazy;
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

static MODEL_LIST: Lazy<Vec<ModelConfig>> = Lazy::new(|| {
    vec![
        ModelConfig::new("llama3.1:8b", Mode::ChatCompletions, "ollama")
            .context(131_072, 4_096)
            .tools(),
        ModelConfig::new("qwen2.5:7b", Mode::ChatCompletions, "ollama")
            .context(32_768, 8_192)
            .tools(),
        ModelConfig::new("llava:7b", Mode::ChatCompletions, "ollama")
            .context(4_096, 4_096)
            .vision(),
        ModelConfig::new("nomic-embed-text", Mode::Embeddings, "ollama").max_input(8_192),
    ]
});

#[derive(Debug, Default, Serialize)]
struct Options {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<Value>,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: Options,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Tool>>,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: ResponseMessage,
    #[serde(default)]
    done: bool,
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f64>>,
    #[serde(default)]
    prompt_eval_count: u32,
}

fn convert_message(message: &Message) -> AppResult<ChatMessage> {
    let mut content = String::new();
    let mut images = Vec::new();
    match &message.content {
        Some(MessageContent::Text(text)) => content.push_str(text),
        Some(MessageContent::Parts(parts)) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => content.push_str(text),
                    ContentPart::ImageUrl { image_url } if is_data_url(&image_url.url) => {
                        images.push(parse_data_url(&image_url.url)?.data);
                    }
                    ContentPart::ImageUrl { .. } => {
                        return Err(AppError::Conversion(
                            "ollama only accepts inline base64 images".to_string(),
                        ))
                    }
                }
            }
        }
        None => {}
    }

    let tool_calls = message
        .tool_calls
        .iter()
        .flatten()
        .map(|call| {
            let arguments: Value = if call.function.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&call.function.arguments).map_err(|e| {
                    AppError::Conversion(format!(
                        "tool call '{}' has invalid arguments: {}",
                        call.function.name, e
                    ))
                })?
            };
            Ok(json!({"function": {"name": call.function.name, "arguments": arguments}}))
        })
        .collect::<AppResult<Vec<_>>>()?;

    Ok(ChatMessage {
        role: message.role.clone(),
        content,
        images,
        tool_calls,
    })
}

fn convert_chat_request(request: &GeneralOpenAIRequest, model: &str) -> AppResult<ChatRequest> {
    let format = match &request.response_format {
        Some(format) if format.format_type == "json_object" => {
            Some(Value::String("json".to_string()))
        }
        Some(format) if format.format_type == "json_schema" => format
            .json_schema
            .as_ref()
            .and_then(|s| s.get("schema").cloned())
            .map(Some)
            .ok_or_else(|| {
                AppError::Conversion("json_schema response_format without schema".to_string())
            })?,
        _ => None,
    };

    Ok(ChatRequest {
        model: model.to_string(),
        messages: request.messages.iter().map(convert_message).collect::<AppResult<_>>()?,
        stream: request.stream,
        options: Options {
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            seed: request.seed,
            num_predict: request.output_limit(),
            stop: request.stop_sequences(),
            frequency_penalty: request.frequency_penalty,
            presence_penalty: request.presence_penalty,
        },
        format,
        tools: request.tools.clone().filter(|t| !t.is_empty()),
    })
}

fn tool_calls_of(message: &ResponseMessage, id_prefix: &str) -> Vec<ToolCall> {
    message
        .tool_calls
        .iter()
        .enumerate()
        .map(|(i, call)| {
            let mut converted = ToolCall::function(
                format!("{}_{}", id_prefix, i),
                call.function.name.clone(),
                call.function.arguments.to_string(),
            );
            converted.index = Some(i as u32);
            converted
        })
        .collect()
}

fn finish_reason(response: &ChatResponse) -> String {
    if !response.message.tool_calls.is_empty() {
        FINISH_TOOL_CALLS.to_string()
    } else {
        response.done_reason.clone().unwrap_or_else(|| FINISH_STOP.to_string())
    }
}

/// Map one NDJSON stream line
fn map_stream_line(record: &str, id: &str, created: i64) -> anyhow::Result<StreamStep> {
    let line: ChatResponse = serde_json::from_str(record)?;
    if let Some(error) = line.error {
        warn!("Ollama stream error: {}", error);
        return Ok(StreamStep::done());
    }

    let tool_calls = tool_calls_of(&line.message, &format!("call_{}", id));
    let delta = Delta {
        role: Some(ROLE_ASSISTANT.to_string()),
        content: Some(line.message.content.clone()),
        reasoning_content: line.message.thinking.clone().filter(|t| !t.is_empty()),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        ..Default::default()
    };

    if !line.done {
        return Ok(StreamStep::chunk(StreamChunk::new(id, "", created).with_delta(delta, None)));
    }

    let usage = Usage::new(line.prompt_eval_count, line.eval_count);
    let chunk = StreamChunk::new(id, "", created)
        .with_delta(delta, Some(finish_reason(&line)))
        .with_usage(usage);
    Ok(StreamStep::chunk(chunk).with_usage(usage).with_done())
}

pub struct OllamaAdaptor {
    clients: HttpClients,
}

impl OllamaAdaptor {
    pub fn new(clients: HttpClients) -> Self {
        Self { clients }
    }

    fn path(&self, mode: Mode) -> AppResult<&'static str> {
        match mode {
            Mode::ChatCompletions => Ok("/api/chat"),
            Mode::Embeddings => Ok("/api/embed"),
            other => Err(unsupported(self.channel_name(), other)),
        }
    }

    async fn chat_response(
        &self,
        meta: &Meta,
        response: Response,
        writer: &RelayWriter,
    ) -> AppResult<Usage> {
        let body: ChatResponse = decode(&read_body(response).await?)?;
        if let Some(error) = body.error {
            return Err(super::upstream_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": error}).to_string().as_bytes(),
            ));
        }

        let id = format!("chatcmpl-{}", meta.request_id);
        let tool_calls = tool_calls_of(&body.message, &format!("call_{}", meta.request_id));
        let usage = resolve_usage(
            Some(Usage::new(body.prompt_eval_count, body.eval_count)),
            &body.message.content,
            meta,
        );
        let message = Message {
            role: ROLE_ASSISTANT.to_string(),
            content: Some(MessageContent::Text(body.message.content.clone())),
            reasoning_content: body.message.thinking.clone().filter(|t| !t.is_empty()),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            ..Default::default()
        };
        let converted = TextResponse::single(
            id,
            meta.origin_model.clone(),
            message,
            Some(finish_reason(&body)),
            usage,
        );

        writer.write_json(StatusCode::OK, &converted).await?;
        Ok(usage)
    }

    async fn embed_response(
        &self,
        meta: &Meta,
        response: Response,
        writer: &RelayWriter,
    ) -> AppResult<Usage> {
        let body: EmbedResponse = decode(&read_body(response).await?)?;
        let reported = (body.prompt_eval_count > 0).then(|| Usage::new(body.prompt_eval_count, 0));
        let usage = resolve_input_usage(reported, meta);

        let converted = EmbeddingResponse::new(meta.origin_model.clone(), body.embeddings, usage);
        writer.write_json(StatusCode::OK, &converted).await?;
        Ok(usage)
    }
}

#[async_trait]
impl Adaptor for OllamaAdaptor {
    fn channel_name(&self) -> &'static str {
        "ollama"
    }

    fn default_base_url(&self) -> &'static str {
        "http://localhost:11434"
    }

    fn model_list(&self) -> &[ModelConfig] {
        &MODEL_LIST
    }

    fn http_clients(&self) -> &HttpClients {
        &self.clients
    }

    async fn get_request_url(&self, meta: &Meta) -> AppResult<String> {
        Ok(format!("{}{}", meta.base_url(), self.path(meta.mode)?))
    }

    async fn setup_request_header(
        &self,
        meta: &Meta,
        builder: RequestBuilder,
    ) -> AppResult<RequestBuilder> {
        if meta.channel.key.is_empty() {
            Ok(builder)
        } else {
            Ok(builder.bearer_auth(&meta.channel.key))
        }
    }

    fn convert_request(&self, meta: &Meta, request: &RelayRequest) -> AppResult<UpstreamBody> {
        self.path(meta.mode)?;
        let RelayRequest::General(general) = request else {
            return Err(unsupported(self.channel_name(), meta.mode));
        };

        let body = match meta.mode {
            Mode::Embeddings => serde_json::to_value(EmbedRequest {
                model: meta.actual_model.clone(),
                input: general.input_texts(),
            })?,
            _ => serde_json::to_value(convert_chat_request(general, &meta.actual_model)?)?,
        };
        Ok(UpstreamBody::Json(body))
    }

    async fn do_response(
        &self,
        meta: &Meta,
        response: Response,
        writer: &RelayWriter,
    ) -> AppResult<Usage> {
        self.path(meta.mode)?;
        let response = ensure_success(response).await?;

        match meta.mode {
            Mode::Embeddings => self.embed_response(meta, response, writer).await,
            _ if meta.is_stream => {
                let id = format!("chatcmpl-{}", meta.request_id);
                let created = chrono::Utc::now().timestamp();
                normalize_stream(meta, response, Framing::Lines, writer, |record| {
                    map_stream_line(record, &id, created)
                })
                .await
            }
            _ => self.chat_response(meta, response, writer).await,
        }
    }
}
