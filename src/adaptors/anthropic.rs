//! Anthropic adaptor
//!
//! Converts chat completions to the Messages API and maps its typed stream
//! events back into chat completion chunks.

use super::{decode, ensure_success, read_body, unsupported, Adaptor, HttpClients, UpstreamBody};
use crate::models::channel::ModelConfig;
use crate::models::meta::Meta;
use crate::models::mode::Mode;
use crate::models::openai::{
    ContentPart, Delta, FunctionCall, GeneralOpenAIRequest, Message, MessageContent, RelayRequest,
    StreamChunk, TextResponse, ToolCall, Usage, FINISH_LENGTH, FINISH_STOP, FINISH_TOOL_CALLS,
    ROLE_ASSISTANT, ROLE_SYSTEM, ROLE_TOOL, ROLE_USER,
};
use crate::services::stream::{normalize_stream, Framing, StreamStep};
use crate::services::usage::resolve_usage;
use crate::services::writer::RelayWriter;
use crate::utils::error::{AppError, AppResult};
use crate::utils::image::{is_data_url, parse_data_url};
use async_trait::async_trait;
use axum::http::StatusCode;
use once_cell::sync::Lazy;
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

const DEFAULT_API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: i64 = 4096;

static MODEL_LIST: Lazy<Vec<ModelConfig>> = Lazy::new(|| {
    vec![
        ModelConfig::new("claude-3-5-haiku-20241022", Mode::ChatCompletions, "anthropic")
            .price(0.0008, 0.004)
            .context(200_000, 8_192)
            .vision()
            .tools(),
        ModelConfig::new("claude-3-7-sonnet-20250219", Mode::ChatCompletions, "anthropic")
            .price(0.003, 0.015)
            .context(200_000, 64_000)
            .vision()
            .tools(),
        ModelConfig::new("claude-sonnet-4-20250514", Mode::ChatCompletions, "anthropic")
            .price(0.003, 0.015)
            .context(200_000, 64_000)
            .vision()
            .tools(),
        ModelConfig::new("claude-opus-4-20250514", Mode::ChatCompletions, "anthropic")
            .price(0.015, 0.075)
            .context(200_000, 32_000)
            .vision()
            .tools(),
    ]
});

/// Messages API request
#[derive(Debug, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub max_tokens: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

/// Request content block
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Serialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Response content block
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    Thinking { thinking: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    cache_creation_input_tokens: u32,
    #[serde(default)]
    cache_read_input_tokens: u32,
}

impl AnthropicUsage {
    fn prompt_tokens(&self) -> u32 {
        self.input_tokens
            .saturating_add(self.cache_creation_input_tokens)
            .saturating_add(self.cache_read_input_tokens)
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: String,
    #[serde(default)]
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    id: String,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

/// Messages API stream event
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart { message: StreamMessage },
    ContentBlockStart { content_block: ResponseBlock },
    ContentBlockDelta { delta: StreamDelta },
    ContentBlockStop,
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: AnthropicUsage,
    },
    MessageStop,
    Ping,
    Error { error: StreamError },
    #[serde(other)]
    Other,
}

/// Map a Messages API stop reason to a chat finish reason
pub fn stop_reason_to_finish_reason(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" => FINISH_STOP.to_string(),
        "max_tokens" => FINISH_LENGTH.to_string(),
        "tool_use" => FINISH_TOOL_CALLS.to_string(),
        other => other.to_string(),
    }
}

fn image_block(url: &str) -> AppResult<ContentBlock> {
    if is_data_url(url) {
        let image = parse_data_url(url)?;
        Ok(ContentBlock::Image {
            source: ImageSource::Base64 {
                media_type: image.mime_type,
                data: image.data,
            },
        })
    } else {
        Ok(ContentBlock::Image {
            source: ImageSource::Url { url: url.to_string() },
        })
    }
}

fn content_blocks(content: &MessageContent) -> AppResult<Vec<ContentBlock>> {
    match content {
        MessageContent::Text(text) if text.is_empty() => Ok(Vec::new()),
        MessageContent::Text(text) => Ok(vec![ContentBlock::Text { text: text.clone() }]),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter(|part| !matches!(part, ContentPart::Text { text } if text.is_empty()))
            .map(|part| match part {
                ContentPart::Text { text } => Ok(ContentBlock::Text { text: text.clone() }),
                ContentPart::ImageUrl { image_url } => image_block(&image_url.url),
            })
            .collect(),
    }
}

fn message_blocks(message: &Message) -> AppResult<Vec<ContentBlock>> {
    if message.role == ROLE_TOOL {
        let tool_use_id = message
            .tool_call_id
            .clone()
            .ok_or_else(|| AppError::Conversion("tool message without tool_call_id".to_string()))?;
        return Ok(vec![ContentBlock::ToolResult {
            tool_use_id,
            content: message.text(),
        }]);
    }

    let mut blocks = match &message.content {
        Some(content) => content_blocks(content)?,
        None => Vec::new(),
    };
    for call in message.tool_calls.iter().flatten() {
        let input = if call.function.arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&call.function.arguments).map_err(|e| {
                AppError::Conversion(format!(
                    "tool call '{}' has invalid arguments: {}",
                    call.function.name, e
                ))
            })?
        };
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.function.name.clone(),
            input,
        });
    }
    Ok(blocks)
}

fn convert_tool_choice(choice: &Value) -> AppResult<Value> {
    match choice {
        Value::String(mode) => match mode.as_str() {
            "auto" => Ok(json!({"type": "auto"})),
            "none" => Ok(json!({"type": "none"})),
            "required" => Ok(json!({"type": "any"})),
            other => Err(AppError::Conversion(format!("unsupported tool_choice '{}'", other))),
        },
        Value::Object(_) => choice
            .pointer("/function/name")
            .and_then(Value::as_str)
            .map(|name| json!({"type": "tool", "name": name}))
            .ok_or_else(|| AppError::Conversion("tool_choice must name a function".to_string())),
        _ => Err(AppError::Conversion("unsupported tool_choice".to_string())),
    }
}

/// Convert a chat request to a Messages API request
pub fn convert_chat_request(
    request: &GeneralOpenAIRequest,
    model: &str,
) -> AppResult<MessagesRequest> {
    if request.n.is_some_and(|n| n > 1) {
        return Err(AppError::Conversion("n > 1 is not supported".to_string()));
    }
    if let Some(format) = &request.response_format {
        if format.format_type != "text" {
            return Err(AppError::Conversion(format!(
                "response_format '{}' is not supported",
                format.format_type
            )));
        }
    }

    let mut system = Vec::new();
    let mut messages: Vec<AnthropicMessage> = Vec::new();
    for message in &request.messages {
        if message.role == ROLE_SYSTEM {
            let text = message.text();
            if !text.is_empty() {
                system.push(text);
            }
            continue;
        }

        let role = if message.role == ROLE_ASSISTANT { ROLE_ASSISTANT } else { ROLE_USER };
        let blocks = message_blocks(message)?;
        if blocks.is_empty() {
            continue;
        }
        match messages.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => messages.push(AnthropicMessage {
                role: role.to_string(),
                content: blocks,
            }),
        }
    }
    if messages.is_empty() {
        return Err(AppError::Conversion(
            "at least one user or assistant message is required".to_string(),
        ));
    }

    let tools = request.tools.as_ref().filter(|t| !t.is_empty()).map(|tools| {
        tools
            .iter()
            .map(|tool| AnthropicTool {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                input_schema: tool
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            })
            .collect()
    });

    Ok(MessagesRequest {
        model: model.to_string(),
        messages,
        system: (!system.is_empty()).then(|| system.join("\n")),
        max_tokens: request.output_limit().filter(|m| *m > 0).unwrap_or(DEFAULT_MAX_TOKENS),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        stop_sequences: request.stop_sequences(),
        stream: request.stream,
        tools,
        tool_choice: request.tool_choice.as_ref().map(convert_tool_choice).transpose()?,
    })
}

fn response_to_openai(response: MessagesResponse, meta: &Meta) -> TextResponse {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for block in response.content {
        match block {
            ResponseBlock::Text { text: t } => text.push_str(&t),
            ResponseBlock::Thinking { thinking } => reasoning.push_str(&thinking),
            ResponseBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall::function(id, name, input.to_string()))
            }
            ResponseBlock::Other => {}
        }
    }

    let usage = resolve_usage(
        Some(Usage::new(response.usage.prompt_tokens(), response.usage.output_tokens)),
        &text,
        meta,
    );
    let message = Message {
        role: ROLE_ASSISTANT.to_string(),
        content: Some(MessageContent::Text(text)),
        reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        ..Default::default()
    };

    TextResponse::single(
        response.id,
        meta.origin_model.clone(),
        message,
        response.stop_reason.as_deref().map(stop_reason_to_finish_reason),
        usage,
    )
}

/// Per-stream mapping state
#[derive(Debug)]
pub struct StreamMapper {
    id: String,
    created: i64,
    tool_index: Option<u32>,
    prompt_tokens: u32,
}

impl StreamMapper {
    pub fn new() -> Self {
        Self {
            id: String::new(),
            created: chrono::Utc::now().timestamp(),
            tool_index: None,
            prompt_tokens: 0,
        }
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<String>) -> StreamChunk {
        StreamChunk::new(self.id.clone(), "", self.created).with_delta(delta, finish_reason)
    }

    /// Map one `data:` payload
    pub fn map(&mut self, record: &str) -> anyhow::Result<StreamStep> {
        let event: StreamEvent = serde_json::from_str(record)?;
        let step = match event {
            StreamEvent::MessageStart { message } => {
                self.id = message.id;
                self.prompt_tokens = message.usage.prompt_tokens();
                let delta = Delta {
                    role: Some(ROLE_ASSISTANT.to_string()),
                    content: Some(String::new()),
                    ..Default::default()
                };
                StreamStep::chunk(self.chunk(delta, None)).with_usage(Usage {
                    prompt_tokens: self.prompt_tokens,
                    completion_tokens: message.usage.output_tokens,
                    total_tokens: 0,
                })
            }
            StreamEvent::ContentBlockStart { content_block } => match content_block {
                ResponseBlock::ToolUse { id, name, .. } => {
                    let index = self.tool_index.map_or(0, |i| i + 1);
                    self.tool_index = Some(index);
                    let mut call = ToolCall::function(id, name, "");
                    call.index = Some(index);
                    let delta = Delta {
                        tool_calls: Some(vec![call]),
                        ..Default::default()
                    };
                    StreamStep::chunk(self.chunk(delta, None))
                }
                ResponseBlock::Text { text } if !text.is_empty() => {
                    StreamStep::chunk(self.chunk(Delta::text(text), None))
                }
                _ => StreamStep::skip(),
            },
            StreamEvent::ContentBlockDelta { delta } => match delta {
                StreamDelta::TextDelta { text } => {
                    StreamStep::chunk(self.chunk(Delta::text(text), None))
                }
                StreamDelta::ThinkingDelta { thinking } => {
                    let delta = Delta {
                        reasoning_content: Some(thinking),
                        ..Default::default()
                    };
                    StreamStep::chunk(self.chunk(delta, None))
                }
                StreamDelta::InputJsonDelta { partial_json } => {
                    let call = ToolCall {
                        index: Some(self.tool_index.unwrap_or(0)),
                        function: FunctionCall {
                            name: String::new(),
                            arguments: partial_json,
                        },
                        ..Default::default()
                    };
                    let delta = Delta {
                        tool_calls: Some(vec![call]),
                        ..Default::default()
                    };
                    StreamStep::chunk(self.chunk(delta, None))
                }
                StreamDelta::Other => StreamStep::skip(),
            },
            StreamEvent::MessageDelta { delta, usage } => {
                if usage.prompt_tokens() > 0 {
                    self.prompt_tokens = usage.prompt_tokens();
                }
                let usage = Usage::new(self.prompt_tokens, usage.output_tokens);
                let finish = delta.stop_reason.as_deref().map(stop_reason_to_finish_reason);
                let chunk = self.chunk(Delta::default(), finish).with_usage(usage);
                StreamStep::chunk(chunk).with_usage(usage)
            }
            StreamEvent::MessageStop => StreamStep::done(),
            StreamEvent::Error { error } => {
                warn!("Anthropic stream error {}: {}", error.error_type, error.message);
                StreamStep::done()
            }
            StreamEvent::ContentBlockStop | StreamEvent::Ping | StreamEvent::Other => {
                StreamStep::skip()
            }
        };
        Ok(step)
    }
}

impl Default for StreamMapper {
    fn default() -> Self {
        Self::new()
    }
}

/// Anthropic adaptor
pub struct AnthropicAdaptor {
    clients: HttpClients,
}

impl AnthropicAdaptor {
    pub fn new(clients: HttpClients) -> Self {
        Self { clients }
    }

    fn check_mode(&self, mode: Mode) -> AppResult<()> {
        if mode == Mode::ChatCompletions {
            Ok(())
        } else {
            Err(unsupported(self.channel_name(), mode))
        }
    }
}

#[async_trait]
impl Adaptor for AnthropicAdaptor {
    fn channel_name(&self) -> &'static str {
        "anthropic"
    }

    fn default_base_url(&self) -> &'static str {
        "https://api.anthropic.com"
    }

    fn model_list(&self) -> &[ModelConfig] {
        &MODEL_LIST
    }

    fn http_clients(&self) -> &HttpClients {
        &self.clients
    }

    async fn get_request_url(&self, meta: &Meta) -> AppResult<String> {
        self.check_mode(meta.mode)?;
        Ok(format!("{}/v1/messages", meta.base_url()))
    }

    async fn setup_request_header(
        &self,
        meta: &Meta,
        builder: RequestBuilder,
    ) -> AppResult<RequestBuilder> {
        Ok(builder
            .header("x-api-key", &meta.channel.key)
            .header("anthropic-version", meta.api_version(DEFAULT_API_VERSION)))
    }

    fn convert_request(&self, meta: &Meta, request: &RelayRequest) -> AppResult<UpstreamBody> {
        self.check_mode(meta.mode)?;
        let RelayRequest::General(general) = request else {
            return Err(unsupported(self.channel_name(), meta.mode));
        };
        let converted = convert_chat_request(general, &meta.actual_model)?;
        debug!("Converted chat request into {} Anthropic messages", converted.messages.len());
        Ok(UpstreamBody::Json(serde_json::to_value(converted)?))
    }

    async fn do_response(
        &self,
        meta: &Meta,
        response: Response,
        writer: &RelayWriter,
    ) -> AppResult<Usage> {
        self.check_mode(meta.mode)?;
        if meta.is_stream {
            let response = ensure_success(response).await?;
            let mut mapper = StreamMapper::new();
            return normalize_stream(meta, response, Framing::Sse, writer, |record| {
                mapper.map(record)
            })
            .await;
        }

        let response = ensure_success(response).await?;
        let body: MessagesResponse = decode(&read_body(response).await?)?;
        let converted = response_to_openai(body, meta);
        writer.write_json(StatusCode::OK, &converted).await?;
        Ok(converted.usage)
    }
}
