//! Google Gemini adaptor
//!
//! Converts the canonical chat request into `generateContent` contents. The
//! conversion and response handling are shared with the Vertex AI adaptor,
//! which serves the same schema behind a different host and auth scheme.

use super::{decode, ensure_success, read_body, unsupported, Adaptor, HttpClients, UpstreamBody};
use crate::models::channel::ModelConfig;
use crate::models::meta::Meta;
use crate::models::mode::Mode;
use crate::models::openai::{
    ContentPart, Delta, EmbeddingResponse, GeneralOpenAIRequest, Message, MessageContent,
    RelayRequest, StreamChunk, TextResponse, TextResponseChoice, ToolCall, Usage,
    FINISH_CONTENT_FILTER, FINISH_LENGTH, FINISH_STOP, FINISH_TOOL_CALLS, ROLE_ASSISTANT,
    ROLE_SYSTEM, ROLE_TOOL,
};
use crate::services::stream::{normalize_stream, Framing, StreamStep};
use crate::services::usage::{resolve_input_usage, resolve_usage};
use crate::services::writer::RelayWriter;
use crate::utils::error::{AppError, AppResult};
use crate::utils::image::{is_data_url, mime_from_url, parse_data_url};
use async_trait::async_trait;
use axum::http::StatusCode;
use once_cell::sync::Lazy;
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::debug;

const DEFAULT_API_VERSION: &str = "v1beta";

static MODEL_LIST: Lazy<Vec<ModelConfig>> = Lazy::new(|| {
    vec![
        ModelConfig::new("gemini-2.5-pro", Mode::ChatCompletions, "google")
            .price(0.00125, 0.01)
            .context(1_048_576, 65_536)
            .vision()
            .tools(),
        ModelConfig::new("gemini-2.5-flash", Mode::ChatCompletions, "google")
            .price(0.0003, 0.0025)
            .context(1_048_576, 65_536)
            .vision()
            .tools(),
        ModelConfig::new("gemini-2.0-flash", Mode::ChatCompletions, "google")
            .price(0.0001, 0.0004)
            .context(1_048_576, 8_192)
            .vision()
            .tools(),
        ModelConfig::new("text-embedding-004", Mode::Embeddings, "google").max_input(2_048),
    ]
});

const HARM_CATEGORIES: [&str; 5] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_CIVIC_INTEGRITY",
];

/// JSON Schema keywords the function declaration endpoint rejects
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &[
    "$schema",
    "$id",
    "$ref",
    "$defs",
    "definitions",
    "$comment",
    "additionalProperties",
    "anyOf",
    "allOf",
    "oneOf",
    "not",
    "if",
    "then",
    "else",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "multipleOf",
    "propertyNames",
    "patternProperties",
    "unevaluatedProperties",
    "dependentSchemas",
    "dependentRequired",
    "minProperties",
    "maxProperties",
    "contains",
    "minContains",
    "maxContains",
    "unevaluatedItems",
    "prefixItems",
    "uniqueItems",
    "contentEncoding",
    "contentMediaType",
    "contentSchema",
    "const",
    "deprecated",
    "readOnly",
    "writeOnly",
    "examples",
    "default",
];

/// Strip schema keywords Gemini rejects, recursively
pub fn sanitize_tool_schema(schema: Option<Value>) -> Option<Value> {
    schema.map(sanitize_schema_value)
}

fn sanitize_schema_value(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            for key in UNSUPPORTED_SCHEMA_KEYS {
                map.remove(*key);
            }
            // "properties" maps names to schemas; a property may itself be called "default"
            let sanitized: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| {
                    let v = if k == "properties" {
                        sanitize_properties(v)
                    } else {
                        sanitize_schema_value(v)
                    };
                    (k, v)
                })
                .collect();
            Value::Object(sanitized)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_schema_value).collect()),
        other => other,
    }
}

fn sanitize_properties(value: Value) -> Value {
    match value {
        Value::Object(properties) => Value::Object(
            properties
                .into_iter()
                .map(|(name, schema)| (name, sanitize_schema_value(schema)))
                .collect(),
        ),
        other => sanitize_schema_value(other),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub mime_type: String,
    pub file_uri: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionCallPart {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionResponsePart {
    pub name: String,
    pub response: Value,
}

/// One content part; exactly one of the payload fields is set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<FileData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCallPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponsePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetySetting {
    pub category: &'static str,
    pub threshold: &'static str,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiTool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub safety_settings: Vec<SafetySetting>,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<GeminiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub candidates_token_count: u32,
    #[serde(default)]
    pub thoughts_token_count: u32,
    #[serde(default)]
    pub total_token_count: u32,
}

impl UsageMetadata {
    fn to_usage(&self) -> Usage {
        let completion = self.candidates_token_count.saturating_add(self.thoughts_token_count);
        let completion = if completion == 0 {
            self.total_token_count.saturating_sub(self.prompt_token_count)
        } else {
            completion
        };
        Usage::new(self.prompt_token_count, completion)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Content,
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    pub usage_metadata: Option<UsageMetadata>,
}

pub fn finish_reason_to_openai(reason: &str) -> String {
    match reason {
        "MAX_TOKENS" => FINISH_LENGTH,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            FINISH_CONTENT_FILTER
        }
        _ => FINISH_STOP,
    }
    .to_string()
}

fn convert_parts(content: &MessageContent) -> AppResult<Vec<Part>> {
    match content {
        MessageContent::Text(text) => Ok(vec![Part::text(text.clone())]),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => Ok(Part::text(text.clone())),
                ContentPart::ImageUrl { image_url } if is_data_url(&image_url.url) => {
                    let image = parse_data_url(&image_url.url)?;
                    Ok(Part {
                        inline_data: Some(InlineData {
                            mime_type: image.mime_type,
                            data: image.data,
                        }),
                        ..Default::default()
                    })
                }
                ContentPart::ImageUrl { image_url } => Ok(Part {
                    file_data: Some(FileData {
                        mime_type: mime_from_url(&image_url.url).to_string(),
                        file_uri: image_url.url.clone(),
                    }),
                    ..Default::default()
                }),
            })
            .collect(),
    }
}

fn tool_result_payload(message: &Message) -> Value {
    let text = message.text();
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(object)) => Value::Object(object),
        _ => json!({ "content": text }),
    }
}

fn convert_tool_choice(choice: &Value) -> Option<Value> {
    let config = match choice {
        Value::String(mode) => match mode.as_str() {
            "none" => json!({"mode": "NONE"}),
            "required" => json!({"mode": "ANY"}),
            _ => json!({"mode": "AUTO"}),
        },
        Value::Object(_) => {
            let name = choice.pointer("/function/name").and_then(Value::as_str)?;
            json!({"mode": "ANY", "allowedFunctionNames": [name]})
        }
        _ => return None,
    };
    Some(json!({ "functionCallingConfig": config }))
}

fn convert_response_format(request: &GeneralOpenAIRequest, config: &mut GenerationConfig) {
    let Some(format) = &request.response_format else {
        return;
    };
    match format.format_type.as_str() {
        "json_object" => config.response_mime_type = Some("application/json".to_string()),
        "json_schema" => {
            config.response_mime_type = Some("application/json".to_string());
            config.response_schema = sanitize_tool_schema(
                format.json_schema.as_ref().and_then(|s| s.get("schema")).cloned(),
            );
        }
        "text" => config.response_mime_type = Some("text/plain".to_string()),
        _ => {}
    }
}

/// Convert a canonical chat request into a `generateContent` body
pub fn convert_chat_request(request: &GeneralOpenAIRequest) -> AppResult<ChatRequest> {
    let mut system = Vec::new();
    let mut contents: Vec<Content> = Vec::new();
    let mut tool_names: HashMap<String, String> = HashMap::new();

    for message in &request.messages {
        if message.role == ROLE_SYSTEM {
            system.push(Part::text(message.text()));
            continue;
        }

        let (role, parts) = if message.role == ROLE_TOOL {
            let id = message
                .tool_call_id
                .as_deref()
                .ok_or_else(|| {
                    AppError::Conversion("tool message without tool_call_id".to_string())
                })?;
            let name = tool_names
                .get(id)
                .cloned()
                .or_else(|| message.name.clone())
                .ok_or_else(|| {
                    AppError::Conversion(format!("no tool call found for id '{}'", id))
                })?;
            let part = Part {
                function_response: Some(FunctionResponsePart {
                    name,
                    response: tool_result_payload(message),
                }),
                ..Default::default()
            };
            ("user", vec![part])
        } else {
            let mut parts = match &message.content {
                Some(content) => convert_parts(content)?,
                None => Vec::new(),
            };
            parts.retain(|p| p.text.as_deref() != Some(""));

            for call in message.tool_calls.iter().flatten() {
                let args: Value = if call.function.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&call.function.arguments).map_err(|e| {
                        AppError::Conversion(format!(
                            "tool call '{}' has invalid arguments: {}",
                            call.function.name, e
                        ))
                    })?
                };
                tool_names.insert(call.id.clone(), call.function.name.clone());
                parts.push(Part {
                    function_call: Some(FunctionCallPart {
                        name: call.function.name.clone(),
                        args,
                    }),
                    ..Default::default()
                });
            }

            let role = if message.role == ROLE_ASSISTANT { "model" } else { "user" };
            (role, parts)
        };

        if parts.is_empty() {
            continue;
        }
        match contents.last_mut() {
            Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
            _ => contents.push(Content {
                role: Some(role.to_string()),
                parts,
            }),
        }
    }

    let tools: Vec<FunctionDeclaration> = request
        .tools
        .iter()
        .flatten()
        .map(|tool| FunctionDeclaration {
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            parameters: sanitize_tool_schema(tool.function.parameters.clone()),
        })
        .collect();

    let mut generation_config = GenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        max_output_tokens: request.output_limit(),
        stop_sequences: request.stop_sequences(),
        candidate_count: request.n.filter(|n| *n > 1),
        seed: request.seed,
        ..Default::default()
    };
    convert_response_format(request, &mut generation_config);

    Ok(ChatRequest {
        contents,
        system_instruction: (!system.is_empty()).then(|| Content { role: None, parts: system }),
        safety_settings: HARM_CATEGORIES
            .iter()
            .map(|category| SafetySetting {
                category: *category,
                threshold: "BLOCK_NONE",
            })
            .collect(),
        generation_config,
        tools: if tools.is_empty() {
            Vec::new()
        } else {
            vec![GeminiTool {
                function_declarations: tools,
            }]
        },
        tool_config: request.tool_choice.as_ref().and_then(convert_tool_choice),
    })
}

/// Text, reasoning and tool calls of one candidate
fn split_candidate(candidate: &Candidate) -> (String, String, Vec<ToolCall>) {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for part in &candidate.content.parts {
        if let Some(call) = &part.function_call {
            let mut converted = ToolCall::function(
                format!("call_{}", uuid::Uuid::new_v4().simple()),
                call.name.clone(),
                call.args.to_string(),
            );
            converted.index = Some(tool_calls.len() as u32);
            tool_calls.push(converted);
        } else if let Some(t) = &part.text {
            if part.thought == Some(true) {
                reasoning.push_str(t);
            } else {
                text.push_str(t);
            }
        }
    }
    (text, reasoning, tool_calls)
}

fn candidate_finish(candidate: &Candidate, has_tool_calls: bool) -> Option<String> {
    if has_tool_calls {
        return Some(FINISH_TOOL_CALLS.to_string());
    }
    candidate.finish_reason.as_deref().map(finish_reason_to_openai)
}

/// Map one `alt=sse` record into a stream step
pub fn map_stream_record(record: &str, created: i64) -> anyhow::Result<StreamStep> {
    let response: ChatResponse = serde_json::from_str(record)?;
    let mut step = StreamStep::default();

    if let Some(candidate) = response.candidates.first() {
        let (text, reasoning, tool_calls) = split_candidate(candidate);
        let finish = candidate_finish(candidate, !tool_calls.is_empty());
        let delta = Delta {
            role: Some(ROLE_ASSISTANT.to_string()),
            content: Some(text),
            reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            ..Default::default()
        };
        step.chunk = Some(StreamChunk::new("", "", created).with_delta(delta, finish));
    }

    if let Some(metadata) = &response.usage_metadata {
        let usage = metadata.to_usage();
        if let Some(chunk) = step.chunk.take() {
            step.chunk = Some(chunk.with_usage(usage));
        }
        step = step.with_usage(usage);
    }
    Ok(step)
}

/// Relay an `alt=sse` stream
pub async fn stream_handler(
    meta: &Meta,
    response: Response,
    writer: &RelayWriter,
) -> AppResult<Usage> {
    let response = ensure_success(response).await?;
    let created = chrono::Utc::now().timestamp();
    normalize_stream(meta, response, Framing::Sse, writer, |record| {
        map_stream_record(record, created)
    })
    .await
}

/// Convert a `generateContent` body into a chat completion
pub fn response_to_openai(response: ChatResponse, meta: &Meta) -> AppResult<TextResponse> {
    if response.candidates.is_empty() {
        return Err(AppError::Upstream {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "No candidates returned".to_string(),
            error_type: "gemini_error".to_string(),
            code: None,
        });
    }

    let mut all_text = String::new();
    let choices: Vec<TextResponseChoice> = response
        .candidates
        .iter()
        .enumerate()
        .map(|(i, candidate)| {
            let (text, reasoning, tool_calls) = split_candidate(candidate);
            all_text.push_str(&text);
            let finish = candidate_finish(candidate, !tool_calls.is_empty());
            TextResponseChoice {
                index: i as u32,
                message: Message {
                    role: ROLE_ASSISTANT.to_string(),
                    content: Some(MessageContent::Text(text)),
                    reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    ..Default::default()
                },
                finish_reason: finish.or_else(|| Some(FINISH_STOP.to_string())),
            }
        })
        .collect();

    let reported = response.usage_metadata.as_ref().map(UsageMetadata::to_usage);
    let usage = resolve_usage(reported, &all_text, meta);

    let mut converted = TextResponse::single(
        format!("chatcmpl-{}", meta.request_id),
        meta.origin_model.clone(),
        Message::default(),
        None,
        usage,
    );
    converted.choices = choices;
    Ok(converted)
}

/// Relay a `generateContent` body
pub async fn text_handler(
    meta: &Meta,
    response: Response,
    writer: &RelayWriter,
) -> AppResult<Usage> {
    let response = ensure_success(response).await?;
    let body: ChatResponse = decode(&read_body(response).await?)?;
    let converted = response_to_openai(body, meta)?;
    writer.write_json(StatusCode::OK, &converted).await?;
    Ok(converted.usage)
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    #[serde(default)]
    values: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingValues>,
}

/// Gemini adaptor
pub struct GeminiAdaptor {
    clients: HttpClients,
}

impl GeminiAdaptor {
    pub fn new(clients: HttpClients) -> Self {
        Self { clients }
    }

    fn check_mode(&self, mode: Mode) -> AppResult<()> {
        match mode {
            Mode::ChatCompletions | Mode::Embeddings => Ok(()),
            other => Err(unsupported(self.channel_name(), other)),
        }
    }
}

#[async_trait]
impl Adaptor for GeminiAdaptor {
    fn channel_name(&self) -> &'static str {
        "gemini"
    }

    fn default_base_url(&self) -> &'static str {
        "https://generativelanguage.googleapis.com"
    }

    fn model_list(&self) -> &[ModelConfig] {
        &MODEL_LIST
    }

    fn http_clients(&self) -> &HttpClients {
        &self.clients
    }

    async fn get_request_url(&self, meta: &Meta) -> AppResult<String> {
        self.check_mode(meta.mode)?;
        let action = match meta.mode {
            Mode::Embeddings => "batchEmbedContents",
            _ if meta.is_stream => "streamGenerateContent?alt=sse",
            _ => "generateContent",
        };
        Ok(format!(
            "{}/{}/models/{}:{}",
            meta.base_url(),
            meta.api_version(DEFAULT_API_VERSION),
            meta.actual_model,
            action
        ))
    }

    async fn setup_request_header(
        &self,
        meta: &Meta,
        builder: RequestBuilder,
    ) -> AppResult<RequestBuilder> {
        Ok(builder.header("x-goog-api-key", &meta.channel.key))
    }

    fn convert_request(&self, meta: &Meta, request: &RelayRequest) -> AppResult<UpstreamBody> {
        self.check_mode(meta.mode)?;
        let RelayRequest::General(general) = request else {
            return Err(unsupported(self.channel_name(), meta.mode));
        };

        if meta.mode == Mode::Embeddings {
            let model = format!("models/{}", meta.actual_model);
            let requests: Vec<Value> = general
                .input_texts()
                .into_iter()
                .map(|text| {
                    let mut entry = json!({"model": model, "content": {"parts": [{"text": text}]}});
                    if let Some(dimensions) = general.dimensions {
                        entry["outputDimensionality"] = json!(dimensions);
                    }
                    entry
                })
                .collect();
            return Ok(UpstreamBody::Json(json!({ "requests": requests })));
        }

        let converted = convert_chat_request(general)?;
        debug!("Converted chat request into {} Gemini contents", converted.contents.len());
        Ok(UpstreamBody::Json(serde_json::to_value(converted)?))
    }

    async fn do_response(
        &self,
        meta: &Meta,
        response: Response,
        writer: &RelayWriter,
    ) -> AppResult<Usage> {
        self.check_mode(meta.mode)?;
        match meta.mode {
            Mode::Embeddings => {
                let response = ensure_success(response).await?;
                let body: BatchEmbedResponse = decode(&read_body(response).await?)?;
                let usage = resolve_input_usage(None, meta);
                let vectors = body.embeddings.into_iter().map(|e| e.values).collect();
                let converted = EmbeddingResponse::new(meta.origin_model.clone(), vectors, usage);
                writer.write_json(StatusCode::OK, &converted).await?;
                Ok(usage)
            }
            _ if meta.is_stream => stream_handler(meta, response, writer).await,
            _ => text_handler(meta, response, writer).await,
        }
    }
}
