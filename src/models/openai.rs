//! Canonical OpenAI-compatible data models
//!
//! Every adaptor converts from these request shapes and back into these
//! response shapes. Unknown request fields are preserved in `extra` so that
//! OpenAI-compatible upstreams receive them untouched.

use crate::models::mode::Mode;
use crate::utils::error::{AppError, AppResult};
use axum::http::StatusCode;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const ROLE_SYSTEM: &str = "system";
pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";
pub const ROLE_TOOL: &str = "tool";

pub const FINISH_STOP: &str = "stop";
pub const FINISH_LENGTH: &str = "length";
pub const FINISH_TOOL_CALLS: &str = "tool_calls";
pub const FINISH_CONTENT_FILTER: &str = "content_filter";

/// Canonical request for the text modes
/// (chat, completions, embeddings, moderations, edits)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralOpenAIRequest {
    /// Model name as requested by the caller
    #[serde(default)]
    pub model: String,
    /// Chat messages
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    /// Legacy completion prompt (string or array of strings)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Value>,
    /// Embedding / moderation input (string or array)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Edit instruction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<i64>,
    /// Stop sequences (string or array of strings)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    /// Legacy function calling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub functions: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
    /// Fields not modelled above
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GeneralOpenAIRequest {
    /// Effective completion budget, preferring `max_completion_tokens`
    pub fn output_limit(&self) -> Option<i64> {
        self.max_completion_tokens.or(self.max_tokens)
    }

    /// Stop sequences flattened to a list
    pub fn stop_sequences(&self) -> Option<Vec<String>> {
        self.stop.as_ref().map(value_to_strings).filter(|s| !s.is_empty())
    }

    /// Legacy prompt flattened to one string
    pub fn prompt_text(&self) -> String {
        self.prompt
            .as_ref()
            .map(|p| value_to_strings(p).join("\n"))
            .unwrap_or_default()
    }

    /// Embedding / moderation input as a list of strings
    pub fn input_texts(&self) -> Vec<String> {
        self.input.as_ref().map(value_to_strings).unwrap_or_default()
    }
}

/// Flatten a string-or-array JSON value into strings
pub fn value_to_strings(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Chat message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    /// Role (system/user/assistant/tool)
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Reasoning text returned by thinking models
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(MessageContent::Text(text.into())),
            ..Default::default()
        }
    }

    /// Concatenated text of the message content
    pub fn text(&self) -> String {
        self.content
            .as_ref()
            .map(MessageContent::extract_text)
            .unwrap_or_default()
    }
}

/// Message content (plain string or list of typed parts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// Typed content part
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    /// Remote URL or `data:` URL
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl MessageContent {
    pub fn extract_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn has_images(&self) -> bool {
        self.image_count() > 0
    }

    pub fn image_count(&self) -> usize {
        match self {
            MessageContent::Text(_) => 0,
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|part| matches!(part, ContentPart::ImageUrl { .. }))
                .count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<Value>,
}

/// Tool definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: Function,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Tool call, both complete (responses) and partial (stream deltas)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCall {
    /// Position in the tool call list (stream deltas only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub tool_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// JSON-encoded arguments (possibly a fragment while streaming)
    #[serde(default)]
    pub arguments: String,
}

impl ToolCall {
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            index: None,
            id: id.into(),
            tool_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// Token accounting for one relayed call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Usage for outputs billed by a substitute unit (bytes, images)
    pub fn substitute(count: u32) -> Self {
        Self::new(0, count)
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0
    }

    /// Fold a partial report into this one; non-zero counters win
    pub fn merge(&mut self, other: &Usage) {
        if other.prompt_tokens != 0 {
            self.prompt_tokens = other.prompt_tokens;
        }
        if other.completion_tokens != 0 {
            self.completion_tokens = other.completion_tokens;
        }
        if other.total_tokens != 0 {
            self.total_tokens = other.total_tokens;
        }
    }
}

/// Non-streaming chat response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<TextResponseChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextResponseChoice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: Option<String>,
}

impl TextResponse {
    /// Single-choice chat completion
    pub fn single(
        id: impl Into<String>,
        model: impl Into<String>,
        message: Message,
        finish_reason: Option<String>,
        usage: Usage,
    ) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            choices: vec![TextResponseChoice {
                index: 0,
                message,
                finish_reason,
            }],
            usage,
        }
    }
}

/// Incremental delta of a streamed choice
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Delta {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }
}

/// One streamed chunk (`chat.completion.chunk`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionsStreamResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_chunk_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChatCompletionsStreamResponseChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Normalized incremental unit emitted while streaming
pub type StreamChunk = ChatCompletionsStreamResponse;

fn default_chunk_object() -> String {
    "chat.completion.chunk".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionsStreamResponseChoice {
    #[serde(default)]
    pub index: u32,
    /// Absent on legacy completion chunks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<Delta>,
    /// Legacy completion text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub finish_reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionsStreamResponse {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            object: default_chunk_object(),
            created,
            model: model.into(),
            choices: Vec::new(),
            usage: None,
            extra: Map::new(),
        }
    }

    /// Append a single choice built from a delta
    pub fn with_delta(mut self, delta: Delta, finish_reason: Option<String>) -> Self {
        self.choices.push(ChatCompletionsStreamResponseChoice {
            index: 0,
            delta: Some(delta),
            finish_reason,
            ..Default::default()
        });
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Text carried by this chunk across all choices
    pub fn content_text(&self) -> String {
        let mut text = String::new();
        for choice in &self.choices {
            if let Some(content) = choice.delta.as_ref().and_then(|d| d.content.as_deref()) {
                text.push_str(content);
            }
            if let Some(legacy) = &choice.text {
                text.push_str(legacy);
            }
        }
        text
    }

    pub fn has_finish_reason(&self) -> bool {
        self.choices.iter().any(|c| c.finish_reason.is_some())
    }
}

/// Image generation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Text-to-speech request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextToSpeechRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub voice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Transcription / translation upload, read from a multipart body
#[derive(Debug, Clone, Default)]
pub struct AudioTranscriptionRequest {
    pub model: String,
    pub file: Bytes,
    pub file_name: String,
    pub content_type: Option<String>,
    pub language: Option<String>,
    pub prompt: Option<String>,
    pub response_format: Option<String>,
    pub temperature: Option<f64>,
}

/// Rerank request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RerankRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub documents: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_n: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_documents: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Document parsing upload
#[derive(Debug, Clone, Default)]
pub struct DocumentRequest {
    pub model: String,
    pub file: Bytes,
    pub file_name: String,
    /// `list` returns one Markdown string per page
    pub response_format: Option<String>,
}

/// Parsed document as one Markdown text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsePdfResponse {
    pub pages: usize,
    pub markdown: String,
}

/// Parsed document as Markdown per page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsePdfListResponse {
    pub markdowns: Vec<String>,
}

/// A canonical request of any mode
#[derive(Debug, Clone)]
pub enum RelayRequest {
    General(GeneralOpenAIRequest),
    Image(ImageRequest),
    Speech(TextToSpeechRequest),
    Transcription(AudioTranscriptionRequest),
    Rerank(RerankRequest),
    Document(DocumentRequest),
}

impl RelayRequest {
    /// Decode a JSON body into the request shape of `mode`
    pub fn from_json(mode: Mode, body: &[u8]) -> AppResult<Self> {
        let invalid =
            |e: serde_json::Error| AppError::Validation(format!("invalid request body: {}", e));
        match mode {
            Mode::ChatCompletions
            | Mode::Completions
            | Mode::Embeddings
            | Mode::Moderations
            | Mode::Edits => {
                Ok(RelayRequest::General(serde_json::from_slice(body).map_err(invalid)?))
            }
            Mode::ImagesGenerations => {
                Ok(RelayRequest::Image(serde_json::from_slice(body).map_err(invalid)?))
            }
            Mode::AudioSpeech => {
                Ok(RelayRequest::Speech(serde_json::from_slice(body).map_err(invalid)?))
            }
            Mode::Rerank => {
                Ok(RelayRequest::Rerank(serde_json::from_slice(body).map_err(invalid)?))
            }
            Mode::AudioTranscription | Mode::AudioTranslation | Mode::ParsePdf => Err(
                AppError::Validation(format!("mode {} expects a multipart body", mode)),
            ),
            Mode::Unknown => Err(AppError::NotFound("unknown relay mode".to_string())),
        }
    }

    pub fn model(&self) -> &str {
        match self {
            RelayRequest::General(r) => &r.model,
            RelayRequest::Image(r) => &r.model,
            RelayRequest::Speech(r) => &r.model,
            RelayRequest::Transcription(r) => &r.model,
            RelayRequest::Rerank(r) => &r.model,
            RelayRequest::Document(r) => &r.model,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, RelayRequest::General(r) if r.stream)
    }

    /// Output format requested by multipart uploads
    pub fn response_format(&self) -> Option<&str> {
        match self {
            RelayRequest::Transcription(r) => r.response_format.as_deref(),
            RelayRequest::Document(r) => r.response_format.as_deref(),
            _ => None,
        }
    }
}

/// OpenAI-style error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIError {
    pub message: String,
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    /// String or numeric code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
}

/// Upstream error envelope `{"error": {...}}`
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIErrorResponse {
    pub error: OpenAIError,
}

/// Canonical error that crosses back out of the relay core
#[derive(Debug, Clone, Serialize)]
pub struct ErrorWithStatusCode {
    pub error: OpenAIError,
    #[serde(skip)]
    pub status_code: StatusCode,
}

/// Embedding response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub object: String,
    pub data: Vec<EmbeddingData>,
    pub model: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingData {
    pub object: String,
    pub index: u32,
    pub embedding: Vec<f64>,
}

impl EmbeddingResponse {
    pub fn new(model: impl Into<String>, vectors: Vec<Vec<f64>>, usage: Usage) -> Self {
        Self {
            object: "list".to_string(),
            data: vectors
                .into_iter()
                .enumerate()
                .map(|(index, embedding)| EmbeddingData {
                    object: "embedding".to_string(),
                    index: index as u32,
                    embedding,
                })
                .collect(),
            model: model.into(),
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_text_extraction() {
        let parts = MessageContent::Parts(vec![
            ContentPart::Text { text: "Hello ".to_string() },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "https://example.com/a.png".to_string(),
                    detail: None,
                },
            },
            ContentPart::Text { text: "world".to_string() },
        ]);
        assert_eq!(parts.extract_text(), "Hello world");
        assert_eq!(parts.image_count(), 1);
        assert!(!MessageContent::Text("hi".to_string()).has_images());
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let request: GeneralOpenAIRequest = serde_json::from_str(
            r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}],"logprobs":true}"#,
        )
        .unwrap();
        assert_eq!(request.extra.get("logprobs"), Some(&Value::Bool(true)));

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["logprobs"], Value::Bool(true));
        assert!(value.get("stream").is_none());
    }

    #[test]
    fn test_usage_merge() {
        let mut usage = Usage::default();
        usage.merge(&Usage { prompt_tokens: 10, completion_tokens: 1, total_tokens: 0 });
        usage.merge(&Usage { prompt_tokens: 0, completion_tokens: 25, total_tokens: 0 });
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 25);
        assert_eq!(Usage::new(3, 4).total_tokens, 7);
        assert_eq!(
            Usage::substitute(1024),
            Usage { prompt_tokens: 0, completion_tokens: 1024, total_tokens: 1024 }
        );
    }

    #[test]
    fn test_legacy_completion_chunk() {
        let chunk: ChatCompletionsStreamResponse = serde_json::from_value(serde_json::json!({
            "id": "c1",
            "object": "text_completion",
            "created": 1,
            "model": "m",
            "choices": [{"index": 0, "text": "abc", "finish_reason": null}]
        }))
        .unwrap();
        assert_eq!(chunk.content_text(), "abc");
        let value = serde_json::to_value(&chunk).unwrap();
        assert!(value["choices"][0].get("delta").is_none());
    }

    #[test]
    fn test_relay_request_shapes() {
        let request = RelayRequest::from_json(
            Mode::AudioSpeech,
            br#"{"model":"tts-1","input":"hello","voice":"alloy"}"#,
        )
        .unwrap();
        assert!(matches!(request, RelayRequest::Speech(_)));
        assert_eq!(request.model(), "tts-1");
        assert!(!request.is_stream());

        assert!(RelayRequest::from_json(Mode::AudioTranscription, b"{}").is_err());
        assert!(RelayRequest::from_json(Mode::ChatCompletions, b"not json").is_err());
    }
}
