//! Logging utilities
//!
//! Shared helpers for request summaries in debug logs

use crate::models::openai::{GeneralOpenAIRequest, Message, MessageContent, RelayRequest};
use serde_json::{json, Value};

/// Set to true to include full request details (tools, prompts) in debug logs
/// Default is false to reduce log verbosity
pub const VERBOSE_REQUEST_LOGGING: bool = false;

/// Truncate a string with a note about original length
pub fn truncate_content(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut cut = max_len;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... ({} chars truncated)", &s[..cut], s.len() - cut)
}

fn filter_message(msg: &Message) -> Value {
    let content = match &msg.content {
        Some(MessageContent::Text(t)) => {
            let max_len = if msg.role == "system" { 100 } else { 200 };
            Value::String(truncate_content(t, max_len))
        }
        Some(MessageContent::Parts(parts)) => json!(format!("[...{} content parts]", parts.len())),
        None => Value::Null,
    };

    let mut obj = json!({
        "role": msg.role,
        "content": content,
    });

    if let Some(tool_calls) = &msg.tool_calls {
        obj["tool_calls"] = json!(format!("[...{} tool calls]", tool_calls.len()));
    }
    if let Some(tool_call_id) = &msg.tool_call_id {
        obj["tool_call_id"] = json!(tool_call_id);
    }

    obj
}

fn general_summary(request: &GeneralOpenAIRequest) -> Value {
    let tools = match &request.tools {
        Some(t) if !t.is_empty() => json!([format!("...{} tools (details truncated)", t.len())]),
        _ => Value::Null,
    };

    json!({
        "model": request.model,
        "max_tokens": request.output_limit(),
        "temperature": request.temperature,
        "stream": request.stream,
        "messages": request.messages.iter().map(filter_message).collect::<Vec<_>>(),
        "prompt": request.prompt.as_ref().map(|_| truncate_content(&request.prompt_text(), 200)),
        "input": request
            .input
            .as_ref()
            .map(|_| format!("[...{} inputs]", request.input_texts().len())),
        "tools": tools,
    })
}

/// Create a filtered summary of a relay request for logging
pub fn create_request_log_summary(request: &RelayRequest) -> Value {
    match request {
        RelayRequest::General(general) if VERBOSE_REQUEST_LOGGING => {
            serde_json::to_value(general).unwrap_or(json!({"error": "serialize failed"}))
        }
        RelayRequest::General(general) => general_summary(general),
        RelayRequest::Image(image) => json!({
            "model": image.model,
            "prompt": truncate_content(&image.prompt, 100),
            "n": image.n,
            "size": image.size,
        }),
        RelayRequest::Speech(speech) => json!({
            "model": speech.model,
            "voice": speech.voice,
            "input_chars": speech.input.chars().count(),
        }),
        RelayRequest::Transcription(upload) => json!({
            "model": upload.model,
            "file_name": upload.file_name,
            "file_bytes": upload.file.len(),
        }),
        RelayRequest::Rerank(rerank) => json!({
            "model": rerank.model,
            "query": truncate_content(&rerank.query, 100),
            "documents": rerank.documents.len(),
        }),
        RelayRequest::Document(document) => json!({
            "model": document.model,
            "file_name": document.file_name,
            "file_bytes": document.file.len(),
        }),
    }
}
