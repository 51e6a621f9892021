//! Prompt and completion token counting
//!
//! Used to pre-count prompt tokens before dispatch and as the fallback when an
//! upstream reports no usage.

use crate::models::openai::{
    ContentPart, GeneralOpenAIRequest, Message, MessageContent, RelayRequest,
};
use once_cell::sync::Lazy;
use serde_json::Value;
use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};
use tracing::warn;

static CL100K: Lazy<Option<CoreBPE>> = Lazy::new(|| match cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        warn!("Failed to load cl100k_base tokenizer: {}", e);
        None
    }
});

static O200K: Lazy<Option<CoreBPE>> = Lazy::new(|| match o200k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        warn!("Failed to load o200k_base tokenizer: {}", e);
        None
    }
});

const TOKENS_PER_MESSAGE: u32 = 3;
const TOKENS_PER_NAME: u32 = 1;
const REPLY_PRIMING_TOKENS: u32 = 3;
const IMAGE_PART_TOKENS: u32 = 85;

fn uses_o200k(model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    ["gpt-4o", "gpt-4.1", "gpt-5", "o1", "o3", "o4", "chatgpt-4o"]
        .iter()
        .any(|prefix| model.starts_with(prefix))
}

fn encoder_for(model: &str) -> Option<&'static CoreBPE> {
    if uses_o200k(model) {
        O200K.as_ref()
    } else {
        CL100K.as_ref()
    }
}

/// Load both encoders outside the request path
pub fn preload() {
    Lazy::force(&CL100K);
    Lazy::force(&O200K);
}

/// Token count of plain text
pub fn count_text_tokens(text: &str, model: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    match encoder_for(model) {
        Some(bpe) => bpe.encode_ordinary(text).len() as u32,
        // rough estimate when no encoder is available
        None => (text.chars().count() as u32).div_ceil(4),
    }
}

/// Prompt tokens of a chat message list
pub fn count_message_tokens(messages: &[Message], model: &str) -> u32 {
    let mut total = 0;
    for message in messages {
        total += TOKENS_PER_MESSAGE;
        total += count_text_tokens(&message.role, model);
        match &message.content {
            Some(MessageContent::Text(text)) => total += count_text_tokens(text, model),
            Some(MessageContent::Parts(parts)) => {
                for part in parts {
                    total += match part {
                        ContentPart::Text { text } => count_text_tokens(text, model),
                        ContentPart::ImageUrl { .. } => IMAGE_PART_TOKENS,
                    };
                }
            }
            None => {}
        }
        if let Some(name) = &message.name {
            total += TOKENS_PER_NAME + count_text_tokens(name, model);
        }
        if let Some(tool_calls) = &message.tool_calls {
            for call in tool_calls {
                total += count_text_tokens(&call.function.name, model);
                total += count_text_tokens(&call.function.arguments, model);
            }
        }
    }
    total + REPLY_PRIMING_TOKENS
}

/// Token count of a string-or-array input value
pub fn count_input_tokens(input: &Value, model: &str) -> u32 {
    match input {
        Value::String(text) => count_text_tokens(text, model),
        Value::Array(items) => items.iter().map(|item| count_input_tokens(item, model)).sum(),
        _ => 0,
    }
}

fn count_general_tokens(request: &GeneralOpenAIRequest, model: &str) -> u32 {
    let mut total = 0;
    if !request.messages.is_empty() {
        total += count_message_tokens(&request.messages, model);
    }
    if let Some(prompt) = &request.prompt {
        total += count_input_tokens(prompt, model);
    }
    if let Some(input) = &request.input {
        total += count_input_tokens(input, model);
    }
    if let Some(instruction) = &request.instruction {
        total += count_text_tokens(instruction, model);
    }
    total
}

/// Prompt tokens of a relay request before dispatch
pub fn count_request_tokens(request: &RelayRequest, model: &str) -> u32 {
    match request {
        RelayRequest::General(general) => count_general_tokens(general, model),
        RelayRequest::Image(image) => count_text_tokens(&image.prompt, model),
        RelayRequest::Speech(speech) => count_text_tokens(&speech.input, model),
        RelayRequest::Rerank(rerank) => {
            let documents: u32 = rerank
                .documents
                .iter()
                .map(|doc| match doc {
                    Value::String(text) => count_text_tokens(text, model),
                    other => count_text_tokens(&other.to_string(), model),
                })
                .sum();
            count_text_tokens(&rerank.query, model) + documents
        }
        RelayRequest::Transcription(_) | RelayRequest::Document(_) => 0,
    }
}
