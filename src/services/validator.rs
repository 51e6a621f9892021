//! Request validation
//!
//! Checks the fields each relay mode requires before any adaptor runs.

use crate::models::mode::Mode;
use crate::models::openai::{GeneralOpenAIRequest, RelayRequest};
use crate::utils::error::{helpers::field_error, AppError, AppResult};
use serde_json::Value;

const MAX_TOKENS_LIMIT: i64 = 1 << 31;

fn require(condition: bool, field: &str, message: &str) -> AppResult<()> {
    if condition {
        Ok(())
    } else {
        Err(field_error(field, message))
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Null => false,
        _ => true,
    }
}

fn shape_mismatch(mode: Mode) -> AppError {
    AppError::Validation(format!("request body does not match mode {}", mode))
}

fn validate_general(request: &GeneralOpenAIRequest, mode: Mode) -> AppResult<()> {
    for (field, value) in [
        ("max_tokens", request.max_tokens),
        ("max_completion_tokens", request.max_completion_tokens),
    ] {
        if let Some(value) = value {
            require(
                (0..=MAX_TOKENS_LIMIT).contains(&value),
                field,
                "must be between 0 and 2147483648",
            )?;
        }
    }

    match mode {
        Mode::ChatCompletions => {
            require(!request.messages.is_empty(), "messages", "field messages is required")
        }
        Mode::Completions => require(
            request.prompt.as_ref().is_some_and(is_present),
            "prompt",
            "field prompt is required",
        ),
        Mode::Embeddings | Mode::Moderations => require(
            request.input.as_ref().is_some_and(is_present),
            "input",
            "field input is required",
        ),
        Mode::Edits => require(
            request.instruction.as_deref().is_some_and(|i| !i.is_empty()),
            "instruction",
            "field instruction is required",
        ),
        other => Err(shape_mismatch(other)),
    }
}

/// Validate a canonical request against its classified mode
pub fn validate(request: &RelayRequest, mode: Mode) -> AppResult<()> {
    if mode == Mode::Unknown {
        return Err(AppError::NotFound("unknown relay mode".to_string()));
    }
    require(!request.model().is_empty(), "model", "field model is required")?;

    match (request, mode) {
        (RelayRequest::General(general), mode) => validate_general(general, mode),
        (RelayRequest::Image(image), Mode::ImagesGenerations) => {
            require(!image.prompt.is_empty(), "prompt", "field prompt is required")?;
            if let Some(n) = image.n {
                require((1..=10).contains(&n), "n", "must be between 1 and 10")?;
            }
            Ok(())
        }
        (RelayRequest::Speech(speech), Mode::AudioSpeech) => {
            require(!speech.input.is_empty(), "input", "field input is required")
        }
        (
            RelayRequest::Transcription(upload),
            Mode::AudioTranscription | Mode::AudioTranslation,
        ) => {
            require(!upload.file.is_empty(), "file", "field file is required")
        }
        (RelayRequest::Rerank(rerank), Mode::Rerank) => {
            require(!rerank.query.is_empty(), "query", "field query is required")?;
            require(!rerank.documents.is_empty(), "documents", "field documents is required")
        }
        (RelayRequest::Document(document), Mode::ParsePdf) => {
            require(!document.file.is_empty(), "file", "field file is required")
        }
        (_, mode) => Err(shape_mismatch(mode)),
    }
}
