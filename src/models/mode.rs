//! Relay mode classification
//!
//! Maps an inbound request path to the kind of operation being relayed

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operation kind of an inbound request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Unknown,
    ChatCompletions,
    Completions,
    Embeddings,
    Moderations,
    ImagesGenerations,
    Edits,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
    Rerank,
    ParsePdf,
}

impl Mode {
    /// Every classifiable mode, `Unknown` excluded
    pub const ALL: [Mode; 11] = [
        Mode::ChatCompletions,
        Mode::Completions,
        Mode::Embeddings,
        Mode::Moderations,
        Mode::ImagesGenerations,
        Mode::Edits,
        Mode::AudioSpeech,
        Mode::AudioTranscription,
        Mode::AudioTranslation,
        Mode::Rerank,
        Mode::ParsePdf,
    ];

    /// Classify a request path.
    ///
    /// Never fails: paths matching no rule yield [`Mode::Unknown`], which callers
    /// must reject before dispatch.
    pub fn from_path(path: &str) -> Self {
        let path = path.trim_end_matches('/');

        if path.starts_with("/v1/chat/completions") {
            Mode::ChatCompletions
        } else if path.starts_with("/v1/completions") {
            Mode::Completions
        } else if path.starts_with("/v1/embeddings")
            || (path.starts_with("/v1/") && path.ends_with("/embeddings"))
        {
            Mode::Embeddings
        } else if path.starts_with("/v1/moderations") {
            Mode::Moderations
        } else if path.starts_with("/v1/images/generations") {
            Mode::ImagesGenerations
        } else if path.starts_with("/v1/edits") {
            Mode::Edits
        } else if path.starts_with("/v1/audio/speech") {
            Mode::AudioSpeech
        } else if path.starts_with("/v1/audio/transcriptions") {
            Mode::AudioTranscription
        } else if path.starts_with("/v1/audio/translations") {
            Mode::AudioTranslation
        } else if path.starts_with("/v1/rerank") {
            Mode::Rerank
        } else if path.starts_with("/v1/parse/pdf") {
            Mode::ParsePdf
        } else {
            Mode::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Unknown => "unknown",
            Mode::ChatCompletions => "chat_completions",
            Mode::Completions => "completions",
            Mode::Embeddings => "embeddings",
            Mode::Moderations => "moderations",
            Mode::ImagesGenerations => "images_generations",
            Mode::Edits => "edits",
            Mode::AudioSpeech => "audio_speech",
            Mode::AudioTranscription => "audio_transcription",
            Mode::AudioTranslation => "audio_translation",
            Mode::Rerank => "rerank",
            Mode::ParsePdf => "parse_pdf",
        }
    }

    /// Whether the inbound body is a multipart upload rather than JSON
    pub fn is_multipart(&self) -> bool {
        matches!(
            self,
            Mode::AudioTranscription | Mode::AudioTranslation | Mode::ParsePdf
        )
    }

    /// Whether the mode may be answered as an event stream
    pub fn supports_stream(&self) -> bool {
        matches!(self, Mode::ChatCompletions | Mode::Completions)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
