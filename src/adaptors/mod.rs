//! Adaptor module
//!
//! Defines the Adaptor contract every upstream provider implements and the
//! helpers shared by the provider implementations.

pub mod anthropic;
pub mod baidu;
pub mod doc2x;
pub mod gemini;
pub mod moonshot;
pub mod ollama;
pub mod openai;
pub mod vertexai;

use crate::models::channel::{Channel, ModelConfig};
use crate::models::meta::Meta;
use crate::models::mode::Mode;
use crate::models::openai::{OpenAIErrorResponse, RelayRequest, Usage};
use crate::services::writer::RelayWriter;
use crate::utils::error::{AppError, AppResult};
use crate::utils::logging::truncate_content;
use anyhow::Context;
use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

pub use anthropic::AnthropicAdaptor;
pub use baidu::BaiduAdaptor;
pub use doc2x::Doc2xAdaptor;
pub use gemini::GeminiAdaptor;
pub use moonshot::MoonshotAdaptor;
pub use ollama::OllamaAdaptor;
pub use openai::OpenAIAdaptor;
pub use vertexai::VertexAIAdaptor;

/// Body of an upstream request
#[derive(Debug)]
pub enum UpstreamBody {
    Json(Value),
    Multipart(reqwest::multipart::Form),
    /// Raw upload such as a document file
    Raw { content_type: String, body: Bytes },
}

impl UpstreamBody {
    pub fn apply(self, builder: RequestBuilder) -> RequestBuilder {
        match self {
            UpstreamBody::Json(value) => builder.json(&value),
            UpstreamBody::Multipart(form) => builder.multipart(form),
            UpstreamBody::Raw { content_type, body } => {
                builder.header(reqwest::header::CONTENT_TYPE, content_type).body(body)
            }
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            UpstreamBody::Json(value) => Some(value),
            UpstreamBody::Multipart(_) | UpstreamBody::Raw { .. } => None,
        }
    }
}

/// Plain and streaming HTTP clients shared by all adaptors
#[derive(Debug, Clone)]
pub struct HttpClients {
    pub client: Client,
    pub stream_client: Client,
}

impl HttpClients {
    /// Create clients with custom timeouts
    pub fn with_timeouts(timeout_secs: u64, stream_timeout_secs: u64) -> anyhow::Result<Self> {
        let user_agent = format!("airelay/{}", env!("CARGO_PKG_VERSION"));

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(&user_agent)
            .build()
            .context("Failed to create HTTP client")?;

        let stream_client = Client::builder()
            .timeout(Duration::from_secs(stream_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(&user_agent)
            .build()
            .context("Failed to create streaming HTTP client")?;

        Ok(Self { client, stream_client })
    }

    pub fn for_meta(&self, meta: &Meta) -> &Client {
        if meta.is_stream {
            &self.stream_client
        } else {
            &self.client
        }
    }
}

/// Syntactic check of channel key material, without network I/O
pub trait KeyValidator: Send + Sync {
    fn validate_key(&self, key: &str) -> AppResult<()>;
}

/// Remaining account balance of a channel
#[async_trait]
pub trait Balancer: Send + Sync {
    async fn get_balance(&self, channel: &Channel) -> AppResult<f64>;
}

/// Contract between the relay core and one upstream provider
///
/// The relay calls `init`, `convert_request`, `do_request` and `do_response`
/// in that order, once per inbound request.
#[async_trait]
pub trait Adaptor: Send + Sync {
    fn channel_name(&self) -> &'static str;

    fn default_base_url(&self) -> &'static str;

    /// Models this provider serves
    fn model_list(&self) -> &[ModelConfig];

    fn http_clients(&self) -> &HttpClients;

    /// Per-call setup; the only stage allowed to write into `meta`
    fn init(&self, _meta: &mut Meta) -> AppResult<()> {
        Ok(())
    }

    /// Upstream URL for the request described by `meta`
    async fn get_request_url(&self, meta: &Meta) -> AppResult<String>;

    /// Attach provider authentication and content headers
    async fn setup_request_header(
        &self,
        meta: &Meta,
        builder: RequestBuilder,
    ) -> AppResult<RequestBuilder>;

    /// Convert the canonical request into the provider schema
    fn convert_request(&self, meta: &Meta, request: &RelayRequest) -> AppResult<UpstreamBody>;

    /// Send the converted request. No retries are done here.
    async fn do_request(&self, meta: &Meta, body: UpstreamBody) -> AppResult<Response> {
        let url = self.get_request_url(meta).await?;
        debug!("Sending {} request to {}", self.channel_name(), url);

        let builder = self.http_clients().for_meta(meta).post(&url);
        let mut builder = self.setup_request_header(meta, builder).await?;
        for (name, value) in &meta.channel.config.headers {
            builder = builder.header(name, value);
        }

        let response = body.apply(builder).send().await?;
        debug!("{} responded with {}", self.channel_name(), response.status());
        Ok(response)
    }

    /// Write the canonical response (or stream) and report usage
    async fn do_response(
        &self,
        meta: &Meta,
        response: Response,
        writer: &RelayWriter,
    ) -> AppResult<Usage>;

    fn key_validator(&self) -> Option<&dyn KeyValidator> {
        None
    }

    fn balancer(&self) -> Option<&dyn Balancer> {
        None
    }
}

/// Error for a mode the adaptor does not implement
pub fn unsupported(channel: &str, mode: Mode) -> AppError {
    AppError::UnsupportedMode {
        channel: channel.to_string(),
        mode: mode.to_string(),
    }
}

/// Check for a single bearer token
pub fn validate_bearer_key(key: &str) -> AppResult<()> {
    if key.is_empty() {
        return Err(AppError::Credential("key must not be empty".to_string()));
    }
    if key.chars().any(char::is_whitespace) {
        return Err(AppError::Credential("key must not contain whitespace".to_string()));
    }
    Ok(())
}

/// Decode a JSON body into `T`
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> AppResult<T> {
    serde_json::from_slice(body).map_err(|e| {
        AppError::Decode(format!(
            "{} - body: {}",
            e,
            truncate_content(&String::from_utf8_lossy(body), 200)
        ))
    })
}

/// Read the whole upstream body
pub async fn read_body(response: Response) -> AppResult<Bytes> {
    Ok(response.bytes().await?)
}

/// Pass a successful response through, or convert an error status into `AppError::Upstream`
pub async fn ensure_success(response: Response) -> AppResult<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.bytes().await.unwrap_or_default();
    Err(upstream_error(status, &body))
}

/// Normalize a provider error body
///
/// Understands `{"error": {...}}` (OpenAI, Anthropic, Google), `{"error": "..."}`
/// (Ollama) and `{"message": "..."}`. Anything else is reported as raw text.
pub fn upstream_error(status: StatusCode, body: &[u8]) -> AppError {
    if let Ok(parsed) = serde_json::from_slice::<OpenAIErrorResponse>(body) {
        warn!("Upstream error {}: {}", status, parsed.error.message);
        return AppError::Upstream {
            status,
            message: parsed.error.message,
            error_type: if parsed.error.error_type.is_empty() {
                "upstream_error".to_string()
            } else {
                parsed.error.error_type
            },
            code: parsed.error.code,
        };
    }

    let message = match serde_json::from_slice::<Value>(body) {
        Ok(value) => value
            .get("error")
            .and_then(Value::as_str)
            .or_else(|| value.get("message").and_then(Value::as_str))
            .or_else(|| value.get("error_msg").and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        Err(_) => String::from_utf8_lossy(body).to_string(),
    };
    let message = if message.is_empty() {
        format!("upstream returned status {}", status)
    } else {
        truncate_content(&message, 500)
    };

    warn!("Upstream error {}: {}", status, message);
    AppError::Upstream {
        status,
        message,
        error_type: "upstream_error".to_string(),
        code: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_error_shapes() {
        let openai = upstream_error(
            StatusCode::UNAUTHORIZED,
            concat!(
                r#"{"error":{"message":"Incorrect API key","#,
                r#""type":"invalid_request_error","code":"invalid_api_key"}}"#
            )
            .as_bytes(),
        );
        match openai {
            AppError::Upstream { status, message, error_type, code } => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert_eq!(message, "Incorrect API key");
                assert_eq!(error_type, "invalid_request_error");
                assert_eq!(code, Some(Value::String("invalid_api_key".into())));
            }
            other => panic!("unexpected {:?}", other),
        }

        let ollama = upstream_error(StatusCode::NOT_FOUND, br#"{"error":"model 'x' not found"}"#);
        assert!(ollama.to_string().contains("model 'x' not found"));

        let raw = upstream_error(StatusCode::BAD_GATEWAY, b"<html>bad gateway</html>");
        assert_eq!(raw.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_bearer_key_validation() {
        assert!(validate_bearer_key("sk-abc").is_ok());
        assert!(validate_bearer_key("").is_err());
        assert!(validate_bearer_key("sk abc").is_err());
    }

    #[test]
    fn test_decode_failure_is_decode_error() {
        let result: AppResult<Value> = decode(b"{not json");
        assert!(matches!(result, Err(AppError::Decode(_))));
    }
}
