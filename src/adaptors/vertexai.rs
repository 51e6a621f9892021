//! Google Vertex AI adaptor
//!
//! Channel keys are `region|projectID|serviceAccountJSON`. The service account
//! signs an RS256 JWT that is exchanged for an OAuth access token; tokens are
//! cached per account in the shared [`TokenCache`].

use super::gemini;
use super::{
    decode, ensure_success, read_body, unsupported, Adaptor, HttpClients, KeyValidator,
    UpstreamBody,
};
use crate::models::channel::ModelConfig;
use crate::models::meta::Meta;
use crate::models::mode::Mode;
use crate::models::openai::{EmbeddingResponse, RelayRequest, Usage};
use crate::services::usage::resolve_input_usage;
use crate::services::writer::RelayWriter;
use crate::utils::error::{AppError, AppResult};
use crate::utils::token_cache::{TokenCache, TokenGrant};
use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use once_cell::sync::Lazy;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const JWT_LIFETIME_SECS: i64 = 3600;
const TOKEN_REFRESH_WINDOW_SECS: i64 = 600;

const META_REGION: &str = "region";
const META_PROJECT: &str = "project_id";

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
        ModelConfig::new("text-embedding-005", Mode::Embeddings, "google").max_input(2_048),
        ModelConfig::new("text-multilingual-embedding-002", Mode::Embeddings, "google")
            .max_input(2_048),
    ]
});

/// The three parts of a Vertex AI channel key
#[derive(Debug)]
struct VertexKey<'a> {
    region: &'a str,
    project_id: &'a str,
    adc: Map<String, Value>,
}

fn parse_key(key: &str) -> AppResult<VertexKey<'_>> {
    let mut parts = key.splitn(3, '|');
    let (Some(region), Some(project_id), Some(adc)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(AppError::Credential(
            "vertexai key must be in the form 'region|projectID|adcJSON'".to_string(),
        ));
    };
    if region.trim().is_empty() || project_id.trim().is_empty() {
        return Err(AppError::Credential(
            "vertexai region and project id must not be empty".to_string(),
        ));
    }
    let adc = match serde_json::from_str::<Value>(adc) {
        Ok(Value::Object(adc)) => adc,
        _ => {
            return Err(AppError::Credential(
                "vertexai credentials must be a JSON object".to_string(),
            ))
        }
    };

    Ok(VertexKey {
        region: region.trim(),
        project_id: project_id.trim(),
        adc,
    })
}

/// Fields of a service account JSON file used for the token exchange
#[derive(Debug, Clone, Deserialize)]
struct ServiceAccount {
    client_email: String,
    private_key: String,
    #[serde(default)]
    private_key_id: String,
    #[serde(default)]
    token_uri: Option<String>,
}

impl ServiceAccount {
    fn from_adc(adc: Map<String, Value>) -> AppResult<Self> {
        serde_json::from_value(Value::Object(adc)).map_err(|e| {
            AppError::Credential(format!("vertexai service account is incomplete: {}", e))
        })
    }

    fn token_uri(&self) -> String {
        self.token_uri
            .clone()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string())
    }
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

fn sign_assertion(
    account: &ServiceAccount,
    token_uri: &str,
    now: DateTime<Utc>,
) -> AppResult<String> {
    let claims = JwtClaims {
        iss: &account.client_email,
        scope: CLOUD_PLATFORM_SCOPE,
        aud: token_uri,
        iat: now.timestamp(),
        exp: now.timestamp() + JWT_LIFETIME_SECS,
    };
    let mut header = Header::new(Algorithm::RS256);
    if !account.private_key_id.trim().is_empty() {
        header.kid = Some(account.private_key_id.clone());
    }
    let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
        .map_err(|e| AppError::Credential(format!("invalid vertexai private key: {}", e)))?;
    jsonwebtoken::encode(&header, &claims, &key)
        .map_err(|e| AppError::Credential(format!("failed to sign vertexai assertion: {}", e)))
}

async fn fetch_access_token(
    client: Client,
    account: ServiceAccount,
    now: DateTime<Utc>,
) -> AppResult<TokenGrant> {
    let token_uri = account.token_uri();
    let assertion = sign_assertion(&account, &token_uri, now)?;
    let body = format!(
        "grant_type=urn:ietf:params:oauth:grant-type:jwt-bearer&assertion={}",
        urlencoding::encode(&assertion)
    );

    debug!("Exchanging vertexai assertion for {}", account.client_email);
    let response = client
        .post(&token_uri)
        .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await?;
    let response = ensure_success(response).await?;
    let token: OAuthTokenResponse = decode(&read_body(response).await?)?;

    let expires_in = token.expires_in.unwrap_or(JWT_LIFETIME_SECS);
    info!("Obtained vertexai access token valid for {}s", expires_in);
    Ok(TokenGrant::expiring_in(token.access_token, now, expires_in))
}

#[derive(Debug, Default, Deserialize)]
struct EmbeddingStatistics {
    #[serde(default)]
    token_count: f64,
}

#[derive(Debug, Default, Deserialize)]
struct PredictionEmbedding {
    #[serde(default)]
    values: Vec<f64>,
    #[serde(default)]
    statistics: EmbeddingStatistics,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    #[serde(default)]
    embeddings: PredictionEmbedding,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

/// Vertex AI adaptor
pub struct VertexAIAdaptor {
    clients: HttpClients,
    tokens: Arc<TokenCache>,
}

impl VertexAIAdaptor {
    pub fn new(clients: HttpClients, tokens: Arc<TokenCache>) -> Self {
        Self { clients, tokens }
    }

    fn check_mode(&self, mode: Mode) -> AppResult<()> {
        match mode {
            Mode::ChatCompletions | Mode::Embeddings => Ok(()),
            other => Err(unsupported(self.channel_name(), other)),
        }
    }

    /// Region and project, as recorded by `init` or read from the key
    fn location(meta: &Meta) -> AppResult<(String, String)> {
        if let (Some(region), Some(project)) = (meta.get(META_REGION), meta.get(META_PROJECT)) {
            return Ok((region.to_string(), project.to_string()));
        }
        let key = parse_key(&meta.channel.key)?;
        Ok((key.region.to_string(), key.project_id.to_string()))
    }

    fn host(meta: &Meta, region: &str) -> String {
        let base = meta.base_url();
        if !base.is_empty() {
            base
        } else if region == "global" {
            "https://aiplatform.googleapis.com".to_string()
        } else {
            format!("https://{}-aiplatform.googleapis.com", region)
        }
    }

    async fn access_token(&self, meta: &Meta) -> AppResult<String> {
        let key = parse_key(&meta.channel.key)?;
        let account = ServiceAccount::from_adc(key.adc)?;
        let cache_key = account.client_email.clone();
        let client = self.clients.client.clone();
        let now = self.tokens.now();

        self.tokens
            .get_or_refresh(
                &cache_key,
                chrono::Duration::seconds(TOKEN_REFRESH_WINDOW_SECS),
                move || fetch_access_token(client, account, now),
            )
            .await
    }

    async fn embedding_response(
        &self,
        meta: &Meta,
        response: Response,
        writer: &RelayWriter,
    ) -> AppResult<Usage> {
        let response = ensure_success(response).await?;
        let body: PredictResponse = decode(&read_body(response).await?)?;

        let prompt_tokens: f64 =
            body.predictions.iter().map(|p| p.embeddings.statistics.token_count).sum();
        let reported = (prompt_tokens > 0.0).then(|| Usage::new(prompt_tokens as u32, 0));
        let usage = resolve_input_usage(reported, meta);

        let vectors = body.predictions.into_iter().map(|p| p.embeddings.values).collect();
        let converted = EmbeddingResponse::new(meta.origin_model.clone(), vectors, usage);
        writer.write_json(StatusCode::OK, &converted).await?;
        Ok(usage)
    }
}

impl KeyValidator for VertexAIAdaptor {
    fn validate_key(&self, key: &str) -> AppResult<()> {
        parse_key(key).map(|_| ())
    }
}

#[async_trait]
impl Adaptor for VertexAIAdaptor {
    fn channel_name(&self) -> &'static str {
        "vertexai"
    }

    fn default_base_url(&self) -> &'static str {
        ""
    }

    fn model_list(&self) -> &[ModelConfig] {
        &MODEL_LIST
    }

    fn http_clients(&self) -> &HttpClients {
        &self.clients
    }

    fn init(&self, meta: &mut Meta) -> AppResult<()> {
        let key = parse_key(&meta.channel.key)?;
        let (region, project) = (key.region.to_string(), key.project_id.to_string());
        meta.set(META_REGION, region);
        meta.set(META_PROJECT, project);
        Ok(())
    }

    async fn get_request_url(&self, meta: &Meta) -> AppResult<String> {
        self.check_mode(meta.mode)?;
        let (region, project) = Self::location(meta)?;
        let action = match meta.mode {
            Mode::Embeddings => "predict",
            _ if meta.is_stream => "streamGenerateContent?alt=sse",
            _ => "generateContent",
        };
        Ok(format!(
            "{}/v1/projects/{}/locations/{}/publishers/google/models/{}:{}",
            Self::host(meta, &region),
            project,
            region,
            meta.actual_model,
            action
        ))
    }

    async fn setup_request_header(
        &self,
        meta: &Meta,
        builder: RequestBuilder,
    ) -> AppResult<RequestBuilder> {
        let token = self.access_token(meta).await?;
        Ok(builder.bearer_auth(token))
    }

    fn convert_request(&self, meta: &Meta, request: &RelayRequest) -> AppResult<UpstreamBody> {
        self.check_mode(meta.mode)?;
        let RelayRequest::General(general) = request else {
            return Err(unsupported(self.channel_name(), meta.mode));
        };

        if meta.mode == Mode::Embeddings {
            let instances: Vec<Value> = general
                .input_texts()
                .into_iter()
                .map(|content| json!({ "content": content }))
                .collect();
            let mut body = json!({ "instances": instances });
            if let Some(dimensions) = general.dimensions {
                body["parameters"] = json!({ "outputDimensionality": dimensions });
            }
            return Ok(UpstreamBody::Json(body));
        }

        Ok(UpstreamBody::Json(serde_json::to_value(gemini::convert_chat_request(general)?)?))
    }

    async fn do_response(
        &self,
        meta: &Meta,
        response: Response,
        writer: &RelayWriter,
    ) -> AppResult<Usage> {
        self.check_mode(meta.mode)?;
        match meta.mode {
            Mode::Embeddings => self.embedding_response(meta, response, writer).await,
            _ if meta.is_stream => gemini::stream_handler(meta, response, writer).await,
            _ => gemini::text_handler(meta, response, writer).await,
        }
    }

    fn key_validator(&self) -> Option<&dyn KeyValidator> {
        Some(self)
    }
}
