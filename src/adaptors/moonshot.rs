//! Moonshot adaptor
//!
//! OpenAI-compatible chat API with a balance endpoint.

use super::openai::{convert_openai_request, stream_handler, text_handler};
use super::{
    decode, ensure_success, read_body, unsupported, validate_bearer_key, Adaptor, Balancer,
    HttpClients, KeyValidator, UpstreamBody,
};
use crate::models::channel::{Channel, ModelConfig};
use crate::models::meta::Meta;
use crate::models::mode::Mode;
use crate::models::openai::{RelayRequest, Usage};
use crate::services::writer::RelayWriter;
use crate::utils::error::{AppError, AppResult};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;

static MODEL_LIST: Lazy<Vec<ModelConfig>> = Lazy::new(|| {
    vec![
        ModelConfig::new("moonshot-v1-8k", Mode::ChatCompletions, "moonshot")
            .price(0.012, 0.012)
            .context(8_192, 8_192)
            .tools(),
        ModelConfig::new("moonshot-v1-32k", Mode::ChatCompletions, "moonshot")
            .price(0.024, 0.024)
            .context(32_768, 32_768)
            .tools(),
        ModelConfig::new("moonshot-v1-128k", Mode::ChatCompletions, "moonshot")
            .price(0.06, 0.06)
            .context(131_072, 131_072)
            .tools(),
        ModelConfig::new("kimi-k2-0711-preview", Mode::ChatCompletions, "moonshot")
            .price(0.004, 0.016)
            .context(131_072, 131_072)
            .tools(),
    ]
});

pub struct MoonshotAdaptor {
    clients: HttpClients,
}

impl MoonshotAdaptor {
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

impl KeyValidator for MoonshotAdaptor {
    fn validate_key(&self, key: &str) -> AppResult<()> {
        validate_bearer_key(key)
    }
}

#[derive(Deserialize)]
struct BalanceResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    status: bool,
    data: Option<BalanceData>,
}

#[derive(Deserialize)]
struct BalanceData {
    available_balance: f64,
}

#[async_trait]
impl Balancer for MoonshotAdaptor {
    async fn get_balance(&self, channel: &Channel) -> AppResult<f64> {
        let url = format!("{}/v1/users/me/balance", channel.base_url());
        let response = self.clients.client.get(&url).bearer_auth(&channel.key).send().await?;
        let response = ensure_success(response).await?;
        let balance: BalanceResponse = decode(&read_body(response).await?)?;

        match balance.data {
            Some(data) if balance.status && balance.code == 0 => Ok(data.available_balance),
            _ => Err(AppError::Decode(format!(
                "balance query failed with code {}",
                balance.code
            ))),
        }
    }
}

#[async_trait]
impl Adaptor for MoonshotAdaptor {
    fn channel_name(&self) -> &'static str {
        "moonshot"
    }

    fn default_base_url(&self) -> &'static str {
        "https://api.moonshot.cn"
    }

    fn model_list(&self) -> &[ModelConfig] {
        &MODEL_LIST
    }

    fn http_clients(&self) -> &HttpClients {
        &self.clients
    }

    async fn get_request_url(&self, meta: &Meta) -> AppResult<String> {
        self.check_mode(meta.mode)?;
        Ok(format!("{}/v1/chat/completions", meta.base_url()))
    }

    async fn setup_request_header(
        &self,
        meta: &Meta,
        builder: RequestBuilder,
    ) -> AppResult<RequestBuilder> {
        Ok(builder.bearer_auth(&meta.channel.key))
    }

    fn convert_request(&self, meta: &Meta, request: &RelayRequest) -> AppResult<UpstreamBody> {
        self.check_mode(meta.mode)?;
        convert_openai_request(meta, request)
    }

    async fn do_response(
        &self,
        meta: &Meta,
        response: Response,
        writer: &RelayWriter,
    ) -> AppResult<Usage> {
        self.check_mode(meta.mode)?;
        if meta.is_stream {
            stream_handler(meta, response, writer).await
        } else {
            text_handler(meta, response, writer).await
        }
    }

    fn key_validator(&self) -> Option<&dyn KeyValidator> {
        Some(self)
    }

    fn balancer(&self) -> Option<&dyn Balancer> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::channel::ChannelType;
    use crate::models::openai::ImageRequest;
    use std::sync::Arc;

    #[test]
    fn test_only_chat_is_supported() {
        let adaptor = MoonshotAdaptor::new(HttpClients::with_timeouts(5, 5).unwrap());
        let channel = Arc::new(Channel::new(1, ChannelType::Moonshot, "sk"));
        let meta = Meta::new(Mode::ImagesGenerations, channel, "moonshot-v1-8k", false);
        let request = RelayRequest::Image(ImageRequest {
            model: "moonshot-v1-8k".into(),
            prompt: "a cat".into(),
            ..Default::default()
        });
        assert!(matches!(
            adaptor.convert_request(&meta, &request),
            Err(AppError::UnsupportedMode { .. })
        ));
    }
}
