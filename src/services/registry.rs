//! Adaptor registry
//!
//! Maps each channel type to the adaptor implementing it.

use crate::adaptors::{
    Adaptor, AnthropicAdaptor, BaiduAdaptor, Doc2xAdaptor, GeminiAdaptor, HttpClients,
    MoonshotAdaptor, OllamaAdaptor, OpenAIAdaptor, VertexAIAdaptor,
};
use crate::models::channel::{Channel, ChannelType};
use crate::utils::error::{AppError, AppResult};
use crate::utils::token_cache::TokenCache;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Read-only table of adaptors, built once at startup
pub struct AdaptorRegistry {
    adaptors: HashMap<ChannelType, Arc<dyn Adaptor>>,
}

impl AdaptorRegistry {
    /// Registry with every built-in adaptor
    pub fn new(clients: HttpClients, tokens: Arc<TokenCache>) -> Self {
        let mut registry = Self::empty();
        registry.register(ChannelType::OpenAI, Arc::new(OpenAIAdaptor::new(clients.clone())));
        registry.register(ChannelType::Moonshot, Arc::new(MoonshotAdaptor::new(clients.clone())));
        registry.register(ChannelType::Anthropic, Arc::new(AnthropicAdaptor::new(clients.clone())));
        registry.register(ChannelType::Ollama, Arc::new(OllamaAdaptor::new(clients.clone())));
        registry.register(
            ChannelType::Baidu,
            Arc::new(BaiduAdaptor::new(clients.clone(), Arc::clone(&tokens))),
        );
        registry.register(ChannelType::Gemini, Arc::new(GeminiAdaptor::new(clients.clone())));
        registry.register(
            ChannelType::VertexAI,
            Arc::new(VertexAIAdaptor::new(clients.clone(), tokens)),
        );
        registry.register(ChannelType::Doc2x, Arc::new(Doc2xAdaptor::new(clients)));

        info!("Adaptor registry initialized with {} adaptors", registry.adaptors.len());
        registry
    }

    pub fn empty() -> Self {
        Self {
            adaptors: HashMap::new(),
        }
    }

    /// Add or replace the adaptor for a channel type
    pub fn register(&mut self, channel_type: ChannelType, adaptor: Arc<dyn Adaptor>) {
        self.adaptors.insert(channel_type, adaptor);
    }

    pub fn get_adaptor(&self, channel_type: ChannelType) -> Option<Arc<dyn Adaptor>> {
        self.adaptors.get(&channel_type).cloned()
    }

    fn require(&self, channel_type: ChannelType) -> AppResult<Arc<dyn Adaptor>> {
        self.get_adaptor(channel_type).ok_or_else(|| {
            AppError::NotFound(format!(
                "no adaptor registered for channel type '{}'",
                channel_type
            ))
        })
    }

    /// Check a channel's key format and model list against its adaptor
    ///
    /// Purely local: no upstream call is made.
    pub fn validate_channel(&self, channel: &Channel) -> AppResult<()> {
        let adaptor = self.require(channel.channel_type)?;

        if let Some(validator) = adaptor.key_validator() {
            validator.validate_key(&channel.key).map_err(|e| match e {
                AppError::Credential(message) => AppError::Credential(format!(
                    "channel {} ({}): {}",
                    channel.id, channel.name, message
                )),
                other => other,
            })?;
        }

        for model in &channel.models {
            let served = adaptor.model_list().iter().any(|m| m.model == model.as_str())
                || channel.model_mapping.contains_key(model);
            if !served {
                return Err(AppError::Validation(format!(
                    "channel {} ({}): model '{}' is not served by {}",
                    channel.id,
                    channel.name,
                    model,
                    adaptor.channel_name()
                )));
            }
        }

        debug!("Validated channel {} ({})", channel.id, channel.name);
        Ok(())
    }

    /// Remaining balance of a channel, if its provider exposes one
    pub async fn get_balance(&self, channel: &Channel) -> AppResult<f64> {
        let adaptor = self.require(channel.channel_type)?;
        match adaptor.balancer() {
            Some(balancer) => balancer.get_balance(channel).await,
            None => Err(AppError::BalanceNotImplemented(adaptor.channel_name().to_string())),
        }
    }

    pub fn len(&self) -> usize {
        self.adaptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adaptors.is_empty()
    }
}
