//! Relay pipeline
//!
//! Selects a channel for the requested model and drives its adaptor through
//! init, conversion, the upstream call and response normalization.

use crate::models::channel::{Channel, ModelConfig};
use crate::models::meta::{Meta, META_RESPONSE_FORMAT};
use crate::models::mode::Mode;
use crate::models::openai::{RelayRequest, Usage};
use crate::services::registry::AdaptorRegistry;
use crate::services::validator::validate;
use crate::services::writer::RelayWriter;
use crate::utils::error::{AppError, AppResult};
use crate::utils::tokenizer::count_request_tokens;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Entry of the model listing
#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub channel: String,
    pub config: Option<ModelConfig>,
}

/// Relay core shared by all inbound requests
pub struct Relay {
    registry: AdaptorRegistry,
    channels: Vec<Arc<Channel>>,
}

impl Relay {
    /// Build the relay, rejecting channels that fail validation
    pub fn new(registry: AdaptorRegistry, channels: Vec<Channel>) -> AppResult<Self> {
        for channel in &channels {
            registry.validate_channel(channel)?;
        }
        info!("Relay initialized with {} channels", channels.len());
        Ok(Self {
            registry,
            channels: channels.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn registry(&self) -> &AdaptorRegistry {
        &self.registry
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    fn serves(&self, channel: &Channel, model: &str) -> bool {
        if channel.models.is_empty() {
            return self
                .registry
                .get_adaptor(channel.channel_type)
                .is_some_and(|adaptor| adaptor.model_list().iter().any(|m| m.model == model));
        }
        channel.models.iter().any(|m| m == model)
    }

    /// Enabled channel with the highest priority that serves `model`
    ///
    /// Ties go to the channel listed first in the configuration.
    pub fn select_channel(&self, model: &str) -> AppResult<Arc<Channel>> {
        let mut selected: Option<&Arc<Channel>> = None;
        for channel in self.channels.iter().filter(|c| c.is_enabled() && self.serves(c, model)) {
            if selected.map_or(true, |best| channel.priority > best.priority) {
                selected = Some(channel);
            }
        }

        selected
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(format!("no available channel for model '{}'", model))
            })
    }

    /// Models reachable through enabled channels, without duplicates
    pub fn list_models(&self) -> Vec<ModelEntry> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();

        for channel in self.channels.iter().filter(|c| c.is_enabled()) {
            let Some(adaptor) = self.registry.get_adaptor(channel.channel_type) else {
                continue;
            };
            let names: Vec<String> = if channel.models.is_empty() {
                adaptor.model_list().iter().map(|m| m.model.to_string()).collect()
            } else {
                channel.models.clone()
            };

            for name in names {
                if !seen.insert(name.clone()) {
                    continue;
                }
                let actual = channel.mapped_model(&name);
                let config = adaptor.model_list().iter().find(|m| m.model == actual).cloned();
                entries.push(ModelEntry {
                    id: name,
                    channel: channel.channel_type.to_string(),
                    config,
                });
            }
        }
        entries
    }

    /// Balance of the channel with the given id
    pub async fn channel_balance(&self, channel_id: u32) -> AppResult<f64> {
        let channel = self
            .channels
            .iter()
            .find(|c| c.id == channel_id)
            .ok_or_else(|| AppError::NotFound(format!("channel {} not found", channel_id)))?;
        self.registry.get_balance(channel).await
    }

    /// Relay one request, writing the response through `writer`
    ///
    /// Validation happens before any adaptor is touched.
    pub async fn relay(
        &self,
        mode: Mode,
        request: RelayRequest,
        writer: &RelayWriter,
    ) -> AppResult<Usage> {
        self.relay_with_id(None, mode, request, writer).await
    }

    /// Same as [`Relay::relay`], tagging the relay with an inbound request id
    pub async fn relay_with_id(
        &self,
        request_id: Option<String>,
        mode: Mode,
        request: RelayRequest,
        writer: &RelayWriter,
    ) -> AppResult<Usage> {
        validate(&request, mode)?;

        let channel = self.select_channel(request.model())?;
        let adaptor = self
            .registry
            .get_adaptor(channel.channel_type)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "no adaptor for channel type '{}'",
                    channel.channel_type
                ))
            })?;

        let mut meta = Meta::new(mode, Arc::clone(&channel), request.model(), request.is_stream());
        if let Some(request_id) = request_id {
            meta.request_id = request_id;
        }
        meta.input_tokens = count_request_tokens(&request, &meta.actual_model);
        if let Some(format) = request.response_format() {
            meta.set(META_RESPONSE_FORMAT, format);
        }
        debug!(
            "Relaying {} for {} via channel {} ({}), {} input tokens",
            mode, meta.origin_model, channel.id, channel.channel_type, meta.input_tokens
        );

        adaptor.init(&mut meta)?;
        let body = adaptor.convert_request(&meta, &request)?;
        let response = adaptor.do_request(&meta, body).await?;
        let usage = adaptor.do_response(&meta, response, writer).await?;

        info!(
            request_id = %meta.request_id,
            mode = %mode,
            channel = channel.id,
            channel_type = %channel.channel_type,
            origin_model = %meta.origin_model,
            actual_model = %meta.actual_model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            total_tokens = usage.total_tokens,
            "Relay completed"
        );
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptors::HttpClients;
    use crate::models::channel::{ChannelStatus, ChannelType};
    use crate::utils::token_cache::TokenCache;

    fn relay(channels: Vec<Channel>) -> Relay {
        let registry = AdaptorRegistry::new(
            HttpClients::with_timeouts(5, 5).unwrap(),
            Arc::new(TokenCache::with_system_clock()),
        );
        Relay::new(registry, channels).unwrap()
    }

    #[test]
    fn test_priority_selection() {
        let relay = relay(vec![
            Channel::new(1, ChannelType::OpenAI, "sk-a").with_priority(10),
            Channel::new(2, ChannelType::OpenAI, "sk-b").with_priority(50),
            Channel::new(3, ChannelType::OpenAI, "sk-c").with_priority(50),
        ]);
        assert_eq!(relay.select_channel("gpt-4o").unwrap().id, 2);
    }

    #[test]
    fn test_disabled_and_unknown() {
        let mut disabled = Channel::new(1, ChannelType::Moonshot, "sk").with_priority(1000);
        disabled.status = ChannelStatus::Disabled;
        let relay = relay(vec![disabled, Channel::new(2, ChannelType::Moonshot, "sk")]);

        assert_eq!(relay.select_channel("moonshot-v1-8k").unwrap().id, 2);
        assert!(matches!(relay.select_channel("gpt-4o"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_explicit_models_and_listing() {
        let relay = relay(vec![
            Channel::new(1, ChannelType::OpenAI, "sk")
                .with_models(&["gpt-4o", "fast"])
                .with_mapping("fast", "gpt-4o-mini"),
            Channel::new(2, ChannelType::Moonshot, "sk"),
        ]);
        assert_eq!(relay.select_channel("fast").unwrap().id, 1);
        assert!(relay.select_channel("gpt-4.1").is_err());

        let models = relay.list_models();
        let fast = models.iter().find(|m| m.id == "fast").unwrap();
        assert_eq!(fast.config.as_ref().unwrap().model, "gpt-4o-mini");
        assert!(models.iter().any(|m| m.id == "moonshot-v1-8k" && m.channel == "moonshot"));
    }

    #[test]
    fn test_invalid_channel_rejected() {
        let registry = AdaptorRegistry::new(
            HttpClients::with_timeouts(5, 5).unwrap(),
            Arc::new(TokenCache::with_system_clock()),
        );
        assert!(Relay::new(registry, vec![Channel::new(1, ChannelType::VertexAI, "bad")]).is_err());
    }
}
