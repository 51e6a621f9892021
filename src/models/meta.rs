//! Per-request execution context

use crate::models::channel::Channel;
use crate::models::mode::Mode;
use std::collections::HashMap;
use std::sync::Arc;

/// Output format of a multipart upload, set before `init`
pub const META_RESPONSE_FORMAT: &str = "response_format";

/// Context shared by every relay stage of one inbound request
#[derive(Debug, Clone)]
pub struct Meta {
    pub mode: Mode,
    pub channel: Arc<Channel>,
    /// Model name as requested by the caller
    pub origin_model: String,
    /// Model name sent upstream after channel mapping
    pub actual_model: String,
    pub is_stream: bool,
    /// Pre-counted prompt tokens
    pub input_tokens: u32,
    pub request_id: String,
    values: HashMap<String, String>,
}

impl Meta {
    pub fn new(mode: Mode, channel: Arc<Channel>, origin_model: &str, is_stream: bool) -> Self {
        let actual_model = channel.mapped_model(origin_model);
        Self {
            mode,
            channel,
            origin_model: origin_model.to_string(),
            actual_model,
            is_stream,
            input_tokens: 0,
            request_id: uuid::Uuid::new_v4().to_string(),
            values: HashMap::new(),
        }
    }

    pub fn with_input_tokens(mut self, input_tokens: u32) -> Self {
        self.input_tokens = input_tokens;
        self
    }

    pub fn base_url(&self) -> String {
        self.channel.base_url()
    }

    /// API version from the channel config, or the provider default
    pub fn api_version<'a>(&'a self, default: &'a str) -> &'a str {
        self.channel
            .config
            .api_version
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or(default)
    }

    /// Store a scratch value (only before dispatch and during `init`)
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::channel::ChannelType;

    #[test]
    fn test_meta_applies_mapping() {
        let channel =
            Arc::new(Channel::new(1, ChannelType::OpenAI, "sk").with_mapping("gpt-4", "gpt-4o"));
        let mut meta = Meta::new(Mode::ChatCompletions, channel, "gpt-4", false);
        assert_eq!(meta.origin_model, "gpt-4");
        assert_eq!(meta.actual_model, "gpt-4o");
        assert_eq!(meta.api_version("v1"), "v1");

        meta.set("region", "us-central1");
        assert_eq!(meta.get("region"), Some("us-central1"));
        assert_eq!(meta.get("missing"), None);
    }
}
