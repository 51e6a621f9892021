//! Channels and static model metadata
//!
//! A channel is one configured credential/endpoint for a provider. Model
//! metadata is compiled into each adaptor's model list.

use crate::models::mode::Mode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Provider kind of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    OpenAI,
    Moonshot,
    Anthropic,
    Ollama,
    Baidu,
    Gemini,
    VertexAI,
    Doc2x,
}

impl ChannelType {
    pub const ALL: [ChannelType; 8] = [
        ChannelType::OpenAI,
        ChannelType::Moonshot,
        ChannelType::Anthropic,
        ChannelType::Ollama,
        ChannelType::Baidu,
        ChannelType::Gemini,
        ChannelType::VertexAI,
        ChannelType::Doc2x,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::OpenAI => "openai",
            ChannelType::Moonshot => "moonshot",
            ChannelType::Anthropic => "anthropic",
            ChannelType::Ollama => "ollama",
            ChannelType::Baidu => "baidu",
            ChannelType::Gemini => "gemini",
            ChannelType::VertexAI => "vertexai",
            ChannelType::Doc2x => "doc2x",
        }
    }

    /// Default upstream base URL; empty when it is derived per request
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ChannelType::OpenAI => "https://api.openai.com",
            ChannelType::Moonshot => "https://api.moonshot.cn",
            ChannelType::Anthropic => "https://api.anthropic.com",
            ChannelType::Ollama => "http://localhost:11434",
            ChannelType::Baidu => "https://aip.baidubce.com",
            ChannelType::Gemini => "https://generativelanguage.googleapis.com",
            ChannelType::VertexAI => "",
            ChannelType::Doc2x => "https://v2.doc2x.noedgeai.com",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    Disabled,
}

/// Provider specific channel options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(rename = "apiVersion", skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Extra headers sent on every upstream request
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Move a leading `<think>` block into `reasoning_content`
    #[serde(rename = "splitThink", default, skip_serializing_if = "std::ops::Not::not")]
    pub split_think: bool,
}

/// Configured upstream channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    /// Empty means the provider default
    #[serde(rename = "baseUrl", default)]
    pub base_url: String,
    /// Provider-defined key material
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub config: ChannelConfig,
    /// Served models; empty means the adaptor's full list
    #[serde(default)]
    pub models: Vec<String>,
    /// Origin model -> upstream model
    #[serde(rename = "modelMapping", default)]
    pub model_mapping: HashMap<String, String>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub status: ChannelStatus,
}

fn default_priority() -> i64 {
    100
}

impl Channel {
    pub fn new(id: u32, channel_type: ChannelType, key: impl Into<String>) -> Self {
        Self {
            id,
            name: format!("{}-{}", channel_type, id),
            channel_type,
            base_url: String::new(),
            key: key.into(),
            config: ChannelConfig::default(),
            models: Vec::new(),
            model_mapping: HashMap::new(),
            priority: default_priority(),
            status: ChannelStatus::Enabled,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_mapping(mut self, origin: &str, actual: &str) -> Self {
        self.model_mapping.insert(origin.to_string(), actual.to_string());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Effective base URL without a trailing slash
    pub fn base_url(&self) -> String {
        let url = if self.base_url.is_empty() {
            self.channel_type.default_base_url()
        } else {
            self.base_url.as_str()
        };
        url.trim_end_matches('/').to_string()
    }

    /// Upstream model name for a requested model
    pub fn mapped_model(&self, origin: &str) -> String {
        self.model_mapping
            .get(origin)
            .cloned()
            .unwrap_or_else(|| origin.to_string())
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }
}

/// Per-size image price
#[derive(Debug, Clone, Serialize)]
pub struct ImagePrice {
    pub size: &'static str,
    pub price: f64,
}

/// Static per-model metadata
#[derive(Debug, Clone, Serialize)]
pub struct ModelConfig {
    pub model: &'static str,
    #[serde(rename = "type")]
    pub mode: Mode,
    pub owner: &'static str,
    /// Price per 1K input tokens
    pub input_price: f64,
    /// Price per 1K output tokens
    pub output_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_input_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    pub vision: bool,
    pub tool_choice: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub voices: Vec<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub image_prices: Vec<ImagePrice>,
}

impl ModelConfig {
    pub fn new(model: &'static str, mode: Mode, owner: &'static str) -> Self {
        Self {
            model,
            mode,
            owner,
            input_price: 0.0,
            output_price: 0.0,
            max_context_tokens: None,
            max_input_tokens: None,
            max_output_tokens: None,
            vision: false,
            tool_choice: false,
            voices: Vec::new(),
            image_prices: Vec::new(),
        }
    }

    pub fn price(mut self, input: f64, output: f64) -> Self {
        self.input_price = input;
        self.output_price = output;
        self
    }

    pub fn context(mut self, max_context: u32, max_output: u32) -> Self {
        self.max_context_tokens = Some(max_context);
        self.max_output_tokens = Some(max_output);
        self
    }

    pub fn max_input(mut self, max_input: u32) -> Self {
        self.max_input_tokens = Some(max_input);
        self
    }

    pub fn vision(mut self) -> Self {
        self.vision = true;
        self
    }

    pub fn tools(mut self) -> Self {
        self.tool_choice = true;
        self
    }

    pub fn voices(mut self, voices: &[&'static str]) -> Self {
        self.voices = voices.to_vec();
        self
    }

    pub fn image_prices(mut self, prices: &[(&'static str, f64)]) -> Self {
        self.image_prices = prices
            .iter()
            .map(|(size, price)| ImagePrice { size, price: *price })
            .collect();
        self
    }
}
