//! Data models module
//!
//! Canonical request/response types, channels, relay modes and the
//! per-request execution context

pub mod channel;
pub mod meta;
pub mod mode;
pub mod openai;

pub use channel::{Channel, ChannelType, ModelConfig};
pub use meta::Meta;
pub use mode::Mode;
pub use openai::{GeneralOpenAIRequest, RelayRequest, Usage};
