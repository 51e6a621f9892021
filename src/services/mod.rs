//! Service layer module
//!
//! Relay pipeline, adaptor registry, validation, and the stream and usage
//! machinery shared by the adaptors.

pub mod registry;
pub mod relay;
pub mod stream;
pub mod usage;
pub mod validator;
pub mod writer;

pub use registry::AdaptorRegistry;
pub use relay::Relay;
pub use writer::{RelayFrame, RelayWriter};
