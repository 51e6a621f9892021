//! airelay library
//!
//! Relays OpenAI-compatible requests to many upstream model providers. Each
//! provider is an [`adaptors::Adaptor`] that converts the canonical request,
//! calls the upstream and normalizes the answer back, streaming or not.

pub mod adaptors;
pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

// Re-export common types
pub use adaptors::{Adaptor, HttpClients};
pub use config::{AppConfig, Settings};
pub use handlers::{create_router, AppState};
pub use models::{channel, meta, mode, openai};
pub use services::{AdaptorRegistry, Relay, RelayFrame, RelayWriter};
pub use utils::error::{AppError, AppResult};
pub use utils::token_cache::TokenCache;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Library description
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get version information
pub fn version_info() -> String {
    format!("{} v{} - {}", NAME, VERSION, DESCRIPTION)
}
