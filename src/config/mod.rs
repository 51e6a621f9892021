//! Configuration management module
//!
//! Channels and the listen address come from a JSON file; timeouts, limits
//! and logging come from the environment.

pub mod file;
pub mod settings;

pub use file::{AppConfig, ServerConfig};
pub use settings::Settings;
