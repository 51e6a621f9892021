//! Utilities module
//!
//! Error handling, token counting, access token caching, logging and
//! reasoning split helpers

pub mod error;
pub mod image;
pub mod logging;
pub mod think;
pub mod token_cache;
pub mod tokenizer;
