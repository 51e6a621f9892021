//! Inline image helpers

use crate::utils::error::{AppError, AppResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Decoded form of a `data:<mime>;base64,<payload>` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: String,
    /// Base64 payload, kept encoded
    pub data: String,
}

pub fn is_data_url(url: &str) -> bool {
    url.starts_with("data:")
}

/// Parse a base64 data URL, validating the payload
pub fn parse_data_url(url: &str) -> AppResult<InlineImage> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| AppError::Conversion("image is not a data URL".to_string()))?;
    let (header, data) = rest
        .split_once(',')
        .ok_or_else(|| AppError::Conversion("malformed data URL".to_string()))?;
    let mime_type = header
        .strip_suffix(";base64")
        .ok_or_else(|| AppError::Conversion("only base64 data URLs are supported".to_string()))?;

    if mime_type.is_empty() || !mime_type.starts_with("image/") {
        return Err(AppError::Conversion(format!("unsupported image type '{}'", mime_type)));
    }
    STANDARD
        .decode(data)
        .map_err(|e| AppError::Conversion(format!("invalid base64 image: {}", e)))?;

    Ok(InlineImage {
        mime_type: mime_type.to_string(),
        data: data.to_string(),
    })
}

/// Guess an image mime type from a URL extension
pub fn mime_from_url(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else if path.ends_with(".svg") {
        "image/svg+xml"
    } else {
        "image/jpeg"
    }
}
