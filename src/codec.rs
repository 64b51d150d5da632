//! Normalizes opaque image payloads into a (media type, base64 body) pair.
//!
//! Payloads arrive either as self-describing `data:` URIs or as bare
//! base64. The adapter is deterministic and side-effect-free: its output
//! goes straight into generation and verification requests, so the same
//! input must always produce the same output.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// Media types we accept from a data-URI declaration. Anything else is
/// re-derived by signature sniffing.
const ALLOWED_MEDIA_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/gif"];

/// Fallback when neither the declaration nor the signature identifies the
/// payload. Marketplace uploads are overwhelmingly JPEG.
const DEFAULT_MEDIA_TYPE: &str = "image/jpeg";

/// A normalized image payload: media type plus base64-encoded body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    pub media_type: String,
    /// Base64-encoded image bytes (standard alphabet, padded).
    pub data: String,
}

impl ImageData {
    pub fn new(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    /// Render back to a self-describing data URI.
    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data)
    }

    /// Decode the base64 body into raw bytes.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(self.data.trim())
    }
}

/// Normalize an opaque payload into `(media_type, base64 body)`.
///
/// `data:` URIs have their declared media type honored when it is on the
/// allow-list (after `image/jpg` → `image/jpeg` normalization); otherwise
/// the type is re-derived from the decoded body's leading bytes. Bare
/// payloads are treated as base64 and always sniffed.
pub fn extract(payload: &str) -> ImageData {
    let trimmed = payload.trim();

    if let Some(rest) = trimmed.strip_prefix("data:") {
        if let Some((header, body)) = rest.split_once(',') {
            let declared = header
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            let media_type = normalize_media_type(&declared)
                .unwrap_or_else(|| sniff_media_type(body).to_string());
            return ImageData::new(media_type, body.trim().to_string());
        }
    }

    ImageData::new(sniff_media_type(trimmed), trimmed.to_string())
}

/// Map a declared media type onto the allow-list, or `None` if it must be
/// replaced by sniffing.
fn normalize_media_type(declared: &str) -> Option<String> {
    let normalized = if declared == "image/jpg" {
        "image/jpeg"
    } else {
        declared
    };
    ALLOWED_MEDIA_TYPES
        .contains(&normalized)
        .then(|| normalized.to_string())
}

/// Infer a media type from the payload's magic prefix.
///
/// Only a short prefix of the body is decoded; a WEBP signature needs the
/// first 12 bytes (`RIFF....WEBP`).
fn sniff_media_type(body: &str) -> &'static str {
    let prefix = decode_prefix(body, 12);
    match prefix.as_slice() {
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => DEFAULT_MEDIA_TYPE,
    }
}

/// Decode just enough leading base64 to expose `want` raw bytes.
fn decode_prefix(body: &str, want: usize) -> Vec<u8> {
    // 4 base64 chars decode to 3 bytes; take whole quads so the slice is
    // valid on its own.
    let quads = want.div_ceil(3) + 1;
    let take = (quads * 4).min(body.len());
    let head: String = body
        .chars()
        .filter(|c| c.is_ascii() && !c.is_whitespace())
        .take(take)
        .collect();
    // Truncate to a quad boundary so the slice decodes on its own.
    let aligned = &head[..head.len() - head.len() % 4];
    BASE64.decode(aligned).unwrap_or_default()
}
