//! Typed error hierarchy for the Retouch fix loop.
//!
//! Two layers:
//! - `ProviderError` — a single external call failed; carries the stable
//!   error kind and whether the invoker may retry it
//! - `FixError` — the fix surface rejected a request (unknown asset,
//!   invalid options, run bookkeeping)

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable classification of provider failures.
///
/// Kinds are wire-stable (serialized into progress snapshots) so callers
/// can render a specific explanation instead of a generic failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Provider throttled the call (HTTP 429).
    RateLimit,
    /// Credentials rejected (HTTP 403).
    AuthError,
    /// Provider declined the request on safety-policy grounds.
    SafetyBlock,
    /// Malformed request (HTTP 400 without a safety marker).
    BadRequest,
    /// Provider-side failure (HTTP 5xx).
    ServerError,
    /// Provider declined generation over near-duplicate/recitation concerns.
    ImageRecitation,
    /// Generation response contained no image data.
    NoImageReturned,
    /// Anything we could not classify.
    Unknown,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::AuthError => "auth_error",
            Self::SafetyBlock => "safety_block",
            Self::BadRequest => "bad_request",
            Self::ServerError => "server_error",
            Self::ImageRecitation => "image_recitation",
            Self::NoImageReturned => "no_image_returned",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed call to the generation or verification capability.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    /// HTTP status, when the failure came with a response.
    pub status: Option<u16>,
    /// Whether the resilient invoker may retry this call.
    pub retryable: bool,
}

/// Markers that identify a 400 as a safety-policy rejection rather than a
/// plain bad request. Matched case-insensitively against the provider's
/// own error message.
const SAFETY_MARKERS: &[&str] = &["safety", "blocked by policy", "prohibited content"];

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            ProviderErrorKind::RateLimit | ProviderErrorKind::ServerError
        );
        Self {
            kind,
            message: message.into(),
            status: None,
            retryable,
        }
    }

    /// A transport-level failure with no HTTP response at all.
    /// Treated as retryable until the invoker's final attempt.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Unknown,
            message: message.into(),
            status: None,
            retryable: true,
        }
    }

    /// Classify a provider HTTP failure from its status code and raw body.
    ///
    /// Policy, evaluated in order:
    /// - 429 → `rate_limit`, retryable
    /// - 403 → `auth_error`, not retryable
    /// - 400 with a safety marker in the provider message → `safety_block`
    /// - other 400 → `bad_request`, message includes the provider's own
    /// - 5xx → `server_error`, retryable
    /// - anything else → `unknown`, retryable only when status >= 500
    ///
    /// Bodies that are not parseable JSON fall back to a generic message
    /// built from the status code alone, classified the same way.
    pub fn classify(status: u16, body: &str) -> Self {
        let provider_message = extract_provider_message(body);

        let (kind, message, retryable) = match status {
            429 => (
                ProviderErrorKind::RateLimit,
                provider_message.unwrap_or_else(|| "rate limit exceeded".to_string()),
                true,
            ),
            403 => (
                ProviderErrorKind::AuthError,
                provider_message.unwrap_or_else(|| "authentication rejected".to_string()),
                false,
            ),
            400 => {
                let msg =
                    provider_message.unwrap_or_else(|| format!("bad request (HTTP {})", status));
                let lowered = msg.to_lowercase();
                if SAFETY_MARKERS.iter().any(|m| lowered.contains(m)) {
                    (ProviderErrorKind::SafetyBlock, msg, false)
                } else {
                    (ProviderErrorKind::BadRequest, msg, false)
                }
            }
            s if s >= 500 => (
                ProviderErrorKind::ServerError,
                provider_message.unwrap_or_else(|| format!("provider error (HTTP {})", s)),
                true,
            ),
            s => (
                ProviderErrorKind::Unknown,
                provider_message.unwrap_or_else(|| format!("unexpected response (HTTP {})", s)),
                false,
            ),
        };

        Self {
            kind,
            message,
            status: Some(status),
            retryable,
        }
    }
}

/// Pull the provider's own error message out of a structured error body.
///
/// Understands `{"error": {"message": ...}}` and flat `{"message": ...}`
/// shapes. Returns `None` for unparseable or message-less bodies.
fn extract_provider_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body.trim()).ok()?;
    let message = value
        .get("error")
        .and_then(|e| e.get("message"))
        .or_else(|| value.get("message"))
        .and_then(|m| m.as_str())?;
    let trimmed = message.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Errors from the fix orchestration layer.
#[derive(Debug, Error)]
pub enum FixError {
    #[error("Asset {id} is not registered")]
    UnknownAsset { id: String },

    #[error("A fix run is already active for asset {id}")]
    AlreadyRunning { id: String },

    #[error("No fix run found for asset {id}")]
    NoActiveRun { id: String },

    #[error("maxAttempts must be at least 1 (got {got})")]
    InvalidOptions { got: u32 },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}
