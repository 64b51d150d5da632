//! External capability contracts and the resilient call layer.
//!
//! The fix loop talks to two capabilities: image generation and image
//! verification. Both are abstracted behind async traits for
//! testability — real implementation: [`gemini::GeminiClient`]; test
//! doubles: scripted impls in the integration tests.

pub mod gemini;
pub mod invoker;

pub use invoker::{RetryPolicy, invoke};

use async_trait::async_trait;

use crate::codec::ImageData;
use crate::errors::ProviderError;
use crate::fixer::{ComplianceResult, VerificationResult};

/// Request to the generation capability.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Composed instruction text.
    pub instruction: String,
    /// The image to regenerate.
    pub image: ImageData,
    /// Listing main image, supplied for secondary-image runs so the
    /// generator keeps the product identity consistent.
    pub reference: Option<ImageData>,
}

/// A successful generation response.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub image: ImageData,
}

/// Request to the verification capability.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    /// The freshly generated candidate.
    pub generated: ImageData,
    /// The original asset image it was derived from.
    pub original: ImageData,
    /// Compliance context the verifier judges against.
    pub compliance: ComplianceResult,
}

/// The image-generation capability.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, ProviderError>;
}

/// The verification/critique capability.
#[async_trait]
pub trait ImageVerifier: Send + Sync {
    async fn verify(
        &self,
        request: &VerificationRequest,
    ) -> Result<VerificationResult, ProviderError>;
}
