//! Gemini-style provider client for generation and verification.
//!
//! Both capabilities go through a `models/<model>:generateContent`
//! endpoint: generation sends the instruction plus inline image data and
//! expects an inline image back; verification sends both images plus the
//! compliance context and expects a JSON verdict embedded in the reply
//! text. Provider output is never trusted for shape — every response is
//! parsed into a typed result or rejected with a classified error.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::codec::{self, ImageData};
use crate::config::RetouchConfig;
use crate::errors::{ProviderError, ProviderErrorKind};
use crate::fixer::{ComponentScores, VerificationResult};
use crate::provider::{
    GeneratedImage, GenerationRequest, ImageGenerator, ImageVerifier, VerificationRequest,
};

use async_trait::async_trait;

/// HTTP client for the generation and verification capabilities.
pub struct GeminiClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    generation_model: String,
    verification_model: String,
}

impl GeminiClient {
    pub fn new(config: &RetouchConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            generation_model: config.generation_model.clone(),
            verification_model: config.verification_model.clone(),
        })
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.api_base, model)
    }

    /// POST one generateContent call and decode the response envelope,
    /// classifying HTTP and transport failures on the way.
    async fn call(
        &self,
        model: &str,
        body: serde_json::Value,
    ) -> Result<GenerateContentResponse, ProviderError> {
        let response = self
            .http
            .post(self.endpoint(model))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::classify(status.as_u16(), &body));
        }

        response
            .json::<GenerateContentResponse>()
            .await
            .map_err(|e| {
                ProviderError::new(
                    ProviderErrorKind::Unknown,
                    format!("unparseable provider response: {}", e),
                )
            })
    }
}

#[async_trait]
impl ImageGenerator for GeminiClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, ProviderError> {
        let mut parts = vec![json!({ "text": request.instruction })];
        parts.push(inline_part(&request.image));
        if let Some(reference) = &request.reference {
            parts.push(json!({ "text": "Reference main image for product identity:" }));
            parts.push(inline_part(reference));
        }

        let body = json!({ "contents": [{ "role": "user", "parts": parts }] });
        debug!(model = %self.generation_model, "dispatching generation call");
        let response = self.call(&self.generation_model, body).await?;
        let image = extract_generated_image(&response)?;
        Ok(GeneratedImage { image })
    }
}

#[async_trait]
impl ImageVerifier for GeminiClient {
    async fn verify(
        &self,
        request: &VerificationRequest,
    ) -> Result<VerificationResult, ProviderError> {
        let parts = vec![
            json!({ "text": build_verification_prompt(request) }),
            json!({ "text": "Generated image:" }),
            inline_part(&request.generated),
            json!({ "text": "Original image:" }),
            inline_part(&request.original),
        ];

        let body = json!({ "contents": [{ "role": "user", "parts": parts }] });
        debug!(model = %self.verification_model, "dispatching verification call");
        let response = self.call(&self.verification_model, body).await?;
        let text = collect_text(&response);
        parse_verification(&text)
    }
}

fn inline_part(image: &ImageData) -> serde_json::Value {
    json!({
        "inline_data": {
            "mime_type": image.media_type,
            "data": image.data,
        }
    })
}

/// Instruction for the verification call. Asks for a strict JSON verdict
/// so the reply can be parsed into [`VerificationResult`].
fn build_verification_prompt(request: &VerificationRequest) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You are a marketplace image compliance verifier. Compare the \
         generated image against the original and judge whether the \
         generated image fixes the violations below without changing the \
         product's identity.\n\n",
    );

    if let Some(context) = &request.compliance.listing_context {
        prompt.push_str(&format!("Listing context: {}\n\n", context));
    }

    if !request.compliance.violations.is_empty() {
        prompt.push_str("Violations to fix:\n");
        for violation in &request.compliance.violations {
            prompt.push_str(&format!(
                "- [{}] {}: {}\n",
                violation.severity, violation.category, violation.message
            ));
        }
        prompt.push('\n');
    }

    prompt.push_str(
        "Reply with a JSON object: {\"score\": 0-100, \"satisfactory\": bool, \
         \"product_match\": bool, \"components\": {\"identity\": 0-100, \
         \"compliance\": 0-100, \"quality\": 0-100, \"no_new_issues\": 0-100}, \
         \"critique\": string, \"improvements\": [string], \
         \"passed_checks\": [string], \"failed_checks\": [string], \
         \"reasoning\": [string]}. Think step by step in the reasoning list.",
    );
    prompt
}

// ── Response envelope ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default, rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "inlineData", alias = "inline_data")]
    inline_data: Option<InlinePayload>,
}

#[derive(Debug, Deserialize)]
struct InlinePayload {
    #[serde(rename = "mimeType", alias = "mime_type", default)]
    mime_type: Option<String>,
    data: String,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(default, rename = "blockReason")]
    block_reason: Option<String>,
}

/// Pull the generated image out of a response, mapping provider refusals
/// onto the error taxonomy: SAFETY → `safety_block`, RECITATION →
/// `image_recitation`, an image-less response → `no_image_returned`.
fn extract_generated_image(
    response: &GenerateContentResponse,
) -> Result<ImageData, ProviderError> {
    if let Some(feedback) = &response.prompt_feedback
        && let Some(reason) = &feedback.block_reason
    {
        return Err(ProviderError::new(
            ProviderErrorKind::SafetyBlock,
            format!("generation request blocked: {}", reason),
        ));
    }

    let candidate = response.candidates.first().ok_or_else(|| {
        ProviderError::new(
            ProviderErrorKind::NoImageReturned,
            "provider returned no candidates",
        )
    })?;

    match candidate.finish_reason.as_deref() {
        Some("SAFETY") | Some("IMAGE_SAFETY") => {
            return Err(ProviderError::new(
                ProviderErrorKind::SafetyBlock,
                "generation declined on safety grounds",
            ));
        }
        Some("RECITATION") => {
            return Err(ProviderError::new(
                ProviderErrorKind::ImageRecitation,
                "generation declined over recitation concerns",
            ));
        }
        _ => {}
    }

    let inline = candidate
        .content
        .as_ref()
        .and_then(|c| c.parts.iter().find_map(|p| p.inline_data.as_ref()))
        .ok_or_else(|| {
            ProviderError::new(
                ProviderErrorKind::NoImageReturned,
                "response lacked image data",
            )
        })?;

    // Re-run the codec so declared types are normalized and sniffed the
    // same way caller payloads are.
    match inline.mime_type.as_deref() {
        Some(mime) => Ok(codec::extract(&format!(
            "data:{};base64,{}",
            mime, inline.data
        ))),
        None => Ok(codec::extract(&inline.data)),
    }
}

/// Concatenated text of every text part in the first candidate.
fn collect_text(response: &GenerateContentResponse) -> String {
    response
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

// ── Verification reply parsing ───────────────────────────────────────

/// Verdict shape as the model writes it; tolerant of camelCase keys.
#[derive(Debug, Deserialize)]
struct WireVerdict {
    score: f64,
    #[serde(default, alias = "isSatisfactory")]
    satisfactory: bool,
    #[serde(default, alias = "productMatch")]
    product_match: bool,
    #[serde(default)]
    components: Option<WireComponents>,
    #[serde(default)]
    critique: String,
    #[serde(default)]
    improvements: Vec<String>,
    #[serde(default, alias = "passedChecks")]
    passed_checks: Vec<String>,
    #[serde(default, alias = "failedChecks")]
    failed_checks: Vec<String>,
    #[serde(default, alias = "thinkingSteps")]
    reasoning: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireComponents {
    #[serde(default)]
    identity: f64,
    #[serde(default)]
    compliance: f64,
    #[serde(default)]
    quality: f64,
    #[serde(default, alias = "noNewIssues")]
    no_new_issues: f64,
    #[serde(default, alias = "textLayout")]
    text_layout: Option<f64>,
    #[serde(default, alias = "noAdditions")]
    no_additions: Option<f64>,
}

fn clamp_score(raw: f64) -> u8 {
    raw.clamp(0.0, 100.0).round() as u8
}

/// Parse a verification reply (free text with an embedded JSON verdict)
/// into a typed result, or fail with `unknown`.
///
/// Priority: a fenced ```json block, then the first top-level `{...}`
/// span. Scores are clamped to 0–100.
pub fn parse_verification(text: &str) -> Result<VerificationResult, ProviderError> {
    let json_block = extract_json_block(text).ok_or_else(|| {
        ProviderError::new(
            ProviderErrorKind::Unknown,
            "verification reply contained no JSON verdict",
        )
    })?;

    let wire: WireVerdict = serde_json::from_str(&json_block).map_err(|e| {
        ProviderError::new(
            ProviderErrorKind::Unknown,
            format!("verification verdict did not match expected shape: {}", e),
        )
    })?;

    Ok(VerificationResult {
        score: clamp_score(wire.score),
        satisfactory: wire.satisfactory,
        product_match: wire.product_match,
        components: wire.components.map(|c| ComponentScores {
            identity: clamp_score(c.identity),
            compliance: clamp_score(c.compliance),
            quality: clamp_score(c.quality),
            no_new_issues: clamp_score(c.no_new_issues),
            text_layout: c.text_layout.map(clamp_score),
            no_additions: c.no_additions.map(clamp_score),
        }),
        critique: wire.critique,
        improvements: wire.improvements,
        passed_checks: wire.passed_checks,
        failed_checks: wire.failed_checks,
        reasoning: wire.reasoning,
    })
}

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fence regex is valid")
    })
}

/// Locate the JSON verdict inside a free-text reply.
fn extract_json_block(text: &str) -> Option<String> {
    if let Some(captures) = fence_regex().captures(text) {
        return Some(captures[1].to_string());
    }

    // Fall back to the first balanced top-level object.
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..=start + offset].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
