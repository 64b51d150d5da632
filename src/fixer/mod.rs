//! Fix-loop domain model.
//!
//! Types shared by the orchestrator, the caller-facing service, and the
//! progress projection:
//!
//! - [`Asset`] / [`ComplianceResult`] / [`Violation`]: the caller's input
//! - [`FixAttempt`] / [`VerificationResult`]: the per-attempt audit trail
//! - [`FixProgressState`]: the externally observable snapshot, replaced
//!   (never mutated in place) on every transition
//! - [`FixOptions`]: per-run knobs

pub mod orchestrator;
pub mod progress;
pub mod service;

pub use orchestrator::FixOrchestrator;
pub use progress::{ProgressStep, StepStatus, project};
pub use service::{FixService, wait_for_terminal};

use serde::{Deserialize, Serialize};

use crate::codec::ImageData;
use crate::errors::{ProviderError, ProviderErrorKind};

/// Minimum verification score treated as a pass.
pub const DEFAULT_SATISFACTION_THRESHOLD: u8 = 80;

/// Default generate→verify attempts per fix run.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Where this image sits in the listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetRole {
    #[default]
    Main,
    Secondary,
}

/// One product image under compliance management.
///
/// Owned by the caller; the fix loop reads `id`/`image` and writes back
/// `fixed_image` on success only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    /// Raw image payload: a data URI or bare base64.
    pub image: String,
    #[serde(default)]
    pub role: AssetRole,
    /// Latest passing regenerated image, if any run has succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_image: Option<ImageData>,
}

impl Asset {
    pub fn new(id: impl Into<String>, image: impl Into<String>, role: AssetRole) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            role,
            fixed_image: None,
        }
    }
}

/// Severity of a single compliance violation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    #[default]
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::Warning => "warning",
            Self::Info => "info",
        };
        f.write_str(s)
    }
}

/// A single rule violation from the upstream compliance analysis.
/// Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub severity: Severity,
    pub category: String,
    pub message: String,
    pub recommendation: String,
    /// Affected region of the image, when the analyzer localized it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Output of the upstream compliance analysis; the fix loop's starting
/// context. Produced once, consumed read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceResult {
    /// Overall score, 0–100.
    pub score: u8,
    pub passed: bool,
    #[serde(default)]
    pub violations: Vec<Violation>,
    /// Free-form fix recommendations from the analyzer.
    #[serde(default)]
    pub recommendations: Vec<String>,
    /// Listing context (title, category line) forwarded to verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_context: Option<String>,
}

impl ComplianceResult {
    /// Violations at the given severity.
    pub fn count_by_severity(&self, severity: Severity) -> usize {
        self.violations
            .iter()
            .filter(|v| v.severity == severity)
            .count()
    }

    /// Violation recommendations, most severe first, for prompt targeting.
    pub fn ordered_recommendations(&self) -> Vec<String> {
        let mut sorted: Vec<&Violation> = self.violations.iter().collect();
        sorted.sort_by_key(|v| v.severity);
        sorted
            .iter()
            .map(|v| v.recommendation.clone())
            .filter(|r| !r.is_empty())
            .collect()
    }
}

/// Per-dimension verification scores, 0–100 each.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub identity: u8,
    pub compliance: u8,
    pub quality: u8,
    pub no_new_issues: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_layout: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_additions: Option<u8>,
}

/// One verification call's judgement of a generated image.
/// Produced once per attempt; immutable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Satisfaction score, 0–100.
    pub score: u8,
    /// Provider's own pass verdict. Recomputed locally against the
    /// configured threshold before any decision is made.
    #[serde(default)]
    pub satisfactory: bool,
    /// Whether the generated image still shows the same product.
    #[serde(default)]
    pub product_match: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentScores>,
    /// Free-form critique; feeds the next attempt's instruction.
    #[serde(default)]
    pub critique: String,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default)]
    pub passed_checks: Vec<String>,
    #[serde(default)]
    pub failed_checks: Vec<String>,
    /// Step-by-step reasoning trace for live display.
    #[serde(default)]
    pub reasoning: Vec<String>,
}

impl VerificationResult {
    /// The satisfaction rule: score at or above the threshold AND the
    /// product identity preserved.
    pub fn is_satisfactory(&self, threshold: u8) -> bool {
        self.score >= threshold && self.product_match
    }
}

/// Lifecycle of one generate→verify cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Generating,
    Verifying,
    Passed,
    Failed,
    Error,
}

/// One generate→verify cycle within a fix run.
///
/// Created at the start of each loop iteration and never mutated after
/// the iteration completes; retries append a new attempt instead of
/// overwriting. The ordered sequence is the complete audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixAttempt {
    /// 1-based attempt index.
    pub index: u32,
    pub status: AttemptStatus,
    /// The generated image, once generation succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl FixAttempt {
    pub fn begin(index: u32) -> Self {
        Self {
            index,
            status: AttemptStatus::Generating,
            image: None,
            verification: None,
            started_at: chrono::Utc::now(),
        }
    }

    /// Verification score, when this attempt completed verification.
    pub fn score(&self) -> Option<u8> {
        self.verification.as_ref().map(|v| v.score)
    }
}

/// Coarse phase of the whole fix run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixPhase {
    Generating,
    Verifying,
    Retrying,
    Complete,
    Error,
}

impl FixPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// A provider failure surfaced verbatim to the caller: stable kind plus
/// the provider's own message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixFailure {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl From<&ProviderError> for FixFailure {
    fn from(err: &ProviderError) -> Self {
        Self {
            kind: err.kind,
            message: err.message.clone(),
        }
    }
}

/// The externally observable state of one asset's fix run.
///
/// Replaced wholesale (behind an `Arc`) on every transition so concurrent
/// readers never observe a torn snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixProgressState {
    pub asset_id: String,
    /// Current attempt number, 1-based.
    pub attempt: u32,
    pub max_attempts: u32,
    pub phase: FixPhase,
    /// Full audit trail, oldest first.
    pub attempts: Vec<FixAttempt>,
    /// Accumulating live reasoning trace across all verifications.
    pub thinking: Vec<String>,
    /// Critique text from the most recent verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_critique: Option<String>,
    /// Caller-supplied instruction override, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_prompt: Option<String>,
    /// Terminal provider failure, when `phase` is `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FixFailure>,
}

impl FixProgressState {
    pub fn start(asset_id: impl Into<String>, options: &FixOptions) -> Self {
        Self {
            asset_id: asset_id.into(),
            attempt: 1,
            max_attempts: options.max_attempts,
            phase: FixPhase::Generating,
            attempts: Vec::new(),
            thinking: Vec::new(),
            last_critique: None,
            custom_prompt: options.custom_prompt.clone(),
            failure: None,
        }
    }

    /// The attempt currently in flight, if any.
    pub fn current_attempt(&self) -> Option<&FixAttempt> {
        self.attempts.last()
    }

    /// The attempt that passed verification, if the run succeeded.
    pub fn passed_attempt(&self) -> Option<&FixAttempt> {
        self.attempts
            .iter()
            .find(|a| a.status == AttemptStatus::Passed)
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Whether the run ended with every attempt failing verification, as
    /// opposed to a provider error that prevented completing the loop.
    pub fn is_exhausted(&self) -> bool {
        self.phase == FixPhase::Complete && self.passed_attempt().is_none()
    }
}

/// Per-run options for the fix loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixOptions {
    /// Generate→verify attempts before giving up; must be >= 1.
    pub max_attempts: u32,
    /// Verbatim instruction override for the generation call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_prompt: Option<String>,
    /// Minimum verification score treated as a pass.
    pub satisfaction_threshold: u8,
    /// Image category steering template selection (e.g. "lifestyle").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Default for FixOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            custom_prompt: None,
            satisfaction_threshold: DEFAULT_SATISFACTION_THRESHOLD,
            category: None,
        }
    }
}

impl FixOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_custom_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.custom_prompt = Some(prompt.into());
        self
    }

    pub fn with_threshold(mut self, threshold: u8) -> Self {
        self.satisfaction_threshold = threshold;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verification(score: u8, product_match: bool) -> VerificationResult {
        VerificationResult {
            score,
            product_match,
            ..Default::default()
        }
    }

    #[test]
    fn satisfaction_requires_score_and_product_match() {
        assert!(verification(85, true).is_satisfactory(80));
        assert!(verification(80, true).is_satisfactory(80));
        assert!(!verification(79, true).is_satisfactory(80));
        assert!(!verification(95, false).is_satisfactory(80));
    }

    #[test]
    fn satisfaction_respects_configured_threshold() {
        let v = verification(70, true);
        assert!(!v.is_satisfactory(80));
        assert!(v.is_satisfactory(60));
    }

    #[test]
    fn severity_orders_critical_first() {
        assert!(Severity::Critical < Severity::Warning);
        assert!(Severity::Warning < Severity::Info);
    }

    #[test]
    fn ordered_recommendations_sorts_by_severity_and_skips_empty() {
        let compliance = ComplianceResult {
            score: 40,
            passed: false,
            violations: vec![
                Violation {
                    severity: Severity::Info,
                    category: "style".into(),
                    message: "busy background".into(),
                    recommendation: "simplify background".into(),
                    region: None,
                },
                Violation {
                    severity: Severity::Critical,
                    category: "background".into(),
                    message: "non-white background".into(),
                    recommendation: "use pure white background".into(),
                    region: None,
                },
                Violation {
                    severity: Severity::Warning,
                    category: "text".into(),
                    message: "promotional text".into(),
                    recommendation: String::new(),
                    region: None,
                },
            ],
            recommendations: Vec::new(),
            listing_context: None,
        };
        let recs = compliance.ordered_recommendations();
        assert_eq!(
            recs,
            vec!["use pure white background", "simplify background"]
        );
    }

    #[test]
    fn count_by_severity() {
        let compliance = ComplianceResult {
            score: 55,
            passed: false,
            violations: vec![
                Violation {
                    severity: Severity::Critical,
                    category: "a".into(),
                    message: String::new(),
                    recommendation: String::new(),
                    region: None,
                },
                Violation {
                    severity: Severity::Critical,
                    category: "b".into(),
                    message: String::new(),
                    recommendation: String::new(),
                    region: None,
                },
            ],
            recommendations: Vec::new(),
            listing_context: None,
        };
        assert_eq!(compliance.count_by_severity(Severity::Critical), 2);
        assert_eq!(compliance.count_by_severity(Severity::Info), 0);
    }

    #[test]
    fn fix_state_starts_on_first_generating_attempt() {
        let state = FixProgressState::start("asset-1", &FixOptions::default());
        assert_eq!(state.attempt, 1);
        assert_eq!(state.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(state.phase, FixPhase::Generating);
        assert!(state.attempts.is_empty());
        assert!(!state.is_terminal());
    }

    #[test]
    fn passed_attempt_found_in_trail() {
        let mut state = FixProgressState::start("asset-1", &FixOptions::default());
        let mut first = FixAttempt::begin(1);
        first.status = AttemptStatus::Failed;
        let mut second = FixAttempt::begin(2);
        second.status = AttemptStatus::Passed;
        state.attempts = vec![first, second];
        assert_eq!(state.passed_attempt().unwrap().index, 2);
    }

    #[test]
    fn exhausted_run_is_complete_without_a_pass() {
        let mut state = FixProgressState::start("asset-1", &FixOptions::default());
        let mut attempt = FixAttempt::begin(1);
        attempt.status = AttemptStatus::Failed;
        state.attempts = vec![attempt];
        state.phase = FixPhase::Complete;
        assert!(state.is_exhausted());
    }

    #[test]
    fn phase_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&FixPhase::Retrying).unwrap(),
            "\"retrying\""
        );
        assert_eq!(
            serde_json::to_string(&AttemptStatus::Verifying).unwrap(),
            "\"verifying\""
        );
    }

    #[test]
    fn fix_failure_copies_kind_and_message() {
        let err = ProviderError::new(ProviderErrorKind::SafetyBlock, "blocked by policy");
        let failure = FixFailure::from(&err);
        assert_eq!(failure.kind, ProviderErrorKind::SafetyBlock);
        assert_eq!(failure.message, "blocked by policy");
    }

    #[test]
    fn options_builders() {
        let options = FixOptions::default()
            .with_max_attempts(5)
            .with_threshold(90)
            .with_custom_prompt("make it pop");
        assert_eq!(options.max_attempts, 5);
        assert_eq!(options.satisfaction_threshold, 90);
        assert_eq!(options.custom_prompt.as_deref(), Some("make it pop"));
    }
}
