//! The per-asset fix state machine.
//!
//! One run walks `generating → verifying → (passed | retrying | failed |
//! error)`, where `retrying` loops back to `generating` with the next
//! attempt number and the prior verification's critique folded into the
//! instruction. Provider calls go through the resilient invoker, so
//! transient failures are absorbed there; this loop's own budget counts
//! whole generate→verify attempts, never transport retries.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::codec::{self, ImageData};
use crate::errors::ProviderError;
use crate::fixer::{
    Asset, AttemptStatus, ComplianceResult, FixAttempt, FixFailure, FixOptions, FixPhase,
    FixProgressState,
};
use crate::prompt::{self, CritiqueContext, PromptSpec};
use crate::provider::{
    GenerationRequest, ImageGenerator, ImageVerifier, RetryPolicy, VerificationRequest, invoke,
};

/// Elements every regeneration must carry over untouched, independent of
/// what the compliance report flags.
const PRESERVE_DEFAULTS: &[&str] = &[
    "the exact product: shape, color, proportions, and materials",
    "brand names, logos, and label text",
    "product orientation and visible feature details",
];

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct FixOutcome {
    pub state: Arc<FixProgressState>,
    /// The passing image, present only when the run ended `Passed`.
    pub fixed_image: Option<ImageData>,
}

/// Drives one asset's generate→verify loop.
pub struct FixOrchestrator {
    generator: Arc<dyn ImageGenerator>,
    verifier: Arc<dyn ImageVerifier>,
    retry: RetryPolicy,
}

impl FixOrchestrator {
    pub fn new(
        generator: Arc<dyn ImageGenerator>,
        verifier: Arc<dyn ImageVerifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            generator,
            verifier,
            retry,
        }
    }

    /// Run the fix loop to a terminal state.
    ///
    /// Every transition replaces the published snapshot via `publish`.
    /// `reference` is the listing's main image, supplied for secondary
    /// assets so generation keeps the product identity consistent.
    /// Cancellation is observed between suspension points: once
    /// `cancelled` is set, no further provider calls are issued and no
    /// fixed image is returned.
    pub async fn run(
        &self,
        asset: &Asset,
        compliance: &ComplianceResult,
        options: &FixOptions,
        reference: Option<ImageData>,
        publish: &watch::Sender<Arc<FixProgressState>>,
        cancelled: &AtomicBool,
    ) -> FixOutcome {
        let mut state = FixProgressState::start(&asset.id, options);
        send(publish, &state);

        let original = codec::extract(&asset.image);
        let mut prior_critique: Option<CritiqueContext> = None;

        loop {
            if cancelled.load(Ordering::SeqCst) {
                return abandoned(state, publish);
            }

            // ── Generating ────────────────────────────────────────
            state.phase = FixPhase::Generating;
            state.attempts.push(FixAttempt::begin(state.attempt));
            send(publish, &state);

            let spec = build_prompt_spec(compliance, options, prior_critique.take());
            let request = GenerationRequest {
                instruction: prompt::compose(&spec),
                image: original.clone(),
                reference: reference.clone(),
            };

            info!(asset = %asset.id, attempt = state.attempt, "generating fix candidate");
            let generated = invoke(self.retry, |_| self.generator.generate(&request)).await;

            let image = match generated {
                Ok(response) => response.image,
                Err(err) => return provider_failed(state, publish, &err, "generation"),
            };

            {
                let attempt = current(&mut state);
                attempt.image = Some(image.clone());
                attempt.status = AttemptStatus::Verifying;
            }

            if cancelled.load(Ordering::SeqCst) {
                return abandoned(state, publish);
            }

            // ── Verifying ─────────────────────────────────────────
            state.phase = FixPhase::Verifying;
            send(publish, &state);

            let verification_request = VerificationRequest {
                generated: image.clone(),
                original: original.clone(),
                compliance: compliance.clone(),
            };

            info!(asset = %asset.id, attempt = state.attempt, "verifying fix candidate");
            let verification = invoke(self.retry, |_| {
                self.verifier.verify(&verification_request)
            })
            .await;

            let verdict = match verification {
                Ok(verdict) => verdict,
                Err(err) => return provider_failed(state, publish, &err, "verification"),
            };

            // Live reasoning accumulates regardless of the outcome.
            state.thinking.extend(verdict.reasoning.iter().cloned());
            if !verdict.critique.is_empty() {
                state.last_critique = Some(verdict.critique.clone());
            }

            let satisfied = verdict.is_satisfactory(options.satisfaction_threshold);
            let score = verdict.score;
            {
                let attempt = current(&mut state);
                attempt.verification = Some(verdict.clone());
                attempt.status = if satisfied {
                    AttemptStatus::Passed
                } else {
                    AttemptStatus::Failed
                };
            }

            if satisfied {
                info!(asset = %asset.id, attempt = state.attempt, score, "fix passed verification");
                state.phase = FixPhase::Complete;
                send(publish, &state);
                return FixOutcome {
                    state: Arc::new(state),
                    fixed_image: Some(image),
                };
            }

            if state.attempt >= state.max_attempts {
                info!(
                    asset = %asset.id,
                    attempts = state.attempt,
                    "attempt budget exhausted without a passing fix"
                );
                state.phase = FixPhase::Complete;
                send(publish, &state);
                return FixOutcome {
                    state: Arc::new(state),
                    fixed_image: None,
                };
            }

            // ── Retrying ──────────────────────────────────────────
            prior_critique = Some(CritiqueContext {
                critique: verdict.critique.clone(),
                failed_checks: verdict.failed_checks.clone(),
            });
            state.phase = FixPhase::Retrying;
            state.attempt += 1;
            send(publish, &state);
        }
    }
}

/// Assemble the composer inputs for one attempt.
///
/// Target improvements come from the compliance report (violation
/// recommendations first, most severe leading, then the analyzer's
/// free-form suggestions); preserve elements are the fixed identity set.
fn build_prompt_spec(
    compliance: &ComplianceResult,
    options: &FixOptions,
    prior_critique: Option<CritiqueContext>,
) -> PromptSpec {
    let mut improvements = compliance.ordered_recommendations();
    for rec in &compliance.recommendations {
        if !improvements.contains(rec) {
            improvements.push(rec.clone());
        }
    }

    PromptSpec {
        category: options.category.clone().unwrap_or_default(),
        enhancement_type: "marketplace compliance remediation".to_string(),
        target_improvements: improvements,
        preserve_elements: PRESERVE_DEFAULTS.iter().map(|s| s.to_string()).collect(),
        prior_critique,
        user_override: options.custom_prompt.clone(),
    }
}

fn current<'a>(state: &'a mut FixProgressState) -> &'a mut FixAttempt {
    state
        .attempts
        .last_mut()
        .expect("an attempt is always pushed before use")
}

fn send(publish: &watch::Sender<Arc<FixProgressState>>, state: &FixProgressState) {
    let _ = publish.send(Arc::new(state.clone()));
}

fn provider_failed(
    mut state: FixProgressState,
    publish: &watch::Sender<Arc<FixProgressState>>,
    err: &ProviderError,
    stage: &str,
) -> FixOutcome {
    warn!(kind = %err.kind, stage, "provider failure ended the fix run");
    if let Some(attempt) = state.attempts.last_mut() {
        attempt.status = AttemptStatus::Error;
    }
    state.phase = FixPhase::Error;
    state.failure = Some(FixFailure::from(err));
    send(publish, &state);
    FixOutcome {
        state: Arc::new(state),
        fixed_image: None,
    }
}

fn abandoned(
    mut state: FixProgressState,
    publish: &watch::Sender<Arc<FixProgressState>>,
) -> FixOutcome {
    info!(asset = %state.asset_id, "fix run abandoned by caller");
    if let Some(attempt) = state.attempts.last_mut()
        && !matches!(
            attempt.status,
            AttemptStatus::Passed | AttemptStatus::Failed
        )
    {
        attempt.status = AttemptStatus::Error;
    }
    state.phase = FixPhase::Error;
    state.failure = Some(FixFailure {
        kind: crate::errors::ProviderErrorKind::Unknown,
        message: "fix run abandoned by caller".to_string(),
    });
    send(publish, &state);
    FixOutcome {
        state: Arc::new(state),
        fixed_image: None,
    }
}
