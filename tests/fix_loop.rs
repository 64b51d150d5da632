//! End-to-end fix-loop scenarios driven through `FixService` with
//! scripted provider doubles.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use retouch::codec::ImageData;
use retouch::errors::{FixError, ProviderError, ProviderErrorKind};
use retouch::fixer::{
    Asset, AssetRole, AttemptStatus, ComplianceResult, FixOptions, FixPhase, FixService, Severity,
    VerificationResult, Violation, wait_for_terminal,
};
use retouch::provider::{
    GeneratedImage, GenerationRequest, ImageGenerator, ImageVerifier, RetryPolicy,
    VerificationRequest,
};

// ── Scripted doubles ─────────────────────────────────────────────────

/// Generator driven by a queue of scripted outcomes. Records every
/// instruction it was asked to draw from; repeats the last outcome once
/// the queue is drained.
struct ScriptedGenerator {
    outcomes: Mutex<VecDeque<Result<ImageData, ProviderError>>>,
    instructions: Mutex<Vec<String>>,
    calls: Mutex<u32>,
}

impl ScriptedGenerator {
    fn new(outcomes: Vec<Result<ImageData, ProviderError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            instructions: Mutex::new(Vec::new()),
            calls: Mutex::new(0),
        }
    }

    fn always_ok() -> Self {
        Self::new(vec![Ok(generated_image("ZmFrZQ=="))])
    }

    fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }

    fn instructions(&self) -> Vec<String> {
        self.instructions.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GeneratedImage, ProviderError> {
        *self.calls.lock().unwrap() += 1;
        self.instructions
            .lock()
            .unwrap()
            .push(request.instruction.clone());
        let mut outcomes = self.outcomes.lock().unwrap();
        let outcome = if outcomes.len() > 1 {
            outcomes.pop_front().unwrap()
        } else {
            outcomes.front().cloned().unwrap()
        };
        outcome.map(|image| GeneratedImage { image })
    }
}

/// Verifier driven by a queue of scripted verdicts.
struct ScriptedVerifier {
    verdicts: Mutex<VecDeque<Result<VerificationResult, ProviderError>>>,
    calls: Mutex<u32>,
    entered: Arc<Notify>,
    proceed: Arc<Notify>,
    gated: bool,
}

impl ScriptedVerifier {
    fn new(verdicts: Vec<Result<VerificationResult, ProviderError>>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into()),
            calls: Mutex::new(0),
            entered: Arc::new(Notify::new()),
            proceed: Arc::new(Notify::new()),
            gated: false,
        }
    }

    /// Block each verify call until the test releases it, so the test
    /// can act (e.g. cancel) while a call is in flight.
    fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ImageVerifier for ScriptedVerifier {
    async fn verify(
        &self,
        _request: &VerificationRequest,
    ) -> Result<VerificationResult, ProviderError> {
        *self.calls.lock().unwrap() += 1;
        if self.gated {
            self.entered.notify_one();
            self.proceed.notified().await;
        }
        let mut verdicts = self.verdicts.lock().unwrap();
        let verdict = if verdicts.len() > 1 {
            verdicts.pop_front().unwrap()
        } else {
            verdicts.front().cloned().unwrap()
        };
        verdict
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────

fn generated_image(data: &str) -> ImageData {
    ImageData::new("image/jpeg", data)
}

fn verdict(score: u8) -> VerificationResult {
    VerificationResult {
        score,
        product_match: true,
        critique: format!("scored {}", score),
        failed_checks: if score < 80 {
            vec!["compliance".to_string()]
        } else {
            Vec::new()
        },
        reasoning: vec![format!("examined candidate, score {}", score)],
        ..Default::default()
    }
}

fn compliance() -> ComplianceResult {
    ComplianceResult {
        score: 45,
        passed: false,
        violations: vec![Violation {
            severity: Severity::Critical,
            category: "background".into(),
            message: "background is not white".into(),
            recommendation: "use a pure white background".into(),
            region: None,
        }],
        recommendations: Vec::new(),
        listing_context: None,
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1))
}

async fn service_with(
    generator: Arc<ScriptedGenerator>,
    verifier: Arc<ScriptedVerifier>,
) -> FixService {
    let service = FixService::new(generator, verifier, fast_retry());
    service
        .register_asset(
            Asset::new("asset-1", "Zm9v", AssetRole::Main),
            compliance(),
        )
        .await;
    service
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test]
async fn second_attempt_passes_and_writes_back() {
    // Attempt 1 scores 65, attempt 2 scores 90 with threshold 80.
    let generator = Arc::new(ScriptedGenerator::new(vec![
        Ok(generated_image("YXR0ZW1wdDE=")),
        Ok(generated_image("YXR0ZW1wdDI=")),
    ]));
    let verifier = Arc::new(ScriptedVerifier::new(vec![
        Ok(verdict(65)),
        Ok(verdict(90)),
    ]));
    let service = service_with(generator.clone(), verifier.clone()).await;

    let rx = service
        .start_fix("asset-1", FixOptions::default().with_max_attempts(3))
        .await
        .unwrap();
    let state = wait_for_terminal(rx).await;

    assert_eq!(state.phase, FixPhase::Complete);
    assert_eq!(state.attempts.len(), 2);
    assert_eq!(state.attempts[0].status, AttemptStatus::Failed);
    assert_eq!(state.attempts[1].status, AttemptStatus::Passed);
    assert_eq!(state.attempts[1].score(), Some(90));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let asset = service.asset("asset-1").await.unwrap();
    assert_eq!(asset.fixed_image.unwrap().data, "YXR0ZW1wdDI=");
}

#[tokio::test]
async fn exhausted_budget_fails_without_write_back() {
    // Three straight sub-threshold scores: 50, 60, 70.
    let generator = Arc::new(ScriptedGenerator::always_ok());
    let verifier = Arc::new(ScriptedVerifier::new(vec![
        Ok(verdict(50)),
        Ok(verdict(60)),
        Ok(verdict(70)),
    ]));
    let service = service_with(generator.clone(), verifier.clone()).await;

    let rx = service
        .start_fix("asset-1", FixOptions::default().with_max_attempts(3))
        .await
        .unwrap();
    let state = wait_for_terminal(rx).await;

    assert!(state.is_exhausted());
    assert_eq!(state.attempts.len(), 3);
    assert!(
        state
            .attempts
            .iter()
            .all(|a| a.status == AttemptStatus::Failed)
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    let asset = service.asset("asset-1").await.unwrap();
    assert!(asset.fixed_image.is_none());
}

#[tokio::test]
async fn attempt_count_never_exceeds_budget() {
    let generator = Arc::new(ScriptedGenerator::always_ok());
    let verifier = Arc::new(ScriptedVerifier::new(vec![Ok(verdict(10))]));
    let service = service_with(generator.clone(), verifier.clone()).await;

    let rx = service
        .start_fix("asset-1", FixOptions::default().with_max_attempts(2))
        .await
        .unwrap();
    let state = wait_for_terminal(rx).await;

    assert_eq!(state.attempts.len(), 2);
    assert_eq!(generator.call_count(), 2);
    assert_eq!(verifier.call_count(), 2);
}

#[tokio::test]
async fn safety_block_on_first_generation_ends_in_error() {
    let generator = Arc::new(ScriptedGenerator::new(vec![Err(ProviderError::new(
        ProviderErrorKind::SafetyBlock,
        "generation declined on safety grounds",
    ))]));
    let verifier = Arc::new(ScriptedVerifier::new(vec![Ok(verdict(95))]));
    let service = service_with(generator.clone(), verifier.clone()).await;

    let rx = service
        .start_fix("asset-1", FixOptions::default().with_max_attempts(3))
        .await
        .unwrap();
    let state = wait_for_terminal(rx).await;

    assert_eq!(state.phase, FixPhase::Error);
    let failure = state.failure.as_ref().unwrap();
    assert_eq!(failure.kind, ProviderErrorKind::SafetyBlock);
    assert!(failure.message.contains("safety"));
    // Not retried by the invoker, no further attempts, verifier untouched.
    assert_eq!(generator.call_count(), 1);
    assert_eq!(verifier.call_count(), 0);
    assert_eq!(state.attempts.len(), 1);
    assert_eq!(state.attempts[0].status, AttemptStatus::Error);
}

#[tokio::test]
async fn transient_rate_limits_are_absorbed_by_the_invoker() {
    // 429 twice, then success, within one logical generation call.
    let generator = Arc::new(ScriptedGenerator::new(vec![
        Err(ProviderError::classify(429, "{}")),
        Err(ProviderError::classify(429, "{}")),
        Ok(generated_image("b2s=")),
    ]));
    let verifier = Arc::new(ScriptedVerifier::new(vec![Ok(verdict(90))]));
    let service = service_with(generator.clone(), verifier.clone()).await;

    let rx = service
        .start_fix("asset-1", FixOptions::default())
        .await
        .unwrap();
    let state = wait_for_terminal(rx).await;

    assert_eq!(state.phase, FixPhase::Complete);
    // Three underlying calls but a single FixAttempt: the transport
    // retry budget is independent of the attempt budget.
    assert_eq!(generator.call_count(), 3);
    assert_eq!(state.attempts.len(), 1);
    assert_eq!(state.attempts[0].status, AttemptStatus::Passed);
}

#[tokio::test]
async fn verification_server_error_after_retries_ends_in_error() {
    let generator = Arc::new(ScriptedGenerator::always_ok());
    let verifier = Arc::new(ScriptedVerifier::new(vec![Err(ProviderError::classify(
        503,
        r#"{"error":{"message":"overloaded"}}"#,
    ))]));
    let service = service_with(generator.clone(), verifier.clone()).await;

    let rx = service
        .start_fix("asset-1", FixOptions::default())
        .await
        .unwrap();
    let state = wait_for_terminal(rx).await;

    assert_eq!(state.phase, FixPhase::Error);
    assert_eq!(
        state.failure.as_ref().unwrap().kind,
        ProviderErrorKind::ServerError
    );
    // The invoker exhausted its own budget on the one verification.
    assert_eq!(verifier.call_count(), 3);
    assert_eq!(state.attempts.len(), 1);
}

#[tokio::test]
async fn retry_instruction_carries_prior_critique_first_does_not() {
    let generator = Arc::new(ScriptedGenerator::always_ok());
    let verifier = Arc::new(ScriptedVerifier::new(vec![
        Ok(verdict(40)),
        Ok(verdict(92)),
    ]));
    let service = service_with(generator.clone(), verifier.clone()).await;

    let rx = service
        .start_fix("asset-1", FixOptions::default())
        .await
        .unwrap();
    wait_for_terminal(rx).await;

    let instructions = generator.instructions();
    assert_eq!(instructions.len(), 2);
    assert!(!instructions[0].contains("Previous attempt feedback"));
    assert!(instructions[1].contains("Previous attempt feedback"));
    assert!(instructions[1].contains("scored 40"));
    assert!(instructions[1].contains("- compliance"));
}

#[tokio::test]
async fn reasoning_traces_accumulate_across_attempts() {
    let generator = Arc::new(ScriptedGenerator::always_ok());
    let verifier = Arc::new(ScriptedVerifier::new(vec![
        Ok(verdict(55)),
        Ok(verdict(85)),
    ]));
    let service = service_with(generator.clone(), verifier.clone()).await;

    let rx = service
        .start_fix("asset-1", FixOptions::default())
        .await
        .unwrap();
    let state = wait_for_terminal(rx).await;

    assert_eq!(
        state.thinking,
        vec![
            "examined candidate, score 55".to_string(),
            "examined candidate, score 85".to_string(),
        ]
    );
    assert_eq!(state.last_critique.as_deref(), Some("scored 85"));
}

#[tokio::test]
async fn custom_prompt_bypasses_composition() {
    let generator = Arc::new(ScriptedGenerator::always_ok());
    let verifier = Arc::new(ScriptedVerifier::new(vec![Ok(verdict(90))]));
    let service = service_with(generator.clone(), verifier.clone()).await;

    let rx = service
        .start_fix(
            "asset-1",
            FixOptions::default().with_custom_prompt("white background, keep everything else"),
        )
        .await
        .unwrap();
    wait_for_terminal(rx).await;

    assert_eq!(
        generator.instructions(),
        vec!["white background, keep everything else".to_string()]
    );
}

#[tokio::test]
async fn cancelled_run_stops_and_never_writes_back() {
    let generator = Arc::new(ScriptedGenerator::always_ok());
    // Low score so an uncancelled run would keep retrying.
    let verifier = Arc::new(ScriptedVerifier::new(vec![Ok(verdict(10))]).gated());
    let service = service_with(generator.clone(), verifier.clone()).await;

    let rx = service
        .start_fix("asset-1", FixOptions::default().with_max_attempts(5))
        .await
        .unwrap();

    // Wait until verification is in flight, cancel, then release it.
    verifier.entered.notified().await;
    service.cancel("asset-1").await.unwrap();
    verifier.proceed.notify_one();

    let state = wait_for_terminal(rx).await;
    assert_eq!(state.phase, FixPhase::Error);
    // The in-flight verify was not force-cancelled, but no further
    // attempts were issued.
    assert_eq!(generator.call_count(), 1);
    assert_eq!(verifier.call_count(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let asset = service.asset("asset-1").await.unwrap();
    assert!(asset.fixed_image.is_none());
}

#[tokio::test]
async fn concurrent_assets_run_independently() {
    let generator = Arc::new(ScriptedGenerator::always_ok());
    let verifier = Arc::new(ScriptedVerifier::new(vec![Ok(verdict(90))]));
    let service = FixService::new(generator.clone(), verifier.clone(), fast_retry());
    service
        .register_asset(Asset::new("a", "Zm9v", AssetRole::Main), compliance())
        .await;
    service
        .register_asset(Asset::new("b", "YmFy", AssetRole::Main), compliance())
        .await;

    let rx_a = service.start_fix("a", FixOptions::default()).await.unwrap();
    let rx_b = service.start_fix("b", FixOptions::default()).await.unwrap();

    let (state_a, state_b) =
        tokio::join!(wait_for_terminal(rx_a), wait_for_terminal(rx_b));
    assert_eq!(state_a.phase, FixPhase::Complete);
    assert_eq!(state_b.phase, FixPhase::Complete);
    assert_eq!(state_a.asset_id, "a");
    assert_eq!(state_b.asset_id, "b");
}

#[tokio::test]
async fn second_start_while_running_is_rejected() {
    let generator = Arc::new(ScriptedGenerator::always_ok());
    let verifier = Arc::new(ScriptedVerifier::new(vec![Ok(verdict(90))]).gated());
    let service = service_with(generator.clone(), verifier.clone()).await;

    let rx = service
        .start_fix("asset-1", FixOptions::default())
        .await
        .unwrap();
    verifier.entered.notified().await;

    let second = service.start_fix("asset-1", FixOptions::default()).await;
    assert!(matches!(second, Err(FixError::AlreadyRunning { .. })));

    verifier.proceed.notify_one();
    wait_for_terminal(rx).await;
}

#[tokio::test]
async fn get_progress_reads_mid_flight_snapshots() {
    let generator = Arc::new(ScriptedGenerator::always_ok());
    let verifier = Arc::new(ScriptedVerifier::new(vec![Ok(verdict(90))]).gated());
    let service = service_with(generator.clone(), verifier.clone()).await;

    let rx = service
        .start_fix("asset-1", FixOptions::default())
        .await
        .unwrap();
    verifier.entered.notified().await;

    let snapshot = service.get_progress("asset-1").await.unwrap();
    assert_eq!(snapshot.phase, FixPhase::Verifying);
    assert_eq!(snapshot.attempts.len(), 1);
    assert_eq!(snapshot.attempts[0].status, AttemptStatus::Verifying);

    verifier.proceed.notify_one();
    let state = wait_for_terminal(rx).await;
    assert_eq!(state.phase, FixPhase::Complete);
}

#[tokio::test]
async fn secondary_asset_receives_main_reference() {
    struct RecordingGenerator {
        saw_reference: Mutex<Option<bool>>,
    }

    #[async_trait]
    impl ImageGenerator for RecordingGenerator {
        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> Result<GeneratedImage, ProviderError> {
            *self.saw_reference.lock().unwrap() = Some(request.reference.is_some());
            Ok(GeneratedImage {
                image: generated_image("b2s="),
            })
        }
    }

    let generator = Arc::new(RecordingGenerator {
        saw_reference: Mutex::new(None),
    });
    let verifier = Arc::new(ScriptedVerifier::new(vec![Ok(verdict(90))]));
    let service = FixService::new(generator.clone(), verifier, fast_retry());
    service
        .register_asset(Asset::new("main", "Zm9v", AssetRole::Main), compliance())
        .await;
    service
        .register_asset(
            Asset::new("gallery-2", "YmFy", AssetRole::Secondary),
            compliance(),
        )
        .await;

    let rx = service
        .start_fix("gallery-2", FixOptions::default())
        .await
        .unwrap();
    wait_for_terminal(rx).await;

    assert_eq!(*generator.saw_reference.lock().unwrap(), Some(true));
}
