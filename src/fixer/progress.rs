//! Display-ready projection of fix-run state.
//!
//! A pure view transform: no network, no mutation, callable at any time
//! including mid-flight. One step is emitted per generate/verify stage
//! already reached; completed verifications carry their score.

use serde::{Deserialize, Serialize};

use crate::fixer::{AttemptStatus, FixPhase, FixProgressState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One display row. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStep {
    pub id: String,
    pub label: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
}

/// Derive the ordered step list from a progress snapshot.
pub fn project(state: &FixProgressState) -> Vec<ProgressStep> {
    let mut steps = Vec::with_capacity(state.attempts.len() * 2);

    for attempt in &state.attempts {
        let n = attempt.index;

        let generate_status = match attempt.status {
            AttemptStatus::Generating => StepStatus::InProgress,
            AttemptStatus::Error if attempt.image.is_none() => StepStatus::Failed,
            _ => StepStatus::Completed,
        };
        steps.push(ProgressStep {
            id: format!("generate-{}", n),
            label: format!("Generate attempt {}", n),
            status: generate_status,
            detail: failure_detail(state, generate_status),
            score: None,
        });

        // The verify stage only exists once generation produced an image.
        if attempt.image.is_none() {
            continue;
        }

        let verify_status = match attempt.status {
            AttemptStatus::Verifying => StepStatus::InProgress,
            AttemptStatus::Passed => StepStatus::Completed,
            AttemptStatus::Failed => StepStatus::Failed,
            AttemptStatus::Error => StepStatus::Failed,
            AttemptStatus::Generating => StepStatus::Pending,
        };
        steps.push(ProgressStep {
            id: format!("verify-{}", n),
            label: format!("Verify attempt {}", n),
            status: verify_status,
            detail: attempt
                .verification
                .as_ref()
                .filter(|v| !v.critique.is_empty())
                .map(|v| v.critique.clone())
                .or_else(|| failure_detail(state, verify_status)),
            score: attempt.score(),
        });
    }

    steps
}

/// Attach the terminal failure message to the step that failed.
fn failure_detail(state: &FixProgressState, status: StepStatus) -> Option<String> {
    if status == StepStatus::Failed && state.phase == FixPhase::Error {
        state.failure.as_ref().map(|f| f.message.clone())
    } else {
        None
    }
}
