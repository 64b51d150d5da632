//! Caller-facing fix surface.
//!
//! Holds registered assets and their running fix loops. Each asset's loop
//! is an independent spawned task publishing immutable
//! [`FixProgressState`] snapshots through a `watch` channel; callers
//! subscribe via [`FixService::start_fix`], poll via
//! [`FixService::get_progress`], and abandon via [`FixService::cancel`].
//! Cancellation never force-kills an in-flight provider call — the loop
//! observes the flag at its next suspension point and stops issuing
//! further attempts.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, watch};
use tracing::info;
use uuid::Uuid;

use crate::errors::FixError;
use crate::fixer::{
    Asset, AssetRole, ComplianceResult, FixOptions, FixOrchestrator, FixProgressState,
};
use crate::provider::{ImageGenerator, ImageVerifier, RetryPolicy};
use crate::codec;

/// A registered asset together with its compliance analysis.
#[derive(Debug, Clone)]
struct AssetEntry {
    asset: Asset,
    compliance: ComplianceResult,
}

/// One running (or finished) fix loop.
struct FixHandle {
    run_id: Uuid,
    state_rx: watch::Receiver<Arc<FixProgressState>>,
    cancelled: Arc<AtomicBool>,
}

/// Orchestrates fix loops across independently running assets.
pub struct FixService {
    generator: Arc<dyn ImageGenerator>,
    verifier: Arc<dyn ImageVerifier>,
    retry: RetryPolicy,
    assets: Arc<Mutex<HashMap<String, AssetEntry>>>,
    runs: Arc<Mutex<HashMap<String, FixHandle>>>,
}

impl FixService {
    pub fn new(
        generator: Arc<dyn ImageGenerator>,
        verifier: Arc<dyn ImageVerifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            generator,
            verifier,
            retry,
            assets: Arc::new(Mutex::new(HashMap::new())),
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register an asset and its compliance analysis. Re-registering an
    /// id replaces the previous entry.
    pub async fn register_asset(&self, asset: Asset, compliance: ComplianceResult) {
        let mut assets = self.assets.lock().await;
        assets.insert(asset.id.clone(), AssetEntry { asset, compliance });
    }

    /// A snapshot of a registered asset (with any written-back fix).
    pub async fn asset(&self, asset_id: &str) -> Option<Asset> {
        let assets = self.assets.lock().await;
        assets.get(asset_id).map(|entry| entry.asset.clone())
    }

    /// Start a fix loop for a registered asset.
    ///
    /// Returns a receiver of progress snapshots; the first value is the
    /// initial `generating` state and the last is terminal. Starting is
    /// rejected while a previous run for the same asset is still live.
    pub async fn start_fix(
        &self,
        asset_id: &str,
        options: FixOptions,
    ) -> Result<watch::Receiver<Arc<FixProgressState>>, FixError> {
        if options.max_attempts < 1 {
            return Err(FixError::InvalidOptions {
                got: options.max_attempts,
            });
        }

        let (asset, compliance, reference) = {
            let assets = self.assets.lock().await;
            let entry = assets.get(asset_id).ok_or_else(|| FixError::UnknownAsset {
                id: asset_id.to_string(),
            })?;
            // Secondary images carry the listing's main image along for
            // product-identity consistency.
            let reference = match entry.asset.role {
                AssetRole::Secondary => assets
                    .values()
                    .find(|other| other.asset.role == AssetRole::Main)
                    .map(|other| codec::extract(&other.asset.image)),
                AssetRole::Main => None,
            };
            (entry.asset.clone(), entry.compliance.clone(), reference)
        };

        let mut runs = self.runs.lock().await;
        if let Some(existing) = runs.get(asset_id)
            && !existing.state_rx.borrow().is_terminal()
        {
            return Err(FixError::AlreadyRunning {
                id: asset_id.to_string(),
            });
        }

        let run_id = Uuid::new_v4();
        let initial = Arc::new(FixProgressState::start(asset_id, &options));
        let (state_tx, state_rx) = watch::channel(initial);
        let cancelled = Arc::new(AtomicBool::new(false));

        let orchestrator =
            FixOrchestrator::new(self.generator.clone(), self.verifier.clone(), self.retry);
        let assets_store = self.assets.clone();
        let cancel_flag = cancelled.clone();
        let task_asset_id = asset_id.to_string();

        info!(asset = %asset_id, run = %run_id, "starting fix run");
        tokio::spawn(async move {
            let outcome = orchestrator
                .run(
                    &asset,
                    &compliance,
                    &options,
                    reference,
                    &state_tx,
                    &cancel_flag,
                )
                .await;

            // Write the passing image back onto the registered asset.
            // Abandoned and failed runs leave it untouched.
            if let Some(fixed) = outcome.fixed_image {
                let mut assets = assets_store.lock().await;
                if let Some(entry) = assets.get_mut(&task_asset_id) {
                    entry.asset.fixed_image = Some(fixed);
                }
            }
        });

        runs.insert(
            asset_id.to_string(),
            FixHandle {
                run_id,
                state_rx: state_rx.clone(),
                cancelled,
            },
        );

        Ok(state_rx)
    }

    /// Latest progress snapshot for an asset's current (or last) run.
    pub async fn get_progress(&self, asset_id: &str) -> Result<Arc<FixProgressState>, FixError> {
        let runs = self.runs.lock().await;
        let handle = runs.get(asset_id).ok_or_else(|| FixError::NoActiveRun {
            id: asset_id.to_string(),
        })?;
        Ok(handle.state_rx.borrow().clone())
    }

    /// Abandon an asset's fix run. In-flight provider calls are not
    /// force-cancelled; the loop stops at its next suspension point and
    /// never writes back a fixed image.
    pub async fn cancel(&self, asset_id: &str) -> Result<(), FixError> {
        let runs = self.runs.lock().await;
        let handle = runs.get(asset_id).ok_or_else(|| FixError::NoActiveRun {
            id: asset_id.to_string(),
        })?;
        info!(asset = %asset_id, run = %handle.run_id, "cancelling fix run");
        handle.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Await a run's terminal snapshot on a receiver from
/// [`FixService::start_fix`].
pub async fn wait_for_terminal(
    mut rx: watch::Receiver<Arc<FixProgressState>>,
) -> Arc<FixProgressState> {
    loop {
        {
            let state = rx.borrow_and_update();
            if state.is_terminal() {
                return state.clone();
            }
        }
        if rx.changed().await.is_err() {
            // Sender dropped; the last observed snapshot is final.
            return rx.borrow().clone();
        }
    }
}
