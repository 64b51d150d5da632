//! The fix loop from the command line — `retouch fix`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Arguments for one `retouch fix` invocation.
pub struct FixArgs {
    pub project_dir: PathBuf,
    pub image: PathBuf,
    pub report: PathBuf,
    pub out: Option<PathBuf>,
    pub trail: Option<PathBuf>,
    pub max_attempts: Option<u32>,
    pub threshold: Option<u8>,
    pub category: Option<String>,
    pub prompt: Option<String>,
    pub reference: Option<PathBuf>,
    pub verbose: bool,
}

pub async fn cmd_fix(args: FixArgs) -> Result<()> {
    use retouch::config::RetouchConfig;
    use retouch::fixer::{
        Asset, AssetRole, ComplianceResult, FixOptions, FixService, wait_for_terminal,
    };
    use retouch::provider::gemini::GeminiClient;
    use retouch::ui::FixUi;

    let report_raw = std::fs::read_to_string(&args.report)
        .with_context(|| format!("Failed to read report {}", args.report.display()))?;
    let compliance: ComplianceResult = serde_json::from_str(&report_raw)
        .with_context(|| format!("Failed to parse report {}", args.report.display()))?;

    if compliance.passed {
        println!("Report says this image already passes; nothing to fix.");
        return Ok(());
    }

    let config = RetouchConfig::load(&args.project_dir)?;
    if !config.has_api_key() {
        anyhow::bail!(
            "No provider API key configured. Set RETOUCH_API_KEY (or GEMINI_API_KEY), \
             or add api_key to retouch.toml."
        );
    }

    let asset_id = args
        .image
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("asset")
        .to_string();
    let payload = read_image_payload(&args.image)?;

    let client = Arc::new(GeminiClient::new(&config)?);
    let service = FixService::new(client.clone(), client, config.retry_policy());

    // A reference main image registers as its own asset so the service
    // hands it to generation for identity consistency.
    let role = if args.reference.is_some() {
        AssetRole::Secondary
    } else {
        AssetRole::Main
    };
    if let Some(reference) = &args.reference {
        let reference_payload = read_image_payload(reference)?;
        service
            .register_asset(
                Asset::new(format!("{}-reference", asset_id), reference_payload, AssetRole::Main),
                compliance.clone(),
            )
            .await;
    }
    service
        .register_asset(
            Asset::new(asset_id.clone(), payload, role),
            compliance.clone(),
        )
        .await;

    let mut options = FixOptions::default()
        .with_max_attempts(args.max_attempts.unwrap_or(config.max_attempts))
        .with_threshold(args.threshold.unwrap_or(config.satisfaction_threshold));
    if let Some(category) = &args.category {
        options = options.with_category(category.clone());
    }
    if let Some(prompt) = &args.prompt {
        options = options.with_custom_prompt(prompt.clone());
    }

    let ui = FixUi::new(u64::from(options.max_attempts), args.verbose);
    let mut rx = service.start_fix(&asset_id, options).await?;

    // Render every snapshot until the run settles.
    loop {
        {
            let state = rx.borrow_and_update();
            if state.is_terminal() {
                break;
            }
            ui.render(&state);
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
    let final_state = wait_for_terminal(rx).await;
    ui.finish(&final_state);

    if let Some(trail_path) = &args.trail {
        let trail = serde_json::to_string_pretty(final_state.as_ref())?;
        std::fs::write(trail_path, trail)
            .with_context(|| format!("Failed to write trail {}", trail_path.display()))?;
    }

    // The write-back lands on the run task right after the terminal
    // snapshot; fetch the asset once it is visible.
    if final_state.passed_attempt().is_some() {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let fixed = service
            .asset(&asset_id)
            .await
            .and_then(|asset| asset.fixed_image)
            .context("Run passed but no fixed image was written back")?;

        let out_path = args
            .out
            .clone()
            .unwrap_or_else(|| default_out_path(&args.image, &fixed.media_type));
        let bytes = fixed
            .decode()
            .context("Fixed image payload was not valid base64")?;
        std::fs::write(&out_path, bytes)
            .with_context(|| format!("Failed to write fixed image {}", out_path.display()))?;
        println!("Fixed image written to {}", out_path.display());
        return Ok(());
    }

    if final_state.is_exhausted() {
        anyhow::bail!(
            "No attempt passed verification within {} attempts",
            final_state.max_attempts
        );
    }
    match &final_state.failure {
        Some(failure) => anyhow::bail!("Fix run failed ({}): {}", failure.kind, failure.message),
        None => anyhow::bail!("Fix run ended without a result"),
    }
}

/// Read an image file into the raw base64 payload the fix loop consumes.
fn read_image_payload(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read image {}", path.display()))?;
    Ok(BASE64.encode(bytes))
}

/// `photo.jpg` → `photo-fixed.png` (extension from the fixed media type).
fn default_out_path(input: &Path, media_type: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("asset");
    let ext = match media_type {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "jpg",
    };
    input.with_file_name(format!("{}-fixed.{}", stem, ext))
}
