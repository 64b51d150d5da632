//! Runtime configuration for Retouch.
//!
//! Settings are layered: built-in defaults, then an optional
//! `retouch.toml` next to the working directory, then environment
//! variables (highest priority). `.env` files are loaded by `main`
//! before this module reads the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::fixer::{DEFAULT_MAX_ATTEMPTS, DEFAULT_SATISFACTION_THRESHOLD};
use crate::provider::RetryPolicy;
use crate::provider::invoker::{DEFAULT_INITIAL_DELAY, DEFAULT_MAX_RETRIES};

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_GENERATION_MODEL: &str = "gemini-2.5-flash-image";
const DEFAULT_VERIFICATION_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct RetouchConfig {
    pub api_base: String,
    pub api_key: String,
    pub generation_model: String,
    pub verification_model: String,
    pub max_attempts: u32,
    pub satisfaction_threshold: u8,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    /// Per-call wall-clock deadline; guards against a stalled provider
    /// call stalling an asset's loop indefinitely.
    pub request_timeout_secs: u64,
}

/// `retouch.toml` shape; every key optional.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    api_base: Option<String>,
    api_key: Option<String>,
    generation_model: Option<String>,
    verification_model: Option<String>,
    max_attempts: Option<u32>,
    satisfaction_threshold: Option<u8>,
    max_retries: Option<u32>,
    initial_delay_ms: Option<u64>,
    request_timeout_secs: Option<u64>,
}

impl RetouchConfig {
    /// Load configuration for `project_dir`, layering defaults,
    /// `retouch.toml`, and environment variables.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let file = Self::read_file(&project_dir.join("retouch.toml"))?;

        let api_key = env_string("RETOUCH_API_KEY")
            .or_else(|| env_string("GEMINI_API_KEY"))
            .or(file.api_key)
            .unwrap_or_default();

        Ok(Self {
            api_base: env_string("RETOUCH_API_BASE")
                .or(file.api_base)
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key,
            generation_model: env_string("RETOUCH_GENERATION_MODEL")
                .or(file.generation_model)
                .unwrap_or_else(|| DEFAULT_GENERATION_MODEL.to_string()),
            verification_model: env_string("RETOUCH_VERIFICATION_MODEL")
                .or(file.verification_model)
                .unwrap_or_else(|| DEFAULT_VERIFICATION_MODEL.to_string()),
            max_attempts: env_parsed("RETOUCH_MAX_ATTEMPTS")
                .or(file.max_attempts)
                .unwrap_or(DEFAULT_MAX_ATTEMPTS)
                .max(1),
            satisfaction_threshold: env_parsed("RETOUCH_SATISFACTION_THRESHOLD")
                .or(file.satisfaction_threshold)
                .unwrap_or(DEFAULT_SATISFACTION_THRESHOLD)
                .min(100),
            max_retries: env_parsed("RETOUCH_MAX_RETRIES")
                .or(file.max_retries)
                .unwrap_or(DEFAULT_MAX_RETRIES)
                .max(1),
            initial_delay_ms: env_parsed("RETOUCH_INITIAL_DELAY_MS")
                .or(file.initial_delay_ms)
                .unwrap_or(DEFAULT_INITIAL_DELAY.as_millis() as u64),
            request_timeout_secs: env_parsed("RETOUCH_REQUEST_TIMEOUT_SECS")
                .or(file.request_timeout_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        })
    }

    fn read_file(path: &PathBuf) -> Result<FileConfig> {
        if !path.exists() {
            return Ok(FileConfig::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// The invoker retry budget described by this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.initial_delay_ms))
    }

    /// Whether a provider API key is configured at all.
    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // Env-var layering is exercised via the file layer here; mutating
    // process-wide env in parallel tests is flaky.

    #[test]
    fn defaults_apply_without_file_or_env() {
        let dir = tempdir().unwrap();
        let config = RetouchConfig::load(dir.path()).unwrap();
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.satisfaction_threshold, DEFAULT_SATISFACTION_THRESHOLD);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("retouch.toml"),
            r#"
                generation_model = "gemini-exp"
                max_attempts = 5
                satisfaction_threshold = 90
                initial_delay_ms = 250
            "#,
        )
        .unwrap();
        let config = RetouchConfig::load(dir.path()).unwrap();
        assert_eq!(config.generation_model, "gemini-exp");
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.satisfaction_threshold, 90);
        assert_eq!(
            config.retry_policy().initial_delay,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("retouch.toml"), "max_attempts = [nope").unwrap();
        assert!(RetouchConfig::load(dir.path()).is_err());
    }

    #[test]
    fn zero_budgets_are_clamped_to_one() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("retouch.toml"),
            "max_attempts = 0\nmax_retries = 0\n",
        )
        .unwrap();
        let config = RetouchConfig::load(dir.path()).unwrap();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.max_retries, 1);
    }

    #[test]
    fn threshold_is_capped_at_100() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("retouch.toml"), "satisfaction_threshold = 250").unwrap();
        let config = RetouchConfig::load(dir.path()).unwrap();
        assert_eq!(config.satisfaction_threshold, 100);
    }

    #[test]
    fn missing_api_key_is_detectable() {
        let dir = tempdir().unwrap();
        let config = RetouchConfig::load(dir.path()).unwrap();
        // No key in file; only the env could provide one, and tests do
        // not set it.
        if std::env::var("RETOUCH_API_KEY").is_err() && std::env::var("GEMINI_API_KEY").is_err() {
            assert!(!config.has_api_key());
        }
    }
}
