use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result, MAX_ENVELOPE_SIZE, RETRY_COUNT};

const ONE_DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Tunables for the delivery engine and its job runtime. Every field has a
/// default so a partial JSON document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryConfig {
    /// Largest padded content accepted for a single envelope.
    #[serde(default = "default_max_envelope_size")]
    pub max_envelope_size: usize,

    /// Conflict-resolution cycles per logical send.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Worker threads for per-recipient network work.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Retry over REST when the websocket pipe is unavailable or fails with IO.
    #[serde(default = "default_true")]
    pub rest_fallback: bool,

    #[serde(default = "default_certificate_expiration_buffer_ms")]
    pub certificate_expiration_buffer_ms: u64,

    #[serde(default = "default_remediation_timeout_ms")]
    pub remediation_timeout_ms: u64,

    /// How long a send waits for an expiring sender certificate to be renewed.
    #[serde(default = "default_certificate_refresh_timeout_ms")]
    pub certificate_refresh_timeout_ms: u64,

    /// Signed pre-keys older than this must be rotated before sending.
    #[serde(default = "default_max_signed_pre_key_age_ms")]
    pub max_signed_pre_key_age_ms: u64,

    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Attempts per delivery job before it is marked permanently failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_job_runners")]
    pub job_runners: usize,
}

fn default_max_envelope_size() -> usize {
    MAX_ENVELOPE_SIZE
}

fn default_retry_count() -> u32 {
    RETRY_COUNT
}

fn default_max_concurrency() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_certificate_expiration_buffer_ms() -> u64 {
    ONE_DAY_MS
}

fn default_remediation_timeout_ms() -> u64 {
    30_000
}

fn default_certificate_refresh_timeout_ms() -> u64 {
    5_000
}

fn default_max_signed_pre_key_age_ms() -> u64 {
    14 * ONE_DAY_MS
}

fn default_min_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    60 * 60 * 1000
}

fn default_max_attempts() -> u32 {
    25
}

fn default_job_runners() -> usize {
    4
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_envelope_size: default_max_envelope_size(),
            retry_count: default_retry_count(),
            max_concurrency: default_max_concurrency(),
            rest_fallback: default_true(),
            certificate_expiration_buffer_ms: default_certificate_expiration_buffer_ms(),
            remediation_timeout_ms: default_remediation_timeout_ms(),
            certificate_refresh_timeout_ms: default_certificate_refresh_timeout_ms(),
            max_signed_pre_key_age_ms: default_max_signed_pre_key_age_ms(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: default_max_attempts(),
            job_runners: default_job_runners(),
        }
    }
}

impl DeliveryConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry_count == 0 {
            return Err(Error::Config("retryCount must be at least 1".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(Error::Config("maxConcurrency must be at least 1".to_string()));
        }
        if self.job_runners == 0 {
            return Err(Error::Config("jobRunners must be at least 1".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("maxAttempts must be at least 1".to_string()));
        }
        if self.min_backoff_ms > self.max_backoff_ms {
            return Err(Error::Config(
                "minBackoffMs must not exceed maxBackoffMs".to_string(),
            ));
        }
        Ok(())
    }

    pub fn remediation_timeout(&self) -> Duration {
        Duration::from_millis(self.remediation_timeout_ms)
    }

    pub fn certificate_refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.certificate_refresh_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() -> Result<()> {
        let config = DeliveryConfig::from_json(r#"{"maxConcurrency": 2, "restFallback": false}"#)?;
        assert_eq!(config.max_concurrency, 2);
        assert!(!config.rest_fallback);
        assert_eq!(config.retry_count, RETRY_COUNT);
        assert_eq!(config.remediation_timeout(), Duration::from_secs(30));
        assert_eq!(config.certificate_refresh_timeout(), Duration::from_secs(5));
        assert_eq!(config.certificate_expiration_buffer_ms, ONE_DAY_MS);
        Ok(())
    }

    #[test]
    fn rejects_zero_retry_count() {
        assert!(matches!(
            DeliveryConfig::from_json(r#"{"retryCount": 0}"#),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn load_reads_file() -> Result<()> {
        let dir = tempfile::TempDir::new().map_err(|e| Error::Storage(e.to_string()))?;
        let path = dir.path().join("delivery.json");
        std::fs::write(&path, r#"{"jobRunners": 3}"#).map_err(|e| Error::Storage(e.to_string()))?;

        let config = DeliveryConfig::load(&path)?;
        assert_eq!(config.job_runners, 3);
        Ok(())
    }
}
