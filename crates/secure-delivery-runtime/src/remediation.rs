use secure_delivery::SenderCertificate;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{DeliveryContext, Job, JobContext, JobError, JobFactory, Result};

pub const PRE_KEY_REFRESH_FACTORY_KEY: &str = "PreKeyRefreshJob";
pub const CERTIFICATE_REFRESH_FACTORY_KEY: &str = "SenderCertificateRefreshJob";

/// Queue keys remediation runs under; one refresh of each kind at a time.
pub const PRE_KEY_REFRESH_QUEUE: &str = "remediation/pre-key";
pub const CERTIFICATE_REFRESH_QUEUE: &str = "remediation/sender-certificate";

pub trait PreKeyRotator: Send + Sync {
    /// Generates and uploads a new signed pre-key. Returns the rotation
    /// time in unix milliseconds.
    fn rotate_signed_pre_key(&self) -> secure_delivery::Result<u64>;
}

/// Issues sender certificates.
pub trait CertificateRotator: Send + Sync {
    fn fetch_sender_certificate(&self) -> secure_delivery::Result<SenderCertificate>;
}

/// Rotates the signed pre-key and records the rotation in the context.
pub struct PreKeyRefreshJob {
    rotator: Arc<dyn PreKeyRotator>,
    context: Arc<DeliveryContext>,
}

impl PreKeyRefreshJob {
    pub fn new(rotator: Arc<dyn PreKeyRotator>, context: Arc<DeliveryContext>) -> Self {
        Self { rotator, context }
    }
}

impl Job for PreKeyRefreshJob {
    fn factory_key(&self) -> &'static str {
        PRE_KEY_REFRESH_FACTORY_KEY
    }

    fn run(&mut self, ctx: &JobContext) -> Result<()> {
        let rotated_at = self.rotator.rotate_signed_pre_key()?;
        self.context.record_rotation(rotated_at);
        info!(rotated_at, attempt = ctx.attempt, "rotated signed pre-key");
        Ok(())
    }

    fn max_attempts(&self) -> u32 {
        3
    }

    fn on_failure(&mut self, error: &JobError) {
        warn!(error = %error, "signed pre-key rotation failed");
    }

    fn serialize(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({}))
    }
}

pub struct PreKeyRefreshJobFactory {
    pub rotator: Arc<dyn PreKeyRotator>,
    pub context: Arc<DeliveryContext>,
}

impl JobFactory for PreKeyRefreshJobFactory {
    fn create(&self, _data: serde_json::Value) -> Result<Box<dyn Job>> {
        Ok(Box::new(PreKeyRefreshJob::new(
            self.rotator.clone(),
            self.context.clone(),
        )))
    }
}

/// Fetches a new sender certificate and stores it in the context.
pub struct CertificateRefreshJob {
    rotator: Arc<dyn CertificateRotator>,
    context: Arc<DeliveryContext>,
}

impl CertificateRefreshJob {
    pub fn new(rotator: Arc<dyn CertificateRotator>, context: Arc<DeliveryContext>) -> Self {
        Self { rotator, context }
    }
}

impl Job for CertificateRefreshJob {
    fn factory_key(&self) -> &'static str {
        CERTIFICATE_REFRESH_FACTORY_KEY
    }

    fn run(&mut self, ctx: &JobContext) -> Result<()> {
        let certificate = self.rotator.fetch_sender_certificate()?;
        info!(
            expires_at_ms = certificate.expires_at_ms,
            attempt = ctx.attempt,
            "renewed sender certificate"
        );
        self.context.record_certificate(certificate);
        Ok(())
    }

    fn max_attempts(&self) -> u32 {
        3
    }

    fn on_failure(&mut self, error: &JobError) {
        warn!(error = %error, "sender certificate renewal failed");
    }

    fn serialize(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({}))
    }
}
