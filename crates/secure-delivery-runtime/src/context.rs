use secure_delivery::{DeliveryConfig, SenderCertificate};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::remediation::{
    CertificateRefreshJob, CertificateRotator, PreKeyRefreshJob, PreKeyRotator,
    CERTIFICATE_REFRESH_QUEUE, PRE_KEY_REFRESH_QUEUE,
};
use crate::{JobError, JobHandle, JobState, Result};

/// Process-scoped state shared by delivery jobs.
///
/// One instance lives for an app cycle. Call [`DeliveryContext::begin_cycle`]
/// when the process (re)starts its send pipeline, and
/// [`DeliveryContext::reset`] when the account's keys are replaced.
#[derive(Debug, Default)]
pub struct DeliveryContext {
    last_rotation_ms: AtomicU64,
    refreshed_this_cycle: AtomicBool,
    sender_certificate: Mutex<Option<SenderCertificate>>,
}

impl DeliveryContext {
    pub fn new(last_rotation_ms: u64) -> Self {
        Self {
            last_rotation_ms: AtomicU64::new(last_rotation_ms),
            refreshed_this_cycle: AtomicBool::new(false),
            sender_certificate: Mutex::new(None),
        }
    }

    pub fn begin_cycle(&self) {
        self.refreshed_this_cycle.store(false, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.last_rotation_ms.store(0, Ordering::SeqCst);
        self.refreshed_this_cycle.store(false, Ordering::SeqCst);
        self.sender_certificate.lock().unwrap().take();
    }

    pub fn last_rotation_ms(&self) -> u64 {
        self.last_rotation_ms.load(Ordering::SeqCst)
    }

    pub fn record_rotation(&self, rotated_at_ms: u64) {
        self.last_rotation_ms.store(rotated_at_ms, Ordering::SeqCst);
        self.refreshed_this_cycle.store(true, Ordering::SeqCst);
    }

    pub fn refreshed_this_cycle(&self) -> bool {
        self.refreshed_this_cycle.load(Ordering::SeqCst)
    }

    /// The most recently renewed sender certificate.
    pub fn sender_certificate(&self) -> Option<SenderCertificate> {
        self.sender_certificate.lock().unwrap().clone()
    }

    pub fn record_certificate(&self, certificate: SenderCertificate) {
        *self.sender_certificate.lock().unwrap() = Some(certificate);
    }

    /// Negative when the recorded rotation is in the future.
    pub fn signed_pre_key_age_ms(&self, now_ms: u64) -> i64 {
        now_ms as i64 - self.last_rotation_ms() as i64
    }
}

/// Local-state check run before every delivery attempt: the signed pre-key
/// must have been rotated recently. When it has not, a refresh job runs
/// synchronously and the attempt proceeds only if it succeeds in time.
/// Concurrent checks share one refresh.
pub struct PreKeyPrecondition {
    context: Arc<DeliveryContext>,
    jobs: JobHandle,
    rotator: Arc<dyn PreKeyRotator>,
    max_age_ms: u64,
    timeout: Duration,
}

impl PreKeyPrecondition {
    pub fn new(
        context: Arc<DeliveryContext>,
        jobs: JobHandle,
        rotator: Arc<dyn PreKeyRotator>,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            context,
            jobs,
            rotator,
            max_age_ms: config.max_signed_pre_key_age_ms,
            timeout: config.remediation_timeout(),
        }
    }

    pub fn is_satisfied(&self, now_ms: u64) -> bool {
        let age = self.context.signed_pre_key_age_ms(now_ms);
        age >= 0 && age as u64 <= self.max_age_ms
    }

    pub fn ensure(&self, now_ms: u64) -> Result<()> {
        if self.is_satisfied(now_ms) {
            return Ok(());
        }

        let age_ms = self.context.signed_pre_key_age_ms(now_ms);
        if self.context.refreshed_this_cycle() {
            // a refresh may have landed since the first check
            if self.is_satisfied(now_ms) {
                return Ok(());
            }
            warn!(age_ms, "signed pre-key still stale after refresh this cycle");
            return Err(JobError::retry_later("signed pre-key refresh already ran this cycle"));
        }

        warn!(age_ms, "signed pre-key rotation overdue, refreshing before send");
        let job = PreKeyRefreshJob::new(self.rotator.clone(), self.context.clone());
        match self
            .jobs
            .run_synchronously_on(Box::new(job), PRE_KEY_REFRESH_QUEUE, self.timeout)?
        {
            Some(JobState::Succeeded) => {
                info!("signed pre-key refreshed");
                Ok(())
            }
            state => {
                warn!(state = ?state, "signed pre-key refresh did not complete");
                Err(JobError::retry_later("signed pre-key refresh did not complete"))
            }
        }
    }
}

/// Keeps sealed sends from going out with a sender certificate that expires
/// within the safety buffer. An expiring certificate is renewed
/// synchronously; if renewal does not finish in time the attempt is retried
/// later rather than sent unsealed.
pub struct CertificatePrecondition {
    context: Arc<DeliveryContext>,
    jobs: JobHandle,
    rotator: Arc<dyn CertificateRotator>,
    buffer_ms: u64,
    timeout: Duration,
}

impl CertificatePrecondition {
    pub fn new(
        context: Arc<DeliveryContext>,
        jobs: JobHandle,
        rotator: Arc<dyn CertificateRotator>,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            context,
            jobs,
            rotator,
            buffer_ms: config.certificate_expiration_buffer_ms,
            timeout: config.certificate_refresh_timeout(),
        }
    }

    fn usable(&self, certificate: &SenderCertificate, now_ms: u64) -> bool {
        !certificate.is_expiring_within(self.buffer_ms, now_ms)
    }

    /// Returns `current` when it is still good, otherwise a renewed certificate.
    pub fn ensure(&self, current: &SenderCertificate, now_ms: u64) -> Result<SenderCertificate> {
        if self.usable(current, now_ms) {
            return Ok(current.clone());
        }
        if let Some(renewed) = self.context.sender_certificate() {
            if self.usable(&renewed, now_ms) {
                debug!(expires_at_ms = renewed.expires_at_ms, "using renewed sender certificate");
                return Ok(renewed);
            }
        }

        warn!(
            expires_at_ms = current.expires_at_ms,
            "sender certificate expiring, renewing before send"
        );
        let job = CertificateRefreshJob::new(self.rotator.clone(), self.context.clone());
        let state = self
            .jobs
            .run_synchronously_on(Box::new(job), CERTIFICATE_REFRESH_QUEUE, self.timeout)?;
        if state != Some(JobState::Succeeded) {
            warn!(state = ?state, "sender certificate renewal did not complete");
            return Err(JobError::retry_later("sender certificate renewal did not complete"));
        }
        match self.context.sender_certificate() {
            Some(renewed) if self.usable(&renewed, now_ms) => Ok(renewed),
            _ => Err(JobError::retry_later("renewed sender certificate is still expiring")),
        }
    }
}
