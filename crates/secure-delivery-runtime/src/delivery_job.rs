use secure_delivery::utils::now_millis;
use secure_delivery::{
    DeliveryPlanner, DistributionId, EnvelopeContent, SealedSenderAccess, SendEvents, SendRequest,
    SendResult, SendSummary, ServiceAddress,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::classify::seconds_to_ms;
use crate::ledger::Terminal;
use crate::{
    CertificatePrecondition, DeliveryLedger, DeliveryRecorder, Job, JobContext, JobError,
    JobFactory, JobManager, PreKeyPrecondition, Result,
};

pub const DELIVERY_JOB_FACTORY_KEY: &str = "DeliveryJob";

/// Persisted state of one logical send. `recipients` shrinks as recipients
/// reach a final outcome, so a retry only covers the ones still pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryJobData {
    pub message_id: String,
    pub recipients: Vec<ServiceAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution_id: Option<DistributionId>,
    pub content: EnvelopeContent,
    #[serde(default)]
    pub access: Vec<(ServiceAddress, SealedSenderAccess)>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub delivered: usize,
    #[serde(default)]
    pub identity_mismatches: usize,
}

impl DeliveryJobData {
    pub fn individual(
        message_id: impl Into<String>,
        recipients: Vec<ServiceAddress>,
        content: EnvelopeContent,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            recipients,
            distribution_id: None,
            content,
            access: Vec::new(),
            online: false,
            delivered: 0,
            identity_mismatches: 0,
        }
    }

    pub fn group(
        message_id: impl Into<String>,
        distribution_id: DistributionId,
        recipients: Vec<ServiceAddress>,
        content: EnvelopeContent,
    ) -> Self {
        Self {
            distribution_id: Some(distribution_id),
            ..Self::individual(message_id, recipients, content)
        }
    }

    pub fn with_access(mut self, recipient: ServiceAddress, access: SealedSenderAccess) -> Self {
        self.access.retain(|(address, _)| *address != recipient);
        self.access.push((recipient, access));
        self
    }

    /// Sends to one recipient serialize per recipient; group sends per
    /// distribution.
    pub fn queue_key(&self) -> String {
        match (&self.distribution_id, self.recipients.as_slice()) {
            (Some(id), _) => format!("delivery/group/{}", id),
            (None, [recipient]) => format!("delivery/{}", recipient.identifier()),
            (None, _) => format!("delivery/message/{}", self.message_id),
        }
    }
}

/// Everything a delivery job needs besides its own data.
pub struct DeliveryServices {
    pub planner: Arc<DeliveryPlanner>,
    pub ledger: Arc<DeliveryLedger>,
    pub recorder: Arc<dyn DeliveryRecorder>,
    pub precondition: Option<Arc<PreKeyPrecondition>>,
    /// Renews expiring sender certificates. Without it a job whose
    /// certificate is expiring waits for a retry.
    pub certificates: Option<Arc<CertificatePrecondition>>,
    pub events: Arc<dyn SendEvents>,
}

pub struct DeliveryJob {
    data: DeliveryJobData,
    services: Arc<DeliveryServices>,
}

impl DeliveryJob {
    pub fn new(data: DeliveryJobData, services: Arc<DeliveryServices>) -> Self {
        Self { data, services }
    }

    pub fn data(&self) -> &DeliveryJobData {
        &self.data
    }

    /// Enqueues the job under its own queue key.
    pub fn enqueue(self, manager: &JobManager, max_instances: Option<usize>) -> Result<String> {
        let queue_key = self.data.queue_key();
        manager.enqueue(Box::new(self), &queue_key, max_instances)
    }

    /// Swaps expiring sender certificates of pending recipients for renewed
    /// ones, so sealed recipients are never sent to unsealed.
    fn renew_certificates(&mut self, now_ms: u64) -> Result<()> {
        let buffer_ms = self.services.planner.config().certificate_expiration_buffer_ms;
        let data = &mut self.data;
        for (recipient, access) in data.access.iter_mut() {
            if !data.recipients.contains(recipient)
                || !access.certificate.is_expiring_within(buffer_ms, now_ms)
            {
                continue;
            }
            let Some(certificates) = &self.services.certificates else {
                warn!(
                    message_id = %data.message_id,
                    recipient = %recipient,
                    "sender certificate expiring and cannot be renewed"
                );
                return Err(JobError::retry_later("sender certificate expiring"));
            };
            access.certificate = certificates.ensure(&access.certificate, now_ms)?;
            debug!(
                message_id = %data.message_id,
                recipient = %recipient,
                expires_at_ms = access.certificate.expires_at_ms,
                "sending with renewed sender certificate"
            );
        }
        Ok(())
    }

    fn request(&self) -> SendRequest {
        let data = &self.data;
        let mut request = match data.distribution_id {
            Some(id) => SendRequest::group(id, data.recipients.clone(), data.content.clone()),
            None => SendRequest::individual(data.recipients.clone(), data.content.clone()),
        }
        .with_online(data.online);

        for (recipient, access) in &data.access {
            if data.recipients.contains(recipient) {
                request = request.with_access(recipient.clone(), access.clone());
            }
        }
        request
    }

    fn process_results(&mut self, results: Vec<SendResult>) -> Result<()> {
        let message_id = self.data.message_id.clone();
        let recorder = &self.services.recorder;
        let summary = SendSummary::partition(&results);

        for (recipient, identity_key) in &summary.identity_mismatches {
            warn!(message_id = %message_id, recipient = %recipient, "identity key changed");
            recorder.record_identity_mismatch(&message_id, recipient, identity_key);
            recorder.refresh_identity(recipient);
        }
        for recipient in &summary.unregistered {
            info!(message_id = %message_id, recipient = %recipient, "recipient is unregistered");
            recorder.record_unregistered(&message_id, recipient);
        }
        for result in &summary.successes {
            recorder.record_sent(&message_id, result);
        }

        let finished: Vec<&ServiceAddress> = summary
            .successes
            .iter()
            .map(|r| &r.address)
            .chain(summary.unregistered.iter())
            .chain(summary.identity_mismatches.iter().map(|(address, _)| address))
            .collect();
        self.data.recipients.retain(|r| !finished.contains(&r));
        self.data.delivered += summary.successes.len();
        self.data.identity_mismatches += summary.identity_mismatches.len();

        if !summary.canceled.is_empty() {
            return Err(JobError::Canceled);
        }
        if !summary.proof_required.is_empty() {
            let retry_after_seconds = summary
                .proof_required
                .iter()
                .map(|(_, _, seconds)| *seconds)
                .max()
                .unwrap_or(-1);
            return Err(JobError::ProofRequired {
                retry_after_ms: seconds_to_ms(retry_after_seconds),
            });
        }
        if !summary.rate_limited.is_empty() {
            let retry_after_ms = summary.rate_limited.iter().filter_map(|(_, ms)| *ms).max();
            return Err(JobError::RateLimited { retry_after_ms });
        }
        let retryable = summary.network_failures.len() + summary.invalid_pre_key.len();
        if retryable > 0 {
            return Err(JobError::NetworkFailure(retryable));
        }
        if self.data.identity_mismatches > 0 {
            return Err(JobError::IdentityMismatch(self.data.identity_mismatches));
        }
        if self.data.delivered == 0 {
            return Err(JobError::Undeliverable(message_id));
        }

        self.services.ledger.mark_sent(&message_id)?;
        info!(
            message_id = %message_id,
            delivered = self.data.delivered,
            "message sent"
        );
        Ok(())
    }
}

impl Job for DeliveryJob {
    fn factory_key(&self) -> &'static str {
        DELIVERY_JOB_FACTORY_KEY
    }

    fn run(&mut self, ctx: &JobContext) -> Result<()> {
        let message_id = self.data.message_id.clone();
        match self.services.ledger.terminal(&message_id)? {
            Some(Terminal::Failed) => {
                info!(message_id = %message_id, "message already failed, not sending again");
                return Ok(());
            }
            Some(Terminal::Sent) => {
                debug!(message_id = %message_id, "message already sent");
                return Ok(());
            }
            None => {}
        }

        if let Some(precondition) = &self.services.precondition {
            precondition.ensure(now_millis())?;
        }
        if !self.services.recorder.is_registered() {
            warn!(message_id = %message_id, "local account is not registered, not sending");
            return Err(JobError::NotRegistered);
        }
        self.renew_certificates(now_millis())?;

        debug!(
            message_id = %message_id,
            recipients = self.data.recipients.len(),
            attempt = ctx.attempt,
            "sending message"
        );
        let request = self.request();
        let results = self.services.planner.plan_and_send(
            &request,
            &ctx.cancel,
            self.services.events.as_ref(),
        )?;
        self.process_results(results)
    }

    fn max_attempts(&self) -> u32 {
        self.services.planner.config().max_attempts
    }

    fn on_retry(&mut self, error: &JobError) {
        debug!(
            message_id = %self.data.message_id,
            pending = self.data.recipients.len(),
            error = %error,
            "delivery will be retried"
        );
    }

    fn on_failure(&mut self, error: &JobError) {
        let message_id = &self.data.message_id;
        match self.services.ledger.mark_failed(message_id) {
            Ok(true) => {
                warn!(message_id = %message_id, error = %error, "message failed permanently");
                self.services
                    .recorder
                    .record_permanent_failure(message_id, &error.to_string());
            }
            Ok(false) => debug!(message_id = %message_id, "failure already recorded"),
            Err(e) => warn!(message_id = %message_id, error = %e, "failed to record failure"),
        }
    }

    fn serialize(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.data)?)
    }
}

pub struct DeliveryJobFactory {
    pub services: Arc<DeliveryServices>,
}

impl JobFactory for DeliveryJobFactory {
    fn create(&self, data: serde_json::Value) -> Result<Box<dyn Job>> {
        let data: DeliveryJobData = serde_json::from_value(data)?;
        Ok(Box::new(DeliveryJob::new(data, self.services.clone())))
    }
}
