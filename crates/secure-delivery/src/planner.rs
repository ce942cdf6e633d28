use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::pool::run_bounded;
use crate::results::{map_send_error, transform_group_response, ResultAggregator};
use crate::transport::GroupEnvelope;
use crate::utils::now_millis;
use crate::{
    CancellationToken, CipherError, ConflictResolver, ContentHint, DeliveryConfig, DeviceAddress,
    DeviceLocks, DistributionId, EnvelopeCipher, EnvelopeContent, Error, KeyDirectory,
    NoopSendEvents, OutgoingEnvelope, OutgoingMessageList, PreKeyBundle, Result,
    SealedSenderAccess, SendEvents, SendPlan, SendResult, SenderKeyTracker, ServiceAddress,
    SessionCipher, SessionStore, StorageAdapter, Transport, TransportError, DEFAULT_DEVICE_ID,
};

/// One logical send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub targets: Vec<ServiceAddress>,
    pub content: EnvelopeContent,
    /// Present for sender-key (group or story) sends.
    pub distribution_id: Option<DistributionId>,
    pub access: HashMap<ServiceAddress, SealedSenderAccess>,
    pub online: bool,
}

impl SendRequest {
    pub fn individual(targets: Vec<ServiceAddress>, content: EnvelopeContent) -> Self {
        Self {
            targets,
            content,
            distribution_id: None,
            access: HashMap::new(),
            online: false,
        }
    }

    pub fn group(
        distribution_id: DistributionId,
        targets: Vec<ServiceAddress>,
        content: EnvelopeContent,
    ) -> Self {
        Self {
            distribution_id: Some(distribution_id),
            ..Self::individual(targets, content)
        }
    }

    pub fn with_access(mut self, address: ServiceAddress, access: SealedSenderAccess) -> Self {
        self.access.insert(address, access);
        self
    }

    pub fn with_online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Access used for a multicast: the first target's, in target order.
    pub fn group_access(&self) -> Option<&SealedSenderAccess> {
        self.targets.iter().find_map(|t| self.access.get(t))
    }
}

pub struct DeliveryPlannerOptions {
    pub local_address: ServiceAddress,
    pub local_device_id: u32,
    pub sessions: Arc<dyn SessionStore>,
    pub key_directory: Arc<dyn KeyDirectory>,
    pub transport: Arc<dyn Transport>,
    pub cipher: Arc<dyn SessionCipher>,
    pub storage: Arc<dyn StorageAdapter>,
    pub config: DeliveryConfig,
}

/// Turns a logical send into device-level transport calls: picks pairwise
/// or sender-key delivery, fans out on the worker pool, resolves device
/// conflicts and reduces everything to one result per recipient.
pub struct DeliveryPlanner {
    local_address: ServiceAddress,
    local_device_id: u32,
    sessions: Arc<dyn SessionStore>,
    key_directory: Arc<dyn KeyDirectory>,
    transport: Arc<dyn Transport>,
    envelope_cipher: Arc<EnvelopeCipher>,
    sender_keys: Arc<SenderKeyTracker>,
    resolver: ConflictResolver,
    locks: Arc<DeviceLocks>,
    config: DeliveryConfig,
}

impl DeliveryPlanner {
    pub fn new(options: DeliveryPlannerOptions) -> Result<Self> {
        options.config.validate()?;

        let sender_keys = Arc::new(SenderKeyTracker::new(
            options.storage.clone(),
            options.sessions.clone(),
        ));
        let envelope_cipher = Arc::new(EnvelopeCipher::new(
            options.sessions.clone(),
            options.cipher.clone(),
            sender_keys.clone(),
            options.config.max_envelope_size,
        ));
        let locks = Arc::new(DeviceLocks::new());
        let resolver = ConflictResolver::new(
            options.sessions.clone(),
            options.key_directory.clone(),
            envelope_cipher.clone(),
            sender_keys.clone(),
            locks.clone(),
        );

        Ok(Self {
            local_address: options.local_address,
            local_device_id: options.local_device_id,
            sessions: options.sessions,
            key_directory: options.key_directory,
            transport: options.transport,
            envelope_cipher,
            sender_keys,
            resolver,
            locks,
            config: options.config,
        })
    }

    pub fn sender_keys(&self) -> &Arc<SenderKeyTracker> {
        &self.sender_keys
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn local_address(&self) -> &ServiceAddress {
        &self.local_address
    }

    /// Sends `request` and returns exactly one result per distinct target.
    ///
    /// Per-recipient failures become results; an error is returned only
    /// when the whole send is unusable (content too large, server rejection,
    /// conflict retries exhausted).
    pub fn plan_and_send(
        &self,
        request: &SendRequest,
        cancel: &CancellationToken,
        events: &dyn SendEvents,
    ) -> Result<Vec<SendResult>> {
        if request.targets.is_empty() {
            debug!("send has no targets");
            return Ok(Vec::new());
        }

        self.envelope_cipher.enforce_max_size(&request.content)?;

        if cancel.is_canceled() {
            return Ok(canceled(&request.targets));
        }

        match &request.distribution_id {
            None => self.send_individual(&request.targets, &request.content, request, cancel, events),
            Some(distribution_id) => self.send_group(distribution_id, request, cancel, events),
        }
    }

    /// Sends a transcript of `content` to our own other devices. Returns
    /// `None` when there is no other device to sync with.
    pub fn send_sync(
        &self,
        content: &EnvelopeContent,
        cancel: &CancellationToken,
        events: &dyn SendEvents,
    ) -> Result<Option<SendResult>> {
        self.envelope_cipher.enforce_max_size(content)?;

        let local = self.local_address.clone();
        if self.local_device_id == DEFAULT_DEVICE_ID
            && self.sessions.sub_device_sessions(&local)?.is_empty()
        {
            debug!("no linked devices, skipping sync transcript");
            return Ok(None);
        }

        let result = match self.send_to_recipient(&local, None, content, false, cancel, events) {
            Ok(result) => result,
            Err(e) => map_send_error(e, &local)?,
        };
        if result.is_success() {
            events.on_sync_sent();
        }
        Ok(Some(result))
    }

    /// Partitions the devices of `recipients` by whether they already hold
    /// the distribution's current sender key.
    pub fn build_plan(
        &self,
        distribution_id: &DistributionId,
        recipients: &[ServiceAddress],
    ) -> Result<SendPlan> {
        let sessions = self.sessions.all_with_active_sessions(recipients)?;
        let shared = self.sender_keys.shared_with(distribution_id)?;

        let mut live: BTreeMap<&ServiceAddress, BTreeSet<u32>> = BTreeMap::new();
        for device in sessions.keys() {
            live.entry(&device.address)
                .or_default()
                .insert(device.device_id);
        }

        let mut plan = SendPlan::default();
        for recipient in recipients {
            if plan.devices_by_recipient.contains_key(recipient) {
                continue;
            }
            let mut devices = live.get(recipient).cloned().unwrap_or_default();
            devices.insert(DEFAULT_DEVICE_ID);
            if *recipient == self.local_address {
                devices.remove(&self.local_device_id);
            }
            if devices.is_empty() {
                plan.without_devices.push(recipient.clone());
                continue;
            }

            for device_id in &devices {
                let device = recipient.device(*device_id);
                if shared.contains(&device) && sessions.contains_key(&device) {
                    plan.has_sender_key.push(device);
                } else {
                    plan.needs_sender_key.push(device);
                }
            }
            plan.devices_by_recipient
                .insert(recipient.clone(), devices.into_iter().collect());
        }
        Ok(plan)
    }

    fn send_individual(
        &self,
        targets: &[ServiceAddress],
        content: &EnvelopeContent,
        request: &SendRequest,
        cancel: &CancellationToken,
        events: &dyn SendEvents,
    ) -> Result<Vec<SendResult>> {
        let mut aggregator = ResultAggregator::new(targets);
        for (recipient, outcome) in self.fan_out(targets, content, request, cancel, events) {
            let result = match outcome {
                Ok(result) => result,
                Err(e) => map_send_error(e, &recipient)?,
            };
            events.on_recipient_complete(&result);
            aggregator.add(result);
        }
        Ok(aggregator.finish())
    }

    fn fan_out(
        &self,
        targets: &[ServiceAddress],
        content: &EnvelopeContent,
        request: &SendRequest,
        cancel: &CancellationToken,
        events: &dyn SendEvents,
    ) -> Vec<(ServiceAddress, Result<SendResult>)> {
        let mut unique: Vec<ServiceAddress> = Vec::with_capacity(targets.len());
        for target in targets {
            if !unique.contains(target) {
                unique.push(target.clone());
            }
        }

        self.eagerly_fetch_missing_pre_keys(&unique, request, content.is_story());

        run_bounded(unique, self.config.max_concurrency, |recipient| {
            let access = request.access.get(&recipient).cloned();
            let outcome =
                self.send_to_recipient(&recipient, access, content, request.online, cancel, events);
            (recipient, outcome)
        })
    }

    fn is_local_device(&self, device: &DeviceAddress) -> bool {
        device.address == self.local_address && device.device_id == self.local_device_id
    }

    /// Builds default-device sessions for recipients that have none, so the
    /// per-recipient sends do not each stall on a bundle fetch. Failures are
    /// only logged; the send path fetches again and reports them.
    fn eagerly_fetch_missing_pre_keys(
        &self,
        recipients: &[ServiceAddress],
        request: &SendRequest,
        story: bool,
    ) {
        let missing: Vec<ServiceAddress> = recipients
            .iter()
            .filter(|r| {
                let device = r.device(DEFAULT_DEVICE_ID);
                !self.is_local_device(&device)
                    && !self.sessions.contains_session(&device).unwrap_or(true)
            })
            .cloned()
            .collect();
        if missing.is_empty() {
            return;
        }

        debug!(count = missing.len(), "eagerly fetching missing pre-keys");
        run_bounded(missing, self.config.max_concurrency, |recipient| {
            let device = recipient.device(DEFAULT_DEVICE_ID);
            let outcome = self.locks.with_lock(&device, || -> Result<()> {
                if self.sessions.contains_session(&device)? {
                    return Ok(());
                }
                let bundles = self.fetch_pre_keys(
                    &recipient,
                    Some(DEFAULT_DEVICE_ID),
                    request.access.get(&recipient),
                    story,
                )?;
                if let Some(bundle) = bundles.iter().find(|b| b.device_id == DEFAULT_DEVICE_ID) {
                    self.envelope_cipher.establish_session(&device, bundle)?;
                }
                Ok(())
            });
            if let Err(e) = outcome {
                debug!(recipient = %recipient, error = %e, "eager pre-key fetch failed");
            }
        });
    }

    fn fetch_pre_keys(
        &self,
        address: &ServiceAddress,
        device_id: Option<u32>,
        access: Option<&SealedSenderAccess>,
        story: bool,
    ) -> Result<Vec<PreKeyBundle>> {
        let access = if story && access.is_some_and(|a| a.is_unrestricted_for_story()) {
            None
        } else {
            access
        };

        match self
            .key_directory
            .fetch_pre_key_bundles(address, device_id, access)
        {
            Err(TransportError::Unauthorized) if access.is_some() => {
                debug!(recipient = %address, "no sealed access to key directory, fetching unsealed");
                Ok(self
                    .key_directory
                    .fetch_pre_key_bundles(address, device_id, None)?)
            }
            other => Ok(other?),
        }
    }

    /// Per-recipient retry loop. Each cycle makes one `send_envelope` call
    /// carrying an envelope for every device of the recipient, so the server
    /// can answer with the full device conflict. Each conflict answer costs
    /// one cycle; the loop gives up after `retry_count` cycles.
    fn send_to_recipient(
        &self,
        recipient: &ServiceAddress,
        mut access: Option<SealedSenderAccess>,
        content: &EnvelopeContent,
        online: bool,
        cancel: &CancellationToken,
        events: &dyn SendEvents,
    ) -> Result<SendResult> {
        let start = Instant::now();

        for attempt in 0..self.config.retry_count {
            if cancel.is_canceled() {
                return Ok(SendResult::canceled(recipient.clone()));
            }

            let messages = self.encrypted_messages(recipient, access.as_ref(), content)?;
            if messages.is_empty() {
                info!(recipient = %recipient, "recipient has no devices");
                return Ok(SendResult::unregistered(recipient.clone()));
            }
            if attempt == 0 {
                events.on_encrypted();
            }

            if cancel.is_canceled() {
                return Ok(SendResult::canceled(recipient.clone()));
            }

            let list = OutgoingMessageList {
                destination: recipient.clone(),
                timestamp: content.timestamp(),
                messages,
                online,
                urgent: content.is_urgent(),
            };

            match self.transport.send_envelope(&list, access.as_ref()) {
                Ok(response) => {
                    events.on_sent();
                    debug!(
                        recipient = %recipient,
                        timestamp = content.timestamp(),
                        devices = ?list.devices(),
                        attempt,
                        "sent"
                    );
                    return Ok(SendResult::success(
                        recipient.clone(),
                        list.devices(),
                        access.is_some() || response.sent_unidentified,
                        response.needs_sync,
                        Some(start.elapsed().as_millis() as u64),
                    ));
                }
                Err(TransportError::Unauthorized) if access.is_some() => {
                    warn!(recipient = %recipient, attempt, "sealed sender rejected, retrying unsealed");
                    access = None;
                }
                Err(TransportError::MismatchedDevices(mismatch)) => {
                    self.resolver.on_mismatched_devices(
                        recipient,
                        &mismatch.extra_devices,
                        &mismatch.missing_devices,
                    )?;
                }
                Err(TransportError::StaleDevices(stale)) => {
                    self.resolver
                        .on_stale_devices(recipient, &stale.stale_devices)?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(
            recipient = %recipient,
            attempts = self.config.retry_count,
            "giving up after repeated device conflicts"
        );
        Err(Error::ConflictRetriesExhausted(self.config.retry_count))
    }

    fn encrypted_messages(
        &self,
        recipient: &ServiceAddress,
        access: Option<&SealedSenderAccess>,
        content: &EnvelopeContent,
    ) -> Result<Vec<OutgoingEnvelope>> {
        let mut device_ids = vec![DEFAULT_DEVICE_ID];
        for device_id in self.sessions.sub_device_sessions(recipient)? {
            if !device_ids.contains(&device_id) {
                device_ids.push(device_id);
            }
        }
        if *recipient == self.local_address {
            device_ids.retain(|d| *d != self.local_device_id);
        }

        let mut messages = Vec::with_capacity(device_ids.len());
        for device_id in device_ids {
            let device = recipient.device(device_id);
            if device_id == DEFAULT_DEVICE_ID || self.sessions.contains_session(&device)? {
                messages.push(self.encrypt_device(&device, access, content)?);
            }
        }
        Ok(messages)
    }

    fn encrypt_device(
        &self,
        device: &DeviceAddress,
        access: Option<&SealedSenderAccess>,
        content: &EnvelopeContent,
    ) -> Result<OutgoingEnvelope> {
        self.locks.with_lock(device, || {
            if !self.sessions.contains_session(device)? {
                let bundles = self.fetch_pre_keys(
                    &device.address,
                    Some(device.device_id),
                    access,
                    content.is_story(),
                )?;
                let bundle = bundles
                    .iter()
                    .find(|b| b.device_id == device.device_id)
                    .ok_or_else(|| TransportError::Unregistered(device.address.identifier()))?;
                self.envelope_cipher.establish_session(device, bundle)?;
            }
            self.envelope_cipher
                .encrypt_for_device(device, content, access, now_millis())
        })
    }

    fn send_group(
        &self,
        distribution_id: &DistributionId,
        request: &SendRequest,
        cancel: &CancellationToken,
        events: &dyn SendEvents,
    ) -> Result<Vec<SendResult>> {
        let content = &request.content;
        let access = request.group_access();
        let start = Instant::now();

        let mut aggregator = ResultAggregator::new(&request.targets);
        let mut remaining: Vec<ServiceAddress> = Vec::new();
        for target in &request.targets {
            if !remaining.contains(target) {
                remaining.push(target.clone());
            }
        }

        for attempt in 0..self.config.retry_count {
            if cancel.is_canceled() {
                aggregator.extend(canceled(&remaining));
                return Ok(aggregator.finish());
            }

            let mut plan = self.build_plan(distribution_id, &remaining)?;
            self.drop_without_devices(&plan, &mut remaining, &mut aggregator);

            if !plan.needs_sender_key.is_empty() {
                for failure in self.distribute_sender_key(distribution_id, &plan, request, cancel)? {
                    remaining.retain(|r| *r != failure.address);
                    events.on_recipient_complete(&failure);
                    aggregator.add(failure);
                }
                events.on_sender_key_shared();

                if remaining.is_empty() {
                    return Ok(aggregator.finish());
                }
                plan = self.build_plan(distribution_id, &remaining)?;
                self.drop_without_devices(&plan, &mut remaining, &mut aggregator);
            }

            let destinations: Vec<DeviceAddress> = plan
                .destinations()
                .into_iter()
                .filter(|d| remaining.contains(&d.address))
                .collect();
            let mut group = self.envelope_cipher.encrypt_for_group(
                distribution_id,
                &destinations,
                content,
                access,
                now_millis(),
            )?;

            if !group.excluded.is_empty() {
                let dropped = drop_excluded_recipients(&group.excluded, &mut aggregator);
                remaining.retain(|r| !dropped.contains(r));
                let kept: Vec<DeviceAddress> = group
                    .included
                    .iter()
                    .filter(|d| !dropped.contains(&d.address))
                    .cloned()
                    .collect();
                if kept.len() != group.included.len() {
                    group = self.envelope_cipher.encrypt_for_group(
                        distribution_id,
                        &kept,
                        content,
                        access,
                        now_millis(),
                    )?;
                }
            }

            if group.is_empty() {
                return Ok(aggregator.finish());
            }
            if attempt == 0 {
                events.on_encrypted();
            }
            if cancel.is_canceled() {
                aggregator.extend(canceled(&remaining));
                return Ok(aggregator.finish());
            }

            let mut devices_by_recipient: BTreeMap<ServiceAddress, Vec<u32>> = BTreeMap::new();
            for device in &group.included {
                devices_by_recipient
                    .entry(device.address.clone())
                    .or_default()
                    .push(device.device_id);
            }

            let envelope = GroupEnvelope {
                ciphertext: group.ciphertext,
                timestamp: content.timestamp(),
                online: request.online,
                urgent: content.is_urgent(),
                story: content.is_story(),
            };

            match self.transport.send_group_envelope(&envelope, access) {
                Ok(response) => {
                    events.on_sent();
                    info!(
                        distribution_id = %distribution_id,
                        timestamp = content.timestamp(),
                        recipients = devices_by_recipient.len(),
                        unsent = response.unsent_targets.len(),
                        attempt,
                        "group send complete"
                    );
                    let results = transform_group_response(
                        &devices_by_recipient,
                        &response,
                        access.is_some(),
                        Some(start.elapsed().as_millis() as u64),
                    );
                    for result in results {
                        events.on_recipient_complete(&result);
                        aggregator.add(result);
                    }
                    return Ok(aggregator.finish());
                }
                Err(TransportError::GroupMismatchedDevices(mismatches)) => {
                    for mismatch in mismatches {
                        let resolved = self.resolver.on_mismatched_devices(
                            &mismatch.address,
                            &mismatch.devices.extra_devices,
                            &mismatch.devices.missing_devices,
                        );
                        if let Err(e) = resolved {
                            let result = map_send_error(e, &mismatch.address)?;
                            remaining.retain(|r| *r != mismatch.address);
                            aggregator.add(result);
                        }
                    }
                }
                Err(TransportError::GroupStaleDevices(stale)) => {
                    for entry in stale {
                        self.resolver
                            .on_stale_devices(&entry.address, &entry.devices.stale_devices)?;
                    }
                }
                Err(TransportError::Unauthorized) => {
                    warn!(
                        distribution_id = %distribution_id,
                        "multicast not authorized, falling back to pairwise sends"
                    );
                    let results =
                        self.send_individual(&remaining, content, request, cancel, events)?;
                    aggregator.extend(results);
                    return Ok(aggregator.finish());
                }
                Err(e) => return Err(e.into()),
            }

            if remaining.is_empty() {
                return Ok(aggregator.finish());
            }
            warn!(distribution_id = %distribution_id, attempt, "group send hit a device conflict, retrying");
        }

        warn!(
            distribution_id = %distribution_id,
            attempts = self.config.retry_count,
            "giving up group send after repeated device conflicts"
        );
        Err(Error::ConflictRetriesExhausted(self.config.retry_count))
    }

    fn drop_without_devices(
        &self,
        plan: &SendPlan,
        remaining: &mut Vec<ServiceAddress>,
        aggregator: &mut ResultAggregator,
    ) {
        for recipient in &plan.without_devices {
            info!(recipient = %recipient, "recipient has no devices");
            remaining.retain(|r| r != recipient);
            aggregator.add(SendResult::unregistered(recipient.clone()));
        }
    }

    /// Sends the current sender key pairwise to recipients with devices that
    /// lack it. Marks devices shared only after a successful send and
    /// returns the recipients that could not be reached.
    fn distribute_sender_key(
        &self,
        distribution_id: &DistributionId,
        plan: &SendPlan,
        request: &SendRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<SendResult>> {
        let recipients = plan.recipients_needing_sender_key();
        let distribution = self.sender_keys.get_or_create(distribution_id)?;

        let mut skdm = EnvelopeContent::new(distribution.to_bytes()?, request.content.timestamp())
            .with_content_hint(ContentHint::Implicit)
            .with_urgent(request.content.is_urgent())
            .with_story(request.content.is_story());
        if let Some(group_id) = request.content.group_id() {
            skdm = skdm.with_group_id(group_id);
        }

        info!(
            distribution_id = %distribution_id,
            recipients = recipients.len(),
            devices = plan.needs_sender_key.len(),
            "distributing sender key"
        );

        let mut failures = Vec::new();
        for (recipient, outcome) in self.fan_out(&recipients, &skdm, request, cancel, &NoopSendEvents) {
            let result = match outcome {
                Ok(result) => result,
                Err(e) => match map_send_error(e, &recipient) {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(recipient = %recipient, error = %e, "sender key distribution failed");
                        SendResult::network_failure(recipient.clone())
                    }
                },
            };

            if result.is_success() {
                let devices: Vec<DeviceAddress> = result
                    .success_devices()
                    .iter()
                    .map(|d| recipient.device(*d))
                    .collect();
                self.sender_keys.mark_shared(distribution_id, &devices)?;
            } else {
                debug!(recipient = %recipient, outcome = ?result.outcome, "excluding recipient from multicast");
                failures.push(result);
            }
        }
        Ok(failures)
    }
}

/// Recipients with any device the group cipher could not include are taken
/// out of the multicast with a failure result.
fn drop_excluded_recipients(
    excluded: &[(DeviceAddress, CipherError)],
    aggregator: &mut ResultAggregator,
) -> Vec<ServiceAddress> {
    let mut dropped: Vec<ServiceAddress> = Vec::new();
    for (device, error) in excluded {
        if dropped.contains(&device.address) {
            continue;
        }
        let result = match error {
            CipherError::UntrustedIdentity { identity_key, .. } => {
                SendResult::identity_mismatch(device.address.clone(), *identity_key)
            }
            _ => SendResult::network_failure(device.address.clone()),
        };
        warn!(device = %device, error = %error, "dropping recipient from group send");
        aggregator.add(result);
        dropped.push(device.address.clone());
    }
    dropped
}

fn canceled(targets: &[ServiceAddress]) -> Vec<SendResult> {
    let mut aggregator = ResultAggregator::new(targets);
    for target in targets {
        aggregator.add(SendResult::canceled(target.clone()));
    }
    aggregator.finish()
}
