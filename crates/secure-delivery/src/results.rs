use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::transport::GroupSendResponse;
use crate::{Error, IdentityKey, Result, ServiceAddress, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success {
        devices: Vec<u32>,
        unidentified: bool,
        needs_sync: bool,
        duration_ms: Option<u64>,
    },
    NetworkFailure,
    UnregisteredFailure,
    IdentityMismatch {
        their_identity_key: IdentityKey,
    },
    ProofRequired {
        token: String,
        retry_after_seconds: i64,
    },
    RateLimited {
        retry_after_ms: Option<u64>,
    },
    InvalidPreKey,
    Canceled,
}

/// Outcome of one logical send for one recipient. Never per device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub address: ServiceAddress,
    pub outcome: SendOutcome,
}

impl SendResult {
    pub fn success(
        address: ServiceAddress,
        devices: Vec<u32>,
        unidentified: bool,
        needs_sync: bool,
        duration_ms: Option<u64>,
    ) -> Self {
        Self {
            address,
            outcome: SendOutcome::Success {
                devices,
                unidentified,
                needs_sync,
                duration_ms,
            },
        }
    }

    pub fn network_failure(address: ServiceAddress) -> Self {
        Self {
            address,
            outcome: SendOutcome::NetworkFailure,
        }
    }

    pub fn unregistered(address: ServiceAddress) -> Self {
        Self {
            address,
            outcome: SendOutcome::UnregisteredFailure,
        }
    }

    pub fn identity_mismatch(address: ServiceAddress, their_identity_key: IdentityKey) -> Self {
        Self {
            address,
            outcome: SendOutcome::IdentityMismatch { their_identity_key },
        }
    }

    pub fn canceled(address: ServiceAddress) -> Self {
        Self {
            address,
            outcome: SendOutcome::Canceled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SendOutcome::Success { .. })
    }

    /// Transient failures that a later attempt may fix.
    pub fn is_network_failure(&self) -> bool {
        matches!(
            self.outcome,
            SendOutcome::NetworkFailure
                | SendOutcome::ProofRequired { .. }
                | SendOutcome::RateLimited { .. }
        )
    }

    pub fn success_devices(&self) -> &[u32] {
        match &self.outcome {
            SendOutcome::Success { devices, .. } => devices,
            _ => &[],
        }
    }
}

/// Maps a per-recipient send error to a result. Errors that describe the
/// request rather than the recipient are returned unchanged.
pub fn map_send_error(error: Error, address: &ServiceAddress) -> Result<SendResult> {
    let outcome = match error {
        Error::UntrustedIdentity { identity_key, .. } => SendOutcome::IdentityMismatch {
            their_identity_key: identity_key,
        },
        Error::InvalidPreKey(_) => SendOutcome::InvalidPreKey,
        Error::Transport(TransportError::Unregistered(_)) => SendOutcome::UnregisteredFailure,
        Error::Transport(TransportError::ProofRequired {
            token,
            retry_after_seconds,
        }) => SendOutcome::ProofRequired {
            token,
            retry_after_seconds,
        },
        Error::Transport(TransportError::RateLimited { retry_after_ms }) => {
            SendOutcome::RateLimited { retry_after_ms }
        }
        Error::Transport(
            TransportError::Network(_)
            | TransportError::PipeUnavailable
            | TransportError::ServerError(_),
        ) => SendOutcome::NetworkFailure,
        other => return Err(other),
    };
    debug!(recipient = %address, outcome = ?outcome, "mapped send error to result");
    Ok(SendResult {
        address: address.clone(),
        outcome,
    })
}

/// Collects results for a fixed target list. `finish` yields exactly one
/// result per distinct target.
pub struct ResultAggregator {
    targets: Vec<ServiceAddress>,
    results: HashMap<ServiceAddress, SendResult>,
}

impl ResultAggregator {
    pub fn new(targets: &[ServiceAddress]) -> Self {
        let mut unique: Vec<ServiceAddress> = Vec::with_capacity(targets.len());
        for target in targets {
            if !unique.contains(target) {
                unique.push(target.clone());
            }
        }
        Self {
            targets: unique,
            results: HashMap::new(),
        }
    }

    /// Adds a result. Two successes merge their devices; otherwise a failure
    /// replaces a success and the first failure is kept.
    pub fn add(&mut self, result: SendResult) {
        if !self.targets.contains(&result.address) {
            debug!(recipient = %result.address, "ignoring result for unknown target");
            return;
        }
        match self.results.get_mut(&result.address) {
            None => {
                self.results.insert(result.address.clone(), result);
            }
            Some(existing) => {
                if !existing.is_success() {
                    return;
                }
                match result.outcome {
                    SendOutcome::Success {
                        devices: more,
                        unidentified: more_unidentified,
                        needs_sync: more_needs_sync,
                        ..
                    } => {
                        if let SendOutcome::Success {
                            devices,
                            unidentified,
                            needs_sync,
                            ..
                        } = &mut existing.outcome
                        {
                            for device in more {
                                if !devices.contains(&device) {
                                    devices.push(device);
                                }
                            }
                            *unidentified &= more_unidentified;
                            *needs_sync |= more_needs_sync;
                        }
                    }
                    failure => existing.outcome = failure,
                }
            }
        }
    }

    pub fn extend(&mut self, results: impl IntoIterator<Item = SendResult>) {
        for result in results {
            self.add(result);
        }
    }

    pub fn has_result(&self, address: &ServiceAddress) -> bool {
        self.results.contains_key(address)
    }

    /// Targets without a result are reported as network failures.
    pub fn finish(mut self) -> Vec<SendResult> {
        let mut out = Vec::with_capacity(self.targets.len());
        for target in self.targets {
            match self.results.remove(&target) {
                Some(result) => out.push(result),
                None => {
                    warn!(recipient = %target, "no result for target, reporting network failure");
                    out.push(SendResult::network_failure(target));
                }
            }
        }
        out
    }
}

/// Results of a send, partitioned by outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendSummary {
    pub successes: Vec<SendResult>,
    pub network_failures: Vec<ServiceAddress>,
    pub unregistered: Vec<ServiceAddress>,
    pub identity_mismatches: Vec<(ServiceAddress, IdentityKey)>,
    pub proof_required: Vec<(ServiceAddress, String, i64)>,
    pub rate_limited: Vec<(ServiceAddress, Option<u64>)>,
    pub invalid_pre_key: Vec<ServiceAddress>,
    pub canceled: Vec<ServiceAddress>,
}

impl SendSummary {
    pub fn partition(results: &[SendResult]) -> Self {
        let mut summary = Self::default();
        for result in results {
            let address = result.address.clone();
            match &result.outcome {
                SendOutcome::Success { .. } => summary.successes.push(result.clone()),
                SendOutcome::NetworkFailure => summary.network_failures.push(address),
                SendOutcome::UnregisteredFailure => summary.unregistered.push(address),
                SendOutcome::IdentityMismatch { their_identity_key } => summary
                    .identity_mismatches
                    .push((address, *their_identity_key)),
                SendOutcome::ProofRequired {
                    token,
                    retry_after_seconds,
                } => summary
                    .proof_required
                    .push((address, token.clone(), *retry_after_seconds)),
                SendOutcome::RateLimited { retry_after_ms } => {
                    summary.rate_limited.push((address, *retry_after_ms))
                }
                SendOutcome::InvalidPreKey => summary.invalid_pre_key.push(address),
                SendOutcome::Canceled => summary.canceled.push(address),
            }
        }
        summary
    }

    pub fn has_success(&self) -> bool {
        !self.successes.is_empty()
    }
}

/// Maps a multicast response back to recipients: `unsent_targets` are
/// unregistered, everyone else succeeded on the devices that were sent.
pub fn transform_group_response(
    devices_by_recipient: &BTreeMap<ServiceAddress, Vec<u32>>,
    response: &GroupSendResponse,
    unidentified: bool,
    duration_ms: Option<u64>,
) -> Vec<SendResult> {
    devices_by_recipient
        .iter()
        .map(|(address, devices)| {
            if response.unsent_targets.contains(address) {
                SendResult::unregistered(address.clone())
            } else {
                SendResult::success(
                    address.clone(),
                    devices.clone(),
                    unidentified,
                    false,
                    duration_ms,
                )
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregator_reports_every_target_once() {
        let a = ServiceAddress::random();
        let b = ServiceAddress::random();
        let c = ServiceAddress::random();
        let mut aggregator = ResultAggregator::new(&[a.clone(), b.clone(), c.clone(), a.clone()]);

        aggregator.add(SendResult::success(a.clone(), vec![1], true, false, None));
        aggregator.add(SendResult::success(a.clone(), vec![2], false, false, None));
        aggregator.add(SendResult::unregistered(b.clone()));
        aggregator.add(SendResult::network_failure(ServiceAddress::random()));

        let results = aggregator.finish();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].success_devices(), &[1, 2]);
        assert_eq!(results[1].outcome, SendOutcome::UnregisteredFailure);
        assert_eq!(results[2], SendResult::network_failure(c));
    }

    #[test]
    fn failure_overrides_success() {
        let a = ServiceAddress::random();
        let mut aggregator = ResultAggregator::new(std::slice::from_ref(&a));
        aggregator.add(SendResult::success(a.clone(), vec![1], true, false, None));
        aggregator.add(SendResult::canceled(a.clone()));
        aggregator.add(SendResult::network_failure(a.clone()));
        assert_eq!(aggregator.finish(), vec![SendResult::canceled(a)]);
    }

    #[test]
    fn maps_errors_to_results() {
        let a = ServiceAddress::random();
        let unregistered = map_send_error(
            Error::Transport(TransportError::Unregistered(a.identifier())),
            &a,
        );
        assert!(matches!(
            unregistered,
            Ok(SendResult {
                outcome: SendOutcome::UnregisteredFailure,
                ..
            })
        ));

        let network = map_send_error(Error::Transport(TransportError::PipeUnavailable), &a);
        assert!(matches!(network, Ok(r) if r.is_network_failure()));

        assert!(map_send_error(Error::Transport(TransportError::ServerRejected), &a).is_err());
        assert!(map_send_error(Error::ConflictRetriesExhausted(4), &a).is_err());
    }

    #[test]
    fn group_response_marks_unsent_targets_unregistered() {
        let a = ServiceAddress::random();
        let b = ServiceAddress::random();
        let mut devices = BTreeMap::new();
        devices.insert(a.clone(), vec![1, 2]);
        devices.insert(b.clone(), vec![1]);

        let response = GroupSendResponse {
            unsent_targets: vec![b.clone()],
        };
        let results = transform_group_response(&devices, &response, true, Some(5));
        let summary = SendSummary::partition(&results);
        assert_eq!(summary.successes.len(), 1);
        assert_eq!(summary.successes[0].address, a);
        assert_eq!(summary.unregistered, vec![b]);
    }
}
