use secure_delivery::{IdentityKey, SendResult, ServiceAddress};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Where delivery outcomes land: the message database, notifications and
/// profile refresh all sit behind this.
pub trait DeliveryRecorder: Send + Sync {
    /// Whether the local account is still registered for push delivery.
    fn is_registered(&self) -> bool;

    fn record_sent(&self, message_id: &str, result: &SendResult);

    fn record_unregistered(&self, message_id: &str, recipient: &ServiceAddress);

    fn record_identity_mismatch(
        &self,
        message_id: &str,
        recipient: &ServiceAddress,
        identity_key: &IdentityKey,
    );

    /// Out-of-band refetch of a recipient's profile and identity key.
    fn refresh_identity(&self, recipient: &ServiceAddress);

    /// Surfaces a user-visible failure. Called at most once per message.
    fn record_permanent_failure(&self, message_id: &str, reason: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Sent {
        message_id: String,
        recipient: ServiceAddress,
        devices: Vec<u32>,
    },
    Unregistered {
        message_id: String,
        recipient: ServiceAddress,
    },
    IdentityMismatch {
        message_id: String,
        recipient: ServiceAddress,
        identity_key: IdentityKey,
    },
    IdentityRefresh(ServiceAddress),
    PermanentFailure {
        message_id: String,
        reason: String,
    },
}

/// Keeps everything in a list.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<Recorded>>,
    unregistered: AtomicBool,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_registered(&self, registered: bool) {
        self.unregistered.store(!registered, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn permanent_failures(&self, message_id: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Recorded::PermanentFailure { message_id: id, .. } if id == message_id))
            .count()
    }

    pub fn sent_to(&self, message_id: &str) -> Vec<ServiceAddress> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Recorded::Sent {
                    message_id: id,
                    recipient,
                    ..
                } if id == message_id => Some(recipient.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Recorded) {
        self.events.lock().unwrap().push(event);
    }
}

impl DeliveryRecorder for MemoryRecorder {
    fn is_registered(&self) -> bool {
        !self.unregistered.load(Ordering::SeqCst)
    }

    fn record_sent(&self, message_id: &str, result: &SendResult) {
        self.push(Recorded::Sent {
            message_id: message_id.to_string(),
            recipient: result.address.clone(),
            devices: result.success_devices().to_vec(),
        });
    }

    fn record_unregistered(&self, message_id: &str, recipient: &ServiceAddress) {
        self.push(Recorded::Unregistered {
            message_id: message_id.to_string(),
            recipient: recipient.clone(),
        });
    }

    fn record_identity_mismatch(
        &self,
        message_id: &str,
        recipient: &ServiceAddress,
        identity_key: &IdentityKey,
    ) {
        self.push(Recorded::IdentityMismatch {
            message_id: message_id.to_string(),
            recipient: recipient.clone(),
            identity_key: *identity_key,
        });
    }

    fn refresh_identity(&self, recipient: &ServiceAddress) {
        self.push(Recorded::IdentityRefresh(recipient.clone()));
    }

    fn record_permanent_failure(&self, message_id: &str, reason: &str) {
        self.push(Recorded::PermanentFailure {
            message_id: message_id.to_string(),
            reason: reason.to_string(),
        });
    }
}
