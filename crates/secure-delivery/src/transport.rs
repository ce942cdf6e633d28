use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{OutgoingMessageList, SealedSenderAccess, ServiceAddress, TransportError};

pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    /// The server accepted the envelopes as sealed sender.
    pub sent_unidentified: bool,
    /// The recipient is one of our own linked devices and wants a sync copy.
    pub needs_sync: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSendResponse {
    /// Recipients the server could not deliver to because they are no
    /// longer registered.
    pub unsent_targets: Vec<ServiceAddress>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MismatchedDevices {
    pub extra_devices: Vec<u32>,
    pub missing_devices: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleDevices {
    pub stale_devices: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMismatchedDevices {
    pub address: ServiceAddress,
    pub devices: MismatchedDevices,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStaleDevices {
    pub address: ServiceAddress,
    pub devices: StaleDevices,
}

/// A multicast request: one sender-key ciphertext for many devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEnvelope {
    pub ciphertext: Vec<u8>,
    pub timestamp: u64,
    pub online: bool,
    pub urgent: bool,
    pub story: bool,
}

/// Network side of delivery. Implementations perform the actual HTTP or
/// websocket exchange; everything above this trait is transport-agnostic.
pub trait Transport: Send + Sync {
    fn send_envelope(
        &self,
        list: &OutgoingMessageList,
        access: Option<&SealedSenderAccess>,
    ) -> TransportResult<SendMessageResponse>;

    fn send_group_envelope(
        &self,
        envelope: &GroupEnvelope,
        access: Option<&SealedSenderAccess>,
    ) -> TransportResult<GroupSendResponse>;
}

/// Prefers the websocket pipe and retries over REST only when the pipe is
/// unavailable or failed at the connection level. Typed server answers are
/// never retried on the other transport.
pub struct FallbackTransport {
    pipe: Arc<dyn Transport>,
    rest: Arc<dyn Transport>,
    rest_fallback: bool,
}

impl FallbackTransport {
    pub fn new(pipe: Arc<dyn Transport>, rest: Arc<dyn Transport>, rest_fallback: bool) -> Self {
        Self {
            pipe,
            rest,
            rest_fallback,
        }
    }

    fn should_fall_back(&self, error: &TransportError) -> bool {
        self.rest_fallback
            && matches!(
                error,
                TransportError::PipeUnavailable | TransportError::Network(_)
            )
    }

    fn with_fallback<T>(
        &self,
        op: &str,
        call: impl Fn(&dyn Transport) -> TransportResult<T>,
    ) -> TransportResult<T> {
        match call(self.pipe.as_ref()) {
            Ok(response) => Ok(response),
            Err(e) if self.should_fall_back(&e) => {
                warn!(op, error = %e, "pipe send failed, falling back to REST");
                call(self.rest.as_ref())
            }
            Err(e) => {
                debug!(op, error = %e, "pipe send failed");
                Err(e)
            }
        }
    }
}

impl Transport for FallbackTransport {
    fn send_envelope(
        &self,
        list: &OutgoingMessageList,
        access: Option<&SealedSenderAccess>,
    ) -> TransportResult<SendMessageResponse> {
        self.with_fallback("send_envelope", |t| t.send_envelope(list, access))
    }

    fn send_group_envelope(
        &self,
        envelope: &GroupEnvelope,
        access: Option<&SealedSenderAccess>,
    ) -> TransportResult<GroupSendResponse> {
        self.with_fallback("send_group_envelope", |t| {
            t.send_group_envelope(envelope, access)
        })
    }
}
