use nostr::PublicKey;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

pub const DEFAULT_DEVICE_ID: u32 = 1;
pub const RETRY_COUNT: u32 = 4;
pub const MAX_ENVELOPE_SIZE: usize = 256 * 1024;
pub const PADDING_BLOCK_SIZE: usize = 160;
pub const PADDING_TERMINATOR: u8 = 0x80;

/// Long-term identity key of a remote device.
pub type IdentityKey = PublicKey;

/// A user on the service. Equality and hashing use only the service id; the
/// phone number is a legacy alias carried along for display and lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAddress {
    service_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    number: Option<String>,
}

impl ServiceAddress {
    pub const DEFAULT_DEVICE_ID: u32 = DEFAULT_DEVICE_ID;

    pub fn new(service_id: Uuid) -> Self {
        Self {
            service_id,
            number: None,
        }
    }

    pub fn with_number(service_id: Uuid, number: impl Into<String>) -> Self {
        Self {
            service_id,
            number: Some(number.into()),
        }
    }

    pub fn random() -> Self {
        Self::new(Uuid::new_v4())
    }

    pub fn service_id(&self) -> Uuid {
        self.service_id
    }

    pub fn number(&self) -> Option<&str> {
        self.number.as_deref()
    }

    pub fn identifier(&self) -> String {
        self.service_id.to_string()
    }

    pub fn device(&self, device_id: u32) -> DeviceAddress {
        DeviceAddress::new(self.clone(), device_id)
    }
}

impl PartialEq for ServiceAddress {
    fn eq(&self, other: &Self) -> bool {
        self.service_id == other.service_id
    }
}

impl Eq for ServiceAddress {}

impl Hash for ServiceAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.service_id.hash(state);
    }
}

impl PartialOrd for ServiceAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.service_id.cmp(&other.service_id)
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.service_id)
    }
}

/// One session endpoint: a user's device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAddress {
    pub address: ServiceAddress,
    pub device_id: u32,
}

impl DeviceAddress {
    pub fn new(address: ServiceAddress, device_id: u32) -> Self {
        Self { address, device_id }
    }

    pub fn is_default_device(&self) -> bool {
        self.device_id == DEFAULT_DEVICE_ID
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.address, self.device_id)
    }
}

/// A pairwise session with one remote device. The ratchet state is opaque to
/// this crate and only interpreted by the [`crate::SessionCipher`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub remote_identity: IdentityKey,
    pub remote_registration_id: u32,
    #[serde(with = "hex::serde")]
    pub state: Vec<u8>,
}

impl SessionRecord {
    pub fn new(remote_identity: IdentityKey, remote_registration_id: u32, state: Vec<u8>) -> Self {
        Self {
            remote_identity,
            remote_registration_id,
            state,
        }
    }
}

/// Public key material published by a device so others can start a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    pub device_id: u32,
    pub registration_id: u32,
    pub identity_key: IdentityKey,
    #[serde(default)]
    pub pre_key_id: Option<u32>,
    #[serde(with = "hex::serde")]
    pub signed_pre_key: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub signed_pre_key_signature: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DistributionId(pub Uuid);

impl DistributionId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for DistributionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentHint {
    #[default]
    Default,
    Resendable,
    Implicit,
}

/// Plaintext payload of one logical send. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeContent {
    #[serde(with = "hex::serde")]
    content: Vec<u8>,
    content_hint: ContentHint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group_id: Option<String>,
    urgent: bool,
    story: bool,
    timestamp: u64,
}

impl EnvelopeContent {
    pub fn new(content: Vec<u8>, timestamp: u64) -> Self {
        Self {
            content,
            content_hint: ContentHint::Default,
            group_id: None,
            urgent: true,
            story: false,
            timestamp,
        }
    }

    pub fn with_content_hint(mut self, content_hint: ContentHint) -> Self {
        self.content_hint = content_hint;
        self
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_urgent(mut self, urgent: bool) -> Self {
        self.urgent = urgent;
        self
    }

    pub fn with_story(mut self, story: bool) -> Self {
        self.story = story;
        self
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn content_hint(&self) -> ContentHint {
        self.content_hint
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    pub fn is_urgent(&self) -> bool {
        self.urgent
    }

    pub fn is_story(&self) -> bool {
        self.story
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Size on the wire after padding. This is what the envelope size limit
    /// is checked against.
    pub fn size(&self) -> usize {
        padded_len(self.content.len())
    }

    /// Content followed by a terminator byte and zeros up to the next
    /// padding block.
    pub fn padded(&self) -> Vec<u8> {
        let mut padded = Vec::with_capacity(self.size());
        padded.extend_from_slice(&self.content);
        padded.push(PADDING_TERMINATOR);
        padded.resize(self.size(), 0);
        padded
    }
}

pub fn padded_len(unpadded: usize) -> usize {
    let with_terminator = unpadded + 1;
    with_terminator.div_ceil(PADDING_BLOCK_SIZE) * PADDING_BLOCK_SIZE
}

/// Strips the padding added by [`EnvelopeContent::padded`].
pub fn strip_padding(padded: &[u8]) -> Option<&[u8]> {
    let end = padded.iter().rposition(|b| *b != 0)?;
    if padded[end] != PADDING_TERMINATOR {
        return None;
    }
    Some(&padded[..end])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeType {
    PreKey,
    Whisper,
    SealedSender,
    PlaintextContent,
}

/// One encrypted envelope for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingEnvelope {
    pub envelope_type: EnvelopeType,
    pub destination_device_id: u32,
    pub destination_registration_id: u32,
    /// Base64-encoded ciphertext.
    pub content: String,
}

/// Everything sent to one recipient in a single transport call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessageList {
    pub destination: ServiceAddress,
    pub timestamp: u64,
    pub messages: Vec<OutgoingEnvelope>,
    pub online: bool,
    pub urgent: bool,
}

impl OutgoingMessageList {
    pub fn devices(&self) -> Vec<u32> {
        self.messages
            .iter()
            .map(|m| m.destination_device_id)
            .collect()
    }
}

/// Issued by the service; proves who the sender of a sealed envelope is to
/// the recipient without revealing it to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderCertificate {
    pub sender: ServiceAddress,
    pub sender_device_id: u32,
    pub sender_identity: IdentityKey,
    pub expires_at_ms: u64,
}

impl SenderCertificate {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }

    pub fn is_expiring_within(&self, buffer_ms: u64, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms.saturating_add(buffer_ms)
    }
}

/// Credentials to send a recipient sealed-sender envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedSenderAccess {
    pub certificate: SenderCertificate,
    #[serde(default, with = "hex::serde")]
    pub access_key: Vec<u8>,
    /// The recipient accepts stories from anyone. This grants sealed delivery
    /// of the story itself but not sealed access to their key directory.
    #[serde(default)]
    pub unrestricted_story: bool,
}

impl SealedSenderAccess {
    pub fn new(certificate: SenderCertificate, access_key: Vec<u8>) -> Self {
        Self {
            certificate,
            access_key,
            unrestricted_story: false,
        }
    }

    pub fn for_story(certificate: SenderCertificate) -> Self {
        Self {
            certificate,
            access_key: Vec::new(),
            unrestricted_story: true,
        }
    }

    pub fn is_unrestricted_for_story(&self) -> bool {
        self.unrestricted_story
    }
}

/// Device partition for one group send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendPlan {
    pub needs_sender_key: Vec<DeviceAddress>,
    pub has_sender_key: Vec<DeviceAddress>,
    pub devices_by_recipient: BTreeMap<ServiceAddress, Vec<u32>>,
    pub without_devices: Vec<ServiceAddress>,
}

impl SendPlan {
    pub fn destinations(&self) -> Vec<DeviceAddress> {
        let mut all: Vec<DeviceAddress> = self
            .needs_sender_key
            .iter()
            .chain(self.has_sender_key.iter())
            .cloned()
            .collect();
        all.sort();
        all
    }

    pub fn recipients_needing_sender_key(&self) -> Vec<ServiceAddress> {
        let mut out: Vec<ServiceAddress> = Vec::new();
        for device in &self.needs_sender_key {
            if !out.contains(&device.address) {
                out.push(device.address.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_address_equality_ignores_number() {
        let id = Uuid::new_v4();
        let a = ServiceAddress::new(id);
        let b = ServiceAddress::with_number(id, "+15550100");
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn padding_rounds_up_to_block() {
        assert_eq!(padded_len(0), 160);
        assert_eq!(padded_len(159), 160);
        assert_eq!(padded_len(160), 320);

        let content = EnvelopeContent::new(b"hello".to_vec(), 1);
        let padded = content.padded();
        assert_eq!(padded.len(), content.size());
        assert_eq!(strip_padding(&padded), Some(&b"hello"[..]));
    }

    #[test]
    fn certificate_expiry_buffer() {
        let cert = SenderCertificate {
            sender: ServiceAddress::random(),
            sender_device_id: 1,
            sender_identity: nostr::Keys::generate().public_key(),
            expires_at_ms: 10_000,
        };
        assert!(!cert.is_expired(9_999));
        assert!(cert.is_expired(10_000));
        assert!(cert.is_expiring_within(1_000, 9_500));
        assert!(!cert.is_expiring_within(100, 9_000));
    }
}
