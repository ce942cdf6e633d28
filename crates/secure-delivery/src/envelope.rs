use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::sealed::{self, UnidentifiedContent};
use crate::sender_key::SenderKeyState;
use crate::{
    CipherError, ContentHint, DeviceAddress, DistributionId, EnvelopeContent, EnvelopeType, Error,
    OutgoingEnvelope, PreKeyBundle, Result, SealedSenderAccess, SenderCertificate,
    SenderKeyTracker, ServiceAddress, SessionCipher, SessionStore,
};

/// Per-device header in a multicast message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientHeader {
    pub address: ServiceAddress,
    pub device_id: u32,
    pub registration_id: u32,
}

/// Wire form of a multicast: one sender-key ciphertext plus the device list
/// the server fans it out to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiRecipientMessage {
    pub distribution_id: DistributionId,
    pub key_id: u32,
    pub message_number: u32,
    #[serde(with = "hex::serde")]
    pub body: Vec<u8>,
    pub recipients: Vec<RecipientHeader>,
}

/// Plaintext under the sender key. The certificate travels inside so only
/// group members learn who sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderCertificate>,
    pub content_hint: ContentHint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(with = "hex::serde")]
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCiphertext {
    pub ciphertext: Vec<u8>,
    pub included: Vec<DeviceAddress>,
    /// Devices dropped from this send and why.
    pub excluded: Vec<(DeviceAddress, CipherError)>,
}

impl GroupCiphertext {
    pub fn is_empty(&self) -> bool {
        self.included.is_empty()
    }
}

/// Turns plaintext into wire envelopes, pairwise or with a sender key.
///
/// Callers serialize access to one device's session through
/// [`crate::DeviceLocks`]; nothing here takes a device lock.
pub struct EnvelopeCipher {
    sessions: Arc<dyn SessionStore>,
    cipher: Arc<dyn SessionCipher>,
    sender_keys: Arc<SenderKeyTracker>,
    max_envelope_size: usize,
}

impl EnvelopeCipher {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        cipher: Arc<dyn SessionCipher>,
        sender_keys: Arc<SenderKeyTracker>,
        max_envelope_size: usize,
    ) -> Self {
        Self {
            sessions,
            cipher,
            sender_keys,
            max_envelope_size,
        }
    }

    pub fn enforce_max_size(&self, content: &EnvelopeContent) -> Result<()> {
        let size = content.size();
        if size > self.max_envelope_size {
            warn!(size, max = self.max_envelope_size, "content exceeds envelope size limit");
            return Err(Error::ContentTooLarge {
                size,
                max: self.max_envelope_size,
            });
        }
        Ok(())
    }

    /// Builds a session from a fetched bundle and stores it.
    pub fn establish_session(&self, address: &DeviceAddress, bundle: &PreKeyBundle) -> Result<()> {
        let record = self
            .cipher
            .process_pre_key_bundle(address, bundle)
            .map_err(|e| match e {
                CipherError::InvalidKey(reason) => {
                    warn!(device = %address, reason = %reason, "invalid pre-key bundle");
                    Error::InvalidPreKey(address.clone())
                }
                other => cipher_error(address, other),
            })?;
        debug!(device = %address, "established session from pre-key bundle");
        self.sessions.store_session(address, record)
    }

    pub fn encrypt_for_device(
        &self,
        address: &DeviceAddress,
        content: &EnvelopeContent,
        access: Option<&SealedSenderAccess>,
        now_ms: u64,
    ) -> Result<OutgoingEnvelope> {
        self.enforce_max_size(content)?;

        let mut session = self
            .sessions
            .load_session(address)?
            .ok_or_else(|| CipherError::NoSession(address.clone()))?;

        if !self
            .cipher
            .is_trusted_identity(address, &session.remote_identity)
        {
            return Err(cipher_error(
                address,
                CipherError::UntrustedIdentity {
                    address: address.clone(),
                    identity_key: session.remote_identity,
                },
            ));
        }

        let message = self
            .cipher
            .encrypt(address, &mut session, &content.padded())
            .map_err(|e| cipher_error(address, e))?;

        let (envelope_type, body) = match access {
            Some(access) => {
                let unidentified = UnidentifiedContent::new(
                    access.certificate.clone(),
                    message.message_type,
                    content.content_hint(),
                    content.group_id().map(str::to_string),
                    &message.body,
                );
                let sealed = sealed::seal(&unidentified, &session.remote_identity, now_ms)?;
                (EnvelopeType::SealedSender, sealed)
            }
            None => (message.message_type, message.body),
        };

        let registration_id = session.remote_registration_id;
        self.sessions.store_session(address, session)?;

        Ok(OutgoingEnvelope {
            envelope_type,
            destination_device_id: address.device_id,
            destination_registration_id: registration_id,
            content: base64::engine::general_purpose::STANDARD.encode(body),
        })
    }

    /// Encrypts once with the distribution's chain for all `targets`.
    /// Devices without a usable session are reported in `excluded` instead
    /// of failing the send.
    pub fn encrypt_for_group(
        &self,
        distribution_id: &DistributionId,
        targets: &[DeviceAddress],
        content: &EnvelopeContent,
        access: Option<&SealedSenderAccess>,
        now_ms: u64,
    ) -> Result<GroupCiphertext> {
        self.enforce_max_size(content)?;
        if let Some(access) = access {
            if access.certificate.is_expired(now_ms) {
                return Err(CipherError::ExpiredCertificate.into());
            }
        }

        let mut headers = Vec::new();
        let mut included = Vec::new();
        let mut excluded = Vec::new();
        for target in targets {
            match self.sessions.load_session(target)? {
                None => excluded.push((target.clone(), CipherError::NoSession(target.clone()))),
                Some(session) if !self.cipher.is_trusted_identity(target, &session.remote_identity) => {
                    warn!(device = %target, "excluding untrusted device from group send");
                    excluded.push((
                        target.clone(),
                        CipherError::UntrustedIdentity {
                            address: target.clone(),
                            identity_key: session.remote_identity,
                        },
                    ));
                }
                Some(session) => {
                    headers.push(RecipientHeader {
                        address: target.address.clone(),
                        device_id: target.device_id,
                        registration_id: session.remote_registration_id,
                    });
                    included.push(target.clone());
                }
            }
        }

        if included.is_empty() {
            return Ok(GroupCiphertext {
                ciphertext: Vec::new(),
                included,
                excluded,
            });
        }

        let payload = GroupPayload {
            sender: access.map(|a| a.certificate.clone()),
            content_hint: content.content_hint(),
            group_id: content.group_id().map(str::to_string),
            content: content.padded(),
        };
        let plaintext = serde_json::to_vec(&payload)?;
        let (key_id, message_number, body) = self.sender_keys.encrypt(distribution_id, &plaintext)?;

        let message = MultiRecipientMessage {
            distribution_id: *distribution_id,
            key_id,
            message_number,
            body,
            recipients: headers,
        };

        Ok(GroupCiphertext {
            ciphertext: serde_json::to_vec(&message)?,
            included,
            excluded,
        })
    }
}

/// Receiving side of a multicast, for a device holding the distribution.
pub fn open_group_message(
    state: &mut SenderKeyState,
    ciphertext: &[u8],
) -> Result<(MultiRecipientMessage, GroupPayload)> {
    let message: MultiRecipientMessage = serde_json::from_slice(ciphertext)?;
    let plaintext = state.decrypt_from_bytes(message.message_number, &message.body)?;
    let payload: GroupPayload = serde_json::from_slice(&plaintext)?;
    Ok((message, payload))
}

fn cipher_error(address: &DeviceAddress, error: CipherError) -> Error {
    match error {
        CipherError::UntrustedIdentity { identity_key, .. } => Error::UntrustedIdentity {
            address: address.address.clone(),
            identity_key,
        },
        other => Error::Cipher(other),
    }
}
