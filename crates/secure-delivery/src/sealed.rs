//! Sealed sender.
//!
//! The pairwise ciphertext and the sender certificate are wrapped together
//! with nip44 v2 from a one-time ephemeral key to the recipient's identity
//! key. The server sees only the destination; the recipient learns the
//! sender from the certificate after unsealing.

use base64::Engine;
use nostr::nips::nip44::{self, Version};
use nostr::{Keys, PublicKey, SecretKey};
use serde::{Deserialize, Serialize};

use crate::{
    CipherError, ContentHint, EnvelopeType, Error, IdentityKey, Result, SenderCertificate,
};

/// What the recipient recovers after unsealing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnidentifiedContent {
    pub certificate: SenderCertificate,
    pub envelope_type: EnvelopeType,
    pub content_hint: ContentHint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Base64-encoded inner ciphertext.
    pub body: String,
}

impl UnidentifiedContent {
    pub fn new(
        certificate: SenderCertificate,
        envelope_type: EnvelopeType,
        content_hint: ContentHint,
        group_id: Option<String>,
        body: &[u8],
    ) -> Self {
        Self {
            certificate,
            envelope_type,
            content_hint,
            group_id,
            body: base64::engine::general_purpose::STANDARD.encode(body),
        }
    }

    pub fn body_bytes(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.body)
            .map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SealedPayload {
    ephemeral_key: PublicKey,
    content: String,
}

/// Seals `content` to `recipient_identity`. The certificate must not be
/// expired at `now_ms`.
pub fn seal(
    content: &UnidentifiedContent,
    recipient_identity: &IdentityKey,
    now_ms: u64,
) -> Result<Vec<u8>> {
    if content.certificate.is_expired(now_ms) {
        return Err(CipherError::ExpiredCertificate.into());
    }

    let ephemeral = Keys::generate();
    let inner = serde_json::to_string(content)?;
    let encrypted = nip44::encrypt(ephemeral.secret_key(), recipient_identity, inner, Version::V2)?;

    let payload = SealedPayload {
        ephemeral_key: ephemeral.public_key(),
        content: encrypted,
    };
    Ok(serde_json::to_vec(&payload)?)
}

/// Opens a sealed envelope with the recipient's identity secret key.
pub fn unseal(recipient_secret: &SecretKey, sealed: &[u8]) -> Result<UnidentifiedContent> {
    let payload: SealedPayload = serde_json::from_slice(sealed)?;
    let decrypted = nip44::decrypt(recipient_secret, &payload.ephemeral_key, &payload.content)?;
    Ok(serde_json::from_str(&decrypted)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServiceAddress;

    fn certificate(expires_at_ms: u64) -> SenderCertificate {
        SenderCertificate {
            sender: ServiceAddress::random(),
            sender_device_id: 2,
            sender_identity: Keys::generate().public_key(),
            expires_at_ms,
        }
    }

    #[test]
    fn seal_hides_sender_until_unsealed() -> Result<()> {
        let recipient = Keys::generate();
        let cert = certificate(10_000);
        let content = UnidentifiedContent::new(
            cert.clone(),
            EnvelopeType::Whisper,
            ContentHint::Resendable,
            None,
            b"ciphertext",
        );

        let sealed = seal(&content, &recipient.public_key(), 5_000)?;
        let wire = String::from_utf8_lossy(&sealed);
        assert!(!wire.contains(&cert.sender.identifier()));

        let opened = unseal(recipient.secret_key(), &sealed)?;
        assert_eq!(opened.certificate, cert);
        assert_eq!(opened.body_bytes()?, b"ciphertext");
        Ok(())
    }

    #[test]
    fn expired_certificate_is_rejected() {
        let content = UnidentifiedContent::new(
            certificate(1_000),
            EnvelopeType::Whisper,
            ContentHint::Default,
            None,
            b"x",
        );
        let result = seal(&content, &Keys::generate().public_key(), 1_000);
        assert!(matches!(
            result,
            Err(Error::Cipher(CipherError::ExpiredCertificate))
        ));
    }

    #[test]
    fn wrong_recipient_cannot_unseal() -> Result<()> {
        let recipient = Keys::generate();
        let content = UnidentifiedContent::new(
            certificate(10_000),
            EnvelopeType::PreKey,
            ContentHint::Default,
            None,
            b"x",
        );
        let sealed = seal(&content, &recipient.public_key(), 0)?;
        assert!(unseal(Keys::generate().secret_key(), &sealed).is_err());
        Ok(())
    }
}
