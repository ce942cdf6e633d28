use crate::{CipherError, DeviceAddress, EnvelopeType, IdentityKey, PreKeyBundle, SessionRecord};

/// Output of a pairwise encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextMessage {
    pub message_type: EnvelopeType,
    pub body: Vec<u8>,
}

/// The pairwise ratchet. Implementations own the key agreement and message
/// key math; the engine only decides when to call them.
pub trait SessionCipher: Send + Sync {
    /// Verifies a bundle and derives a fresh session from it.
    /// Fails with `InvalidKey` for malformed bundles and
    /// `UntrustedIdentity` when the bundle's identity key is not trusted.
    fn process_pre_key_bundle(
        &self,
        address: &DeviceAddress,
        bundle: &PreKeyBundle,
    ) -> Result<SessionRecord, CipherError>;

    /// Encrypts padded plaintext, advancing `session` in place.
    fn encrypt(
        &self,
        address: &DeviceAddress,
        session: &mut SessionRecord,
        plaintext: &[u8],
    ) -> Result<CiphertextMessage, CipherError>;

    fn is_trusted_identity(&self, address: &DeviceAddress, identity: &IdentityKey) -> bool;
}
