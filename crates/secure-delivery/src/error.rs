use thiserror::Error;

use crate::transport::{GroupMismatchedDevices, GroupStaleDevices, MismatchedDevices, StaleDevices};
use crate::{DeviceAddress, IdentityKey, ServiceAddress};

/// Typed failures raised by the transport and key-directory collaborators.
///
/// This is a closed set: retry decisions match on it exhaustively instead of
/// inspecting error types at runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Authorization failed")]
    Unauthorized,

    #[error("Unregistered user: {0}")]
    Unregistered(String),

    #[error("Mismatched devices (extra: {:?}, missing: {:?})", .0.extra_devices, .0.missing_devices)]
    MismatchedDevices(MismatchedDevices),

    #[error("Stale devices: {:?}", .0.stale_devices)]
    StaleDevices(StaleDevices),

    #[error("Group mismatched devices for {} recipients", .0.len())]
    GroupMismatchedDevices(Vec<GroupMismatchedDevices>),

    #[error("Group stale devices for {} recipients", .0.len())]
    GroupStaleDevices(Vec<GroupStaleDevices>),

    #[error("Rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Proof required (retry after {retry_after_seconds} s)")]
    ProofRequired {
        token: String,
        retry_after_seconds: i64,
    },

    #[error("Server rejected the request")]
    ServerRejected,

    #[error("Server error: status {0}")]
    ServerError(u16),

    #[error("Pipe unavailable")]
    PipeUnavailable,

    #[error("Network error: {0}")]
    Network(String),
}

impl TransportError {
    /// Failures that describe the request or the account rather than the
    /// connection. These are never retried on another transport.
    pub fn is_non_technical(&self) -> bool {
        matches!(
            self,
            TransportError::Unauthorized
                | TransportError::Unregistered(_)
                | TransportError::MismatchedDevices(_)
                | TransportError::StaleDevices(_)
                | TransportError::GroupMismatchedDevices(_)
                | TransportError::GroupStaleDevices(_)
                | TransportError::RateLimited { .. }
                | TransportError::ProofRequired { .. }
                | TransportError::ServerRejected
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("No session for {0}")]
    NoSession(DeviceAddress),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Untrusted identity for {address}")]
    UntrustedIdentity {
        address: DeviceAddress,
        identity_key: IdentityKey,
    },

    #[error("Sender certificate expired")]
    ExpiredCertificate,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Content too large: {size} > {max}")]
    ContentTooLarge { size: usize, max: usize },

    #[error("Failed to resolve conflicts after {0} attempts")]
    ConflictRetriesExhausted(u32),

    #[error("Untrusted identity key for {address}")]
    UntrustedIdentity {
        address: ServiceAddress,
        identity_key: IdentityKey,
    },

    #[error("Invalid pre-key bundle for {0}")]
    InvalidPreKey(DeviceAddress),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Too many skipped messages")]
    TooManySkippedMessages,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    NostrKey(#[from] nostr::key::Error),

    #[error(transparent)]
    Nip44(#[from] nostr::nips::nip44::Error),
}

impl Error {
    /// The transport failure behind this error, if any.
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            Error::Transport(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
