use hkdf::Hkdf;
use nostr::PublicKey;
use sha2::Sha256;

use crate::{Error, Result};

pub fn kdf(input1: &[u8], input2: &[u8], num_outputs: usize) -> Vec<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(input2), input1);

    let mut outputs = Vec::with_capacity(num_outputs);
    for i in 1..=num_outputs {
        let mut okm = [0u8; 32];
        // 32 bytes is always a valid HKDF-SHA256 output length
        if hk.expand(&[i as u8], &mut okm).is_ok() {
            outputs.push(okm);
        }
    }
    outputs
}

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn pubkey_from_hex(hex_str: &str) -> Result<PublicKey> {
    let bytes = hex::decode(hex_str)?;
    if bytes.len() != 32 {
        return Err(Error::Serialization("Invalid pubkey length".to_string()));
    }
    PublicKey::from_slice(&bytes).map_err(|e| Error::Serialization(e.to_string()))
}

/// Storage keys are built from service ids and device ids, both of which are
/// safe path segments.
pub fn storage_key(prefix: &str, parts: &[&str]) -> String {
    let mut key = prefix.to_string();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push('/');
        }
        key.push_str(part);
    }
    key
}
