use nostr::nips::nip44;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{DistributionId, Error, Result};

/// Out-of-order window for a receiving sender-key chain.
pub const SENDER_KEY_MAX_SKIP: usize = 10_000;

/// Cap on cached skipped message keys.
pub const SENDER_KEY_MAX_STORED_SKIPPED_KEYS: usize = 2_000;

const SENDER_KEY_KDF_SALT: &[u8] = b"secure-delivery-sender-key-v1";

/// The distribution message: everything a recipient needs to decrypt our
/// group messages from `iteration` onward.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SenderKeyDistribution {
    pub distribution_id: DistributionId,
    pub key_id: u32,
    #[serde(with = "serde_bytes_array")]
    pub chain_key: [u8; 32],
    pub iteration: u32,
    pub created_at: u64,
}

impl SenderKeyDistribution {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Receiving state that decrypts messages from this distribution.
    pub fn receiving_state(&self) -> SenderKeyState {
        SenderKeyState::new(self.key_id, self.chain_key, self.iteration)
    }
}

/// One symmetric hash-ratchet chain. The sending side only advances; the
/// receiving side may skip ahead and cache keys for late messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SenderKeyState {
    pub key_id: u32,
    #[serde(with = "serde_bytes_array")]
    chain_key: [u8; 32],
    iteration: u32,
    #[serde(with = "serde_hashmap_u32_bytes", default)]
    skipped_message_keys: HashMap<u32, [u8; 32]>,
}

impl SenderKeyState {
    pub fn new(key_id: u32, chain_key: [u8; 32], iteration: u32) -> Self {
        Self {
            key_id,
            chain_key,
            iteration,
            skipped_message_keys: HashMap::new(),
        }
    }

    pub fn new_random() -> Self {
        Self::new(rand::random::<u32>(), rand::random::<[u8; 32]>(), 0)
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn skipped_len(&self) -> usize {
        self.skipped_message_keys.len()
    }

    pub fn distribution(&self, distribution_id: DistributionId, created_at: u64) -> SenderKeyDistribution {
        SenderKeyDistribution {
            distribution_id,
            key_id: self.key_id,
            chain_key: self.chain_key,
            iteration: self.iteration,
            created_at,
        }
    }

    /// Encrypts with the next message key. Returns the message number used.
    pub fn encrypt_to_bytes(&mut self, plaintext: &[u8]) -> Result<(u32, Vec<u8>)> {
        let message_number = self.iteration;
        let (next_chain_key, message_key) = derive_message_key(&self.chain_key);

        self.chain_key = next_chain_key;
        self.iteration = self.iteration.saturating_add(1);

        let conversation_key = nip44::v2::ConversationKey::new(message_key);
        let encrypted = nip44::v2::encrypt_to_bytes(&conversation_key, plaintext)?;

        Ok((message_number, encrypted))
    }

    pub fn decrypt_from_bytes(&mut self, message_number: u32, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if message_number < self.iteration {
            let message_key = self
                .skipped_message_keys
                .remove(&message_number)
                .ok_or_else(|| Error::Decryption("Missing skipped sender key message".to_string()))?;

            return decrypt_with_message_key(&message_key, ciphertext);
        }

        let delta = (message_number - self.iteration) as usize;
        if delta > SENDER_KEY_MAX_SKIP {
            return Err(Error::TooManySkippedMessages);
        }

        while self.iteration < message_number {
            let (next_chain_key, message_key) = derive_message_key(&self.chain_key);
            self.chain_key = next_chain_key;
            self.skipped_message_keys.insert(self.iteration, message_key);
            self.iteration = self.iteration.saturating_add(1);
        }

        let (next_chain_key, message_key) = derive_message_key(&self.chain_key);
        self.chain_key = next_chain_key;
        self.iteration = self.iteration.saturating_add(1);

        prune_skipped(&mut self.skipped_message_keys);

        decrypt_with_message_key(&message_key, ciphertext)
    }
}

fn decrypt_with_message_key(message_key: &[u8; 32], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let conversation_key = nip44::v2::ConversationKey::new(*message_key);
    Ok(nip44::v2::decrypt_to_bytes(&conversation_key, ciphertext)?)
}

fn derive_message_key(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let outputs = crate::utils::kdf(chain_key, SENDER_KEY_KDF_SALT, 2);
    (outputs[0], outputs[1])
}

fn prune_skipped(map: &mut HashMap<u32, [u8; 32]>) {
    if map.len() <= SENDER_KEY_MAX_STORED_SKIPPED_KEYS {
        return;
    }

    // oldest first
    let mut keys: Vec<u32> = map.keys().cloned().collect();
    keys.sort_unstable();
    let to_remove = map.len().saturating_sub(SENDER_KEY_MAX_STORED_SKIPPED_KEYS);
    for k in keys.into_iter().take(to_remove) {
        map.remove(&k);
    }
}

mod serde_bytes_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let mut arr = [0u8; 32];
        hex::decode_to_slice(&s, &mut arr).map_err(serde::de::Error::custom)?;
        Ok(arr)
    }
}

mod serde_hashmap_u32_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;

    pub fn serialize<S>(map: &HashMap<u32, [u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let string_map: HashMap<String, String> = map
            .iter()
            .map(|(k, v)| (k.to_string(), hex::encode(v)))
            .collect();
        string_map.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<u32, [u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string_map: HashMap<String, String> = HashMap::deserialize(deserializer)?;
        let mut out = HashMap::new();
        for (k, v) in string_map {
            let idx: u32 = k.parse().map_err(serde::de::Error::custom)?;
            let mut arr = [0u8; 32];
            hex::decode_to_slice(&v, &mut arr).map_err(serde::de::Error::custom)?;
            out.insert(idx, arr);
        }
        Ok(out)
    }
}
