use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::sender_key::{SenderKeyDistribution, SenderKeyState};
use crate::utils::now_millis;
use crate::{DeviceAddress, DistributionId, Result, SessionStore, StorageAdapter};

pub const SENDER_KEY_PREFIX: &str = "v1/sender-key/";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DistributionRecord {
    #[serde(default)]
    state: Option<SenderKeyState>,
    #[serde(default)]
    shared_with: BTreeSet<DeviceAddress>,
}

/// Our sending sender-key chains and, per distribution, the set of devices
/// that already hold the current chain.
///
/// A device only counts as holding the key while it also has a live 1:1
/// session; callers must clear sharing whenever they archive a session.
pub struct SenderKeyTracker {
    storage: Arc<dyn StorageAdapter>,
    sessions: Arc<dyn SessionStore>,
    cache: Mutex<HashMap<DistributionId, DistributionRecord>>,
}

impl SenderKeyTracker {
    pub fn new(storage: Arc<dyn StorageAdapter>, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            storage,
            sessions,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn key(id: &DistributionId) -> String {
        format!("{}{}", SENDER_KEY_PREFIX, id)
    }

    fn load(
        &self,
        cache: &mut HashMap<DistributionId, DistributionRecord>,
        id: &DistributionId,
    ) -> Result<()> {
        if cache.contains_key(id) {
            return Ok(());
        }
        let record = match self.storage.get(&Self::key(id))? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => DistributionRecord::default(),
        };
        cache.insert(*id, record);
        Ok(())
    }

    fn save(&self, id: &DistributionId, record: &DistributionRecord) -> Result<()> {
        self.storage
            .put(&Self::key(id), serde_json::to_string(record)?)
    }

    fn with_record<T>(
        &self,
        id: &DistributionId,
        f: impl FnOnce(&mut DistributionRecord) -> Result<(T, bool)>,
    ) -> Result<T> {
        let mut cache = self.cache.lock().unwrap();
        self.load(&mut cache, id)?;
        let Some(record) = cache.get_mut(id) else {
            return Err(crate::Error::Storage(format!("distribution {} not loaded", id)));
        };
        let (out, dirty) = f(record)?;
        if dirty {
            self.save(id, record)?;
        }
        Ok(out)
    }

    pub fn has_session(&self, id: &DistributionId) -> Result<bool> {
        self.with_record(id, |record| Ok((record.state.is_some(), false)))
    }

    /// Distribution message for the current chain, creating the chain if
    /// this distribution has none yet.
    pub fn get_or_create(&self, id: &DistributionId) -> Result<SenderKeyDistribution> {
        self.with_record(id, |record| {
            let created = record.state.is_none();
            if created {
                info!(distribution_id = %id, "creating sender key chain");
                record.shared_with.clear();
            }
            let state = record.state.get_or_insert_with(SenderKeyState::new_random);
            Ok((state.distribution(*id, now_millis()), created))
        })
    }

    /// Devices that hold the current key. Devices whose 1:1 session is gone
    /// are evicted here.
    pub fn shared_with(&self, id: &DistributionId) -> Result<BTreeSet<DeviceAddress>> {
        self.with_record(id, |record| {
            let mut evicted = Vec::new();
            for device in &record.shared_with {
                if !self.sessions.contains_session(device)? {
                    evicted.push(device.clone());
                }
            }
            for device in &evicted {
                debug!(distribution_id = %id, device = %device, "evicting device without live session");
                record.shared_with.remove(device);
            }
            Ok((record.shared_with.clone(), !evicted.is_empty()))
        })
    }

    /// Records that `devices` received the current key. Returns how many were
    /// newly added; repeating a call is a no-op.
    pub fn mark_shared(&self, id: &DistributionId, devices: &[DeviceAddress]) -> Result<usize> {
        self.with_record(id, |record| {
            if record.state.is_none() {
                return Ok((0, false));
            }
            let added = devices
                .iter()
                .filter(|d| record.shared_with.insert((*d).clone()))
                .count();
            Ok((added, added > 0))
        })
    }

    /// Forgets `devices` in every distribution so they are re-sent the key
    /// on the next group send.
    pub fn clear_shared_with(&self, devices: &[DeviceAddress]) -> Result<()> {
        if devices.is_empty() {
            return Ok(());
        }

        let mut cache = self.cache.lock().unwrap();
        let mut ids: BTreeSet<DistributionId> = cache.keys().copied().collect();
        for key in self.storage.list(SENDER_KEY_PREFIX)? {
            if let Some(Ok(uuid)) = key
                .strip_prefix(SENDER_KEY_PREFIX)
                .map(uuid::Uuid::parse_str)
            {
                ids.insert(DistributionId(uuid));
            }
        }

        for id in ids {
            self.load(&mut cache, &id)?;
            if let Some(record) = cache.get_mut(&id) {
                let before = record.shared_with.len();
                for device in devices {
                    record.shared_with.remove(device);
                }
                if record.shared_with.len() != before {
                    self.save(&id, record)?;
                }
            }
        }
        Ok(())
    }

    /// Starts a new epoch: the chain is dropped and nobody holds the key.
    pub fn rotate(&self, id: &DistributionId) -> Result<()> {
        info!(distribution_id = %id, "rotating sender key");
        self.with_record(id, |record| {
            record.state = None;
            record.shared_with.clear();
            Ok(((), true))
        })
    }

    /// Encrypts with the distribution's chain. Returns the key id, message
    /// number and ciphertext.
    pub(crate) fn encrypt(&self, id: &DistributionId, plaintext: &[u8]) -> Result<(u32, u32, Vec<u8>)> {
        self.with_record(id, |record| {
            let state = record
                .state
                .get_or_insert_with(SenderKeyState::new_random);
            let (message_number, ciphertext) = state.encrypt_to_bytes(plaintext)?;
            Ok(((state.key_id, message_number, ciphertext), true))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryStorage, ServiceAddress, SessionRecord, StorageSessionStore};
    use nostr::Keys;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn setup() -> (Arc<InMemoryStorage>, Arc<StorageSessionStore>, SenderKeyTracker) {
        let storage = Arc::new(InMemoryStorage::new());
        let sessions = Arc::new(StorageSessionStore::new(storage.clone()));
        let tracker = SenderKeyTracker::new(storage.clone(), sessions.clone());
        (storage, sessions, tracker)
    }

    fn live(sessions: &StorageSessionStore, device: &DeviceAddress) -> Result<()> {
        sessions.store_session(
            device,
            SessionRecord::new(Keys::generate().public_key(), 1, vec![]),
        )
    }

    #[test]
    fn mark_shared_is_idempotent() -> Result<()> {
        let (_, sessions, tracker) = setup();
        let id = DistributionId::new_random();
        let device = ServiceAddress::random().device(1);
        live(&sessions, &device)?;

        tracker.get_or_create(&id)?;
        assert_eq!(tracker.mark_shared(&id, &[device.clone()])?, 1);
        assert_eq!(tracker.mark_shared(&id, &[device.clone()])?, 0);
        assert_eq!(tracker.shared_with(&id)?.len(), 1);
        Ok(())
    }

    #[test]
    fn archived_sessions_are_evicted() -> Result<()> {
        let (_, sessions, tracker) = setup();
        let id = DistributionId::new_random();
        let device = ServiceAddress::random().device(2);
        live(&sessions, &device)?;

        tracker.get_or_create(&id)?;
        tracker.mark_shared(&id, &[device.clone()])?;
        sessions.archive_session(&device)?;

        assert!(tracker.shared_with(&id)?.is_empty());
        Ok(())
    }

    #[test]
    fn clear_applies_to_every_distribution() -> Result<()> {
        let (_, sessions, tracker) = setup();
        let first = DistributionId::new_random();
        let second = DistributionId::new_random();
        let device = ServiceAddress::random().device(1);
        live(&sessions, &device)?;

        for id in [&first, &second] {
            tracker.get_or_create(id)?;
            tracker.mark_shared(id, &[device.clone()])?;
        }
        tracker.clear_shared_with(&[device.clone()])?;

        assert!(tracker.shared_with(&first)?.is_empty());
        assert!(tracker.shared_with(&second)?.is_empty());
        Ok(())
    }

    #[test]
    fn state_is_reloaded_from_storage() -> Result<()> {
        let (storage, sessions, tracker) = setup();
        let id = DistributionId::new_random();
        let device = ServiceAddress::random().device(1);
        live(&sessions, &device)?;

        let distribution = tracker.get_or_create(&id)?;
        tracker.mark_shared(&id, &[device.clone()])?;

        let reopened = SenderKeyTracker::new(storage, sessions);
        assert!(reopened.has_session(&id)?);
        assert_eq!(reopened.get_or_create(&id)?.key_id, distribution.key_id);
        assert!(reopened.shared_with(&id)?.contains(&device));
        Ok(())
    }

    #[test]
    fn rotate_starts_new_epoch() -> Result<()> {
        let (_, sessions, tracker) = setup();
        let id = DistributionId::new_random();
        let device = ServiceAddress::random().device(1);
        live(&sessions, &device)?;

        let before = tracker.get_or_create(&id)?;
        tracker.mark_shared(&id, &[device])?;
        tracker.rotate(&id)?;

        assert!(!tracker.has_session(&id)?);
        assert!(tracker.shared_with(&id)?.is_empty());
        assert_ne!(tracker.get_or_create(&id)?.chain_key, before.chain_key);
        Ok(())
    }

    #[test]
    fn random_archive_and_share_interleavings_never_count_dead_devices() -> Result<()> {
        let (_, sessions, tracker) = setup();
        let id = DistributionId::new_random();
        let users: Vec<ServiceAddress> = (0..3).map(|_| ServiceAddress::random()).collect();
        let devices: Vec<DeviceAddress> = users
            .iter()
            .flat_map(|u| (1..=3).map(move |d| u.device(d)))
            .collect();
        tracker.get_or_create(&id)?;

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let device = devices[rng.gen_range(0..devices.len())].clone();
            match rng.gen_range(0..3) {
                0 => live(&sessions, &device)?,
                1 => {
                    sessions.archive_session(&device)?;
                    tracker.clear_shared_with(&[device])?;
                }
                _ => {
                    if sessions.contains_session(&device)? {
                        tracker.mark_shared(&id, &[device])?;
                    }
                }
            }

            for shared in tracker.shared_with(&id)? {
                assert!(sessions.contains_session(&shared)?);
            }
        }
        Ok(())
    }
}
