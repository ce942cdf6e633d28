use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::utils::{now_millis, storage_key};
use crate::{DeviceAddress, Result, ServiceAddress, SessionRecord, StorageAdapter, DEFAULT_DEVICE_ID};

pub const SESSION_PREFIX: &str = "v1/session/";

/// Owner of pairwise sessions, keyed by device. Archived sessions are kept
/// but never count as live.
pub trait SessionStore: Send + Sync {
    fn contains_session(&self, address: &DeviceAddress) -> Result<bool>;

    /// The live session for `address`, if any.
    fn load_session(&self, address: &DeviceAddress) -> Result<Option<SessionRecord>>;

    fn store_session(&self, address: &DeviceAddress, record: SessionRecord) -> Result<()>;

    fn archive_session(&self, address: &DeviceAddress) -> Result<()>;

    /// Device ids other than the default device that have a live session.
    fn sub_device_sessions(&self, address: &ServiceAddress) -> Result<Vec<u32>>;

    /// Every live session belonging to any of `addresses`.
    fn all_with_active_sessions(
        &self,
        addresses: &[ServiceAddress],
    ) -> Result<HashMap<DeviceAddress, SessionRecord>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSession {
    record: SessionRecord,
    #[serde(default)]
    archived_at: Option<u64>,
}

/// Session store persisted through a [`StorageAdapter`] as one JSON document
/// per device under `v1/session/<service id>/<device id>`.
#[derive(Clone)]
pub struct StorageSessionStore {
    storage: Arc<dyn StorageAdapter>,
}

impl StorageSessionStore {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    fn key(address: &DeviceAddress) -> String {
        storage_key(
            SESSION_PREFIX,
            &[&address.address.identifier(), &address.device_id.to_string()],
        )
    }

    fn load_stored(&self, address: &DeviceAddress) -> Result<Option<StoredSession>> {
        match self.storage.get(&Self::key(address))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn live_devices(&self, address: &ServiceAddress) -> Result<Vec<(u32, SessionRecord)>> {
        let prefix = format!("{}{}/", SESSION_PREFIX, address.identifier());
        let mut out = Vec::new();
        for key in self.storage.list(&prefix)? {
            let Some(device_id) = key
                .strip_prefix(&prefix)
                .and_then(|d| d.parse::<u32>().ok())
            else {
                continue;
            };
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };
            let stored: StoredSession = serde_json::from_str(&raw)?;
            if stored.archived_at.is_none() {
                out.push((device_id, stored.record));
            }
        }
        out.sort_by_key(|(device_id, _)| *device_id);
        Ok(out)
    }
}

impl SessionStore for StorageSessionStore {
    fn contains_session(&self, address: &DeviceAddress) -> Result<bool> {
        Ok(self.load_session(address)?.is_some())
    }

    fn load_session(&self, address: &DeviceAddress) -> Result<Option<SessionRecord>> {
        Ok(self
            .load_stored(address)?
            .filter(|s| s.archived_at.is_none())
            .map(|s| s.record))
    }

    fn store_session(&self, address: &DeviceAddress, record: SessionRecord) -> Result<()> {
        let stored = StoredSession {
            record,
            archived_at: None,
        };
        self.storage
            .put(&Self::key(address), serde_json::to_string(&stored)?)
    }

    fn archive_session(&self, address: &DeviceAddress) -> Result<()> {
        let Some(mut stored) = self.load_stored(address)? else {
            return Ok(());
        };
        if stored.archived_at.is_none() {
            stored.archived_at = Some(now_millis());
            self.storage
                .put(&Self::key(address), serde_json::to_string(&stored)?)?;
        }
        Ok(())
    }

    fn sub_device_sessions(&self, address: &ServiceAddress) -> Result<Vec<u32>> {
        Ok(self
            .live_devices(address)?
            .into_iter()
            .map(|(device_id, _)| device_id)
            .filter(|device_id| *device_id != DEFAULT_DEVICE_ID)
            .collect())
    }

    fn all_with_active_sessions(
        &self,
        addresses: &[ServiceAddress],
    ) -> Result<HashMap<DeviceAddress, SessionRecord>> {
        let mut out = HashMap::new();
        for address in addresses {
            for (device_id, record) in self.live_devices(address)? {
                out.insert(address.device(device_id), record);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStorage;
    use nostr::Keys;

    fn record() -> SessionRecord {
        SessionRecord::new(Keys::generate().public_key(), 7, vec![1, 2, 3])
    }

    #[test]
    fn archived_sessions_are_not_live() -> Result<()> {
        let store = StorageSessionStore::new(Arc::new(InMemoryStorage::new()));
        let alice = ServiceAddress::random();

        store.store_session(&alice.device(1), record())?;
        store.store_session(&alice.device(2), record())?;
        store.store_session(&alice.device(3), record())?;
        assert_eq!(store.sub_device_sessions(&alice)?, vec![2, 3]);

        store.archive_session(&alice.device(2))?;
        assert!(!store.contains_session(&alice.device(2))?);
        assert_eq!(store.sub_device_sessions(&alice)?, vec![3]);

        let active = store.all_with_active_sessions(std::slice::from_ref(&alice))?;
        assert_eq!(active.len(), 2);
        assert!(active.contains_key(&alice.device(1)));
        Ok(())
    }

    #[test]
    fn storing_revives_archived_device() -> Result<()> {
        let store = StorageSessionStore::new(Arc::new(InMemoryStorage::new()));
        let bob = ServiceAddress::random();

        store.store_session(&bob.device(2), record())?;
        store.archive_session(&bob.device(2))?;
        store.store_session(&bob.device(2), record())?;
        assert!(store.contains_session(&bob.device(2))?);
        Ok(())
    }

    #[test]
    fn archive_missing_session_is_noop() -> Result<()> {
        let store = StorageSessionStore::new(Arc::new(InMemoryStorage::new()));
        store.archive_session(&ServiceAddress::random().device(1))
    }
}
