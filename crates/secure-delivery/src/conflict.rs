use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    DeviceAddress, DeviceLocks, EnvelopeCipher, KeyDirectory, Result, SenderKeyTracker,
    ServiceAddress, SessionStore,
};

/// Reconciles local sessions with the server's view of a recipient's
/// devices after a mismatched-devices or stale-devices answer.
pub struct ConflictResolver {
    sessions: Arc<dyn SessionStore>,
    key_directory: Arc<dyn KeyDirectory>,
    envelope_cipher: Arc<EnvelopeCipher>,
    sender_keys: Arc<SenderKeyTracker>,
    locks: Arc<DeviceLocks>,
}

impl ConflictResolver {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        key_directory: Arc<dyn KeyDirectory>,
        envelope_cipher: Arc<EnvelopeCipher>,
        sender_keys: Arc<SenderKeyTracker>,
        locks: Arc<DeviceLocks>,
    ) -> Self {
        Self {
            sessions,
            key_directory,
            envelope_cipher,
            sender_keys,
            locks,
        }
    }

    fn archive(&self, device: &DeviceAddress) -> Result<()> {
        self.locks
            .with_lock(device, || self.sessions.archive_session(device))
    }

    /// Archives `extra`, forgets sender-key sharing for `extra` and
    /// `missing`, and builds sessions for `missing`.
    pub fn on_mismatched_devices(
        &self,
        recipient: &ServiceAddress,
        extra: &[u32],
        missing: &[u32],
    ) -> Result<()> {
        info!(
            recipient = %recipient,
            extra = ?extra,
            missing = ?missing,
            "resolving mismatched devices"
        );

        let extra_devices: Vec<DeviceAddress> = extra.iter().map(|d| recipient.device(*d)).collect();
        let missing_devices: Vec<DeviceAddress> = missing.iter().map(|d| recipient.device(*d)).collect();

        for device in &extra_devices {
            self.archive(device)?;
        }

        let mut cleared = extra_devices.clone();
        cleared.extend(missing_devices.iter().cloned());
        self.sender_keys.clear_shared_with(&cleared)?;

        for device in &missing_devices {
            self.locks.with_lock(device, || -> Result<()> {
                let bundles = self.key_directory.fetch_pre_key_bundles(
                    recipient,
                    Some(device.device_id),
                    None,
                )?;
                let Some(bundle) = bundles.iter().find(|b| b.device_id == device.device_id) else {
                    warn!(device = %device, "no pre-key bundle returned for missing device");
                    return Ok(());
                };
                self.envelope_cipher.establish_session(device, bundle)
            })?;
        }

        Ok(())
    }

    /// Archives `stale` sessions and forgets their sender-key sharing.
    pub fn on_stale_devices(&self, recipient: &ServiceAddress, stale: &[u32]) -> Result<()> {
        info!(recipient = %recipient, stale = ?stale, "resolving stale devices");

        let devices: Vec<DeviceAddress> = stale.iter().map(|d| recipient.device(*d)).collect();
        for device in &devices {
            self.archive(device)?;
        }
        self.sender_keys.clear_shared_with(&devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{StaticKeyDirectory, TestCipher, TestDevice};
    use crate::{DistributionId, Error, InMemoryStorage, StorageSessionStore};

    struct Fixture {
        sessions: Arc<StorageSessionStore>,
        directory: Arc<StaticKeyDirectory>,
        cipher: Arc<TestCipher>,
        tracker: Arc<SenderKeyTracker>,
        envelope: Arc<EnvelopeCipher>,
        resolver: ConflictResolver,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryStorage::new());
        let sessions = Arc::new(StorageSessionStore::new(storage.clone()));
        let directory = Arc::new(StaticKeyDirectory::new());
        let cipher = Arc::new(TestCipher::new());
        let tracker = Arc::new(SenderKeyTracker::new(storage, sessions.clone()));
        let envelope = Arc::new(EnvelopeCipher::new(
            sessions.clone(),
            cipher.clone(),
            tracker.clone(),
            crate::MAX_ENVELOPE_SIZE,
        ));
        let resolver = ConflictResolver::new(
            sessions.clone(),
            directory.clone(),
            envelope.clone(),
            tracker.clone(),
            Arc::new(DeviceLocks::new()),
        );
        Fixture {
            sessions,
            directory,
            cipher,
            tracker,
            envelope,
            resolver,
        }
    }

    #[test]
    fn mismatched_archives_extra_and_builds_missing() -> Result<()> {
        let f = fixture();
        let bob = ServiceAddress::random();
        let old = TestDevice::new(bob.clone(), 3);
        let new = TestDevice::new(bob.clone(), 2);
        f.envelope.establish_session(&old.address, &old.bundle())?;
        f.directory.publish(&new);

        let id = DistributionId::new_random();
        f.tracker.get_or_create(&id)?;
        f.tracker.mark_shared(&id, &[old.address.clone()])?;

        f.resolver.on_mismatched_devices(&bob, &[3], &[2])?;

        assert!(!f.sessions.contains_session(&old.address)?);
        assert!(f.sessions.contains_session(&new.address)?);
        assert!(f.tracker.shared_with(&id)?.is_empty());
        assert_eq!(f.directory.fetches().len(), 1);
        Ok(())
    }

    #[test]
    fn untrusted_missing_device_is_identity_mismatch() -> Result<()> {
        let f = fixture();
        let bob = ServiceAddress::random();
        let device = TestDevice::new(bob.clone(), 2);
        f.directory.publish(&device);
        f.cipher.distrust(device.keys.public_key());

        let result = f.resolver.on_mismatched_devices(&bob, &[], &[2]);
        assert!(matches!(result, Err(Error::UntrustedIdentity { .. })));
        Ok(())
    }

    #[test]
    fn stale_devices_are_archived_and_cleared() -> Result<()> {
        let f = fixture();
        let bob = ServiceAddress::random();
        let device = TestDevice::new(bob.clone(), 1);
        f.envelope.establish_session(&device.address, &device.bundle())?;

        let id = DistributionId::new_random();
        f.tracker.get_or_create(&id)?;
        f.tracker.mark_shared(&id, &[device.address.clone()])?;

        f.resolver.on_stale_devices(&bob, &[1])?;

        assert!(!f.sessions.contains_session(&device.address)?);
        assert!(f.tracker.shared_with(&id)?.is_empty());
        Ok(())
    }
}
