use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::DeviceAddress;

/// One mutex per device. Held across the check-session, fetch-bundle,
/// establish and encrypt sequence so two sends never race to build or
/// advance the same session.
#[derive(Default)]
pub struct DeviceLocks {
    locks: Mutex<HashMap<DeviceAddress, Arc<Mutex<()>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, address: &DeviceAddress) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the entry for `address` unless another caller still holds it.
    fn release(&self, address: &DeviceAddress, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap();
        // one reference in the map, one here
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(address);
        }
    }

    /// Runs `f` while holding the lock for `address`. Not reentrant.
    pub fn with_lock<T>(&self, address: &DeviceAddress, f: impl FnOnce() -> T) -> T {
        let lock = self.lock_for(address);
        let result = {
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f()
        };
        self.release(address, lock);
        result
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServiceAddress;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn same_device_is_serialized() {
        let locks = Arc::new(DeviceLocks::new());
        let device = ServiceAddress::random().device(1);
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let locks = locks.clone();
                let device = device.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                scope.spawn(move || {
                    for _ in 0..20 {
                        locks.with_lock(&device, || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_inside.fetch_max(now, Ordering::SeqCst);
                            std::thread::yield_now();
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                });
            }
        });

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[test]
    fn idle_devices_are_forgotten() {
        let locks = DeviceLocks::new();
        let bob = ServiceAddress::random();
        for device_id in 1..=3 {
            locks.with_lock(&bob.device(device_id), || {
                assert_eq!(locks.len(), 1);
            });
        }
        assert!(locks.is_empty());
    }
}
