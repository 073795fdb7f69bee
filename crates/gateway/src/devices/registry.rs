//! Concurrent table of registered devices.
//!
//! A single `RwLock<HashMap>` guards the whole table. Device counts are
//! small and mutations rare next to lookups, so per-entry locking is not
//! worth it.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

use super::device::{Device, DeviceId};

/// Errors returned by [`DeviceRegistry`] operations.
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    /// A device with this identifier is already registered.
    #[error("device {0} already exists")]
    AlreadyExists(DeviceId),

    /// No device with this identifier is registered.
    #[error("device {0} not found")]
    NotFound(DeviceId),

    /// The offered sequence is not newer than the last accepted one.
    #[error("device {device_id}: sequence {sequence} is not newer than {last}")]
    StaleSequence {
        device_id: DeviceId,
        sequence: u32,
        last: u32,
    },

    /// A thread panicked while holding the table lock.
    #[error("device registry lock poisoned")]
    LockPoisoned,
}

/// Result type alias for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Thread-safe store of device records keyed by identifier.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceId, Device>>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RegistryResult<RwLockReadGuard<'_, HashMap<DeviceId, Device>>> {
        self.devices.read().map_err(|_| RegistryError::LockPoisoned)
    }

    fn write(&self) -> RegistryResult<RwLockWriteGuard<'_, HashMap<DeviceId, Device>>> {
        self.devices.write().map_err(|_| RegistryError::LockPoisoned)
    }

    /// Adds a new device, failing if the identifier is taken.
    pub fn add(&self, device: Device) -> RegistryResult<()> {
        let mut devices = self.write()?;
        if devices.contains_key(&device.id) {
            return Err(RegistryError::AlreadyExists(device.id));
        }
        tracing::info!(device_id = %device.id, name = %device.name, "Device added");
        devices.insert(device.id, device);
        Ok(())
    }

    /// Snapshot of the device, if registered.
    pub fn find(&self, id: DeviceId) -> RegistryResult<Option<Device>> {
        Ok(self.read()?.get(&id).cloned())
    }

    pub fn contains(&self, id: DeviceId) -> RegistryResult<bool> {
        Ok(self.read()?.contains_key(&id))
    }

    /// Removes and returns the device.
    pub fn delete(&self, id: DeviceId) -> RegistryResult<Device> {
        let removed = self.write()?.remove(&id).ok_or(RegistryError::NotFound(id))?;
        tracing::info!(device_id = %id, "Device deleted");
        Ok(removed)
    }

    /// Snapshot of every device, ordered by identifier.
    ///
    /// Concurrent mutations after the call are not reflected.
    pub fn all(&self) -> RegistryResult<Vec<Device>> {
        let mut devices: Vec<Device> = self.read()?.values().cloned().collect();
        devices.sort_by_key(|d| d.id);
        Ok(devices)
    }

    /// Atomically swaps the whole table for `devices`.
    ///
    /// Later entries win when identifiers repeat.
    pub fn replace_all(&self, devices: Vec<Device>) -> RegistryResult<()> {
        let table: HashMap<DeviceId, Device> = devices.into_iter().map(|d| (d.id, d)).collect();
        let count = table.len();
        *self.write()? = table;
        tracing::info!(count, "Device registry replaced");
        Ok(())
    }

    pub fn len(&self) -> RegistryResult<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> RegistryResult<bool> {
        Ok(self.read()?.is_empty())
    }

    /// Applies `f` to the registered device and returns its result.
    pub fn update<R>(&self, id: DeviceId, f: impl FnOnce(&mut Device) -> R) -> RegistryResult<R> {
        let mut devices = self.write()?;
        let device = devices.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        Ok(f(device))
    }

    /// Inserts or overwrites the record. Returns true if it was new.
    pub fn upsert(&self, device: Device) -> RegistryResult<bool> {
        Ok(self.write()?.insert(device.id, device).is_none())
    }

    /// Applies `f` to the device, creating an empty record first if needed.
    ///
    /// Returns a snapshot of the committed record and whether it was created.
    pub fn upsert_with(
        &self,
        id: DeviceId,
        f: impl FnOnce(&mut Device),
    ) -> RegistryResult<(Device, bool)> {
        let mut devices = self.write()?;
        let created = !devices.contains_key(&id);
        let device = devices.entry(id).or_insert_with(|| Device::new(id));
        f(device);
        Ok((device.clone(), created))
    }

    /// Replay check and advance in one step.
    ///
    /// Accepts `sequence` only if it is strictly greater than the device's
    /// `sequence_receive`, which then moves forward. Returns the updated
    /// snapshot. A rejected sequence leaves the record untouched.
    pub fn accept_sequence(&self, id: DeviceId, sequence: u32) -> RegistryResult<Device> {
        let mut devices = self.write()?;
        let device = devices.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        if sequence <= device.sequence_receive {
            return Err(RegistryError::StaleSequence {
                device_id: id,
                sequence,
                last: device.sequence_receive,
            });
        }
        device.sequence_receive = sequence;
        Ok(device.clone())
    }

    /// Increments `sequence_send` and returns the snapshot to send with.
    pub fn next_send_sequence(&self, id: DeviceId) -> RegistryResult<Device> {
        self.update(id, |device| {
            device.sequence_send = device.sequence_send.wrapping_add(1);
            device.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn device(id: u64, name: &str) -> Device {
        let mut device = Device::new(DeviceId(id));
        device.name = name.to_string();
        device
    }

    #[test]
    fn test_add_and_find() {
        let registry = DeviceRegistry::new();
        registry.add(device(1, "porch")).unwrap();

        let found = registry.find(DeviceId(1)).unwrap().unwrap();
        assert_eq!(found.name, "porch");
        assert!(registry.find(DeviceId(2)).unwrap().is_none());
    }

    #[test]
    fn test_add_duplicate() {
        let registry = DeviceRegistry::new();
        registry.add(device(1, "porch")).unwrap();
        assert_eq!(
            registry.add(device(1, "garage")),
            Err(RegistryError::AlreadyExists(DeviceId(1)))
        );
        assert_eq!(registry.find(DeviceId(1)).unwrap().unwrap().name, "porch");
    }

    #[test]
    fn test_delete() {
        let registry = DeviceRegistry::new();
        registry.add(device(1, "porch")).unwrap();

        let removed = registry.delete(DeviceId(1)).unwrap();
        assert_eq!(removed.name, "porch");
        assert!(matches!(
            registry.delete(DeviceId(1)),
            Err(RegistryError::NotFound(DeviceId(1)))
        ));
    }

    #[test]
    fn test_all_is_sorted_snapshot() {
        let registry = DeviceRegistry::new();
        registry.add(device(3, "c")).unwrap();
        registry.add(device(1, "a")).unwrap();
        registry.add(device(2, "b")).unwrap();

        let snapshot = registry.all().unwrap();
        registry.delete(DeviceId(2)).unwrap();

        let ids: Vec<u64> = snapshot.iter().map(|d| d.id.as_u64()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(registry.len().unwrap(), 2);
    }

    #[test]
    fn test_replace_all() {
        let registry = DeviceRegistry::new();
        registry.add(device(1, "old")).unwrap();

        registry
            .replace_all(vec![device(5, "five"), device(6, "six")])
            .unwrap();

        assert!(!registry.contains(DeviceId(1)).unwrap());
        assert!(registry.contains(DeviceId(5)).unwrap());
        assert_eq!(registry.len().unwrap(), 2);
    }

    #[test]
    fn test_upsert_with_creates_once() {
        let registry = DeviceRegistry::new();
        let (first, created) = registry
            .upsert_with(DeviceId(9), |d| d.name = "first".to_string())
            .unwrap();
        assert!(created);
        assert_eq!(first.name, "first");

        let (second, created) = registry
            .upsert_with(DeviceId(9), |d| d.name = "second".to_string())
            .unwrap();
        assert!(!created);
        assert_eq!(second.name, "second");
        assert_eq!(registry.len().unwrap(), 1);
    }

    #[test]
    fn test_upsert_overwrites() {
        let registry = DeviceRegistry::new();
        assert!(registry.upsert(device(2, "old")).unwrap());
        assert!(!registry.upsert(device(2, "new")).unwrap());
        assert_eq!(registry.find(DeviceId(2)).unwrap().unwrap().name, "new");
    }

    #[test]
    fn test_accept_sequence_monotonic() {
        let registry = DeviceRegistry::new();
        registry.add(device(1, "porch")).unwrap();

        for seq in [1, 2, 5, 100] {
            let snapshot = registry.accept_sequence(DeviceId(1), seq).unwrap();
            assert_eq!(snapshot.sequence_receive, seq);
        }

        for stale in [100, 99, 0] {
            assert_eq!(
                registry.accept_sequence(DeviceId(1), stale).unwrap_err(),
                RegistryError::StaleSequence {
                    device_id: DeviceId(1),
                    sequence: stale,
                    last: 100,
                }
            );
        }
        assert_eq!(
            registry.find(DeviceId(1)).unwrap().unwrap().sequence_receive,
            100
        );
    }

    #[test]
    fn test_accept_sequence_unknown_device() {
        let registry = DeviceRegistry::new();
        assert_eq!(
            registry.accept_sequence(DeviceId(4), 1).unwrap_err(),
            RegistryError::NotFound(DeviceId(4))
        );
    }

    #[test]
    fn test_next_send_sequence() {
        let registry = DeviceRegistry::new();
        registry.add(device(1, "porch")).unwrap();

        assert_eq!(registry.next_send_sequence(DeviceId(1)).unwrap().sequence_send, 1);
        assert_eq!(registry.next_send_sequence(DeviceId(1)).unwrap().sequence_send, 2);
    }

    #[test]
    fn test_concurrent_sequence_acceptance() {
        let registry = Arc::new(DeviceRegistry::new());
        registry.add(device(1, "porch")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (1..=100u32)
                        .filter(|seq| registry.accept_sequence(DeviceId(1), *seq).is_ok())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut accepted: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = accepted.len();
        accepted.sort_unstable();
        accepted.dedup();
        // No sequence is ever accepted twice
        assert_eq!(accepted.len(), total);
        assert_eq!(
            registry.find(DeviceId(1)).unwrap().unwrap().sequence_receive,
            100
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_accepted_sequences_strictly_increase(
                sequences in proptest::collection::vec(0u32..64, 1..64)
            ) {
                let registry = DeviceRegistry::new();
                registry.add(device(1, "meter")).unwrap();

                let mut highest = 0u32;
                let mut accepted = Vec::new();
                for sequence in sequences {
                    match registry.accept_sequence(DeviceId(1), sequence) {
                        Ok(snapshot) => {
                            prop_assert!(sequence > highest);
                            prop_assert_eq!(snapshot.sequence_receive, sequence);
                            highest = sequence;
                            accepted.push(sequence);
                        }
                        Err(RegistryError::StaleSequence { last, .. }) => {
                            prop_assert!(sequence <= highest);
                            prop_assert_eq!(last, highest);
                        }
                        Err(other) => prop_assert!(false, "unexpected error: {}", other),
                    }
                }

                prop_assert!(accepted.windows(2).all(|w| w[0] < w[1]));
                let stored = registry.find(DeviceId(1)).unwrap().unwrap();
                prop_assert_eq!(stored.sequence_receive, highest);
            }
        }
    }
}
