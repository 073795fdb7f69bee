//! Bounded store of keys negotiated but not yet consumed by a join.
//!
//! Entries are evicted least recently used first, so a flood of key
//! exchanges from devices that never join cannot grow memory without bound.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};

use lru::LruCache;
use protocol::{EncryptionType, KEY_SIZE};
use thiserror::Error;

use crate::devices::DeviceId;

/// Default number of pending key exchanges kept.
pub const DEFAULT_CAPACITY: usize = 128;

/// Errors raised by [`KeyExchangeCache`].
#[derive(Debug, Error, PartialEq)]
pub enum CacheError {
    /// A thread panicked while holding the cache lock.
    #[error("key exchange cache lock poisoned")]
    LockPoisoned,
}

/// Key and mode agreed during a key exchange.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PendingKey {
    pub key: [u8; KEY_SIZE],
    pub encryption: EncryptionType,
}

impl std::fmt::Debug for PendingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingKey")
            .field("key", &"[REDACTED]")
            .field("encryption", &self.encryption)
            .finish()
    }
}

/// LRU map from device id to its pending key.
pub struct KeyExchangeCache {
    entries: Mutex<LruCache<DeviceId, PendingKey>>,
}

impl Default for KeyExchangeCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl KeyExchangeCache {
    /// Creates a cache holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LruCache<DeviceId, PendingKey>>, CacheError> {
        self.entries.lock().map_err(|_| CacheError::LockPoisoned)
    }

    /// Stores `entry`, replacing any earlier one for `id`.
    pub fn insert(&self, id: DeviceId, entry: PendingKey) -> Result<(), CacheError> {
        let mut entries = self.lock()?;
        if let Some((evicted, _)) = entries.push(id, entry) {
            if evicted != id {
                tracing::debug!(device_id = %evicted, "Pending key exchange evicted");
            }
        }
        Ok(())
    }

    /// Looks up the entry for `id`, marking it recently used.
    pub fn get(&self, id: DeviceId) -> Result<Option<PendingKey>, CacheError> {
        Ok(self.lock()?.get(&id).copied())
    }

    /// Removes and returns the entry for `id`.
    pub fn take(&self, id: DeviceId) -> Result<Option<PendingKey>, CacheError> {
        Ok(self.lock()?.pop(&id))
    }

    /// Whether an entry exists, without touching recency.
    pub fn contains(&self, id: DeviceId) -> Result<bool, CacheError> {
        Ok(self.lock()?.contains(&id))
    }

    pub fn len(&self) -> usize {
        match self.lock() {
            Ok(entries) => entries.len(),
            Err(e) => {
                tracing::error!("{}", e);
                0
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().map(|entries| entries.cap().get()).unwrap_or(0)
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.lock()?.clear();
        Ok(())
    }

    /// Poisons the lock by panicking while holding it.
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = self.entries.lock();
            panic!("poisoning key exchange cache");
        }));
    }
}
