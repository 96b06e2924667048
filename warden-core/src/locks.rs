use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::debug;

use crate::store::{KvStore, StoreError};

#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock store: {0}")]
    Store(#[from] StoreError),

    #[error("corrupt lock record for '{0}'")]
    Corrupt(String),
}

pub type LockResult<T> = std::result::Result<T, LockError>;

/// Name of the host-global lock taken around every package-module call.
pub const GLOBAL_PACKAGE_LOCK: &str = "warden_lock_global_packages";

/// One lock record: when work last started and last completed, unix seconds.
/// Serialized as 16 bytes, two little-endian u64s, consistent per install.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct LockRecord {
    last_started: u64,
    last_completed: u64,
}

impl LockRecord {
    fn to_bytes(self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.last_started.to_le_bytes());
        buf[8..].copy_from_slice(&self.last_completed.to_le_bytes());
        buf
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        Some(Self {
            last_started: u64::from_le_bytes(bytes[..8].try_into().ok()?),
            last_completed: u64::from_le_bytes(bytes[8..].try_into().ok()?),
        })
    }
}

/// Why a lock could not be handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDenied {
    /// The work completed less than `ifelapsed` ago; the caller should
    /// report the promise as skipped.
    RecentlyDone,
    /// Another holder started within `expireafter` and has not yielded.
    Held,
}

/// Proof of acquisition; hand it back to [`LockManager::yield_lock`].
#[derive(Debug)]
pub struct LockGuard {
    name: String,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Named locks shared with other agent processes on this host.
///
/// `ifelapsed` throttles re-execution of converged work; `expireafter`
/// bounds how long a crashed holder can keep a lock hostage.
pub struct LockManager {
    store: Box<dyn KvStore>,
}

impl LockManager {
    pub fn new(store: Box<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn acquire(
        &self,
        name: &str,
        ifelapsed_minutes: u64,
        expireafter_minutes: u64,
        now: u64,
    ) -> LockResult<Result<LockGuard, LockDenied>> {
        let record = self.read(name)?;

        if record.last_completed != 0
            && now.saturating_sub(record.last_completed) < ifelapsed_minutes * 60
        {
            debug!(lock = name, "lock skipped, work done recently");
            return Ok(Err(LockDenied::RecentlyDone));
        }

        if record.last_started != 0
            && now.saturating_sub(record.last_started) < expireafter_minutes * 60
        {
            debug!(lock = name, "lock held by another process");
            return Ok(Err(LockDenied::Held));
        }

        let updated = LockRecord {
            last_started: now,
            last_completed: record.last_completed,
        };
        self.store.put(name.as_bytes(), &updated.to_bytes())?;
        Ok(Ok(LockGuard {
            name: name.to_string(),
        }))
    }

    pub fn yield_lock(&self, guard: LockGuard, now: u64) -> LockResult<()> {
        let record = LockRecord {
            last_started: 0,
            last_completed: now,
        };
        self.store.put(guard.name.as_bytes(), &record.to_bytes())?;
        Ok(())
    }

    /// Drop the record entirely, so the next acquire starts fresh.
    pub fn remove(&self, name: &str) -> LockResult<()> {
        self.store.delete(name.as_bytes())?;
        Ok(())
    }

    fn read(&self, name: &str) -> LockResult<LockRecord> {
        match self.store.get(name.as_bytes())? {
            None => Ok(LockRecord::default()),
            Some(bytes) => {
                LockRecord::from_bytes(&bytes).ok_or_else(|| LockError::Corrupt(name.to_string()))
            }
        }
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn manager() -> LockManager {
        LockManager::new(Box::new(MemStore::new()))
    }

    #[test]
    fn fresh_lock_is_granted() {
        let locks = manager();
        let guard = locks.acquire("edit-/etc/motd", 1, 120, 1000).unwrap();
        assert!(guard.is_ok());
    }

    #[test]
    fn ifelapsed_throttles_after_yield() {
        let locks = manager();
        let guard = locks.acquire("l", 5, 120, 1000).unwrap().unwrap();
        locks.yield_lock(guard, 1010).unwrap();

        // 5 minutes have not passed since completion.
        let denied = locks.acquire("l", 5, 120, 1100).unwrap();
        assert_eq!(denied.unwrap_err(), LockDenied::RecentlyDone);

        // After the window the lock is free again.
        let ok = locks.acquire("l", 5, 120, 1010 + 5 * 60).unwrap();
        assert!(ok.is_ok());
    }

    #[test]
    fn active_lock_is_held_until_expiry() {
        let locks = manager();
        let _guard = locks.acquire("l", 0, 10, 1000).unwrap().unwrap();

        let denied = locks.acquire("l", 0, 10, 1030).unwrap();
        assert_eq!(denied.unwrap_err(), LockDenied::Held);

        // expireafter elapsed: the stale holder is presumed dead.
        let stolen = locks.acquire("l", 0, 10, 1000 + 10 * 60).unwrap();
        assert!(stolen.is_ok());
    }

    #[test]
    fn yield_clears_started_stamp() {
        let locks = manager();
        let guard = locks.acquire("l", 0, 120, 1000).unwrap().unwrap();
        locks.yield_lock(guard, 1005).unwrap();
        // Immediately re-acquirable with ifelapsed 0.
        assert!(locks.acquire("l", 0, 120, 1006).unwrap().is_ok());
    }

    #[test]
    fn record_layout_is_stable() {
        let record = LockRecord {
            last_started: 0x0102030405060708,
            last_completed: 0x1112131415161718,
        };
        let bytes = record.to_bytes();
        assert_eq!(bytes[0], 0x08); // little-endian
        assert_eq!(LockRecord::from_bytes(&bytes), Some(record));
        assert_eq!(LockRecord::from_bytes(&bytes[..15]), None);
    }
}
