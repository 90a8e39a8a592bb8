//! Open-object sharing control: a bounded table of leases keyed by the
//! object's location on a mounted volume.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{trace, warn};

use crate::error::{FsError, FsResult};

/// Identity of an object for sharing purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LockKey {
    /// Mount id of the volume.
    pub vol: u16,
    /// Start cluster of the directory holding the entry (files), or of the
    /// directory itself.
    pub sclust: u32,
    /// Entry offset within that directory, `u32::MAX` for a directory's own
    /// key.
    pub ofs: u32,
}

impl LockKey {
    pub fn directory(vol: u16, sclust: u32) -> Self {
        Self {
            vol,
            sclust,
            ofs: u32::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Readers(u32),
    Writer,
}

/// Kind of access being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
    /// Delete or rename: only allowed when nobody holds the object.
    Remove,
}

pub(crate) struct LockTable {
    capacity: usize,
    entries: Mutex<HashMap<LockKey, LockState>>,
}

impl LockTable {
    /// A table holding at most `capacity` objects; 0 disables sharing control.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<LockKey, LockState>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!("lock table mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Would an access of kind `acc` to `key` be granted right now?
    pub fn check(&self, key: LockKey, acc: Access) -> FsResult<()> {
        if !self.enabled() {
            return Ok(());
        }
        let entries = self.entries();
        match entries.get(&key) {
            Some(state) => {
                if acc != Access::Read || *state == LockState::Writer {
                    return Err(FsError::Locked);
                }
                Ok(())
            }
            None if acc != Access::Remove && entries.len() >= self.capacity => {
                Err(FsError::TooManyOpenFiles)
            }
            None => Ok(()),
        }
    }

    /// Whether an object not yet in the table could be registered.
    pub fn has_room(&self) -> bool {
        !self.enabled() || self.entries().len() < self.capacity
    }

    /// Register an open of `key`, returning a lease that releases it on drop.
    pub fn acquire(self: &Arc<Self>, key: LockKey, write: bool) -> FsResult<Lease> {
        if !self.enabled() {
            return Ok(Lease {
                table: None,
                key,
            });
        }
        let mut entries = self.entries();
        match entries.get_mut(&key) {
            Some(LockState::Readers(n)) if !write => *n += 1,
            Some(_) => return Err(FsError::Locked),
            None => {
                if entries.len() >= self.capacity {
                    return Err(FsError::TooManyOpenFiles);
                }
                let state = if write {
                    LockState::Writer
                } else {
                    LockState::Readers(1)
                };
                entries.insert(key, state);
            }
        }
        trace!("lease {key:?} acquired (write: {write})");
        Ok(Lease {
            table: Some(Arc::clone(self)),
            key,
        })
    }

    fn release(&self, key: LockKey) {
        let mut entries = self.entries();
        match entries.get_mut(&key) {
            Some(LockState::Readers(n)) if *n > 1 => *n -= 1,
            Some(_) => {
                entries.remove(&key);
            }
            // Already dropped by `release_volume`.
            None => trace!("lease {key:?} outlived its volume"),
        }
    }

    pub fn is_held(&self, key: LockKey) -> bool {
        self.entries().contains_key(&key)
    }

    /// Drop every entry belonging to volume mount `vol`.
    pub fn release_volume(&self, vol: u16) {
        self.entries().retain(|k, _| k.vol != vol);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries().len()
    }
}

/// An open reference registered in the lock table.
#[derive(Debug)]
pub(crate) struct Lease {
    table: Option<Arc<LockTable>>,
    key: LockKey,
}

impl Lease {
    pub fn key(&self) -> LockKey {
        self.key
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(table) = self.table.take() {
            table.release(self.key);
        }
    }
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable")
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(ofs: u32) -> LockKey {
        LockKey {
            vol: 1,
            sclust: 0,
            ofs,
        }
    }

    #[test]
    fn test_readers_share_writer_excludes() {
        let table = Arc::new(LockTable::new(4));
        let r1 = table.acquire(key(0), false).unwrap();
        let _r2 = table.acquire(key(0), false).unwrap();
        assert_eq!(table.acquire(key(0), true).unwrap_err(), FsError::Locked);
        assert_eq!(table.check(key(0), Access::Remove), Err(FsError::Locked));
        drop(r1);
        assert!(table.is_held(key(0)));

        let _w = table.acquire(key(32), true).unwrap();
        assert_eq!(table.acquire(key(32), false).unwrap_err(), FsError::Locked);
        assert_eq!(table.check(key(32), Access::Read), Err(FsError::Locked));
    }

    #[test]
    fn test_lease_drop_releases() {
        let table = Arc::new(LockTable::new(1));
        let w = table.acquire(key(0), true).unwrap();
        assert_eq!(
            table.acquire(key(32), false).unwrap_err(),
            FsError::TooManyOpenFiles
        );
        drop(w);
        assert_eq!(table.len(), 0);
        table.acquire(key(32), false).unwrap();
    }

    #[test]
    fn test_remove_check_ignores_capacity() {
        let table = Arc::new(LockTable::new(1));
        let _w = table.acquire(key(0), true).unwrap();
        assert_eq!(table.check(key(64), Access::Remove), Ok(()));
        assert_eq!(
            table.check(key(64), Access::Read),
            Err(FsError::TooManyOpenFiles)
        );
    }

    #[test]
    fn test_disabled_table_grants_everything() {
        let table = Arc::new(LockTable::new(0));
        let _a = table.acquire(key(0), true).unwrap();
        let _b = table.acquire(key(0), true).unwrap();
        assert_eq!(table.check(key(0), Access::Remove), Ok(()));
    }

    #[test]
    fn test_release_volume() {
        let table = Arc::new(LockTable::new(4));
        let lease = table.acquire(key(0), true).unwrap();
        table.release_volume(1);
        assert!(!table.is_held(lease.key()));
        drop(lease);
        assert_eq!(table.len(), 0);
    }
}
