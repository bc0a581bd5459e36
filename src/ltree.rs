//! Per-`(vol_id, lnum)` reader-writer locks.
//!
//! Every LEB-scoped operation (read, write, invalidate, consolidate) takes
//! the lock for its `(vol_id, lnum)` before touching the [`EbaTable`][crate::eba::EbaTable].
//! Entries are created on first use and reclaimed once nothing references
//! them, mirroring the refcounted rbtree the original kernel driver keeps
//! for the same purpose.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use crate::error::{EbaError, Result};

type Key = (u32, u32);

struct Entry {
    lock: Arc<RwLock<()>>,
    users: usize,
}

/// The collection of per-LEB locks for one device.
#[derive(Default)]
pub struct LockTree {
    map: parking_lot::Mutex<BTreeMap<Key, Entry>>,
}

/// A held read lock on `(vol_id, lnum)`. Dropping it releases the lock and,
/// if no other caller is still referencing the entry, removes it from the
/// tree.
pub struct ReadGuard {
    key: Key,
    tree: Arc<LockTree>,
    _guard: ArcRwLockReadGuard<RawRwLock, ()>,
}

/// A held write lock on `(vol_id, lnum)`.
pub struct WriteGuard {
    key: Key,
    tree: Arc<LockTree>,
    _guard: ArcRwLockWriteGuard<RawRwLock, ()>,
}

impl LockTree {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn acquire(self: &Arc<Self>, vol_id: u32, lnum: u32) -> Arc<RwLock<()>> {
        let key = (vol_id, lnum);
        let mut map = self.map.lock();
        let entry = map.entry(key).or_insert_with(|| Entry {
            lock: Arc::new(RwLock::new(())),
            users: 0,
        });
        entry.users += 1;
        entry.lock.clone()
    }

    fn release(self: &Arc<Self>, key: Key) {
        let mut map = self.map.lock();
        if let std::collections::btree_map::Entry::Occupied(mut occ) = map.entry(key) {
            occ.get_mut().users -= 1;
            if occ.get().users == 0 {
                occ.remove();
            }
        }
    }

    /// Block until the read lock for `(vol_id, lnum)` is available.
    pub fn read_lock(self: &Arc<Self>, vol_id: u32, lnum: u32) -> ReadGuard {
        let lock = self.acquire(vol_id, lnum);
        let guard = lock.read_arc();
        ReadGuard {
            key: (vol_id, lnum),
            tree: self.clone(),
            _guard: guard,
        }
    }

    /// Block until the write lock for `(vol_id, lnum)` is available.
    pub fn write_lock(self: &Arc<Self>, vol_id: u32, lnum: u32) -> WriteGuard {
        let lock = self.acquire(vol_id, lnum);
        let guard = lock.write_arc();
        WriteGuard {
            key: (vol_id, lnum),
            tree: self.clone(),
            _guard: guard,
        }
    }

    /// Acquire the read lock for `(vol_id, lnum)` only if uncontended.
    pub fn read_trylock(self: &Arc<Self>, vol_id: u32, lnum: u32) -> Result<ReadGuard> {
        let lock = self.acquire(vol_id, lnum);
        match lock.try_read_arc() {
            Some(guard) => Ok(ReadGuard {
                key: (vol_id, lnum),
                tree: self.clone(),
                _guard: guard,
            }),
            None => {
                self.release((vol_id, lnum));
                Err(EbaError::Contention)
            }
        }
    }

    /// Acquire the write lock for `(vol_id, lnum)` only if uncontended.
    pub fn write_trylock(self: &Arc<Self>, vol_id: u32, lnum: u32) -> Result<WriteGuard> {
        let lock = self.acquire(vol_id, lnum);
        match lock.try_write_arc() {
            Some(guard) => Ok(WriteGuard {
                key: (vol_id, lnum),
                tree: self.clone(),
                _guard: guard,
            }),
            None => {
                self.release((vol_id, lnum));
                Err(EbaError::Contention)
            }
        }
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.tree.release(self.key);
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.tree.release(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_excludes_write() {
        let tree = LockTree::new();
        let _w = tree.write_lock(0, 5);
        assert!(tree.write_trylock(0, 5).is_err());
    }

    #[test]
    fn write_excludes_read() {
        let tree = LockTree::new();
        let _w = tree.write_lock(0, 5);
        assert!(tree.read_trylock(0, 5).is_err());
    }

    #[test]
    fn reads_do_not_exclude_each_other() {
        let tree = LockTree::new();
        let _r1 = tree.read_lock(0, 5);
        assert!(tree.read_trylock(0, 5).is_ok());
    }

    #[test]
    fn distinct_keys_never_contend() {
        let tree = LockTree::new();
        let _w = tree.write_lock(0, 5);
        assert!(tree.write_trylock(0, 6).is_ok());
        assert!(tree.write_trylock(1, 5).is_ok());
    }

    #[test]
    fn entry_is_reclaimed_after_last_release() {
        let tree = LockTree::new();
        {
            let _w = tree.write_lock(0, 5);
        }
        assert_eq!(tree.map.lock().len(), 0);
    }

    #[test]
    fn lock_becomes_available_again_after_drop() {
        let tree = LockTree::new();
        {
            let _w = tree.write_lock(0, 5);
        }
        assert!(tree.write_trylock(0, 5).is_ok());
    }
}
