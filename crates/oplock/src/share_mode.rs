//! Share-mode registry adapter.
//!
//! The registry itself is external: a persistent, cross-process store of
//! one entry per open, keyed by `(device, inode)`. This module defines
//! the store interface the subsystem requires, the locked adapter the
//! rest of the crate goes through, and an in-process reference store.

use oplock_msg::OplockType;
use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use thiserror::Error;

/// Failure inside the external share-mode store.
#[derive(Debug, Error)]
#[error("share mode store: {0}")]
pub struct StoreError(pub String);

/// Registry key: one file-system object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShareKey {
    pub device: u64,
    pub inode: u64,
}

/// One open of a file, as visible to every server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareEntry {
    pub device: u64,
    pub inode: u64,
    /// Process holding the open.
    pub pid: u32,
    /// Break-listen port of the holder.
    pub port: u16,
    pub op_type: OplockType,
    /// The holder's in-process file id for this open.
    pub share_file_id: u32,
}

impl ShareEntry {
    pub fn key(&self) -> ShareKey {
        ShareKey {
            device: self.device,
            inode: self.inode,
        }
    }
}

/// The external cross-process registry of share-mode entries.
///
/// `lock_entry` must exclude every other locker of the same key across
/// all server processes, for a bounded time. Mutators must fail when the
/// caller does not hold the key's lock.
pub trait ShareModeStore: Send + Sync {
    fn lock_entry(&self, key: ShareKey) -> Result<(), StoreError>;
    fn unlock_entry(&self, key: ShareKey) -> Result<(), StoreError>;
    fn entries(&self, key: ShareKey) -> Result<Vec<ShareEntry>, StoreError>;
    fn add(&self, entry: ShareEntry) -> Result<(), StoreError>;
    /// Removes the entry matching `(pid, share_file_id)`; `false` when no
    /// such entry exists.
    fn delete(&self, key: ShareKey, pid: u32, share_file_id: u32) -> Result<bool, StoreError>;
    /// Rewrites the oplock type of the matching entry; `false` when no
    /// such entry exists.
    fn set_oplock(
        &self,
        key: ShareKey,
        pid: u32,
        share_file_id: u32,
        op_type: OplockType,
    ) -> Result<bool, StoreError>;
}

/// Witness that the share-mode lock for one key is held.
///
/// Obtained from [`ShareModeRegistry::lock`]; every mutator demands it
/// for its key, and it must go back through [`ShareModeRegistry::unlock`]
/// on every exit path, including errors.
#[must_use = "the share-mode lock must be released via ShareModeRegistry::unlock"]
#[derive(Debug)]
pub struct ShareLock {
    key: ShareKey,
}

impl ShareLock {
    pub fn key(&self) -> ShareKey {
        self.key
    }
}

/// Locked access to the external store.
pub struct ShareModeRegistry {
    store: std::sync::Arc<dyn ShareModeStore>,
}

impl ShareModeRegistry {
    pub fn new(store: std::sync::Arc<dyn ShareModeStore>) -> Self {
        Self { store }
    }

    pub fn lock(&self, device: u64, inode: u64) -> crate::Result<ShareLock> {
        let key = ShareKey { device, inode };
        self.store.lock_entry(key)?;
        Ok(ShareLock { key })
    }

    pub fn unlock(&self, lock: ShareLock) {
        if let Err(e) = self.store.unlock_entry(lock.key) {
            log::error!("failed to unlock share entry for {:?}: {e}", lock.key);
        }
    }

    pub fn get_entries(&self, lock: &ShareLock) -> crate::Result<Vec<ShareEntry>> {
        Ok(self.store.entries(lock.key)?)
    }

    pub fn add_entry(&self, lock: &ShareLock, entry: ShareEntry) -> crate::Result<()> {
        debug_assert_eq!(lock.key(), entry.key());
        Ok(self.store.add(entry)?)
    }

    pub fn delete_entry(
        &self,
        lock: &ShareLock,
        pid: u32,
        share_file_id: u32,
    ) -> crate::Result<bool> {
        Ok(self.store.delete(lock.key, pid, share_file_id)?)
    }

    /// Clears the oplock on the holder's entry.
    pub fn remove_oplock(
        &self,
        lock: &ShareLock,
        pid: u32,
        share_file_id: u32,
    ) -> crate::Result<bool> {
        Ok(self
            .store
            .set_oplock(lock.key, pid, share_file_id, OplockType::None)?)
    }

    /// Downgrades the oplock on the holder's entry to level-II.
    pub fn downgrade_oplock(
        &self,
        lock: &ShareLock,
        pid: u32,
        share_file_id: u32,
    ) -> crate::Result<bool> {
        Ok(self
            .store
            .set_oplock(lock.key, pid, share_file_id, OplockType::LevelII)?)
    }
}

#[derive(Default)]
struct MemState {
    locked: HashSet<ShareKey>,
    entries: HashMap<ShareKey, Vec<ShareEntry>>,
}

/// In-process reference store.
///
/// Stands in for the external registry when several subsystem instances
/// run inside one OS process, as the integration tests do to emulate
/// separate server processes. Locking blocks until the key is free.
#[derive(Default)]
pub struct MemShareModeStore {
    state: Mutex<MemState>,
    unlocked: Condvar,
}

impl MemShareModeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned(_: impl std::fmt::Display) -> StoreError {
        StoreError("store mutex poisoned".to_string())
    }
}

impl ShareModeStore for MemShareModeStore {
    fn lock_entry(&self, key: ShareKey) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(Self::poisoned)?;
        while state.locked.contains(&key) {
            state = self.unlocked.wait(state).map_err(Self::poisoned)?;
        }
        state.locked.insert(key);
        Ok(())
    }

    fn unlock_entry(&self, key: ShareKey) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(Self::poisoned)?;
        if !state.locked.remove(&key) {
            return Err(StoreError(format!("unlocking {key:?} which is not locked")));
        }
        self.unlocked.notify_all();
        Ok(())
    }

    fn entries(&self, key: ShareKey) -> Result<Vec<ShareEntry>, StoreError> {
        let state = self.state.lock().map_err(Self::poisoned)?;
        Ok(state.entries.get(&key).cloned().unwrap_or_default())
    }

    fn add(&self, entry: ShareEntry) -> Result<(), StoreError> {
        let key = entry.key();
        let mut state = self.state.lock().map_err(Self::poisoned)?;
        if !state.locked.contains(&key) {
            return Err(StoreError(format!("adding to {key:?} without the lock")));
        }
        state.entries.entry(key).or_default().push(entry);
        Ok(())
    }

    fn delete(&self, key: ShareKey, pid: u32, share_file_id: u32) -> Result<bool, StoreError> {
        let mut state = self.state.lock().map_err(Self::poisoned)?;
        if !state.locked.contains(&key) {
            return Err(StoreError(format!("deleting from {key:?} without the lock")));
        }
        let Some(entries) = state.entries.get_mut(&key) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|e| !(e.pid == pid && e.share_file_id == share_file_id));
        Ok(entries.len() != before)
    }

    fn set_oplock(
        &self,
        key: ShareKey,
        pid: u32,
        share_file_id: u32,
        op_type: OplockType,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().map_err(Self::poisoned)?;
        if !state.locked.contains(&key) {
            return Err(StoreError(format!("updating {key:?} without the lock")));
        }
        let Some(entry) = state
            .entries
            .get_mut(&key)
            .and_then(|v| v.iter_mut().find(|e| e.pid == pid && e.share_file_id == share_file_id))
        else {
            return Ok(false);
        };
        entry.op_type = op_type;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(pid: u32, file_id: u32, op_type: OplockType) -> ShareEntry {
        ShareEntry {
            device: 4,
            inode: 400,
            pid,
            port: 1000 + pid as u16,
            op_type,
            share_file_id: file_id,
        }
    }

    fn registry() -> ShareModeRegistry {
        ShareModeRegistry::new(Arc::new(MemShareModeStore::new()))
    }

    #[test]
    fn mutating_without_the_lock_is_refused() {
        let store = MemShareModeStore::new();
        let e = entry(1, 1, OplockType::LevelII);
        assert!(store.add(e.clone()).is_err());
        store.lock_entry(e.key()).unwrap();
        store.add(e.clone()).unwrap();
        store.unlock_entry(e.key()).unwrap();
        assert!(store.set_oplock(e.key(), 1, 1, OplockType::None).is_err());
    }

    #[test]
    fn adapter_remove_and_downgrade_target_one_entry() {
        let registry = registry();
        let lock = registry.lock(4, 400).unwrap();
        registry
            .add_entry(&lock, entry(1, 1, OplockType::Exclusive { batch: false }))
            .unwrap();
        registry
            .add_entry(&lock, entry(2, 1, OplockType::LevelII))
            .unwrap();

        assert!(registry.downgrade_oplock(&lock, 1, 1).unwrap());
        assert!(registry.remove_oplock(&lock, 2, 1).unwrap());
        // No entry for this pid/file id pair.
        assert!(!registry.remove_oplock(&lock, 3, 1).unwrap());

        let entries = registry.get_entries(&lock).unwrap();
        assert_eq!(entries[0].op_type, OplockType::LevelII);
        assert_eq!(entries[1].op_type, OplockType::None);
        registry.unlock(lock);
    }

    #[test]
    fn delete_removes_only_the_matching_open() {
        let registry = registry();
        let lock = registry.lock(4, 400).unwrap();
        registry
            .add_entry(&lock, entry(1, 1, OplockType::None))
            .unwrap();
        registry
            .add_entry(&lock, entry(1, 2, OplockType::None))
            .unwrap();
        assert!(registry.delete_entry(&lock, 1, 1).unwrap());
        let entries = registry.get_entries(&lock).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].share_file_id, 2);
        registry.unlock(lock);
    }

    #[test]
    fn lock_blocks_a_second_locker_until_unlock() {
        let store = Arc::new(MemShareModeStore::new());
        let key = ShareKey { device: 9, inode: 9 };
        store.lock_entry(key).unwrap();

        let contender = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                store.lock_entry(key).unwrap();
                store.unlock_entry(key).unwrap();
            })
        };
        // Give the contender time to block, then release.
        std::thread::sleep(std::time::Duration::from_millis(30));
        store.unlock_entry(key).unwrap();
        contender.join().unwrap();
    }
}
