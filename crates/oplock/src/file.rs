//! In-process open-file records and the process-wide oplock counters.

use crate::config::SharePolicy;
use oplock_msg::{FileIdentity, OplockType, SentBreakMarker};
use std::collections::HashMap;
use std::time::SystemTime;

/// Why a forced write-cache flush ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The file's oplock was released or lost.
    OplockRelease,
    /// Ordinary teardown at close.
    Close,
}

/// Write-behind cache state for one open file.
///
/// The cache proper lives with the VFS layer; the subsystem only forces a
/// classified flush when caching rights are torn down.
#[derive(Debug, Default)]
pub struct WriteCache {
    pub dirty: bool,
    pub last_flush: Option<FlushReason>,
}

impl WriteCache {
    pub fn flush(&mut self, reason: FlushReason) {
        if self.dirty {
            log::debug!("flushing write cache ({reason:?})");
        }
        self.dirty = false;
        self.last_flush = Some(reason);
    }
}

/// One open file in this process (the fsp).
#[derive(Debug)]
pub struct FileHandle {
    pub identity: FileIdentity,
    /// Handle the client knows this open by.
    pub fnum: u16,
    /// Tree the open belongs to.
    pub tid: u16,
    pub name: String,
    pub open_time: SystemTime,
    pub oplock_type: OplockType,
    pub sent_break: SentBreakMarker,
    pub policy: SharePolicy,
    pub write_cache: WriteCache,
}

/// The per-process table of open files, plus the oplock counters.
///
/// Counters are signed on purpose: a negative value means a release ran
/// without a matching grant, which is corruption the subsystem cannot
/// continue through, and the counter ops panic on it.
#[derive(Default)]
pub struct FileTable {
    files: HashMap<FileIdentity, FileHandle>,
    next_file_id: u32,
    exclusive_open: i32,
    level_ii_open: i32,
}

impl FileTable {
    /// Looks an open file up by its full identity. Comparing all three of
    /// device, inode and file id is required; a process can hold several
    /// independent opens of one inode.
    pub fn find(&self, identity: FileIdentity) -> Option<&FileHandle> {
        self.files.get(&identity)
    }

    pub(crate) fn find_mut(&mut self, identity: FileIdentity) -> Option<&mut FileHandle> {
        self.files.get_mut(&identity)
    }

    /// True when any open of `(device, inode)` has a break awaiting its
    /// acknowledgement.
    pub fn break_in_flight_for(&self, device: u64, inode: u64) -> bool {
        self.files.values().any(|f| {
            f.identity.device == device
                && f.identity.inode == inode
                && f.sent_break != SentBreakMarker::NoBreakSent
        })
    }

    pub fn exclusive_open(&self) -> i32 {
        self.exclusive_open
    }

    pub fn level_ii_open(&self) -> i32 {
        self.level_ii_open
    }

    /// Total oplocks this process currently holds.
    pub fn oplocks_open(&self) -> i32 {
        self.exclusive_open + self.level_ii_open
    }

    pub(crate) fn allocate_file_id(&mut self) -> u32 {
        self.next_file_id += 1;
        self.next_file_id
    }

    pub(crate) fn insert(&mut self, fsp: FileHandle) {
        self.files.insert(fsp.identity, fsp);
    }

    pub(crate) fn remove(&mut self, identity: FileIdentity) -> Option<FileHandle> {
        self.files.remove(&identity)
    }

    pub(crate) fn count_grant(&mut self, oplock: OplockType) {
        match oplock {
            OplockType::LevelII => self.level_ii_open += 1,
            OplockType::Exclusive { .. } => self.exclusive_open += 1,
            OplockType::None => unreachable!("OplockType::None is never granted"),
        }
    }

    pub(crate) fn count_release(&mut self, oplock: OplockType) {
        match oplock {
            OplockType::LevelII => {
                self.level_ii_open -= 1;
                assert!(
                    self.level_ii_open >= 0,
                    "level_ii_open < 0 ({}): release without a matching grant",
                    self.level_ii_open
                );
            }
            OplockType::Exclusive { .. } => {
                self.exclusive_open -= 1;
                assert!(
                    self.exclusive_open >= 0,
                    "exclusive_open < 0 ({}): release without a matching grant",
                    self.exclusive_open
                );
            }
            OplockType::None => {
                panic!("releasing an oplock that was never granted")
            }
        }
    }

    /// Exclusive went to level-II; net oplock count is unchanged.
    pub(crate) fn count_downgrade(&mut self) {
        self.exclusive_open -= 1;
        self.level_ii_open += 1;
        assert!(
            self.exclusive_open >= 0,
            "exclusive_open < 0 ({}): downgrade without a matching grant",
            self.exclusive_open
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(identity: FileIdentity) -> FileHandle {
        FileHandle {
            identity,
            fnum: 1,
            tid: 1,
            name: "file.dat".to_string(),
            open_time: SystemTime::now(),
            oplock_type: OplockType::None,
            sent_break: SentBreakMarker::NoBreakSent,
            policy: SharePolicy::default(),
            write_cache: WriteCache::default(),
        }
    }

    #[test]
    fn same_inode_different_file_id_are_distinct_opens() {
        let mut table = FileTable::default();
        let first = FileIdentity {
            device: 1,
            inode: 10,
            file_id: table.allocate_file_id(),
        };
        let second = FileIdentity {
            device: 1,
            inode: 10,
            file_id: table.allocate_file_id(),
        };
        assert_ne!(first, second);
        table.insert(handle(first));
        table.insert(handle(second));
        assert!(table.find(first).is_some());
        assert!(table.find(second).is_some());
        table.remove(first);
        assert!(table.find(first).is_none());
        assert!(table.find(second).is_some());
    }

    #[test]
    fn break_in_flight_scans_every_open_of_the_inode() {
        let mut table = FileTable::default();
        let first = FileIdentity {
            device: 1,
            inode: 10,
            file_id: 1,
        };
        let second = FileIdentity {
            device: 1,
            inode: 10,
            file_id: 2,
        };
        table.insert(handle(first));
        table.insert(handle(second));
        assert!(!table.break_in_flight_for(1, 10));
        table.find_mut(second).unwrap().sent_break = SentBreakMarker::ExclusiveBreakSent;
        assert!(table.break_in_flight_for(1, 10));
        assert!(!table.break_in_flight_for(1, 11));
    }

    #[test]
    fn grant_release_round_trip_is_counter_neutral() {
        let mut table = FileTable::default();
        table.count_grant(OplockType::Exclusive { batch: true });
        assert_eq!(table.exclusive_open(), 1);
        table.count_release(OplockType::Exclusive { batch: true });
        assert_eq!(table.exclusive_open(), 0);
        assert_eq!(table.level_ii_open(), 0);
    }

    #[test]
    fn downgrade_then_release_is_counter_neutral() {
        let mut table = FileTable::default();
        table.count_grant(OplockType::Exclusive { batch: false });
        table.count_downgrade();
        assert_eq!(table.exclusive_open(), 0);
        assert_eq!(table.level_ii_open(), 1);
        table.count_release(OplockType::LevelII);
        assert_eq!(table.oplocks_open(), 0);
    }

    #[test]
    #[should_panic(expected = "exclusive_open < 0")]
    fn unmatched_release_panics() {
        let mut table = FileTable::default();
        table.count_release(OplockType::Exclusive { batch: false });
    }

    #[test]
    #[should_panic(expected = "level_ii_open < 0")]
    fn unmatched_level_ii_release_panics() {
        let mut table = FileTable::default();
        table.count_release(OplockType::LevelII);
    }
}
