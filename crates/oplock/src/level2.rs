//! Level-II broadcast on data-modifying operations.

use crate::dispatch::RequestDispatcher;
use crate::engine::BreakOrigin;
use crate::error::Error;
use crate::share_mode::ShareLock;
use crate::subsystem::OplockSubsystem;
use oplock_msg::{BreakLevel, FileIdentity, OplockBreakNotification};

impl OplockSubsystem {
    /// Runs on any modifying operation (write, lock, truncate) on a file
    /// this session holds at level-II: every level-II holder across all
    /// processes must drop to none so read caches get invalidated.
    ///
    /// Own entries are broken inline under the share lock; foreign
    /// entries are notified asynchronously and never awaited. On return
    /// the calling file no longer holds level-II, on pain of panic.
    pub fn release_level_2_on_change(
        &mut self,
        dispatcher: &mut dyn RequestDispatcher,
        identity: FileIdentity,
    ) -> crate::Result<()> {
        let Some(fsp) = self.files.find(identity) else {
            return Ok(());
        };
        if !fsp.oplock_type.is_level_ii() {
            return Ok(());
        }

        let lock = self.registry.lock(identity.device, identity.inode)?;
        let entries = match self.registry.get_entries(&lock) {
            Ok(entries) => entries,
            Err(e) => {
                self.registry.unlock(lock);
                return Err(e);
            }
        };
        log::trace!(
            "release_level_2_on_change: {} share entries for {identity}",
            entries.len()
        );

        let mut failure = None;
        for entry in &entries {
            // Several writers can queue up on the share lock, so by our
            // turn some entries may already be None and some breaks may
            // be re-sent. Both are harmless.
            if entry.op_type.is_none() {
                continue;
            }
            if entry.op_type.is_exclusive() {
                self.registry.unlock(lock);
                panic!(
                    "share mode entry of pid {} for {identity} holds an exclusive oplock \
                     during a level-II sweep",
                    entry.pid
                );
            }

            let result = if entry.pid == self.pid {
                let own = FileIdentity {
                    device: entry.device,
                    inode: entry.inode,
                    file_id: entry.share_file_id,
                };
                if self.files.find(own).is_none() {
                    self.registry.unlock(lock);
                    panic!("own level-II share entry for {own} has no matching open file");
                }
                log::trace!("release_level_2_on_change: breaking our own oplock on {own}");
                self.break_level2_single(own, BreakOrigin::Local, Some(&lock))
            } else {
                log::trace!(
                    "release_level_2_on_change: breaking remote oplock of pid {}",
                    entry.pid
                );
                self.request_oplock_break(dispatcher, entry)
            };
            if let Err(e) = result {
                log::error!(
                    "release_level_2_on_change: failed to break entry of pid {} ({e})",
                    entry.pid
                );
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }

        self.registry.unlock(lock);

        // Whatever happened above, our own right to cache is gone.
        if let Some(fsp) = self.files.find(identity) {
            assert!(
                !fsp.oplock_type.is_level_ii(),
                "file {} still holds a level-II oplock after a level-II sweep",
                fsp.name
            );
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tears down a single level-II oplock: notify the client when it can
    /// understand the notification, withdraw the registry oplock, clear
    /// local state. No acknowledgement is ever awaited, and there is no
    /// write cache to flush; level-II grants no write caching.
    ///
    /// `held` is the share lock when the caller already owns it (the
    /// sweep above); otherwise the lock is taken here.
    pub(crate) fn break_level2_single(
        &mut self,
        identity: FileIdentity,
        origin: BreakOrigin,
        held: Option<&ShareLock>,
    ) -> crate::Result<()> {
        let Some(fsp) = self.files.find(identity) else {
            return Err(Error::InvalidState(format!(
                "level-II break on a file that is not open ({identity})"
            )));
        };
        let tid = fsp.tid;
        let fnum = fsp.fnum;
        let name = fsp.name.clone();

        // A level-II oplock can exist even when the client never
        // negotiated level-II awareness; such a client gets no packet.
        if self.session.caps().level_ii_oplocks {
            self.wait_before_sending_break(origin);
            let packet = OplockBreakNotification::new(tid, fnum, BreakLevel::None).to_bytes()?;
            if let Err(e) = self.session.send_smb(&packet) {
                log::error!("break_level2_single: sending break notification failed ({e})");
                self.shut_down = true;
                return Err(Error::ClientGone);
            }
        }

        // Tell every other process the level-II oplock is gone.
        let removed = match held {
            Some(lock) => self.registry.remove_oplock(lock, self.pid, identity.file_id),
            None => {
                let lock = self.registry.lock(identity.device, identity.inode)?;
                let removed = self.registry.remove_oplock(&lock, self.pid, identity.file_id);
                self.registry.unlock(lock);
                removed
            }
        };
        match removed {
            Ok(true) => {}
            Ok(false) => {
                log::error!("break_level2_single: no level-II share oplock to remove for {name}");
            }
            Err(e) => return Err(e),
        }

        self.clear_level2(identity);

        log::debug!(
            "break_level2_single: returning success for {name} ({identity}), level_ii = {}",
            self.files.level_ii_open()
        );
        Ok(())
    }
}
