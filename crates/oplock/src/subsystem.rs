//! Process-wide oplock state and lifecycle.

use crate::config::{OplockConfig, SharePolicy};
use crate::dispatch::Scheduler;
use crate::error::Error;
use crate::file::{FileHandle, FileTable, FlushReason, WriteCache};
use crate::session::Session;
use crate::share_mode::{ShareEntry, ShareModeRegistry, ShareModeStore};
use oplock_msg::{FileIdentity, OplockType, SentBreakMarker};
use oplock_transport::{BreakChannel, KernelOplocks};
use std::sync::Arc;
use std::time::SystemTime;

/// The oplock subsystem of one server process.
///
/// Owns everything process-wide: the break channel and its advertised
/// port, the optional kernel source, the open-file table with its
/// counters, the one client session, and the break-window flags. No
/// ambient globals; every operation goes through a reference to this
/// value.
pub struct OplockSubsystem {
    pub(crate) config: OplockConfig,
    pub(crate) pid: u32,
    pub(crate) channel: BreakChannel,
    pub(crate) kernel: Option<Box<dyn KernelOplocks>>,
    pub(crate) registry: ShareModeRegistry,
    pub(crate) files: FileTable,
    pub(crate) session: Session,
    pub(crate) scheduler: Scheduler,
    /// Set for the duration of a client break window; re-entering the
    /// break engine while it is set is a fatal invariant violation.
    pub(crate) break_in_progress: bool,
    /// Sticky: set when this client fails to answer a break in time, and
    /// never cleared. A client that ignores breaks gets no more oplocks.
    pub(crate) client_failed_oplock_break: bool,
    pub(crate) shut_down: bool,
}

impl OplockSubsystem {
    /// Brings the subsystem up for this process: binds the loopback
    /// break channel, learns its assigned port, and installs the kernel
    /// notification source when configured. Failure here is fatal to the
    /// server.
    ///
    /// `pid` is this server process's id; it is stamped into break
    /// messages and share entries, and self-addressed entries are
    /// recognised by it.
    pub fn init(
        config: OplockConfig,
        pid: u32,
        store: Arc<dyn ShareModeStore>,
        session: Session,
        kernel: Option<Box<dyn KernelOplocks>>,
    ) -> crate::Result<Self> {
        let channel = BreakChannel::bind()?;
        let kernel = if config.kernel_oplocks { kernel } else { None };
        log::info!(
            "oplock subsystem up: pid = {pid}, break port = {}, kernel oplocks = {}",
            channel.port(),
            kernel.is_some()
        );
        Ok(Self {
            config,
            pid,
            channel,
            kernel,
            registry: ShareModeRegistry::new(store),
            files: FileTable::default(),
            session,
            scheduler: Scheduler::default(),
            break_in_progress: false,
            client_failed_oplock_break: false,
            shut_down: false,
        })
    }

    /// The port peers reach this process's break channel on. Copied into
    /// every share entry this process writes.
    pub fn port(&self) -> u16 {
        self.channel.port()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn files(&self) -> &FileTable {
        &self.files
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn registry(&self) -> &ShareModeRegistry {
        &self.registry
    }

    pub fn client_failed_oplock_break(&self) -> bool {
        self.client_failed_oplock_break
    }

    /// True once a break window lost the client connection; the embedding
    /// server must exit.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Opens a file: allocates its per-process file id, publishes a share
    /// entry advertising this process's break port, and grants the
    /// requested oplock if nothing forbids it.
    ///
    /// The grant silently degrades to no oplock when the client already
    /// failed a break, when policy forbids level-II, or when the kernel
    /// declines to enforce it.
    pub fn open_file(
        &mut self,
        device: u64,
        inode: u64,
        fnum: u16,
        tid: u16,
        name: &str,
        policy: SharePolicy,
        requested: OplockType,
    ) -> crate::Result<FileIdentity> {
        let file_id = self.files.allocate_file_id();
        let identity = FileIdentity {
            device,
            inode,
            file_id,
        };
        self.files.insert(FileHandle {
            identity,
            fnum,
            tid,
            name: name.to_string(),
            open_time: SystemTime::now(),
            oplock_type: OplockType::None,
            sent_break: SentBreakMarker::NoBreakSent,
            policy,
            write_cache: WriteCache::default(),
        });

        let mut granted = requested;
        if self.client_failed_oplock_break {
            granted = OplockType::None;
        }
        if granted.is_level_ii() && !policy.level2_oplocks {
            granted = OplockType::None;
        }
        if !granted.is_none() {
            match self.set_file_oplock(identity, granted) {
                Ok(()) => {}
                Err(Error::KernelRefused(_)) => {
                    log::debug!("open_file: kernel refused oplock on {name}, granting none");
                }
                Err(e) => return Err(e),
            }
        }

        let op_type = self
            .files
            .find(identity)
            .map(|fsp| fsp.oplock_type)
            .unwrap_or_default();
        let lock = self.registry.lock(device, inode)?;
        let added = self.registry.add_entry(
            &lock,
            ShareEntry {
                device,
                inode,
                pid: self.pid,
                port: self.channel.port(),
                op_type,
                share_file_id: file_id,
            },
        );
        self.registry.unlock(lock);
        added?;

        Ok(identity)
    }

    /// Closes a file: withdraws its share entry, releases any oplock, and
    /// drops the fsp.
    pub fn close_file(&mut self, identity: FileIdentity) -> crate::Result<()> {
        if self.files.find(identity).is_none() {
            return Err(Error::InvalidState(format!(
                "closing a file that is not open ({identity})"
            )));
        }

        let lock = self.registry.lock(identity.device, identity.inode)?;
        let deleted = self.registry.delete_entry(&lock, self.pid, identity.file_id);
        self.registry.unlock(lock);
        if !deleted? {
            log::error!("close_file: no share entry to delete for {identity}");
        }

        let has_oplock = self
            .files
            .find(identity)
            .is_some_and(|fsp| !fsp.oplock_type.is_none());
        if has_oplock {
            self.release_file_oplock(identity)?;
        }

        let mut fsp = self
            .files
            .remove(identity)
            .expect("fsp existed at the top of close_file");
        fsp.write_cache.flush(FlushReason::Close);
        Ok(())
    }

    /// Attempts to grant `oplock` on an open file.
    ///
    /// The kernel source is asked first; when it declines, nothing is
    /// recorded and the caller must not treat the oplock as granted. A
    /// grant is only legal on a file with no current oplock.
    pub fn set_file_oplock(
        &mut self,
        identity: FileIdentity,
        oplock: OplockType,
    ) -> crate::Result<()> {
        if oplock.is_none() {
            return Err(Error::InvalidState(
                "OplockType::None cannot be granted".to_string(),
            ));
        }
        let Some(fsp) = self.files.find(identity) else {
            return Err(Error::InvalidState(format!(
                "granting an oplock on a file that is not open ({identity})"
            )));
        };
        if !fsp.oplock_type.is_none() {
            return Err(Error::InvalidState(format!(
                "file {} already holds {:?}; grants require a release in between",
                fsp.name, fsp.oplock_type
            )));
        }

        if let Some(kernel) = self.kernel.as_deref_mut() {
            if !kernel.set_oplock(identity, oplock) {
                return Err(Error::KernelRefused(identity));
            }
        }

        let fsp = self
            .files
            .find_mut(identity)
            .expect("fsp checked above");
        fsp.oplock_type = oplock;
        fsp.sent_break = SentBreakMarker::NoBreakSent;
        let name = fsp.name.clone();
        self.files.count_grant(oplock);

        log::debug!(
            "set_file_oplock: granted {oplock:?} on file {name}, {identity} \
             (exclusive = {}, level_ii = {})",
            self.files.exclusive_open(),
            self.files.level_ii_open()
        );
        Ok(())
    }

    /// Unconditional local teardown to no oplock: informs the kernel,
    /// fixes the counter for the prior type, clears the sent-break
    /// marker, and forces a write-cache flush.
    pub fn release_file_oplock(&mut self, identity: FileIdentity) -> crate::Result<()> {
        let Some(fsp) = self.files.find(identity) else {
            return Err(Error::InvalidState(format!(
                "releasing an oplock on a file that is not open ({identity})"
            )));
        };
        let prior = fsp.oplock_type;
        if prior.is_none() {
            return Err(Error::InvalidState(format!(
                "file {} holds no oplock to release",
                fsp.name
            )));
        }

        if let Some(kernel) = self.kernel.as_deref_mut() {
            kernel.release_oplock(identity);
        }

        self.files.count_release(prior);
        let fsp = self
            .files
            .find_mut(identity)
            .expect("fsp checked above");
        fsp.oplock_type = OplockType::None;
        fsp.sent_break = SentBreakMarker::NoBreakSent;
        fsp.write_cache.flush(FlushReason::OplockRelease);
        Ok(())
    }

    /// Exclusive going to level-II. The kernel cannot enforce level-II,
    /// so it releases its side entirely. Panics when the prior type is
    /// not exclusive; callers must have checked.
    pub(crate) fn downgrade_file_oplock(&mut self, identity: FileIdentity) {
        let fsp = self
            .files
            .find(identity)
            .unwrap_or_else(|| panic!("downgrading an oplock on a closed file ({identity})"));
        assert!(
            fsp.oplock_type.is_exclusive(),
            "downgrading {:?} on file {}: only exclusive oplocks downgrade",
            fsp.oplock_type,
            fsp.name
        );

        if let Some(kernel) = self.kernel.as_deref_mut() {
            kernel.release_oplock(identity);
        }

        self.files.count_downgrade();
        let fsp = self
            .files
            .find_mut(identity)
            .expect("fsp checked above");
        fsp.oplock_type = OplockType::LevelII;
        fsp.sent_break = SentBreakMarker::NoBreakSent;
    }

    /// Settles a broken oplock, in both the registry and local state.
    ///
    /// `break_to_none` forces full removal; otherwise the sent-break
    /// marker decides, honoring a client that answers a break-to-level-II
    /// by going straight to none.
    pub fn remove_oplock(
        &mut self,
        identity: FileIdentity,
        break_to_none: bool,
    ) -> crate::Result<()> {
        let Some(fsp) = self.files.find(identity) else {
            return Err(Error::InvalidState(format!(
                "removing an oplock on a file that is not open ({identity})"
            )));
        };
        let sent_break = fsp.sent_break;
        let name = fsp.name.clone();

        let lock = self.registry.lock(identity.device, identity.inode)?;
        let result = if sent_break == SentBreakMarker::ExclusiveBreakSent || break_to_none {
            match self.registry.remove_oplock(&lock, self.pid, identity.file_id) {
                Ok(true) => self.release_file_oplock(identity),
                Ok(false) => {
                    log::error!("remove_oplock: no share oplock to remove for file {name}");
                    self.release_file_oplock(identity)
                }
                Err(e) => Err(e),
            }
        } else {
            match self
                .registry
                .downgrade_oplock(&lock, self.pid, identity.file_id)
            {
                Ok(true) => {
                    self.downgrade_file_oplock(identity);
                    Ok(())
                }
                Ok(false) => {
                    log::error!("remove_oplock: no share oplock to downgrade for file {name}");
                    self.downgrade_file_oplock(identity);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        self.registry.unlock(lock);
        result
    }

    /// Clears level-II state locally; the registry entry is the caller's
    /// business (it already holds the share lock).
    pub(crate) fn clear_level2(&mut self, identity: FileIdentity) {
        let fsp = self
            .files
            .find_mut(identity)
            .unwrap_or_else(|| panic!("clearing level-II on a closed file ({identity})"));
        assert!(
            fsp.oplock_type.is_level_ii(),
            "clearing level-II on file {} which holds {:?}",
            fsp.name,
            fsp.oplock_type
        );
        fsp.oplock_type = OplockType::None;
        self.files.count_release(OplockType::LevelII);
    }
}
