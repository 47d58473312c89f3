//! Kernel oplock notification source.

use crate::TransportError;
use oplock_msg::{FileIdentity, OplockType};
use std::os::fd::BorrowedFd;

/// A platform kernel oplock facility.
///
/// When installed, the kernel enforces oplocks against local (non-SMB)
/// opens and delivers break events through a notification descriptor that
/// [`BreakChannel::receive`](crate::BreakChannel::receive) folds into its
/// readiness wait. Events arrive in the facility's own raw format and are
/// turned into a file identity by [`KernelOplocks::parse_message`].
pub trait KernelOplocks: Send {
    /// Descriptor to include in readiness waits, if the facility has one.
    fn notification_fd(&self) -> Option<BorrowedFd<'_>>;

    /// Whether a break event is pending right now.
    fn message_waiting(&mut self) -> bool;

    /// Reads one pending break event.
    fn receive_message(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Extracts the broken file's identity from a raw event.
    fn parse_message(&self, raw: &[u8]) -> Result<FileIdentity, TransportError>;

    /// Asks the kernel to enforce `oplock` on the file. Returns `false`
    /// when the kernel declines, in which case the caller must not record
    /// the oplock.
    fn set_oplock(&mut self, identity: FileIdentity, oplock: OplockType) -> bool;

    /// Tells the kernel the oplock is gone.
    fn release_oplock(&mut self, identity: FileIdentity);
}
