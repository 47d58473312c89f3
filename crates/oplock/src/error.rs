//! Error type of the oplock subsystem.

use crate::share_mode::StoreError;
use oplock_msg::{FileIdentity, MsgError};
use oplock_transport::TransportError;
use thiserror::Error;

/// Errors surfaced by oplock subsystem operations.
///
/// Invariant violations the rest of the server relies on (negative
/// counters, recursion into the break engine, a share entry for an open
/// this process does not have) are not representable here; they panic.
#[derive(Debug, Error)]
pub enum Error {
    /// A break for this file is already awaiting its acknowledgement; the
    /// open that provoked the second break must be denied.
    #[error("oplock break already in flight for {0}")]
    BreakInFlight(FileIdentity),

    /// The kernel declined to enforce the oplock; nothing was granted.
    #[error("kernel refused oplock on {0}")]
    KernelRefused(FileIdentity),

    /// The client connection was lost inside a break window. Never
    /// recovered: the embedding server must tear this process down.
    #[error("client connection lost during oplock break")]
    ClientGone,

    /// A share-mode entry disagrees with the process that wrote it.
    #[error("corrupt share mode entry: {0}")]
    CorruptShareEntry(String),

    /// A state requirement of the requested operation does not hold.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("message error: {0}")]
    Msg(#[from] MsgError),

    #[error("share mode store error: {0}")]
    Store(#[from] StoreError),
}
