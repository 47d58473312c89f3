#![forbid(unsafe_code)]
//! Wire messages and shared data types for the oplock coordination core.
//!
//! Three message families live here:
//! - the fixed-layout break message exchanged between server processes
//!   over the loopback datagram channel ([`BreakMessage`]),
//! - the framing envelope the transport wraps received datagrams in
//!   ([`FramedMessage`]),
//! - the SMB1 `LockingAndX` break notification sent to clients
//!   ([`OplockBreakNotification`]).

pub mod break_msg;
pub mod envelope;
pub mod error;
pub mod locking;
pub mod types;

pub use break_msg::{BREAK_MSG_LEN, BreakCommand, BreakKind, BreakMessage, CMD_REPLY};
pub use envelope::{ENVELOPE_HEADER_LEN, FramedMessage};
pub use error::MsgError;
pub use locking::{BreakLevel, LockType, OplockBreakNotification};
pub use types::{FileIdentity, OplockType, SentBreakMarker};
