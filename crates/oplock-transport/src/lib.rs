#![forbid(unsafe_code)]
//! Local transports of the oplock coordination core.
//!
//! Two message sources feed a server process: the loopback datagram
//! endpoint peers send break messages to ([`BreakChannel`]), and an
//! optional kernel notification source ([`KernelOplocks`]). Both are
//! multiplexed behind a single timed receive. The client-facing SMB
//! stream is abstracted as [`ClientChannel`] so the break engine can be
//! driven against any session implementation.

pub mod error;
pub mod kernel;
pub mod traits;
pub mod udp;

pub use error::TransportError;
pub use kernel::KernelOplocks;
pub use traits::ClientChannel;
pub use udp::{BreakChannel, LocalMessage};
