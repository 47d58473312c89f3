//! The one client session this server process serves.

use oplock_transport::{ClientChannel, TransportError};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Capabilities the client negotiated at session setup.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientCaps {
    /// The client understands break-to-level-II notifications. A client
    /// without this capability can still hold a level-II oplock; it just
    /// never hears about losing it.
    pub level_ii_oplocks: bool,
}

/// Identity requests run under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// Root-equivalent. Used inside a break window so unrelated requests
    /// serviced there never run under the wrong user.
    Root,
    /// The authenticated user of this session.
    User { vuid: u16 },
}

/// Request-processing state saved around a break window.
#[derive(Debug)]
pub struct SavedContext {
    principal: Principal,
    cwd: PathBuf,
    chain_fnum: Option<u16>,
}

/// The client session: its channel, negotiated capabilities, and the
/// request-processing state a break window must save and restore.
pub struct Session {
    channel: Box<dyn ClientChannel>,
    caps: ClientCaps,
    vuid: u16,
    principal: Principal,
    /// Working directory of the connection's VFS.
    cwd: PathBuf,
    /// Chained fnum of the request currently being processed, if any.
    chain_fnum: Option<u16>,
    /// When the last packet from the client was seen; paces break sends.
    last_packet: Instant,
}

impl Session {
    pub fn new(channel: Box<dyn ClientChannel>, vuid: u16, caps: ClientCaps) -> Self {
        Self {
            channel,
            caps,
            vuid,
            principal: Principal::User { vuid },
            cwd: PathBuf::from("/"),
            chain_fnum: None,
            last_packet: Instant::now(),
        }
    }

    pub fn caps(&self) -> ClientCaps {
        self.caps
    }

    pub fn vuid(&self) -> u16 {
        self.vuid
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn cwd(&self) -> &PathBuf {
        &self.cwd
    }

    pub fn set_cwd(&mut self, cwd: PathBuf) {
        self.cwd = cwd;
    }

    pub fn set_chain_fnum(&mut self, fnum: Option<u16>) {
        self.chain_fnum = fnum;
    }

    /// Time since the last packet arrived from the client.
    pub fn since_last_packet(&self) -> Duration {
        self.last_packet.elapsed()
    }

    pub fn send_smb(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        self.channel.send_smb(packet)
    }

    /// Receives the next client request, noting its arrival time.
    pub fn receive_smb(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let request = self.channel.receive_smb(timeout)?;
        self.last_packet = Instant::now();
        Ok(request)
    }

    /// Saves the session's request-processing state and becomes
    /// root-equivalent for the duration of a break window.
    pub(crate) fn save_context_as_root(&mut self) -> SavedContext {
        let saved = SavedContext {
            principal: self.principal.clone(),
            cwd: self.cwd.clone(),
            chain_fnum: self.chain_fnum.take(),
        };
        self.principal = Principal::Root;
        saved
    }

    /// Restores state saved by [`Session::save_context_as_root`].
    pub(crate) fn restore_context(&mut self, saved: SavedContext) {
        self.principal = saved.principal;
        self.cwd = saved.cwd;
        self.chain_fnum = saved.chain_fnum;
    }
}
