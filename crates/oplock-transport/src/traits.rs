//! Client-session channel abstraction.

use crate::TransportError;
use std::time::Duration;

/// The SMB stream between this server process and its one client.
///
/// The break engine writes break notifications to it and, while awaiting
/// an acknowledgement, keeps reading ordinary requests from it. Only
/// `receive_smb` may suspend, and only up to its timeout.
pub trait ClientChannel: Send {
    /// Writes one complete SMB packet.
    fn send_smb(&mut self, packet: &[u8]) -> Result<(), TransportError>;

    /// Reads the next complete SMB request, waiting at most `timeout`.
    ///
    /// Fails with [`TransportError::Timeout`] when nothing arrives in
    /// time, [`TransportError::Eof`] when the client hung up.
    fn receive_smb(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;
}
