//! Transport-level errors.

use thiserror::Error;

/// Errors surfaced by the local transport and by client channels.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No message arrived within the allotted time.
    #[error("receive timed out")]
    Timeout,

    /// The peer closed its end of the stream.
    #[error("end of file from peer")]
    Eof,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message codec error: {0}")]
    Msg(#[from] oplock_msg::MsgError),
}
