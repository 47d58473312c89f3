//! Message-level errors.

use thiserror::Error;

/// Errors raised while encoding or decoding oplock messages.
#[derive(Debug, Error)]
pub enum MsgError {
    /// A datagram's length does not match the declared layout for its
    /// command code. Such datagrams are dropped by the receiver.
    #[error("invalid message length (was {actual}, should be {expected})")]
    InvalidLength { actual: usize, expected: usize },

    /// The command word names no known break operation.
    #[error("unknown break command code {0:#06x}")]
    UnknownCommand(u16),

    #[error("binary (de)serialization failed: {0}")]
    Binrw(binrw::Error),
}

impl From<binrw::Error> for MsgError {
    fn from(err: binrw::Error) -> Self {
        match err {
            binrw::Error::Custom { err, pos } => match err.downcast::<MsgError>() {
                Ok(msg_err) => *msg_err,
                Err(err) => MsgError::Binrw(binrw::Error::Custom { err, pos }),
            },
            other => MsgError::Binrw(other),
        }
    }
}
