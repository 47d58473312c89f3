//! Receive-side framing for break datagrams.

use crate::break_msg::{BREAK_MSG_LEN, BreakMessage};
use binrw::{binrw, prelude::*};
use std::io::Cursor;

/// Length of the framing header the transport prepends to a received
/// datagram: a 4-byte payload length plus the 2-byte origin port.
pub const ENVELOPE_HEADER_LEN: usize = 6;

/// A break message together with its receive-time framing.
///
/// The origin port is taken from the datagram's source address and is what
/// replies are matched against; it is not part of the sender's payload.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramedMessage {
    #[bw(calc = BREAK_MSG_LEN as u32)]
    #[br(temp, assert(len == BREAK_MSG_LEN as u32))]
    len: u32,
    /// Loopback port the datagram arrived from.
    pub origin_port: u16,
    pub msg: BreakMessage,
}

impl FramedMessage {
    pub fn new(origin_port: u16, msg: BreakMessage) -> Self {
        Self { origin_port, msg }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, crate::MsgError> {
        let mut cursor = Cursor::new(Vec::with_capacity(ENVELOPE_HEADER_LEN + BREAK_MSG_LEN));
        self.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    pub fn parse(data: &[u8]) -> Result<Self, crate::MsgError> {
        if data.len() != ENVELOPE_HEADER_LEN + BREAK_MSG_LEN {
            return Err(crate::MsgError::InvalidLength {
                actual: data.len(),
                expected: ENVELOPE_HEADER_LEN + BREAK_MSG_LEN,
            });
        }
        Ok(Self::read(&mut Cursor::new(data))?)
    }
}
