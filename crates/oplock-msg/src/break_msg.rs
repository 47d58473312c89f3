//! The fixed-layout inter-process oplock break message.

use crate::{FileIdentity, MsgError};
use binrw::{binrw, prelude::*};
use std::io::Cursor;

/// Bit OR'd into the command word when the message is a reply.
pub const CMD_REPLY: u16 = 0x8000;

/// Encoded length of a [`BreakMessage`]. Datagrams of any other size are
/// rejected.
pub const BREAK_MSG_LEN: usize = 26;

/// The break operations of the inter-process protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BreakKind {
    /// Break an exclusive oplock; the holder replies when done.
    Exclusive = 0x0001,
    /// Break a level-II oplock; there is no reply protocol.
    LevelII = 0x0002,
    /// Synthesized from the kernel notification source.
    Kernel = 0x0003,
}

/// A command word: the operation plus the reply bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakCommand {
    pub kind: BreakKind,
    pub reply: bool,
}

impl BreakCommand {
    fn from_raw(raw: u16) -> Result<Self, MsgError> {
        let kind = match raw & !CMD_REPLY {
            0x0001 => BreakKind::Exclusive,
            0x0002 => BreakKind::LevelII,
            0x0003 => BreakKind::Kernel,
            _ => return Err(MsgError::UnknownCommand(raw)),
        };
        Ok(Self {
            kind,
            reply: raw & CMD_REPLY != 0,
        })
    }

    fn to_raw(self) -> u16 {
        self.kind as u16 | if self.reply { CMD_REPLY } else { 0 }
    }
}

/// One inter-process break message.
///
/// Fixed field order, exactly [`BREAK_MSG_LEN`] bytes: command word,
/// sender pid, then the target file's identity. Messages never leave the
/// host, so a single fixed byte order is all that is required for the
/// protocol to be self-consistent.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakMessage {
    #[br(try_map = |raw: u16| BreakCommand::from_raw(raw))]
    #[bw(map = |c| c.to_raw())]
    pub command: BreakCommand,
    /// Process the message originates from.
    pub pid: u32,
    /// The file the break is about.
    pub identity: FileIdentity,
}

impl BreakMessage {
    /// A break request of the given kind.
    pub fn request(kind: BreakKind, pid: u32, identity: FileIdentity) -> Self {
        Self {
            command: BreakCommand { kind, reply: false },
            pid,
            identity,
        }
    }

    /// Encodes to exactly [`BREAK_MSG_LEN`] bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MsgError> {
        let mut cursor = Cursor::new(Vec::with_capacity(BREAK_MSG_LEN));
        self.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    /// Decodes a received datagram.
    ///
    /// The datagram must be exactly [`BREAK_MSG_LEN`] bytes; anything else
    /// is [`MsgError::InvalidLength`] and must be dropped by the caller.
    pub fn parse(data: &[u8]) -> Result<Self, MsgError> {
        if data.len() != BREAK_MSG_LEN {
            return Err(MsgError::InvalidLength {
                actual: data.len(),
                expected: BREAK_MSG_LEN,
            });
        }
        Ok(Self::read(&mut Cursor::new(data))?)
    }

    /// Consumes a request into its reply: identical fields, reply bit set.
    pub fn into_reply(mut self) -> Self {
        self.command.reply = true;
        self
    }

    /// Whether `self` is the reply matching the request `request`.
    ///
    /// Matching is by kind under the reply bit plus equality of pid,
    /// device, inode and file id, which makes the originator's wait loop
    /// tolerant of reordered and duplicated datagrams.
    pub fn matches_reply(&self, request: &BreakMessage) -> bool {
        self.command.reply
            && self.command.kind == request.command.kind
            && self.pid == request.pid
            && self.identity == request.identity
    }
}
