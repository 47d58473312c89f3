//! The client-facing oplock break notification.
//!
//! Break notifications ride on a server-initiated SMB1 `LockingAndX`
//! request with the oplock-release bit set in the lock type byte. The
//! client never replies to the packet itself; it acknowledges by releasing
//! (or downgrading) the oplock with a `LockingAndX` of its own, or by
//! closing the file.

use crate::MsgError;
use binrw::{Endian, binrw, prelude::*};
use modular_bitfield::prelude::*;
use std::io::{Cursor, Read, Seek, Write};

/// `LockingAndX` TypeOfLock flag byte.
///
/// Reference: MS-CIFS 2.2.4.32.1
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockType {
    pub shared_lock: bool,
    pub oplock_release: bool,
    pub change_locktype: bool,
    pub cancel_lock: bool,
    pub large_files: bool,
    #[skip]
    __: B3,
}

impl binrw::meta::ReadEndian for LockType {
    const ENDIAN: binrw::meta::EndianKind = binrw::meta::EndianKind::None;
}

impl binrw::meta::WriteEndian for LockType {
    const ENDIAN: binrw::meta::EndianKind = binrw::meta::EndianKind::None;
}

impl BinRead for LockType {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        _: Endian,
        _: Self::Args<'_>,
    ) -> binrw::BinResult<Self> {
        let value = u8::read_options(reader, Endian::Little, ())?;
        Ok(LockType::from_bytes([value]))
    }
}

impl BinWrite for LockType {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        _: Endian,
        _: Self::Args<'_>,
    ) -> binrw::BinResult<()> {
        self.into_bytes()[0].write_options(writer, Endian::Little, ())
    }
}

/// The level the client must fall back to.
///
/// Reference: MS-CIFS 2.2.4.32.1 (NewOpLockLevel)
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq)]
#[brw(repr(u8))]
pub enum BreakLevel {
    None = 0,
    LevelII = 1,
}

/// A server-initiated `LockingAndX` demanding an oplock release.
///
/// Conventional sentinel values mark the packet as server-initiated: pid
/// and mid are 0xFFFF and uid is 0. The tree id and fnum name the open
/// being broken; everything else is fixed.
#[binrw]
#[brw(little)]
#[brw(magic(b"\xffSMB"))]
pub struct OplockBreakNotification {
    #[bw(calc = 0x24)]
    #[br(temp, assert(command == 0x24))]
    command: u8,
    #[bw(calc = 0)]
    #[br(temp)]
    status: u32,
    #[bw(calc = 0)]
    #[br(temp)]
    flags: u8,
    #[bw(calc = 0)]
    #[br(temp)]
    flags2: u16,
    #[bw(calc = 0)]
    #[br(temp)]
    pid_high: u16,
    #[bw(calc = [0u8; 8])]
    #[br(temp)]
    security_features: [u8; 8],
    #[bw(calc = 0)]
    #[br(temp)]
    reserved: u16,
    /// Tree the broken file was opened on.
    pub tid: u16,
    #[bw(calc = 0xffff)]
    #[br(temp, assert(pid == 0xffff))]
    pid: u16,
    #[bw(calc = 0)]
    #[br(temp)]
    uid: u16,
    #[bw(calc = 0xffff)]
    #[br(temp)]
    mid: u16,
    #[bw(calc = 8)]
    #[br(temp, assert(word_count == 8))]
    word_count: u8,
    #[bw(calc = 0xff)]
    #[br(temp)]
    andx_command: u8,
    #[bw(calc = 0)]
    #[br(temp)]
    andx_reserved: u8,
    #[bw(calc = 0)]
    #[br(temp)]
    andx_offset: u16,
    /// Per-session handle of the open being broken.
    pub fnum: u16,
    #[bw(calc = LockType::new().with_oplock_release(true))]
    #[br(temp, assert(lock_type.oplock_release()))]
    lock_type: LockType,
    pub new_level: BreakLevel,
    #[bw(calc = 0)]
    #[br(temp)]
    timeout: u32,
    #[bw(calc = 0)]
    #[br(temp)]
    num_unlocks: u16,
    #[bw(calc = 0)]
    #[br(temp)]
    num_locks: u16,
    #[bw(calc = 0)]
    #[br(temp)]
    byte_count: u16,
}

impl OplockBreakNotification {
    pub fn new(tid: u16, fnum: u16, new_level: BreakLevel) -> Self {
        Self {
            tid,
            fnum,
            new_level,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MsgError> {
        let mut cursor = Cursor::new(Vec::new());
        self.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    pub fn parse(data: &[u8]) -> Result<Self, MsgError> {
        Ok(Self::read(&mut Cursor::new(data))?)
    }
}
