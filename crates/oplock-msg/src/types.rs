//! Data types shared by the codec, the transport and the core.

use binrw::prelude::*;

/// Stable identity of one open file in one server process.
///
/// `device` and `inode` name the object in the shared namespace; `file_id`
/// distinguishes multiple opens of the same inode within the owning
/// process, so keying by `(device, inode)` alone is never sufficient.
/// All three fields participate in every lookup and every break message.
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[brw(little)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
    pub file_id: u32,
}

impl std::fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dev = {:#x}, inode = {}, file_id = {}",
            self.device, self.inode, self.file_id
        )
    }
}

/// Client-side caching right currently granted on an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OplockType {
    /// No caching right.
    #[default]
    None,
    /// Shared read caching; any number of holders may coexist.
    LevelII,
    /// Sole access; the client may cache reads and writes.
    Exclusive {
        /// Batch semantics: the client may additionally defer the close.
        batch: bool,
    },
}

impl OplockType {
    pub fn is_none(&self) -> bool {
        matches!(self, OplockType::None)
    }

    pub fn is_level_ii(&self) -> bool {
        matches!(self, OplockType::LevelII)
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, OplockType::Exclusive { .. })
    }
}

/// The last break this process asked its client about, and therefore
/// which acknowledgement is legal.
///
/// While this is anything other than `NoBreakSent`, no further break may
/// be sent for the same file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SentBreakMarker {
    #[default]
    NoBreakSent,
    ExclusiveBreakSent,
    LevelIIBreakSent,
}
