#![forbid(unsafe_code)]
//! Opportunistic-lock coordination for a multi-process SMB server.
//!
//! Each server process serves one client session; processes share a
//! file-system namespace and a cross-process share-mode registry, and
//! coordinate oplock breaks over a loopback datagram channel. This crate
//! is the per-process side of that coordination: it grants and tracks
//! oplocks on this process's open files, drives breaks of its own
//! client's oplocks to completion, and asks peer processes to break
//! theirs.
//!
//! The entry point is [`OplockSubsystem`], constructed once per process
//! with [`OplockSubsystem::init`]. Request processing is single-threaded
//! and cooperative: the only suspension points are the timed receives on
//! the break channel and the client channel.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod file;
pub mod level2;
pub mod session;
pub mod share_mode;
pub mod subsystem;

pub use config::{
    OPLOCK_BREAK_TIMEOUT, OPLOCK_BREAK_TIMEOUT_FUDGEFACTOR, OplockConfig, SharePolicy,
};
pub use dispatch::{RequestClass, RequestDispatcher};
pub use engine::BreakOrigin;
pub use error::Error;
pub use file::{FileHandle, FileTable, FlushReason, WriteCache};
pub use session::{ClientCaps, Principal, Session};
pub use share_mode::{
    MemShareModeStore, ShareEntry, ShareKey, ShareModeRegistry, ShareModeStore, StoreError,
};
pub use subsystem::OplockSubsystem;

pub use oplock_msg::*;
pub use oplock_transport as transport;

/// Oplock subsystem result type.
pub type Result<T> = std::result::Result<T, crate::Error>;
