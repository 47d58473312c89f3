//! Cooperative request dispatch around break windows.
//!
//! While a break acknowledgement is being awaited, the engine keeps
//! reading the client's requests, but any request whose handler could
//! itself initiate a break must not run there: it is queued and replayed
//! once the break settles. Handlers declare their category through
//! [`RequestDispatcher::classify`].

use crate::subsystem::OplockSubsystem;
use std::collections::VecDeque;

/// Whether a request's handler could itself initiate an oplock break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Safe to run at any time, including inside a break window.
    Safe,
    /// Opens, renames, deletes: deferred while a break is in progress.
    BreakInducing,
}

/// The SMB request dispatcher of the embedding server.
///
/// The engine hands it every request read during a break window; `handle`
/// receives the subsystem so acknowledgement handlers can release or
/// downgrade oplocks through it.
pub trait RequestDispatcher {
    fn classify(&self, request: &[u8]) -> RequestClass;
    fn handle(&mut self, subsystem: &mut OplockSubsystem, request: Vec<u8>) -> crate::Result<()>;
}

/// Requests deferred until the break in progress settles.
#[derive(Default)]
pub(crate) struct Scheduler {
    deferred: VecDeque<Vec<u8>>,
}

impl Scheduler {
    pub(crate) fn defer(&mut self, request: Vec<u8>) {
        self.deferred.push_back(request);
    }

    /// Drains the queue for post-break replay, in arrival order.
    pub(crate) fn take_deferred(&mut self) -> VecDeque<Vec<u8>> {
        std::mem::take(&mut self.deferred)
    }
}
