//! The break engine: drives one oplock break end to end.
//!
//! A break has two sides. The holder side ([`OplockSubsystem::break_oplock`])
//! notifies its client and keeps servicing that client's unrelated
//! requests until the oplock is acknowledged away, the window times out,
//! or the connection dies. The originator side
//! ([`OplockSubsystem::request_oplock_break`]) asks the holding process to
//! run the holder side and, for exclusive oplocks, awaits its reply.

use crate::config::OPLOCK_BREAK_WAIT_CAP;
use crate::dispatch::{RequestClass, RequestDispatcher};
use crate::error::Error;
use crate::share_mode::ShareEntry;
use crate::subsystem::OplockSubsystem;
use oplock_msg::{
    BreakKind, BreakLevel, BreakMessage, FileIdentity, OplockBreakNotification, SentBreakMarker,
};
use oplock_transport::{LocalMessage, TransportError};
use std::time::Instant;

/// Who provoked a break on a file this process holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakOrigin {
    /// Our own client's request conflicts with its own oplock.
    Local,
    /// A peer process or the kernel asked us to break.
    Remote,
}

impl OplockSubsystem {
    /// Drives a break of the oplock on `identity` to completion.
    ///
    /// Succeeds trivially when the file has already closed or its oplock
    /// is already gone; both are legal races, not errors. A level-II
    /// oplock is torn down inline with no acknowledgement. An exclusive
    /// oplock means notifying the client and servicing its unrelated
    /// requests until it acknowledges, times out, or disconnects.
    ///
    /// Fails with [`Error::BreakInFlight`] when a break for this file is
    /// already awaiting its acknowledgement; the provoking open must be
    /// denied. Fails with [`Error::ClientGone`] when the client
    /// connection dies inside the window; that one is terminal.
    pub fn break_oplock(
        &mut self,
        dispatcher: &mut dyn RequestDispatcher,
        identity: FileIdentity,
        origin: BreakOrigin,
    ) -> crate::Result<()> {
        log::debug!(
            "break_oplock: called for {identity} (exclusive = {}, level_ii = {})",
            self.files.exclusive_open(),
            self.files.level_ii_open()
        );

        // The file may have closed between the decision to break and now,
        // or a crossing break may have raced ahead of this one. Both are
        // common and succeed with no side effects.
        let Some(fsp) = self.files.find(identity) else {
            log::debug!("break_oplock: no open file for {identity}, allowing break to succeed");
            return Ok(());
        };
        if fsp.oplock_type.is_none() {
            log::debug!(
                "break_oplock: file {} has no oplock, allowing break to succeed",
                fsp.name
            );
            return Ok(());
        }

        // Level-II has no acknowledgement protocol.
        if fsp.oplock_type.is_level_ii() {
            return self.break_level2_single(identity, origin, None);
        }

        // One in-flight break per (device, inode): we can neither send a
        // second break nor let another open through while the client's
        // answer is pending.
        if self.files.break_in_flight_for(identity.device, identity.inode) {
            log::error!(
                "break_oplock: break already sent for file {} ({identity})",
                fsp.name
            );
            return Err(Error::BreakInFlight(identity));
        }

        assert!(
            !self.break_in_progress,
            "recursion into the break engine: a break-inducing request ran inside a break window"
        );

        let caps = self.session.caps();
        let policy = fsp.policy;
        let tid = fsp.tid;
        let fnum = fsp.fnum;
        let name = fsp.name.clone();

        self.wait_before_sending_break(origin);

        // Break to level-II only when the client understands it, the
        // kernel is not enforcing this oplock, and the share permits it.
        let to_level_ii = caps.level_ii_oplocks && self.kernel.is_none() && policy.level2_oplocks;
        let target = if to_level_ii {
            BreakLevel::LevelII
        } else {
            BreakLevel::None
        };

        let fsp = self
            .files
            .find_mut(identity)
            .expect("fsp looked up at the top of break_oplock");
        fsp.sent_break = if to_level_ii {
            SentBreakMarker::LevelIIBreakSent
        } else {
            SentBreakMarker::ExclusiveBreakSent
        };

        let packet = OplockBreakNotification::new(tid, fnum, target).to_bytes()?;
        if let Err(e) = self.session.send_smb(&packet) {
            log::error!("break_oplock: sending break notification failed ({e})");
            self.shut_down = true;
            return Err(Error::ClientGone);
        }
        self.break_in_progress = true;

        // Unrelated requests serviced inside the window must not run
        // under the oplock holder's identity or directory.
        let saved = self.session.save_context_as_root();

        let start = Instant::now();
        let timeout = self.config.break_timeout;
        let mut timed_out = false;
        let mut shutdown_required = false;

        // Request processing may close the file under us, so the fsp is
        // looked up afresh on every iteration; a cached reference would
        // dangle across the receive.
        loop {
            match self.files.find(identity) {
                Some(fsp) if fsp.oplock_type.is_exclusive() => {}
                _ => break,
            }

            let request = match self.session.receive_smb(timeout) {
                Ok(request) => request,
                Err(TransportError::Timeout) => {
                    log::error!(
                        "break_oplock: no acknowledgement from client within {timeout:?} \
                         for file {name} ({identity})"
                    );
                    timed_out = true;
                    break;
                }
                Err(e) => {
                    log::error!("break_oplock: client receive failed during break ({e})");
                    shutdown_required = true;
                    break;
                }
            };

            if let Err(e) = self.dispatch_during_break(dispatcher, request) {
                log::error!("break_oplock: request failed inside break window ({e})");
            }

            if start.elapsed() > timeout {
                log::error!(
                    "break_oplock: no break received from client within {timeout:?} \
                     for file {name} ({identity})"
                );
                timed_out = true;
                break;
            }
        }

        self.session.restore_context(saved);
        self.break_in_progress = false;

        // The client timed out: clear the oplock ourselves and never
        // grant this client another one. Continuing beats dropping the
        // connection.
        if timed_out {
            let still_exclusive = self
                .files
                .find(identity)
                .is_some_and(|fsp| fsp.oplock_type.is_exclusive());
            if still_exclusive {
                log::error!("break_oplock: client failure in oplock break for file {name}");
                self.remove_oplock(identity, true)?;
                self.client_failed_oplock_break = true;
            }
        }

        if shutdown_required {
            log::error!("break_oplock: client failure in break, shutting this server down");
            self.shut_down = true;
            return Err(Error::ClientGone);
        }

        // Now that breaks are legal again, replay what the window queued.
        self.run_deferred(dispatcher);

        assert!(
            self.files.exclusive_open() >= 0,
            "exclusive_open < 0 ({}) after oplock break",
            self.files.exclusive_open()
        );

        log::debug!(
            "break_oplock: returning success for {identity} (exclusive = {})",
            self.files.exclusive_open()
        );
        Ok(())
    }

    /// Asks the holder of `entry` to break its oplock.
    ///
    /// When the holder is this very process, the break runs directly.
    /// Otherwise a break message goes to the holder's advertised port;
    /// exclusive holders are awaited for a matching reply, level-II
    /// holders are notified fire-and-forget.
    pub fn request_oplock_break(
        &mut self,
        dispatcher: &mut dyn RequestDispatcher,
        entry: &ShareEntry,
    ) -> crate::Result<()> {
        let identity = FileIdentity {
            device: entry.device,
            inode: entry.inode,
            file_id: entry.share_file_id,
        };

        if entry.pid == self.pid {
            // Breaking our own oplock: the entry must really be ours.
            if entry.port != self.channel.port() {
                return Err(Error::CorruptShareEntry(format!(
                    "entry for pid {} names port {}, but this process listens on {}",
                    entry.pid,
                    entry.port,
                    self.channel.port()
                )));
            }
            if self.files.find(identity).is_none() {
                panic!("own share entry for {identity} has no matching open file");
            }
            log::debug!("request_oplock_break: breaking our own oplock on {identity}");
            return self.break_oplock(dispatcher, identity, BreakOrigin::Local);
        }

        let kind = if entry.op_type.is_level_ii() {
            BreakKind::LevelII
        } else {
            BreakKind::Exclusive
        };
        let request = BreakMessage::request(kind, self.pid, identity);
        log::debug!(
            "request_oplock_break: sending {kind:?} break to pid {} on port {} for {identity}",
            entry.pid,
            entry.port
        );
        self.channel.send(entry.port, &request)?;

        // Level-II holders never reply; the message alone is the break.
        if kind == BreakKind::LevelII {
            return Ok(());
        }

        self.await_break_reply(dispatcher, entry, &request)
    }

    /// Originator's wait for the holder's reply. Every message that is
    /// not the awaited reply is a crossing break request and is processed
    /// here; parking it would deadlock two processes breaking each other.
    fn await_break_reply(
        &mut self,
        dispatcher: &mut dyn RequestDispatcher,
        entry: &ShareEntry,
        request: &BreakMessage,
    ) -> crate::Result<()> {
        let deadline = Instant::now() + self.config.break_timeout + self.config.break_reply_fudge;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = match self.receive_local_message(remaining) {
                Ok(message) => message,
                Err(TransportError::Timeout) => {
                    // No answer: assume the holder died with its client's
                    // cached changes, and let the open proceed.
                    log::error!(
                        "request_oplock_break: no response from pid {} on port {} for {}",
                        entry.pid,
                        entry.port,
                        request.identity
                    );
                    return Ok(());
                }
                Err(e) => {
                    log::error!(
                        "request_oplock_break: error awaiting reply from pid {} ({e})",
                        entry.pid
                    );
                    return Err(e.into());
                }
            };

            match message {
                LocalMessage::Peer(framed)
                    if framed.msg.matches_reply(request) && framed.origin_port == entry.port =>
                {
                    log::debug!(
                        "request_oplock_break: oplock broken by pid {} for {}",
                        entry.pid,
                        request.identity
                    );
                    return Ok(());
                }
                other => {
                    if let Err(e) = self.process_local_message(dispatcher, other) {
                        log::error!("request_oplock_break: crossing message failed ({e})");
                    }
                }
            }
        }
    }

    /// Processes one message from the local transport, wherever it came
    /// from, and replies when the protocol calls for it.
    ///
    /// Unsolicited replies and unparsable kernel events are logged and
    /// dropped. A break request arriving when this process holds no
    /// oplocks at all is success: a close raced with the request.
    pub fn process_local_message(
        &mut self,
        dispatcher: &mut dyn RequestDispatcher,
        message: LocalMessage,
    ) -> crate::Result<()> {
        let (identity, reply_to) = match message {
            LocalMessage::Kernel(raw) => {
                let Some(kernel) = self.kernel.as_deref() else {
                    log::error!("process_local_message: unexpected kernel oplock event");
                    return Ok(());
                };
                match kernel.parse_message(&raw) {
                    Ok(identity) => (identity, None),
                    Err(e) => {
                        log::error!("process_local_message: kernel event parse failure ({e})");
                        return Ok(());
                    }
                }
            }
            LocalMessage::Peer(framed) => {
                let msg = framed.msg;
                if msg.command.reply {
                    // Nobody is waiting for this; diagnostic only.
                    log::error!(
                        "process_local_message: unsolicited break reply from pid {} port {} \
                         for {}",
                        msg.pid,
                        framed.origin_port,
                        msg.identity
                    );
                    return Ok(());
                }
                log::debug!(
                    "process_local_message: {:?} break request from pid {} port {} for {}",
                    msg.command.kind,
                    msg.pid,
                    framed.origin_port,
                    msg.identity
                );
                let reply_to =
                    (msg.command.kind == BreakKind::Exclusive).then_some((framed.origin_port, msg));
                (msg.identity, reply_to)
            }
        };

        if self.files.oplocks_open() != 0 {
            self.break_oplock(dispatcher, identity, BreakOrigin::Remote)?;
        } else {
            // A close command may just have been issued on the file that
            // was oplocked.
            log::debug!(
                "process_local_message: break requested with no outstanding oplocks, \
                 returning success"
            );
        }

        // Exclusive peer requests get a reply; kernel and level-II do not.
        if let Some((port, request)) = reply_to {
            self.channel.send(port, &request.into_reply())?;
            log::debug!(
                "process_local_message: break reply sent to pid {} port {port} for {}",
                request.pid,
                request.identity
            );
        }
        Ok(())
    }

    /// Receives one message from the break channel or the kernel source,
    /// kernel first.
    pub fn receive_local_message(
        &mut self,
        timeout: std::time::Duration,
    ) -> Result<LocalMessage, TransportError> {
        let kernel = self.kernel.as_deref_mut();
        self.channel.receive(kernel, timeout)
    }

    /// Whether a break message is pending on either local source.
    pub fn message_waiting(&mut self) -> bool {
        let kernel = self.kernel.as_deref_mut();
        self.channel.ready(kernel)
    }

    /// Last-ditch attempt to free a file-table slot: break our own
    /// exclusive, un-broken oplock on `identity` and report whether the
    /// break ended up closing the file.
    pub fn attempt_close_oplocked_file(
        &mut self,
        dispatcher: &mut dyn RequestDispatcher,
        identity: FileIdentity,
    ) -> crate::Result<bool> {
        let Some(fsp) = self.files.find(identity) else {
            return Ok(false);
        };
        log::debug!("attempt_close_oplocked_file: checking file {}", fsp.name);
        if !fsp.oplock_type.is_exclusive() || fsp.sent_break != SentBreakMarker::NoBreakSent {
            return Ok(false);
        }
        self.break_oplock(dispatcher, identity, BreakOrigin::Local)?;
        Ok(self.files.find(identity).is_none())
    }

    /// Runs a request read inside a break window: break-inducing requests
    /// are queued for post-break replay, everything else runs now.
    fn dispatch_during_break(
        &mut self,
        dispatcher: &mut dyn RequestDispatcher,
        request: Vec<u8>,
    ) -> crate::Result<()> {
        if self.break_in_progress && dispatcher.classify(&request) == RequestClass::BreakInducing {
            log::debug!("deferring break-inducing request until the break settles");
            self.scheduler.defer(request);
            return Ok(());
        }
        dispatcher.handle(self, request)
    }

    /// Replays requests deferred during a break window, in arrival order.
    fn run_deferred(&mut self, dispatcher: &mut dyn RequestDispatcher) {
        for request in self.scheduler.take_deferred() {
            if let Err(e) = dispatcher.handle(self, request) {
                log::error!("deferred request failed after oplock break ({e})");
            }
        }
    }

    /// Paces a locally-provoked break: leave the client a quiet gap after
    /// its last packet, so our reply and the break cannot race on its
    /// wire. Known to confuse several client implementations otherwise.
    pub(crate) fn wait_before_sending_break(&self, origin: BreakOrigin) {
        if origin != BreakOrigin::Local {
            return;
        }
        let wait = self.config.oplock_break_wait.min(OPLOCK_BREAK_WAIT_CAP);
        if wait.is_zero() {
            return;
        }
        if let Some(left) = wait.checked_sub(self.session.since_last_packet()) {
            if !left.is_zero() {
                std::thread::sleep(left.min(OPLOCK_BREAK_WAIT_CAP));
            }
        }
    }
}
