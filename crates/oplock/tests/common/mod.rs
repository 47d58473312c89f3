//! Shared fixtures: scripted client channels, a scriptable dispatcher,
//! and helpers for emulating several server processes in one test binary.
#![allow(dead_code)]

use oplock::transport::{ClientChannel, TransportError};
use oplock::{
    ClientCaps, FileIdentity, MemShareModeStore, OplockConfig, OplockSubsystem, Principal,
    RequestClass, RequestDispatcher, Session, ShareEntry, ShareModeStore,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One step of a scripted client conversation.
pub enum ScriptStep {
    /// The client sends this request.
    Request(Vec<u8>),
    /// The client stays silent until the server's receive times out.
    Timeout,
    /// The client hangs up.
    Eof,
}

/// Handles to a scripted client's queues, kept by the test while the
/// channel itself is owned by the session.
#[derive(Clone, Default)]
pub struct ClientScript {
    steps: Arc<Mutex<VecDeque<ScriptStep>>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ClientScript {
    pub fn push(&self, step: ScriptStep) {
        self.steps.lock().unwrap().push_back(step);
    }

    /// Packets the server wrote to this client.
    pub fn sent_packets(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

struct ScriptedChannel {
    script: ClientScript,
}

impl ClientChannel for ScriptedChannel {
    fn send_smb(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        self.script.sent.lock().unwrap().push(packet.to_vec());
        Ok(())
    }

    fn receive_smb(&mut self, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        match self.script.steps.lock().unwrap().pop_front() {
            Some(ScriptStep::Request(request)) => Ok(request),
            Some(ScriptStep::Timeout) | None => Err(TransportError::Timeout),
            Some(ScriptStep::Eof) => Err(TransportError::Eof),
        }
    }
}

// The dispatcher speaks a tiny request language, one tag byte plus an
// optional identity payload:
//   'N'                     safe no-op
//   'A' to_none identity    oplock release acknowledgement
//   'O'                     open marker (break-inducing)
//   'B' identity            open that breaks our own oplock on identity
pub fn noop() -> Vec<u8> {
    vec![b'N']
}

pub fn ack(identity: FileIdentity, to_none: bool) -> Vec<u8> {
    let mut request = vec![b'A', to_none as u8];
    push_identity(&mut request, identity);
    request
}

pub fn open_marker() -> Vec<u8> {
    vec![b'O']
}

pub fn self_break(identity: FileIdentity) -> Vec<u8> {
    let mut request = vec![b'B'];
    push_identity(&mut request, identity);
    request
}

fn push_identity(request: &mut Vec<u8>, identity: FileIdentity) {
    request.extend_from_slice(&identity.device.to_le_bytes());
    request.extend_from_slice(&identity.inode.to_le_bytes());
    request.extend_from_slice(&identity.file_id.to_le_bytes());
}

fn pop_identity(payload: &[u8]) -> FileIdentity {
    FileIdentity {
        device: u64::from_le_bytes(payload[0..8].try_into().unwrap()),
        inode: u64::from_le_bytes(payload[8..16].try_into().unwrap()),
        file_id: u32::from_le_bytes(payload[16..20].try_into().unwrap()),
    }
}

/// Dispatcher for the request language above, recording what it did.
#[derive(Default)]
pub struct TestDispatcher {
    log: Arc<Mutex<Vec<String>>>,
}

impl TestDispatcher {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, line: String) {
        self.log.lock().unwrap().push(line);
    }
}

impl RequestDispatcher for TestDispatcher {
    fn classify(&self, request: &[u8]) -> RequestClass {
        match request.first() {
            Some(b'O') => RequestClass::BreakInducing,
            _ => RequestClass::Safe,
        }
    }

    fn handle(
        &mut self,
        subsystem: &mut OplockSubsystem,
        request: Vec<u8>,
    ) -> oplock::Result<()> {
        match request.first() {
            Some(b'N') => {
                self.record("noop".to_string());
                Ok(())
            }
            Some(b'A') => {
                let to_none = request[1] != 0;
                let identity = pop_identity(&request[2..]);
                let as_root = *subsystem.session().principal() == Principal::Root;
                self.record(format!("ack {identity} as_root={as_root}"));
                subsystem.remove_oplock(identity, to_none)
            }
            Some(b'O') => {
                self.record("open".to_string());
                Ok(())
            }
            Some(b'B') => {
                let identity = pop_identity(&request[1..]);
                let entry = entries_for(subsystem, identity.device, identity.inode)
                    .into_iter()
                    .find(|e| e.pid == subsystem.pid() && e.share_file_id == identity.file_id)
                    .expect("own share entry present");
                let result = subsystem.request_oplock_break(self, &entry);
                self.record(format!(
                    "self-break {identity} => {}",
                    match &result {
                        Ok(()) => "ok".to_string(),
                        Err(e) => format!("err: {e}"),
                    }
                ));
                // The provoking open is denied; the request itself is done.
                Ok(())
            }
            other => panic!("unknown test request tag {other:?}"),
        }
    }
}

/// One emulated server process.
pub struct Peer {
    pub subsys: OplockSubsystem,
    pub dispatcher: TestDispatcher,
    pub script: ClientScript,
}

/// Short windows keep the negative-path tests fast while leaving plenty
/// of room for the positive paths.
pub fn test_config() -> OplockConfig {
    OplockConfig {
        oplock_break_wait: Duration::ZERO,
        kernel_oplocks: false,
        break_timeout: Duration::from_secs(2),
        break_reply_fudge: Duration::from_secs(1),
    }
}

/// A session talking to a scripted client, plus the script handles.
pub fn scripted_session(vuid: u16, level_ii_caps: bool) -> (Session, ClientScript) {
    let script = ClientScript::default();
    let session = Session::new(
        Box::new(ScriptedChannel {
            script: script.clone(),
        }),
        vuid,
        ClientCaps {
            level_ii_oplocks: level_ii_caps,
        },
    );
    (session, script)
}

pub fn spawn_peer(pid: u32, store: &Arc<MemShareModeStore>, level_ii_caps: bool) -> Peer {
    let (session, script) = scripted_session(100 + pid as u16, level_ii_caps);
    let subsys = OplockSubsystem::init(
        test_config(),
        pid,
        Arc::clone(store) as Arc<dyn ShareModeStore>,
        session,
        None,
    )
    .unwrap();
    Peer {
        subsys,
        dispatcher: TestDispatcher::default(),
        script,
    }
}

/// Reads the share entries for a key, taking and releasing the lock.
pub fn entries_for(subsys: &OplockSubsystem, device: u64, inode: u64) -> Vec<ShareEntry> {
    let registry = subsys.registry();
    let lock = registry.lock(device, inode).unwrap();
    let entries = registry.get_entries(&lock).unwrap();
    registry.unlock(lock);
    entries
}
