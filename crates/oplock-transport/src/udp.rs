//! The loopback datagram endpoint of the inter-process break protocol.

use crate::{KernelOplocks, TransportError};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use oplock_msg::{BreakMessage, FramedMessage};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::{Duration, Instant};

/// One message obtained from [`BreakChannel::receive`].
#[derive(Debug)]
pub enum LocalMessage {
    /// A framed datagram from a peer server process.
    Peer(FramedMessage),
    /// A raw event from the kernel notification source.
    Kernel(Vec<u8>),
}

/// Which source a readiness wait found readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ready {
    Kernel,
    Socket,
}

/// The per-process loopback endpoint of the break protocol.
///
/// Bound once at subsystem startup; the OS-assigned port is advertised to
/// peers through the share-mode registry. Sends never block; receives
/// multiplex the socket with the optional kernel notification source.
pub struct BreakChannel {
    socket: UdpSocket,
    port: u16,
}

impl BreakChannel {
    /// Binds a loopback socket on an OS-assigned ephemeral port.
    pub fn bind() -> Result<Self, TransportError> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
        socket.set_nonblocking(true)?;
        let port = socket.local_addr()?.port();
        log::debug!("break channel bound to 127.0.0.1:{port}");
        Ok(Self { socket, port })
    }

    /// The port peers should send break messages to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Fire-and-forget send of one break message to a peer's port.
    pub fn send(&self, port: u16, msg: &BreakMessage) -> Result<(), TransportError> {
        let bytes = msg.to_bytes()?;
        self.socket
            .send_to(&bytes, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))?;
        Ok(())
    }

    /// Whether a message is pending on either source, without waiting.
    pub fn ready(&self, mut kernel: Option<&mut (dyn KernelOplocks + 'static)>) -> bool {
        if let Some(k) = kernel.as_deref_mut() {
            if k.message_waiting() {
                return true;
            }
        }
        let kernel_fd = kernel.as_deref().and_then(|k| k.notification_fd());
        self.wait_readable(kernel_fd, Duration::ZERO).is_ok()
    }

    /// Returns one fully-framed message from either source.
    ///
    /// The kernel source is serviced first whenever both are ready, so
    /// kernel-driven breaks cannot be starved by a flood of peer
    /// datagrams. Datagrams from non-loopback addresses and datagrams of
    /// the wrong length are logged, dropped, and do not end the wait.
    pub fn receive(
        &self,
        mut kernel: Option<&mut (dyn KernelOplocks + 'static)>,
        timeout: Duration,
    ) -> Result<LocalMessage, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(k) = kernel.as_deref_mut() {
                if k.message_waiting() {
                    return Ok(LocalMessage::Kernel(k.receive_message()?));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let kernel_fd = kernel.as_deref().and_then(|k| k.notification_fd());
            match self.wait_readable(kernel_fd, remaining)? {
                // Let the top of the loop pull the event through the source.
                Ready::Kernel => continue,
                Ready::Socket => {}
            }

            let mut buf = [0u8; 512];
            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                // Another readiness consumer (or a spurious wakeup) beat us.
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => {
                    log::error!("receive: error in recvfrom ({e})");
                    return Err(e.into());
                }
            };

            let from = match from {
                SocketAddr::V4(v4) if v4.ip().is_loopback() => v4,
                other => {
                    log::error!("receive: invalid 'from' address {other}, should be loopback");
                    continue;
                }
            };

            match BreakMessage::parse(&buf[..len]) {
                Ok(msg) => return Ok(LocalMessage::Peer(FramedMessage::new(from.port(), msg))),
                Err(e) => {
                    log::error!("receive: dropping datagram from port {} ({e})", from.port());
                    continue;
                }
            }
        }
    }

    fn wait_readable(
        &self,
        kernel_fd: Option<BorrowedFd<'_>>,
        timeout: Duration,
    ) -> Result<Ready, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let millis = u16::try_from(remaining.as_millis()).unwrap_or(u16::MAX);

            let socket_fd = self.socket.as_fd();
            let mut fds = Vec::with_capacity(2);
            fds.push(PollFd::new(socket_fd, PollFlags::POLLIN));
            if let Some(fd) = kernel_fd {
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
            }

            match poll(&mut fds, PollTimeout::from(millis)) {
                // Often a kernel oplock interrupt; re-check the sources.
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(std::io::Error::from(e).into()),
                Ok(0) => return Err(TransportError::Timeout),
                Ok(_) => {
                    let readable = |fd: &PollFd<'_>| {
                        fd.revents().is_some_and(|r| r.contains(PollFlags::POLLIN))
                    };
                    // Kernel first, so peer floods cannot starve it.
                    if fds.len() == 2 && readable(&fds[1]) {
                        return Ok(Ready::Kernel);
                    }
                    if readable(&fds[0]) {
                        return Ok(Ready::Socket);
                    }
                    continue;
                }
            }
        }
    }
}
