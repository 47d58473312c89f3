//! Subsystem configuration.

use std::time::Duration;

/// How long a client gets to acknowledge a break before the server forces
/// the oplock off.
pub const OPLOCK_BREAK_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra slack on top of [`OPLOCK_BREAK_TIMEOUT`] when awaiting a peer
/// process's reply; the peer may legitimately spend the full client
/// window on its own break first.
pub const OPLOCK_BREAK_TIMEOUT_FUDGEFACTOR: Duration = Duration::from_secs(2);

/// Upper bound on the pacing delay before a locally-provoked break.
pub const OPLOCK_BREAK_WAIT_CAP: Duration = Duration::from_millis(1000);

/// Process-wide oplock configuration.
#[derive(Debug, Clone)]
pub struct OplockConfig {
    /// Minimum quiet time after the client's last packet before a
    /// locally-provoked break notification goes out, capped at
    /// [`OPLOCK_BREAK_WAIT_CAP`]. Works around clients that mishandle a
    /// reply and a break racing on the wire.
    pub oplock_break_wait: Duration,

    /// Whether to install the kernel notification source handed to
    /// [`OplockSubsystem::init`](crate::OplockSubsystem::init).
    pub kernel_oplocks: bool,

    /// Client acknowledgement window. Defaults to
    /// [`OPLOCK_BREAK_TIMEOUT`].
    pub break_timeout: Duration,

    /// Extra wait for a peer's reply on top of `break_timeout`. Defaults
    /// to [`OPLOCK_BREAK_TIMEOUT_FUDGEFACTOR`].
    pub break_reply_fudge: Duration,
}

impl Default for OplockConfig {
    fn default() -> Self {
        Self {
            oplock_break_wait: Duration::ZERO,
            kernel_oplocks: false,
            break_timeout: OPLOCK_BREAK_TIMEOUT,
            break_reply_fudge: OPLOCK_BREAK_TIMEOUT_FUDGEFACTOR,
        }
    }
}

/// Per-share oplock policy, fixed at open time.
#[derive(Debug, Clone, Copy)]
pub struct SharePolicy {
    /// Whether level-II oplocks may be granted, or broken down to, on
    /// this share.
    pub level2_oplocks: bool,
}

impl Default for SharePolicy {
    fn default() -> Self {
        Self {
            level2_oplocks: true,
        }
    }
}
