//! Events reported to the session owner.

use std::fmt;

use super::session_id::SessionId;
use crate::core::ErrorKind;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Never started, or fully reset.
    #[default]
    Unknown,
    /// Transports are starting.
    Started,
    /// Connected, waiting for the server to assign a session id.
    WaitForSessionId,
    /// A session id is assigned.
    Connected,
    /// Graceful stop waiting for unsent data.
    WaitForStop,
    /// Every transport is stopped.
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Started => "started",
            Self::WaitForSessionId => "wait-for-session-id",
            Self::Connected => "connected",
            Self::WaitForStop => "wait-for-stop",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Session-level events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The server assigned a session id.
    Opened(SessionId),
    /// Every started transport is connected.
    Connected,
    /// Every transport stopped.
    Stopped,
    /// The session id was dropped by the server or replaced.
    Closed,
    /// The server asked the session to move.
    RedirectStarted,
    /// The session moved to the new server.
    RedirectSucceeded,
    /// The move failed; all transports are stopped.
    RedirectFailed,
}

/// Per-transport events.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportEvent {
    /// The transport connected.
    Started,
    /// The transport was stopped locally.
    Stopped,
    /// Connecting failed.
    ConnectionFailed(ErrorKind),
    /// Connect plus handshake did not finish in time.
    ConnectionTimedOut,
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// Attempt number, starting at 1.
        attempt: u32,
        /// Delay before the attempt, in seconds.
        delay: f32,
    },
    /// An established transport was lost.
    Disconnected(ErrorKind),
}
