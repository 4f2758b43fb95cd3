//! User-facing notices emitted by the session controller
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SessionNotice: things the UI should tell the user              │
//! │  ├── Connected / PeerLeft / Disconnected                        │
//! │  ├── ConnectionFailed: dismissible error banner                 │
//! │  ├── UnreadChat: peer wrote while the chat view was hidden      │
//! │  └── IncomingCall / CallConnected / CallEnded / CallFailed      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Tool snapshots are not notices; they go out on per-tool channels from
//! [`SessionController::subscribe_tool`](crate::SessionController::subscribe_tool).

use std::fmt;

use crate::types::RoomCode;

/// Why a call returned to idle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEndReason {
    /// Hung up locally
    HungUp,
    /// The peer hung up
    RemoteHungUp,
    /// Declined locally
    Rejected,
    /// The caller gave up before we answered
    CallerCancelled,
    /// The data link to the peer went away
    Disconnected,
}

impl fmt::Display for CallEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallEndReason::HungUp => write!(f, "call ended"),
            CallEndReason::RemoteHungUp => write!(f, "peer hung up"),
            CallEndReason::Rejected => write!(f, "call declined"),
            CallEndReason::CallerCancelled => write!(f, "caller hung up"),
            CallEndReason::Disconnected => write!(f, "connection lost"),
        }
    }
}

/// Notification for the user interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// A data link to the peer opened
    Connected { peer: RoomCode },
    /// The peer went away without us asking
    PeerLeft,
    /// We left the session
    Disconnected,
    /// Joining or connecting failed
    ConnectionFailed { message: String },
    /// Chat arrived while the chat view was not visible
    UnreadChat { text: String },
    /// The peer is calling
    IncomingCall { peer: RoomCode },
    /// Audio is flowing
    CallConnected,
    CallEnded { reason: CallEndReason },
    /// Capture or negotiation failed
    CallFailed { message: String },
}

impl SessionNotice {
    /// Whether this notice reports a failure the user may dismiss
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            SessionNotice::ConnectionFailed { .. } | SessionNotice::CallFailed { .. }
        )
    }
}

impl fmt::Display for SessionNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionNotice::Connected { peer } => write!(f, "Connected to {}", peer),
            SessionNotice::PeerLeft => write!(f, "Your study partner left"),
            SessionNotice::Disconnected => write!(f, "Disconnected"),
            SessionNotice::ConnectionFailed { message } => write!(f, "Connection failed: {}", message),
            SessionNotice::UnreadChat { text } => write!(f, "New message: {}", text),
            SessionNotice::IncomingCall { peer } => write!(f, "Incoming call from {}", peer),
            SessionNotice::CallConnected => write!(f, "Call connected"),
            SessionNotice::CallEnded { reason } => write!(f, "Call over: {}", reason),
            SessionNotice::CallFailed { message } => write!(f, "Call failed: {}", message),
        }
    }
}
