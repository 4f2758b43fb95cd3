//! Core types for StudyLink sessions

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Number of digits in a room code
pub const ROOM_CODE_LEN: usize = 6;

const ROOM_CODE_MIN: u32 = 100_000;
const ROOM_CODE_MAX: u32 = 999_999;

/// Short numeric endpoint identity, also used as the shared session code.
///
/// Always six ASCII digits in `100000..=999999`. Generated fresh on every
/// process start and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    /// Draw a uniformly random code from the valid range
    pub fn generate() -> Self {
        let n: u32 = rand::rng().random_range(ROOM_CODE_MIN..=ROOM_CODE_MAX);
        Self(n.to_string())
    }

    /// Validate user input as a room code.
    ///
    /// Leading/trailing whitespace is ignored. Anything other than exactly
    /// six digits in range is rejected with [`SessionError::InvalidCode`].
    pub fn parse(input: &str) -> Result<Self, SessionError> {
        let trimmed = input.trim();
        if trimmed.len() != ROOM_CODE_LEN || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SessionError::InvalidCode(format!(
                "expected {} digits, got {:?}",
                ROOM_CODE_LEN, trimmed
            )));
        }
        // six digits always fit in u32
        let n: u32 = trimmed
            .parse()
            .map_err(|_| SessionError::InvalidCode(trimmed.to_string()))?;
        if !(ROOM_CODE_MIN..=ROOM_CODE_MAX).contains(&n) {
            return Err(SessionError::InvalidCode(format!(
                "{} is outside {}-{}",
                trimmed, ROOM_CODE_MIN, ROOM_CODE_MAX
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Borrow the code as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomCode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomCode {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}

/// Who wrote a chat entry, from the local point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatSender {
    /// Written locally
    Me,
    /// Received from the study partner
    Peer,
}

/// One line of the session chat log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub sender: ChatSender,
    pub text: String,
    /// Unix timestamp in milliseconds (send time for `Me`, receive time for `Peer`)
    pub timestamp: i64,
}

impl ChatEntry {
    /// Create an entry stamped with the current time
    pub fn now(sender: ChatSender, text: impl Into<String>) -> Self {
        Self {
            sender,
            text: text.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Voice call lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// No call
    #[default]
    Idle,
    /// Outgoing call, waiting for the peer to answer
    Calling,
    /// Peer is calling, waiting for a local answer
    Incoming,
    /// Audio is flowing both ways
    Connected,
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, CallState::Idle)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallState::Idle => write!(f, "idle"),
            CallState::Calling => write!(f, "calling"),
            CallState::Incoming => write!(f, "incoming"),
            CallState::Connected => write!(f, "connected"),
        }
    }
}

/// Read-only view of the two-party study session.
///
/// Owned and mutated exclusively by the
/// [`SessionController`](crate::SessionController).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Shared session code: the local code when hosting, the remote code when joining
    pub room_id: Option<RoomCode>,
    /// Whether this instance created the session
    pub is_host: bool,
    /// True exactly while a data channel to the peer is open
    pub connected: bool,
    /// Identity of the connected peer (call target)
    pub peer: Option<RoomCode>,
    /// Chat log, append-only for the lifetime of the session
    pub messages: Vec<ChatEntry>,
    pub call_state: CallState,
    /// Local microphone track disabled
    pub muted: bool,
    /// Speaker output preference
    pub speaker_on: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            room_id: None,
            is_host: false,
            connected: false,
            peer: None,
            messages: Vec::new(),
            call_state: CallState::Idle,
            muted: false,
            speaker_on: true,
        }
    }
}

impl Session {
    /// The last chat entry came from the peer (used for unread badges)
    pub fn has_unread_from_peer(&self) -> bool {
        self.messages
            .last()
            .map(|m| m.sender == ChatSender::Peer)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_codes_are_valid() {
        for _ in 0..1000 {
            let code = RoomCode::generate();
            assert_eq!(code.as_str().len(), ROOM_CODE_LEN);
            assert!(RoomCode::parse(code.as_str()).is_ok());
        }
    }

    #[test]
    fn test_parse_rejects_bad_codes() {
        for bad in ["", "12", "12345", "1234567", "abcdef", "012345", "12 456", "-12345"] {
            assert!(
                matches!(RoomCode::parse(bad), Err(SessionError::InvalidCode(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let code = RoomCode::parse("  654321\n").unwrap();
        assert_eq!(code.as_str(), "654321");
    }

    #[test]
    fn test_room_code_serde_validates() {
        let code: RoomCode = serde_json::from_str("\"100000\"").unwrap();
        assert_eq!(code.to_string(), "100000");
        assert!(serde_json::from_str::<RoomCode>("\"99999\"").is_err());
    }

    #[test]
    fn test_chat_sender_wire_names() {
        assert_eq!(serde_json::to_string(&ChatSender::Me).unwrap(), "\"me\"");
        assert_eq!(serde_json::to_string(&ChatSender::Peer).unwrap(), "\"peer\"");
    }

    #[test]
    fn test_session_default() {
        let session = Session::default();
        assert!(session.room_id.is_none());
        assert!(!session.connected);
        assert_eq!(session.call_state, CallState::Idle);
        assert!(session.speaker_on);
        assert!(!session.has_unread_from_peer());
    }
}
