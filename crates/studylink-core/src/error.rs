//! Error types for StudyLink sessions

use thiserror::Error;

use crate::types::{CallState, RoomCode};

/// Errors raised by a [`SignalingTransport`](crate::transport::SignalingTransport)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Another endpoint already holds this code at the discovery service
    #[error("Room code {0} is already registered")]
    RegistrationConflict(RoomCode),

    /// The remote code is not registered with the discovery service
    #[error("Peer {0} is not reachable")]
    PeerUnreachable(RoomCode),

    /// The remote endpoint turned the data link down (it already has a partner)
    #[error("Peer {0} refused the link")]
    LinkRefused(RoomCode),

    /// Offer/answer exchange for a media session did not complete
    #[error("Media negotiation failed: {0}")]
    MediaNegotiation(String),

    /// The local endpoint has been closed
    #[error("Endpoint is closed")]
    Closed,

    /// Network-level failure (bind, connect, stream I/O)
    #[error("Network error: {0}")]
    Network(String),

    /// Encoding or decoding of a transport-level message failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TransportError {
    /// Message suitable for showing to the user.
    ///
    /// Transport errors never cross the controller boundary as-is; only this
    /// text does.
    pub fn user_message(&self) -> String {
        match self {
            TransportError::RegistrationConflict(_) => {
                "This session code is already in use. Please try again.".to_string()
            }
            TransportError::PeerUnreachable(code) => {
                format!("No active session found for code {}. Check the code.", code)
            }
            TransportError::LinkRefused(_) => {
                "That session already has a study partner.".to_string()
            }
            TransportError::MediaNegotiation(reason) => format!("Call could not be set up: {}", reason),
            TransportError::Closed => "The connection endpoint is closed.".to_string(),
            TransportError::Network(_) | TransportError::Serialization(_) => {
                "Connection to your study partner failed.".to_string()
            }
        }
    }
}

/// Errors from the local media collaborators (capture devices, sinks)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Local audio capture could not be obtained (e.g. permission denied)
    #[error("Microphone unavailable: {0}")]
    Acquisition(String),

    /// The sink does not expose output routing
    #[error("Output routing is not supported by this audio sink")]
    RoutingUnsupported,

    /// The sink exposes routing but switching failed
    #[error("Output routing failed: {0}")]
    Routing(String),
}

/// Data channel protocol errors (always swallowed by the receiver)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame was not a `{ kind, payload }` JSON object
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Frame carried a `kind` this build does not understand
    #[error("Unrecognized message kind: {0}")]
    UnknownKind(String),

    /// The `kind` was recognized but the payload did not match its shape
    #[error("Malformed payload for {kind}: {reason}")]
    BadPayload {
        /// Message kind the payload belonged to
        kind: String,
        /// Decoder error text
        reason: String,
    },
}

/// Errors from the in-memory session registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The code is already held by a live endpoint
    #[error("Room code {0} is already registered")]
    CodeTaken(RoomCode),

    /// No live endpoint holds this code
    #[error("Room {0} not found")]
    RoomNotFound(RoomCode),
}

impl From<RegistryError> for TransportError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::CodeTaken(code) => TransportError::RegistrationConflict(code),
            RegistryError::RoomNotFound(code) => TransportError::PeerUnreachable(code),
        }
    }
}

/// Main error type returned by the [`SessionController`](crate::SessionController)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Join code does not have the expected shape
    #[error("Invalid room code: {0}")]
    InvalidCode(String),

    /// Operation needs an open data channel
    #[error("Not connected to a study partner")]
    NotConnected,

    /// The transport endpoint was closed by `destroy_session`
    #[error("Session endpoint is closed")]
    EndpointClosed,

    /// Connecting, registering or joining failed (user-facing text)
    #[error("{0}")]
    Connection(String),

    /// Capture or media negotiation failed (user-facing text)
    #[error("{0}")]
    Media(String),

    /// A call operation is not valid in the current call state
    #[error("Cannot {action} while call is {state}")]
    InvalidCallTransition {
        /// Call state at the time of the request
        state: CallState,
        /// The requested operation
        action: &'static str,
    },
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::MediaNegotiation(_) => SessionError::Media(err.user_message()),
            TransportError::Closed => SessionError::EndpointClosed,
            other => SessionError::Connection(other.user_message()),
        }
    }
}

impl From<MediaError> for SessionError {
    fn from(err: MediaError) -> Self {
        SessionError::Media(err.to_string())
    }
}

/// Result type alias using SessionError
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SessionError::InvalidCallTransition {
            state: CallState::Connected,
            action: "start a call",
        };
        assert_eq!(format!("{}", err), "Cannot start a call while call is connected");
    }

    #[test]
    fn test_transport_error_hides_raw_details() {
        let err: SessionError = TransportError::Network("quic: handshake timeout".into()).into();
        match err {
            SessionError::Connection(msg) => assert!(!msg.contains("quic")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_refused_link_is_a_connection_error() {
        let code = RoomCode::parse("123456").unwrap();
        let err: SessionError = TransportError::LinkRefused(code).into();
        assert_eq!(
            err,
            SessionError::Connection("That session already has a study partner.".to_string())
        );
    }

    #[test]
    fn test_registry_error_maps_to_transport() {
        let code = RoomCode::parse("123456").unwrap();
        let err: TransportError = RegistryError::CodeTaken(code.clone()).into();
        assert_eq!(err, TransportError::RegistrationConflict(code));
    }
}
