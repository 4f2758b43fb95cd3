//! Data channel sync protocol
//!
//! Every frame on the data channel is one JSON object:
//!
//! ```text
//! { "kind": "chat",            "payload": { "text": "..." } }
//! { "kind": "sync-<tool>",     "payload": <tool snapshot>   }
//! ```
//!
//! Frames are independent; there are no acks, sequence numbers or replay.
//! Anything that does not decode is reported as a [`ProtocolError`] so the
//! receiver can log and drop it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::tools::{ToolKind, ToolSnapshot};

/// Wire `kind` of a chat message
pub const CHAT_KIND: &str = "chat";

/// Raw envelope as it travels on the wire
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatPayload {
    text: String,
}

/// A decoded data channel message
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    /// Free-text chat line
    Chat { text: String },
    /// Full replacement of one tool's state
    Tool(ToolSnapshot),
}

impl SyncMessage {
    pub fn chat(text: impl Into<String>) -> Self {
        SyncMessage::Chat { text: text.into() }
    }

    /// Wire `kind` for this message
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Chat { .. } => CHAT_KIND,
            SyncMessage::Tool(snapshot) => snapshot.kind().sync_kind(),
        }
    }

    /// Encode as a JSON frame
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let payload = match self {
            SyncMessage::Chat { text } => serde_json::to_value(ChatPayload { text: text.clone() }),
            SyncMessage::Tool(snapshot) => snapshot.to_payload(),
        }
        .map_err(|e| ProtocolError::BadPayload {
            kind: self.kind().to_string(),
            reason: e.to_string(),
        })?;

        let envelope = Envelope {
            kind: self.kind().to_string(),
            payload,
        };
        serde_json::to_vec(&envelope)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Decode a JSON frame
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_slice(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let bad_payload = |e: serde_json::Error| ProtocolError::BadPayload {
            kind: envelope.kind.clone(),
            reason: e.to_string(),
        };

        if envelope.kind == CHAT_KIND {
            let chat: ChatPayload =
                serde_json::from_value(envelope.payload.clone()).map_err(bad_payload)?;
            return Ok(SyncMessage::Chat { text: chat.text });
        }

        match ToolKind::from_sync_kind(&envelope.kind) {
            Some(tool) => ToolSnapshot::from_payload(tool, envelope.payload.clone())
                .map(SyncMessage::Tool)
                .map_err(bad_payload),
            None => Err(ProtocolError::UnknownKind(envelope.kind.clone())),
        }
    }
}
