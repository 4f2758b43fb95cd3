//! Synchronized tool state
//!
//! Each AI tool has one piece of shared state. It is mirrored, not merged:
//! every update is a full snapshot and the receiver replaces its copy
//! wholesale. Whoever wrote a tool's state last is authoritative for it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The AI features whose state is shared with the study partner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Assistant,
    Explainer,
    Analyzer,
    Flashcards,
    Podcast,
}

impl ToolKind {
    /// Every tool kind, in display order
    pub const ALL: [ToolKind; 5] = [
        ToolKind::Assistant,
        ToolKind::Explainer,
        ToolKind::Analyzer,
        ToolKind::Flashcards,
        ToolKind::Podcast,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Assistant => "assistant",
            ToolKind::Explainer => "explainer",
            ToolKind::Analyzer => "analyzer",
            ToolKind::Flashcards => "flashcards",
            ToolKind::Podcast => "podcast",
        }
    }

    /// Wire `kind` used when this tool's snapshot is sent
    pub fn sync_kind(&self) -> &'static str {
        match self {
            ToolKind::Assistant => "sync-assistant",
            ToolKind::Explainer => "sync-explainer",
            ToolKind::Analyzer => "sync-analyzer",
            ToolKind::Flashcards => "sync-flashcards",
            ToolKind::Podcast => "sync-podcast",
        }
    }

    /// Inverse of [`ToolKind::sync_kind`]
    pub fn from_sync_kind(kind: &str) -> Option<Self> {
        kind.strip_prefix("sync-").and_then(|name| name.parse().ok())
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown tool: {}", s))
    }
}

/// Text answer with optional narration, shared by the assistant and explainer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarratedResponse {
    pub text: String,
    /// Base64 audio of the narrated answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_gender_menu: Option<bool>,
    /// Grounding sources, opaque to this layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<serde_json::Value>>,
}

/// A file the analyzer is working on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedFile {
    pub base64: String,
    /// MIME type
    #[serde(rename = "type")]
    pub mime_type: String,
    pub name: String,
}

/// Role of an analyzer chat turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnPart {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<serde_json::Value>,
}

/// One turn of the analyzer's conversation about the attached file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub parts: Vec<TurnPart>,
}

impl ChatTurn {
    pub fn text(role: TurnRole, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![TurnPart {
                text: text.into(),
                inline_data: None,
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzerResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
}

/// Everything the analyzer shows: file, conversation and latest answer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerSnapshot {
    pub file: Option<AttachedFile>,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    pub response: Option<AnalyzerResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flashcard {
    pub term: String,
    pub definition: String,
}

/// A generated two-voice podcast episode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodcastEpisode {
    /// Base64 audio
    pub audio: String,
    /// Script the audio was generated from
    pub dialogue: String,
}

/// Full replacement value for one tool's shared state
#[derive(Debug, Clone, PartialEq)]
pub enum ToolSnapshot {
    Assistant(NarratedResponse),
    Explainer(NarratedResponse),
    Analyzer(AnalyzerSnapshot),
    Flashcards(Vec<Flashcard>),
    Podcast(PodcastEpisode),
}

impl ToolSnapshot {
    pub fn kind(&self) -> ToolKind {
        match self {
            ToolSnapshot::Assistant(_) => ToolKind::Assistant,
            ToolSnapshot::Explainer(_) => ToolKind::Explainer,
            ToolSnapshot::Analyzer(_) => ToolKind::Analyzer,
            ToolSnapshot::Flashcards(_) => ToolKind::Flashcards,
            ToolSnapshot::Podcast(_) => ToolKind::Podcast,
        }
    }

    /// Serialize the snapshot as its wire payload
    pub fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            ToolSnapshot::Assistant(v) | ToolSnapshot::Explainer(v) => serde_json::to_value(v),
            ToolSnapshot::Analyzer(v) => serde_json::to_value(v),
            ToolSnapshot::Flashcards(v) => serde_json::to_value(v),
            ToolSnapshot::Podcast(v) => serde_json::to_value(v),
        }
    }

    /// Interpret a wire payload as `kind`'s snapshot
    pub fn from_payload(
        kind: ToolKind,
        payload: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            ToolKind::Assistant => ToolSnapshot::Assistant(serde_json::from_value(payload)?),
            ToolKind::Explainer => ToolSnapshot::Explainer(serde_json::from_value(payload)?),
            ToolKind::Analyzer => ToolSnapshot::Analyzer(serde_json::from_value(payload)?),
            ToolKind::Flashcards => ToolSnapshot::Flashcards(serde_json::from_value(payload)?),
            ToolKind::Podcast => ToolSnapshot::Podcast(serde_json::from_value(payload)?),
        })
    }
}

/// One snapshot slot per tool kind, last writer wins
#[derive(Debug, Clone, Default)]
pub struct ToolStates {
    slots: HashMap<ToolKind, ToolSnapshot>,
}

impl ToolStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the slot for the snapshot's tool, returning what it held
    pub fn replace(&mut self, snapshot: ToolSnapshot) -> Option<ToolSnapshot> {
        self.slots.insert(snapshot.kind(), snapshot)
    }

    pub fn get(&self, kind: ToolKind) -> Option<&ToolSnapshot> {
        self.slots.get(&kind)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
