//! StudyLink Core Library
//!
//! Two-party study sessions: a shared room code, chat, synced AI tool state
//! and a voice call between two peers.
//!
//! ## Overview
//!
//! One side hosts a session under its six-digit room code, the other joins
//! with that code. Once the data link is open both sides exchange chat lines
//! and full snapshots of whichever study tool is in the foreground, and
//! either side can start a voice call.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     SessionController                        │
//! │   Session view │ ToolStates │ CallMachine │ notices          │
//! └──────┬──────────────────────────────┬────────────────────────┘
//!        │ SyncMessage (JSON frames)    │ LocalAudio / RemoteAudio
//! ┌──────▼──────────────────────────────▼────────────────────────┐
//! │                   SignalingTransport                         │
//! │   MemoryTransport (in-process) │ IrohTransport (QUIC)        │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ register / lookup
//!                      ┌─────────▼─────────┐
//!                      │ SessionRegistry   │  MemoryHub or
//!                      │ (code -> endpoint)│  RendezvousServer
//!                      └───────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use studylink_core::{
//!     open_with_retry, CountingSink, MemoryHub, SessionConfig, SessionController,
//!     SilenceCapture,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = MemoryHub::new();
//!     let (transport, events) = open_with_retry(5, |code| std::future::ready(hub.open(code))).await?;
//!
//!     let mut host = SessionController::new(
//!         Arc::new(transport),
//!         events,
//!         Arc::new(SilenceCapture::new()),
//!         Arc::new(CountingSink::new()),
//!         SessionConfig::default(),
//!     );
//!     let code = host.create_session()?;
//!     println!("Share this code: {}", code);
//!
//!     while host.next_event().await {}
//!     Ok(())
//! }
//! ```

pub mod call;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod tools;
pub mod transport;
pub mod types;

// Re-exports
pub use call::SpeakerRouting;
pub use config::SessionConfig;
pub use controller::SessionController;
pub use error::{
    MediaError, ProtocolError, RegistryError, SessionError, SessionResult, TransportError,
};
pub use events::{CallEndReason, SessionNotice};
pub use media::{
    AudioCapture, AudioFrame, AudioSink, AudioTrack, CountingSink, LocalAudio, OutputRoute,
    RemoteAudio, SilenceCapture,
};
pub use protocol::SyncMessage;
pub use registry::SessionRegistry;
pub use tools::{
    AnalyzerResponse, AnalyzerSnapshot, AttachedFile, ChatTurn, Flashcard, NarratedResponse,
    PodcastEpisode, ToolKind, ToolSnapshot, ToolStates, TurnPart, TurnRole,
};
pub use transport::iroh::IrohTransport;
pub use transport::memory::{MemoryHub, MemoryTransport};
pub use transport::rendezvous::{RendezvousClient, RendezvousServer, RendezvousTicket};
pub use transport::{
    open_with_retry, DataChannel, IncomingCall, IncomingLink, MediaSession, SignalingTransport,
    TransportEvent, TransportEvents,
};
pub use types::{CallState, ChatEntry, ChatSender, RoomCode, Session};
