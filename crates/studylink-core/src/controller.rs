//! Session controller
//!
//! The one surface the rest of the application talks to. It owns the
//! transport endpoint, the [`Session`] view, the peer link, the synced tool
//! state and the call state machine.
//!
//! ## Event flow
//!
//! ```text
//! ┌─────────────────────┐   TransportEvent    ┌───────────────────────┐
//! │ SignalingTransport  │ ──────────────────► │                       │
//! └─────────────────────┘                     │                       │
//! ┌─────────────────────┐   LinkEvent         │   SessionController   │
//! │ link reader task    │ ──────────────────► │     next_event()      │
//! └─────────────────────┘   (generation)      │   process_pending()   │
//! ┌─────────────────────┐   CallSignal        │                       │
//! │ negotiation/watcher │ ──────────────────► │                       │
//! └─────────────────────┘                     └───────────┬───────────┘
//!                                                         │
//!                               SessionNotice, tool snapshots (broadcast)
//! ```
//!
//! Background tasks never touch session state; they only queue events. All
//! mutation happens in `&mut self` methods, so it is serialized without
//! locks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::call::{CallMachine, CallSignal, SpeakerRouting};
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::events::SessionNotice;
use crate::media::{AudioCapture, AudioSink};
use crate::protocol::SyncMessage;
use crate::tools::{ToolKind, ToolSnapshot, ToolStates};
use crate::transport::{
    DataChannel, DataSender, IncomingCall, IncomingLink, SignalingTransport, TransportEvent,
    TransportEvents,
};
use crate::types::{ChatEntry, ChatSender, RoomCode, Session};

/// Report from a link reader task
#[derive(Debug)]
enum LinkEvent {
    Frame { generation: u64, frame: Bytes },
    Closed { generation: u64 },
}

/// The open data link to the peer
struct Link {
    generation: u64,
    peer: RoomCode,
    sender: DataSender,
    reader: JoinHandle<()>,
}

impl Link {
    fn close(self) {
        self.sender.close();
        self.reader.abort();
    }
}

/// One event taken from any of the controller's sources
enum Pending {
    Transport(TransportEvent),
    TransportGone,
    Link(LinkEvent),
    Call(CallSignal),
}

/// Orchestrates a two-party study session over a [`SignalingTransport`]
pub struct SessionController {
    config: SessionConfig,
    transport: Option<Arc<dyn SignalingTransport>>,
    transport_events: Option<TransportEvents>,
    session: Session,
    link: Option<Link>,
    link_generation: u64,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    call: CallMachine,
    tools: ToolStates,
    foreground: Option<ToolKind>,
    chat_visible: bool,
    tool_channels: HashMap<ToolKind, broadcast::Sender<ToolSnapshot>>,
    notices: broadcast::Sender<SessionNotice>,
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("local_code", &self.local_code())
            .field("session", &self.session)
            .field("foreground", &self.foreground)
            .field("chat_visible", &self.chat_visible)
            .finish()
    }
}

impl SessionController {
    /// Create a controller around an opened transport endpoint.
    ///
    /// `capture` and `sink` are the platform's microphone and speaker.
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        events: TransportEvents,
        capture: Arc<dyn AudioCapture>,
        sink: Arc<dyn AudioSink>,
        config: SessionConfig,
    ) -> Self {
        // broadcast::channel panics on zero capacity
        let (notices, _) = broadcast::channel(config.notice_channel_capacity.max(1));
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let tool_capacity = config.tool_channel_capacity.max(1);
        let tool_channels = ToolKind::ALL
            .into_iter()
            .map(|kind| (kind, broadcast::channel(tool_capacity).0))
            .collect();
        let call = CallMachine::new(capture, sink, config.call_timeout, notices.clone());

        Self {
            config,
            transport: Some(transport),
            transport_events: Some(events),
            session: Session::default(),
            link: None,
            link_generation: 0,
            link_tx,
            link_rx,
            call,
            tools: ToolStates::new(),
            foreground: None,
            chat_visible: true,
            tool_channels,
            notices,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Read side
    // ═══════════════════════════════════════════════════════════════════════

    /// Current session view
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// This endpoint's code, `None` once destroyed
    pub fn local_code(&self) -> Option<RoomCode> {
        self.transport.as_ref().map(|t| t.local_code().clone())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Latest snapshot for `kind`, local or remote
    pub fn tool_state(&self, kind: ToolKind) -> Option<&ToolSnapshot> {
        self.tools.get(kind)
    }

    pub fn foreground_tool(&self) -> Option<ToolKind> {
        self.foreground
    }

    /// Snapshots received from the peer for `kind`
    pub fn subscribe_tool(&self, kind: ToolKind) -> broadcast::Receiver<ToolSnapshot> {
        match self.tool_channels.get(&kind) {
            Some(tx) => tx.subscribe(),
            // every kind is created in new()
            None => broadcast::channel(1).1,
        }
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    fn emit(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }

    fn open_transport(&self) -> SessionResult<Arc<dyn SignalingTransport>> {
        match &self.transport {
            Some(transport) if transport.is_open() => Ok(transport.clone()),
            _ => Err(SessionError::EndpointClosed),
        }
    }

    /// Report a connection failure to the user and hand it back
    fn connection_failed(&self, err: SessionError) -> SessionError {
        self.emit(SessionNotice::ConnectionFailed {
            message: err.to_string(),
        });
        err
    }

    fn sync_call_view(&mut self) {
        self.session.call_state = self.call.state();
        self.session.muted = self.call.muted();
        self.session.speaker_on = self.call.speaker_on();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Session lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Host a session under this endpoint's code
    pub fn create_session(&mut self) -> SessionResult<RoomCode> {
        let transport = self.open_transport()?;
        self.drop_link();

        let code = transport.local_code().clone();
        self.session.room_id = Some(code.clone());
        self.session.is_host = true;
        self.session.connected = false;
        self.session.peer = None;
        self.sync_call_view();

        info!(%code, "Session created");
        Ok(code)
    }

    /// Join the session hosted under `code`.
    ///
    /// Resolves once the host has accepted the link. On any failure the
    /// session is left exactly as it was.
    pub async fn join_session(&mut self, code: &str) -> SessionResult<()> {
        let code = RoomCode::parse(code).map_err(|e| self.connection_failed(e))?;
        let transport = self.open_transport().map_err(|e| self.connection_failed(e))?;

        if &code == transport.local_code() {
            return Err(self.connection_failed(SessionError::Connection(
                "That is your own session code.".to_string(),
            )));
        }

        info!(%code, "Joining session");
        let channel = match tokio::time::timeout(
            self.config.connect_timeout,
            transport.connect_data(&code),
        )
        .await
        {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                warn!(%code, error = %e, "Failed to join session");
                return Err(self.connection_failed(e.into()));
            }
            Err(_) => {
                warn!(%code, "Timed out joining session");
                return Err(self.connection_failed(SessionError::Connection(
                    "Your study partner did not respond in time.".to_string(),
                )));
            }
        };

        self.drop_link();
        self.session.room_id = Some(code);
        self.session.is_host = false;
        self.install_link(channel);
        Ok(())
    }

    /// Leave the session but keep the endpoint open
    pub fn leave_session(&mut self) {
        self.teardown();
        info!("Left session");
        self.emit(SessionNotice::Disconnected);
    }

    /// Tear everything down and close the endpoint
    pub async fn destroy_session(&mut self) {
        self.teardown();
        self.transport_events = None;
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        info!("Session destroyed");
    }

    fn teardown(&mut self) {
        self.call.end().ok();
        self.drop_link();
        self.tools.clear();
        self.session = Session::default();
        self.sync_call_view();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Data link
    // ═══════════════════════════════════════════════════════════════════════

    fn install_link(&mut self, channel: DataChannel) {
        self.link_generation += 1;
        let generation = self.link_generation;
        let (peer, sender, mut receiver) = channel.split();

        let events = self.link_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = receiver.recv().await {
                if events.send(LinkEvent::Frame { generation, frame }).is_err() {
                    return;
                }
            }
            let _ = events.send(LinkEvent::Closed { generation });
        });

        info!(%peer, generation, "Peer link open");
        self.link = Some(Link {
            generation,
            peer: peer.clone(),
            sender,
            reader,
        });
        self.session.connected = true;
        self.session.peer = Some(peer.clone());
        self.emit(SessionNotice::Connected { peer });

        if self.config.sync_foreground_on_connect {
            self.send_foreground_snapshot();
        }
    }

    /// Close the link locally. The call cannot outlive it.
    fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            debug!(peer = %link.peer, generation = link.generation, "Closing peer link");
            link.close();
        }
        self.call.force_idle();
        self.session.connected = false;
        self.session.peer = None;
        self.sync_call_view();
    }

    fn is_current(&self, generation: u64) -> bool {
        self.link.as_ref().map(|l| l.generation) == Some(generation)
    }

    /// The link, if it has not closed underneath us
    fn open_link(&self) -> Option<&Link> {
        self.link.as_ref().filter(|l| l.sender.is_open())
    }

    fn send_message(&self, message: &SyncMessage) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        match message.encode() {
            Ok(frame) => link.sender.send(frame),
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "Failed to encode message");
                false
            }
        }
    }

    fn send_foreground_snapshot(&self) -> bool {
        let Some(kind) = self.foreground else {
            return false;
        };
        match self.tools.get(kind) {
            Some(snapshot) => {
                debug!(tool = %kind, "Sending foreground snapshot");
                self.send_message(&SyncMessage::Tool(snapshot.clone()))
            }
            None => false,
        }
    }

    fn on_incoming_data(&mut self, incoming: IncomingLink) {
        if self.open_link().is_some() {
            warn!(peer = %incoming.peer(), "Already connected, refusing second link");
            incoming.refuse();
            return;
        }
        let channel = match incoming.accept() {
            Ok(channel) => channel,
            Err(e) => {
                debug!(error = %e, "Joiner left before the link was accepted");
                return;
            }
        };
        if self.link.is_some() {
            // Closed before its reader reported it
            self.drop_link();
            self.emit(SessionNotice::PeerLeft);
        }
        // Whoever dials our code joins our room
        self.session.room_id = self.local_code();
        self.session.is_host = true;
        self.install_link(channel);
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Frame { generation, frame } => {
                if self.is_current(generation) {
                    self.apply_frame(&frame);
                }
            }
            LinkEvent::Closed { generation } => {
                if !self.is_current(generation) {
                    return;
                }
                info!(generation, "Peer link closed unexpectedly");
                self.drop_link();
                self.emit(SessionNotice::PeerLeft);
            }
        }
    }

    fn apply_frame(&mut self, frame: &[u8]) {
        match SyncMessage::decode(frame) {
            Ok(SyncMessage::Chat { text }) => {
                debug!(len = text.len(), "Chat received");
                self.session
                    .messages
                    .push(ChatEntry::now(ChatSender::Peer, text.clone()));
                if !self.chat_visible {
                    self.emit(SessionNotice::UnreadChat { text });
                }
            }
            Ok(SyncMessage::Tool(snapshot)) => {
                let kind = snapshot.kind();
                debug!(tool = %kind, "Tool snapshot received");
                self.tools.replace(snapshot.clone());
                if let Some(tx) = self.tool_channels.get(&kind) {
                    let _ = tx.send(snapshot);
                }
            }
            Err(e) => debug!(error = %e, "Ignoring frame"),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Chat and tools
    // ═══════════════════════════════════════════════════════════════════════

    /// Append a chat line and send it to the peer.
    ///
    /// Blank text is ignored.
    pub fn send_chat(&mut self, text: &str) -> SessionResult<()> {
        if self.open_link().is_none() {
            return Err(SessionError::NotConnected);
        }
        if text.trim().is_empty() {
            return Ok(());
        }
        self.session
            .messages
            .push(ChatEntry::now(ChatSender::Me, text));
        self.send_message(&SyncMessage::chat(text));
        Ok(())
    }

    /// Store a local snapshot; send it if its tool is in the foreground.
    ///
    /// Returns whether it went to the peer.
    pub fn publish_tool_state(&mut self, snapshot: ToolSnapshot) -> bool {
        let kind = snapshot.kind();
        let send = self.foreground == Some(kind) && self.open_link().is_some();
        let sent = send && self.send_message(&SyncMessage::Tool(snapshot.clone()));
        self.tools.replace(snapshot);
        debug!(tool = %kind, sent, "Published tool state");
        sent
    }

    /// Switch the foreground tool, re-sending its latest snapshot.
    ///
    /// Returns whether a snapshot went to the peer.
    pub fn set_foreground_tool(&mut self, tool: Option<ToolKind>) -> bool {
        if self.foreground == tool {
            return false;
        }
        self.foreground = tool;
        self.send_foreground_snapshot()
    }

    /// Whether the chat view is on screen (controls unread notices)
    pub fn set_chat_visible(&mut self, visible: bool) {
        self.chat_visible = visible;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Calls
    // ═══════════════════════════════════════════════════════════════════════

    /// Call the connected peer
    pub async fn initiate_call(&mut self) -> SessionResult<()> {
        let Some(peer) = self.open_link().map(|l| l.peer.clone()) else {
            return Err(SessionError::NotConnected);
        };
        let transport = self.open_transport()?;
        let result = self.call.initiate(&transport, &peer).await;
        self.sync_call_view();
        result
    }

    pub async fn accept_call(&mut self) -> SessionResult<()> {
        let result = self.call.accept().await;
        self.sync_call_view();
        result
    }

    pub fn reject_call(&mut self) -> SessionResult<()> {
        let result = self.call.reject();
        self.sync_call_view();
        result
    }

    pub fn end_call(&mut self) -> SessionResult<()> {
        let result = self.call.end();
        self.sync_call_view();
        result
    }

    /// Returns the new muted state
    pub fn toggle_mute(&mut self) -> SessionResult<bool> {
        let result = self.call.toggle_mute();
        self.sync_call_view();
        result
    }

    pub fn toggle_speaker(&mut self) -> SpeakerRouting {
        let routing = self.call.toggle_speaker();
        self.sync_call_view();
        routing
    }

    fn on_incoming_call(&mut self, call: IncomingCall) {
        let from_peer = self.open_link().map(|l| &l.peer) == Some(call.peer());
        if !from_peer {
            debug!(peer = %call.peer(), "Rejecting call from outside the session");
            call.reject();
            return;
        }
        self.call.on_incoming(call);
        self.sync_call_view();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Event pump
    // ═══════════════════════════════════════════════════════════════════════

    /// Wait for one transport, link or call event and apply it.
    ///
    /// Returns `false` without waiting once nothing can arrive any more
    /// (endpoint closed, no link, no call).
    pub async fn next_event(&mut self) -> bool {
        if self.transport_events.is_none() && self.link.is_none() && self.call.state().is_idle() {
            return false;
        }

        let pending = {
            let transport_events = &mut self.transport_events;
            let transport_next = async {
                match transport_events {
                    Some(events) => events.recv().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                event = transport_next => match event {
                    Some(event) => Pending::Transport(event),
                    None => Pending::TransportGone,
                },
                Some(event) = self.link_rx.recv() => Pending::Link(event),
                Some(signal) = self.call.next_signal() => Pending::Call(signal),
            }
        };

        self.apply(pending);
        true
    }

    /// Apply every event already queued without waiting.
    ///
    /// Returns how many were applied.
    pub fn process_pending(&mut self) -> usize {
        let mut applied = 0;
        loop {
            let pending = if let Some(event) =
                self.transport_events.as_mut().and_then(|e| e.try_recv())
            {
                Pending::Transport(event)
            } else if let Ok(event) = self.link_rx.try_recv() {
                Pending::Link(event)
            } else if let Some(signal) = self.call.try_next_signal() {
                Pending::Call(signal)
            } else {
                return applied;
            };
            self.apply(pending);
            applied += 1;
        }
    }

    fn apply(&mut self, pending: Pending) {
        match pending {
            Pending::Transport(TransportEvent::IncomingData(incoming)) => {
                self.on_incoming_data(incoming)
            }
            Pending::Transport(TransportEvent::IncomingMedia(call)) => self.on_incoming_call(call),
            Pending::TransportGone => {
                debug!("Transport event stream ended");
                self.transport_events = None;
            }
            Pending::Link(event) => self.on_link_event(event),
            Pending::Call(signal) => self.call.handle_signal(signal),
        }
        self.sync_call_view();
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
    }
}
