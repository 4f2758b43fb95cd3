//! Iroh Transport Integration Tests
//!
//! These tests run real QUIC endpoints against a local rendezvous service.
//!
//! ## What These Tests Verify
//!
//! - Endpoints register their room codes and a duplicate code conflicts
//! - A guest joins a host by code and chat flows both ways
//! - Foreground tool snapshots cross the wire intact
//! - A call connects, carries audio and hangs up on both sides
//! - A busy host refuses a third endpoint and a call right after joining connects
//! - Leaving the session is seen by the peer and frees the code on close
//! - The rendezvous service tracks who sits in which room

use std::sync::Arc;
use std::time::Duration;

use studylink_core::{
    CallState, CountingSink, Flashcard, IrohTransport, RendezvousServer, RendezvousTicket,
    RoomCode, SessionConfig, SessionController, SessionError, SessionResult, SignalingTransport,
    SilenceCapture, ToolKind, ToolSnapshot, TransportError,
};
use tokio::time::{timeout, Instant};

const TIMEOUT: Duration = Duration::from_secs(20);

// ============================================================================
// Test Utilities
// ============================================================================

struct Node {
    controller: SessionController,
    sink: Arc<CountingSink>,
}

impl Node {
    async fn open(ticket: &RendezvousTicket) -> Result<Self, TransportError> {
        let (transport, events) = IrohTransport::open(ticket, 5).await?;
        let sink = Arc::new(CountingSink::new());
        let controller = SessionController::new(
            Arc::new(transport),
            events,
            Arc::new(SilenceCapture::new()),
            sink.clone(),
            SessionConfig::default().with_connect_timeout(TIMEOUT),
        );
        Ok(Self { controller, sink })
    }

    async fn pump_until<F>(&mut self, mut done: F)
    where
        F: FnMut(&SessionController) -> bool,
    {
        let deadline = Instant::now() + TIMEOUT;
        while !done(&self.controller) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let alive = timeout(remaining, self.controller.next_event())
                .await
                .expect("timed out pumping events");
            assert!(alive, "controller ran out of event sources");
        }
    }

    /// Join `host`'s room while the host decides on the link
    async fn join(&mut self, host: &mut Node) -> SessionResult<()> {
        let code = host.controller.local_code().expect("host endpoint open");
        let join = self.controller.join_session(code.as_str());
        tokio::pin!(join);
        loop {
            tokio::select! {
                biased;
                result = &mut join => return result,
                alive = host.controller.next_event() => {
                    if !alive {
                        return join.await;
                    }
                }
            }
        }
    }
}

async fn connected_nodes(server: &RendezvousServer) -> (Node, Node) {
    let ticket = server.ticket();
    let mut host = Node::open(&ticket).await.expect("host endpoint");
    let mut guest = Node::open(&ticket).await.expect("guest endpoint");

    host.controller.create_session().unwrap();
    guest.join(&mut host).await.expect("join over iroh");
    assert!(host.controller.session().connected);

    (host, guest)
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_duplicate_code_conflicts() {
    let server = RendezvousServer::spawn().await.unwrap();
    let ticket = server.ticket();
    let code = RoomCode::parse("314159").unwrap();

    let (first, _events) = IrohTransport::bind(&ticket, code.clone()).await.unwrap();
    assert!(server.registry().is_active(&code));

    let err = IrohTransport::bind(&ticket, code.clone()).await.unwrap_err();
    assert_eq!(err, TransportError::RegistrationConflict(code.clone()));

    first.close().await;
    // The rendezvous service drops the code once the connection goes away
    timeout(TIMEOUT, async {
        while server.registry().is_active(&code) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("code released");

    server.shutdown().await;
}

#[tokio::test]
async fn test_join_unknown_code_fails() {
    let server = RendezvousServer::spawn().await.unwrap();
    let mut guest = Node::open(&server.ticket()).await.unwrap();

    let local = guest.controller.local_code().unwrap();
    let target = if local.as_str() == "271828" { "271829" } else { "271828" };
    assert!(guest.controller.join_session(target).await.is_err());
    assert!(!guest.controller.session().connected);

    guest.controller.destroy_session().await;
    server.shutdown().await;
}

// ============================================================================
// Session Traffic
// ============================================================================

#[tokio::test]
async fn test_chat_and_tool_sync_over_iroh() {
    let server = RendezvousServer::spawn().await.unwrap();
    let (mut host, mut guest) = connected_nodes(&server).await;

    guest.controller.send_chat("hello from the guest").unwrap();
    host.pump_until(|c| c.session().messages.len() == 1).await;
    assert_eq!(host.controller.session().messages[0].text, "hello from the guest");

    host.controller.send_chat("hello back").unwrap();
    guest.pump_until(|c| c.session().messages.len() == 2).await;

    let cards = ToolSnapshot::Flashcards(vec![Flashcard {
        term: "Entropy".to_string(),
        definition: "A measure of disorder".to_string(),
    }]);
    host.controller.set_foreground_tool(Some(ToolKind::Flashcards));
    assert!(host.controller.publish_tool_state(cards.clone()));
    guest
        .pump_until(|c| c.tool_state(ToolKind::Flashcards) == Some(&cards))
        .await;

    host.controller.destroy_session().await;
    guest.pump_until(|c| !c.session().connected).await;
    guest.controller.destroy_session().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_call_over_iroh() {
    let server = RendezvousServer::spawn().await.unwrap();
    let (mut host, mut guest) = connected_nodes(&server).await;

    host.controller.initiate_call().await.unwrap();
    guest
        .pump_until(|c| c.session().call_state == CallState::Incoming)
        .await;
    guest.controller.accept_call().await.unwrap();
    host.pump_until(|c| c.session().call_state == CallState::Connected)
        .await;

    timeout(TIMEOUT, async {
        while host.sink.frames() == 0 || guest.sink.frames() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("audio flows both ways");

    guest.controller.end_call().unwrap();
    host.pump_until(|c| c.session().call_state == CallState::Idle)
        .await;
    assert!(host.controller.session().connected);

    host.controller.destroy_session().await;
    guest.controller.destroy_session().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_call_right_after_join_over_iroh() {
    let server = RendezvousServer::spawn().await.unwrap();
    let (mut host, mut guest) = connected_nodes(&server).await;

    guest.controller.initiate_call().await.unwrap();
    host.pump_until(|c| c.session().call_state == CallState::Incoming)
        .await;
    host.controller.accept_call().await.unwrap();
    guest
        .pump_until(|c| c.session().call_state == CallState::Connected)
        .await;
    assert_eq!(host.controller.session().call_state, CallState::Connected);

    host.controller.destroy_session().await;
    guest.controller.destroy_session().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_rejected_call_over_iroh() {
    let server = RendezvousServer::spawn().await.unwrap();
    let (mut host, mut guest) = connected_nodes(&server).await;

    host.controller.initiate_call().await.unwrap();
    guest
        .pump_until(|c| c.session().call_state == CallState::Incoming)
        .await;
    guest.controller.reject_call().unwrap();
    host.pump_until(|c| c.session().call_state == CallState::Idle)
        .await;

    host.controller.destroy_session().await;
    guest.controller.destroy_session().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_leave_is_seen_by_peer() {
    let server = RendezvousServer::spawn().await.unwrap();
    let (mut host, mut guest) = connected_nodes(&server).await;

    guest.controller.leave_session();
    host.pump_until(|c| !c.session().connected).await;
    assert_eq!(host.controller.session().peer, None);

    host.controller.destroy_session().await;
    guest.controller.destroy_session().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_busy_host_refuses_third_endpoint() {
    let server = RendezvousServer::spawn().await.unwrap();
    let (mut host, guest) = connected_nodes(&server).await;
    let mut intruder = Node::open(&server.ticket()).await.unwrap();

    let err = intruder.join(&mut host).await.unwrap_err();
    assert!(matches!(err, SessionError::Connection(_)), "{err}");
    assert!(!intruder.controller.session().connected);
    assert_eq!(intruder.controller.session().room_id, None);
    assert!(host.controller.session().connected);
    assert_eq!(host.controller.session().peer, guest.controller.local_code());

    intruder.controller.destroy_session().await;
    host.controller.destroy_session().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_rendezvous_tracks_room_membership() {
    let server = RendezvousServer::spawn().await.unwrap();
    let (mut host, mut guest) = connected_nodes(&server).await;
    let host_code = host.controller.local_code().unwrap();
    let guest_code = guest.controller.local_code().unwrap();

    assert_eq!(
        server.registry().participants(&host_code),
        vec![host_code.clone(), guest_code]
    );

    guest.controller.leave_session();
    host.pump_until(|c| !c.session().connected).await;
    timeout(TIMEOUT, async {
        while server.registry().participants(&host_code).len() > 1 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("guest left the room");
    assert_eq!(server.registry().participants(&host_code), vec![host_code.clone()]);

    host.controller.destroy_session().await;
    guest.controller.destroy_session().await;
    server.shutdown().await;
}
