//! In-process transport
//!
//! Every [`MemoryTransport`] opened on the same [`MemoryHub`] can reach the
//! others by code. The hub plays the discovery service: it owns a
//! [`SessionRegistry`] mapping codes to endpoint ports and tracks which
//! endpoints are in whose room.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::{
    await_acceptance, DataChannel, IncomingLink, LinkSet, MediaSession, PendingOffer,
    SignalingTransport, TransportEvent, TransportEvents,
};
use crate::error::TransportError;
use crate::media::{LocalAudio, CAPTURE_BUFFER};
use crate::registry::SessionRegistry;
use crate::types::RoomCode;

/// How the hub reaches a registered endpoint
#[derive(Debug, Clone)]
pub struct HubPort {
    events: mpsc::UnboundedSender<TransportEvent>,
    links: LinkSet,
}

/// Shared discovery service for in-process endpoints
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    registry: Arc<SessionRegistry<HubPort>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint under `code`.
    ///
    /// Fails with [`TransportError::RegistrationConflict`] while another
    /// open endpoint holds the code.
    pub fn open(&self, code: RoomCode) -> Result<(MemoryTransport, TransportEvents), TransportError> {
        let (events_tx, events) = TransportEvents::channel();
        let port = HubPort {
            events: events_tx,
            links: LinkSet::default(),
        };
        self.registry.register(code.clone(), port.clone())?;
        info!(%code, "Memory endpoint opened");

        let transport = MemoryTransport {
            hub: self.clone(),
            code,
            links: port.links,
            open: AtomicBool::new(true),
        };
        Ok((transport, events))
    }

    /// Whether an open endpoint holds `code`
    pub fn is_registered(&self, code: &RoomCode) -> bool {
        self.registry.is_active(code)
    }

    /// Everyone in `room`, host first
    pub fn participants(&self, room: &RoomCode) -> Vec<RoomCode> {
        self.registry.participants(room)
    }

    fn port(&self, code: &RoomCode) -> Result<HubPort, TransportError> {
        self.registry
            .resolve(code)
            .ok_or_else(|| TransportError::PeerUnreachable(code.clone()))
    }
}

/// Endpoint registered on a [`MemoryHub`]
pub struct MemoryTransport {
    hub: MemoryHub,
    code: RoomCode,
    links: LinkSet,
    open: AtomicBool,
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("code", &self.code)
            .field("open", &self.is_open())
            .finish()
    }
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    fn local_code(&self) -> &RoomCode {
        &self.code
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn connect_data(&self, remote: &RoomCode) -> Result<DataChannel, TransportError> {
        self.ensure_open()?;
        let port = self.hub.port(remote)?;

        let (local_end, remote_end) = DataChannel::pair(self.code.clone(), remote.clone());
        let closed = local_end.closed_token();
        let (decision_tx, decision_rx) = oneshot::channel();
        port.events
            .send(TransportEvent::IncomingData(IncomingLink::new(remote_end, decision_tx)))
            .map_err(|_| TransportError::PeerUnreachable(remote.clone()))?;

        self.links.track(closed.clone());
        port.links.track(closed.clone());
        await_acceptance(remote, decision_rx, &closed).await?;

        // Joined the host's room until the link goes away
        self.hub.registry.join(remote, self.code.clone())?;
        let hub = self.hub.clone();
        let room = remote.clone();
        let participant = self.code.clone();
        tokio::spawn(async move {
            closed.cancelled().await;
            hub.registry.leave(&room, &participant);
        });

        debug!(local = %self.code, %remote, "Opened memory data channel");
        Ok(local_end)
    }

    async fn connect_media(
        &self,
        remote: &RoomCode,
        local: LocalAudio,
    ) -> Result<MediaSession, TransportError> {
        self.ensure_open()?;
        let port = self
            .hub
            .port(remote)
            .map_err(|e| TransportError::MediaNegotiation(e.to_string()))?;

        let (offer, call) = PendingOffer::new(self.code.clone(), CAPTURE_BUFFER);
        let closed = call.cancelled();
        port.events
            .send(TransportEvent::IncomingMedia(call))
            .map_err(|_| TransportError::MediaNegotiation(format!("{} went away", remote)))?;

        self.links.track(closed.clone());
        port.links.track(closed);

        debug!(local = %self.code, %remote, "Offered memory media session");
        offer.negotiate(remote.clone(), local).await
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.hub.registry.unregister(&self.code);
        self.links.close_all();
        info!(code = %self.code, "Memory endpoint closed");
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.hub.registry.unregister(&self.code);
            self.links.close_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn code(s: &str) -> RoomCode {
        RoomCode::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_code_conflicts() {
        let hub = MemoryHub::new();
        let (_first, _events) = hub.open(code("111111")).unwrap();
        let err = hub.open(code("111111")).unwrap_err();
        assert_eq!(err, TransportError::RegistrationConflict(code("111111")));
    }

    #[tokio::test]
    async fn test_connect_unknown_code() {
        let hub = MemoryHub::new();
        let (a, _events) = hub.open(code("111111")).unwrap();
        let err = a.connect_data(&code("999999")).await.unwrap_err();
        assert_eq!(err, TransportError::PeerUnreachable(code("999999")));
    }

    #[tokio::test]
    async fn test_data_channel_and_room_membership() {
        let hub = MemoryHub::new();
        let (host, mut host_events) = hub.open(code("111111")).unwrap();
        let (guest, _guest_events) = hub.open(code("222222")).unwrap();

        let host_code = host.local_code().clone();
        let (outbound, inbound) = tokio::join!(guest.connect_data(&host_code), async {
            let Some(TransportEvent::IncomingData(link)) = host_events.recv().await else {
                panic!("expected incoming data link");
            };
            assert_eq!(link.peer(), &code("222222"));
            link.accept().unwrap()
        });
        let mut outbound = outbound.unwrap();
        let mut inbound = inbound;
        assert_eq!(
            hub.participants(&code("111111")),
            vec![code("111111"), code("222222")]
        );

        outbound.send(Bytes::from_static(b"ping"));
        assert_eq!(inbound.recv().await, Some(Bytes::from_static(b"ping")));
        inbound.send(Bytes::from_static(b"pong"));
        assert_eq!(outbound.recv().await, Some(Bytes::from_static(b"pong")));

        outbound.close();
        assert_eq!(inbound.recv().await, None);
        for _ in 0..50 {
            if hub.participants(&code("111111")).len() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(hub.participants(&code("111111")), vec![code("111111")]);
    }

    #[tokio::test]
    async fn test_refused_link_never_joins_the_room() {
        let hub = MemoryHub::new();
        let (host, mut host_events) = hub.open(code("111111")).unwrap();
        let (guest, _guest_events) = hub.open(code("222222")).unwrap();

        let host_code = host.local_code().clone();
        let (result, ()) = tokio::join!(guest.connect_data(&host_code), async {
            if let Some(TransportEvent::IncomingData(link)) = host_events.recv().await {
                link.refuse();
            }
        });

        assert_eq!(result.unwrap_err(), TransportError::LinkRefused(code("111111")));
        assert_eq!(hub.participants(&code("111111")), vec![code("111111")]);
    }

    #[tokio::test]
    async fn test_close_tears_down_links_and_frees_code() {
        let hub = MemoryHub::new();
        let (host, mut host_events) = hub.open(code("111111")).unwrap();
        let (guest, _guest_events) = hub.open(code("222222")).unwrap();

        let host_code = host.local_code().clone();
        let (outbound, _inbound) = tokio::join!(guest.connect_data(&host_code), async {
            match host_events.recv().await {
                Some(TransportEvent::IncomingData(link)) => link.accept().unwrap(),
                _ => panic!("expected incoming data link"),
            }
        });
        let mut outbound = outbound.unwrap();

        host.close().await;
        host.close().await;
        assert!(!host.is_open());
        assert!(!hub.is_registered(&code("111111")));
        assert_eq!(outbound.recv().await, None);
        assert_eq!(
            host.connect_data(&code("222222")).await.unwrap_err(),
            TransportError::Closed
        );

        let (_reopened, _events) = hub.open(code("111111")).unwrap();
    }
}
