//! QUIC transport over iroh endpoints
//!
//! Each StudyLink process binds one iroh endpoint and registers its room
//! code at a rendezvous service. Links are QUIC connections on two ALPNs:
//!
//! ```text
//! DATA_ALPN   one bi-stream, length-delimited frames
//!             ─► "123456"              handshake: initiator code
//!             ◄─ [1] / [0]             host decision
//!             ◄─► {"kind":..}          protocol frames both ways
//!
//! MEDIA_ALPN  one bi-stream, length-delimited frames
//!             ─► "123456"              handshake: caller code
//!             ◄─ [1] / [0]             callee decision
//!             ◄─► audio frames         until either side closes
//! ```
//!
//! Closing a link closes its connection; the other end observes the close
//! as the end of its stream.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::protocol::{ProtocolHandler, Router};
use iroh::{Endpoint, EndpointAddr, SecretKey};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::rendezvous::{RendezvousClient, RendezvousTicket};
use super::{
    open_with_retry, DataChannel, IncomingCall, IncomingLink, LinkSet, MediaSession,
    SignalingTransport, TransportEvent, TransportEvents,
};
use crate::error::TransportError;
use crate::media::{AudioFrame, LocalAudio, CAPTURE_BUFFER};
use crate::types::RoomCode;

/// ALPN protocol identifier for data channels
pub const DATA_ALPN: &[u8] = b"/studylink/data/1";

/// ALPN protocol identifier for media sessions
pub const MEDIA_ALPN: &[u8] = b"/studylink/media/1";

/// Tool snapshots carry base64 audio and files
const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Decision frames for both link kinds
const ACCEPTED: u8 = 1;
const REJECTED: u8 = 0;

/// How long a refusing side waits for the initiator to read the refusal
const REJECT_LINGER: Duration = Duration::from_secs(2);

type FrameWriter = FramedWrite<SendStream, LengthDelimitedCodec>;
type FrameReader = FramedRead<RecvStream, LengthDelimitedCodec>;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

fn framed(send: SendStream, recv: RecvStream) -> (FrameWriter, FrameReader) {
    (
        FramedWrite::new(send, codec()),
        FramedRead::new(recv, codec()),
    )
}

fn close_connection(connection: &Connection, reason: &'static [u8]) {
    connection.close(0u32.into(), reason);
}

/// Read the initiator's room code from the first frame
async fn read_handshake(reader: &mut FrameReader) -> Result<RoomCode, TransportError> {
    let frame = match reader.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => {
            return Err(TransportError::Network(format!("Failed to read handshake: {}", e)))
        }
        None => return Err(TransportError::Network("Stream ended before handshake".to_string())),
    };
    let text = std::str::from_utf8(&frame)
        .map_err(|e| TransportError::Serialization(format!("Handshake is not UTF-8: {}", e)))?;
    RoomCode::parse(text).map_err(|e| TransportError::Serialization(e.to_string()))
}

/// Retry a network operation with exponential backoff.
///
/// Only [`TransportError::Network`] failures are retried. Delays are 100ms
/// then 200ms.
async fn retry_with_backoff<F, Fut, T>(operation_name: &str, mut operation: F) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, TransportError>>,
{
    const MAX_ATTEMPTS: u32 = 3;
    const BASE_DELAY_MS: u64 = 100;

    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e @ TransportError::Network(_)) if attempt < MAX_ATTEMPTS => {
                let delay_ms = BASE_DELAY_MS * (1 << (attempt - 1));
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = MAX_ATTEMPTS,
                    delay_ms,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(operation = operation_name, attempt, error = %e, "Operation failed");
                return Err(e);
            }
        }
    }
}

/// Queues of a [`DataChannel`] whose wire end is bridged later
struct DataQueues {
    outbound: mpsc::UnboundedReceiver<Bytes>,
    inbound: mpsc::UnboundedSender<Bytes>,
    closed: CancellationToken,
}

fn data_queues(peer: RoomCode, links: &LinkSet) -> (DataChannel, DataQueues) {
    let closed = CancellationToken::new();
    links.track(closed.clone());

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let channel = DataChannel::new(peer, outbound_tx, inbound_rx, closed.clone());
    let queues = DataQueues {
        outbound: outbound_rx,
        inbound: inbound_tx,
        closed,
    };
    (channel, queues)
}

/// Bridge a framed bi-stream onto the queues of a [`DataChannel`]
fn bridge_data(
    peer: RoomCode,
    connection: Connection,
    mut writer: FrameWriter,
    mut reader: FrameReader,
    queues: DataQueues,
) {
    let DataQueues {
        outbound: mut outbound_rx,
        inbound: inbound_tx,
        closed,
    } = queues;

    let writer_closed = closed.clone();
    let writer_peer = peer.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = writer_closed.cancelled() => break,
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = writer.send(frame).await {
                        debug!(peer = %writer_peer, error = %e, "Data link write failed");
                        break;
                    }
                }
            }
        }
        writer_closed.cancel();
        let _ = writer.get_mut().finish();
        close_connection(&connection, b"data link closed");
        debug!(peer = %writer_peer, "Data link closed");
    });

    let reader_closed = closed.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = reader_closed.cancelled() => break,
                frame = reader.next() => match frame {
                    Some(Ok(frame)) => {
                        if inbound_tx.send(frame.freeze()).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "Data link read failed");
                        break;
                    }
                    None => break,
                },
            }
        }
        reader_closed.cancel();
    });
}

/// Move audio frames between local queues and an accepted media stream
fn bridge_media(
    peer: RoomCode,
    connection: Connection,
    mut writer: FrameWriter,
    mut reader: FrameReader,
    mut outbound: mpsc::Receiver<AudioFrame>,
    inbound: mpsc::Sender<AudioFrame>,
    closed: CancellationToken,
) {
    let writer_closed = closed.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = writer_closed.cancelled() => break,
                frame = outbound.recv() => {
                    let Some(AudioFrame(frame)) = frame else { break };
                    if writer.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        }
        writer_closed.cancel();
        let _ = writer.get_mut().finish();
        close_connection(&connection, b"call ended");
        debug!(%peer, "Media link closed");
    });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = closed.cancelled() => break,
                frame = reader.next() => {
                    let Some(Ok(frame)) = frame else { break };
                    // Late audio is useless; drop rather than stall the stream
                    if let Err(mpsc::error::TrySendError::Closed(_)) =
                        inbound.try_send(AudioFrame(frame.freeze()))
                    {
                        break;
                    }
                }
            }
        }
        closed.cancel();
    });
}

/// Protocol handler for inbound data links
#[derive(Clone)]
struct DataHandler {
    events: mpsc::UnboundedSender<TransportEvent>,
    links: LinkSet,
}

impl fmt::Debug for DataHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataHandler")
            .field("events", &"<Sender<TransportEvent>>")
            .finish()
    }
}

impl DataHandler {
    async fn handle_connection(
        connection: Connection,
        events: mpsc::UnboundedSender<TransportEvent>,
        links: LinkSet,
    ) -> Result<(), TransportError> {
        let remote_id = connection.remote_id();
        debug!(?remote_id, "Handling data link connection");

        let (send, recv) = connection
            .accept_bi()
            .await
            .map_err(|e| TransportError::Network(format!("Failed to accept bi stream: {}", e)))?;
        let (mut writer, mut reader) = framed(send, recv);
        let peer = read_handshake(&mut reader).await?;

        let (channel, queues) = data_queues(peer.clone(), &links);
        let closed = queues.closed.clone();
        let (decision_tx, decision_rx) = oneshot::channel();
        if events
            .send(TransportEvent::IncomingData(IncomingLink::new(channel, decision_tx)))
            .is_err()
        {
            closed.cancel();
            close_connection(&connection, b"endpoint closed");
            return Err(TransportError::Closed);
        }

        let accepted = tokio::select! {
            biased;
            decision = decision_rx => decision.unwrap_or(false),
            _ = connection.closed() => {
                debug!(%peer, "Initiator gave up before the link was accepted");
                closed.cancel();
                return Ok(());
            }
        };

        if !accepted {
            closed.cancel();
            let _ = writer.send(Bytes::from_static(&[REJECTED])).await;
            let _ = writer.get_mut().finish();
            let _ = tokio::time::timeout(REJECT_LINGER, connection.closed()).await;
            info!(%peer, "Refused data link");
            return Ok(());
        }

        if let Err(e) = writer.send(Bytes::from_static(&[ACCEPTED])).await {
            closed.cancel();
            return Err(TransportError::Network(format!("Failed to send link decision: {}", e)));
        }
        bridge_data(peer.clone(), connection, writer, reader, queues);
        info!(%peer, "Accepted data link");

        // Hold the accept future for the lifetime of the link
        closed.cancelled().await;
        Ok(())
    }
}

impl ProtocolHandler for DataHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), iroh::protocol::AcceptError>> + Send {
        let events = self.events.clone();
        let links = self.links.clone();

        async move {
            debug!(peer = %conn.remote_id(), "Router accepting data connection");

            if let Err(e) = Self::handle_connection(conn, events, links).await {
                error!(error = ?e, "Failed to handle data connection");
                return Err(iroh::protocol::AcceptError::from_err(e));
            }

            Ok(())
        }
    }
}

/// Protocol handler for inbound calls
#[derive(Clone)]
struct MediaHandler {
    events: mpsc::UnboundedSender<TransportEvent>,
    links: LinkSet,
}

impl fmt::Debug for MediaHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHandler")
            .field("events", &"<Sender<TransportEvent>>")
            .finish()
    }
}

impl MediaHandler {
    async fn handle_connection(
        connection: Connection,
        events: mpsc::UnboundedSender<TransportEvent>,
        links: LinkSet,
    ) -> Result<(), TransportError> {
        let remote_id = connection.remote_id();
        debug!(?remote_id, "Handling media connection");

        let (send, recv) = connection
            .accept_bi()
            .await
            .map_err(|e| TransportError::Network(format!("Failed to accept bi stream: {}", e)))?;
        let (mut writer, mut reader) = framed(send, recv);
        let peer = read_handshake(&mut reader).await?;

        let closed = CancellationToken::new();
        links.track(closed.clone());

        let (decision_tx, decision_rx) = oneshot::channel();
        let (to_callee, from_caller) = mpsc::channel(CAPTURE_BUFFER);
        let (to_caller, from_callee) = mpsc::channel(CAPTURE_BUFFER);
        let call = IncomingCall::new(peer.clone(), decision_tx, to_caller, from_caller, closed.clone());

        if events.send(TransportEvent::IncomingMedia(call)).is_err() {
            close_connection(&connection, b"endpoint closed");
            return Err(TransportError::Closed);
        }
        info!(%peer, "Incoming call");

        // The caller sends nothing until answered, so any read outcome
        // here means the offer was withdrawn
        let accepted = tokio::select! {
            biased;
            decision = decision_rx => decision.unwrap_or(false),
            _ = reader.next() => {
                debug!(%peer, "Caller withdrew the call");
                closed.cancel();
                return Ok(());
            }
            _ = closed.cancelled() => false,
        };

        if !accepted {
            let _ = writer.send(Bytes::from_static(&[REJECTED])).await;
            let _ = writer.get_mut().finish();
            let _ = tokio::time::timeout(REJECT_LINGER, connection.closed()).await;
            return Ok(());
        }

        writer
            .send(Bytes::from_static(&[ACCEPTED]))
            .await
            .map_err(|e| TransportError::Network(format!("Failed to send answer: {}", e)))?;

        bridge_media(peer, connection, writer, reader, from_callee, to_callee, closed.clone());
        closed.cancelled().await;
        Ok(())
    }
}

impl ProtocolHandler for MediaHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), iroh::protocol::AcceptError>> + Send {
        let events = self.events.clone();
        let links = self.links.clone();

        async move {
            debug!(peer = %conn.remote_id(), "Router accepting media connection");

            if let Err(e) = Self::handle_connection(conn, events, links).await {
                error!(error = ?e, "Failed to handle media connection");
                return Err(iroh::protocol::AcceptError::from_err(e));
            }

            Ok(())
        }
    }
}

/// Transport backed by an iroh endpoint and a rendezvous service
pub struct IrohTransport {
    code: RoomCode,
    endpoint: Endpoint,
    router: Router,
    rendezvous: RendezvousClient,
    links: LinkSet,
    open: AtomicBool,
}

impl fmt::Debug for IrohTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrohTransport")
            .field("code", &self.code)
            .field("endpoint_id", &self.endpoint.id())
            .field("open", &self.is_open())
            .finish()
    }
}

impl IrohTransport {
    /// Bind an endpoint and register it under `code`.
    ///
    /// Fails with [`TransportError::RegistrationConflict`] if the rendezvous
    /// service already has a live endpoint under that code.
    pub async fn bind(
        ticket: &RendezvousTicket,
        code: RoomCode,
    ) -> Result<(Self, TransportEvents), TransportError> {
        let secret_key = SecretKey::generate(&mut rand::rng());
        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![DATA_ALPN.to_vec(), MEDIA_ALPN.to_vec()])
            .bind()
            .await
            .map_err(|e| TransportError::Network(format!("Failed to bind endpoint: {}", e)))?;

        let endpoint_id = endpoint.id();
        info!(%endpoint_id, "Endpoint bound");

        let registered = async {
            let client = RendezvousClient::connect(&endpoint, ticket).await?;
            client.register(&code, &endpoint.addr()).await?;
            Ok::<_, TransportError>(client)
        }
        .await;
        let rendezvous = match registered {
            Ok(client) => client,
            Err(e) => {
                endpoint.close().await;
                return Err(e);
            }
        };

        let (events_tx, events) = TransportEvents::channel();
        let links = LinkSet::default();
        let router = Router::builder(endpoint.clone())
            .accept(
                DATA_ALPN,
                DataHandler {
                    events: events_tx.clone(),
                    links: links.clone(),
                },
            )
            .accept(
                MEDIA_ALPN,
                MediaHandler {
                    events: events_tx,
                    links: links.clone(),
                },
            )
            .spawn();

        info!(%code, %endpoint_id, "Registered at rendezvous");
        let transport = Self {
            code,
            endpoint,
            router,
            rendezvous,
            links,
            open: AtomicBool::new(true),
        };
        Ok((transport, events))
    }

    /// Bind under a fresh random code, retrying on collisions
    pub async fn open(
        ticket: &RendezvousTicket,
        attempts: u32,
    ) -> Result<(Self, TransportEvents), TransportError> {
        open_with_retry(attempts, |code| Self::bind(ticket, code)).await
    }

    /// This endpoint's dialable address
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    /// Look up `remote` and open a bi-stream on `alpn`, sending our code
    async fn dial(
        &self,
        remote: &RoomCode,
        alpn: &'static [u8],
    ) -> Result<(Connection, FrameWriter, FrameReader), TransportError> {
        let rendezvous = &self.rendezvous;
        let addr = retry_with_backoff("rendezvous_lookup", move || rendezvous.lookup(remote)).await?;

        let endpoint = &self.endpoint;
        let connection = retry_with_backoff("connect", move || {
            let addr = addr.clone();
            async move {
                endpoint
                    .connect(addr, alpn)
                    .await
                    .map_err(|e| TransportError::Network(format!("Failed to connect: {}", e)))
            }
        })
        .await?;

        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Network(format!("Failed to open stream: {}", e)))?;
        let (mut writer, reader) = framed(send, recv);
        writer
            .send(Bytes::copy_from_slice(self.code.as_str().as_bytes()))
            .await
            .map_err(|e| TransportError::Network(format!("Failed to send handshake: {}", e)))?;

        Ok((connection, writer, reader))
    }
}

#[async_trait]
impl SignalingTransport for IrohTransport {
    fn local_code(&self) -> &RoomCode {
        &self.code
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn connect_data(&self, remote: &RoomCode) -> Result<DataChannel, TransportError> {
        self.ensure_open()?;
        let (connection, writer, mut reader) = self.dial(remote, DATA_ALPN).await?;

        match reader.next().await {
            Some(Ok(frame)) if frame.as_ref() == [ACCEPTED] => {}
            Some(Ok(frame)) if frame.as_ref() == [REJECTED] => {
                close_connection(&connection, b"refused");
                info!(%remote, "Data link refused");
                return Err(TransportError::LinkRefused(remote.clone()));
            }
            _ => {
                close_connection(&connection, b"no decision");
                return Err(TransportError::Network(
                    "Data link closed before it was accepted".to_string(),
                ));
            }
        }

        let (channel, queues) = data_queues(remote.clone(), &self.links);
        let closed = queues.closed.clone();
        bridge_data(remote.clone(), connection, writer, reader, queues);
        info!(%remote, "Opened data link");

        // Present in the host's room until the link goes away
        if let Err(e) = self.rendezvous.join(remote, &self.code).await {
            warn!(%remote, error = %e, "Failed to record room membership");
        }
        let rendezvous = self.rendezvous.clone();
        let room = remote.clone();
        let joiner = self.code.clone();
        tokio::spawn(async move {
            closed.cancelled().await;
            if let Err(e) = rendezvous.leave(&room, &joiner).await {
                debug!(%room, error = %e, "Failed to record leaving the room");
            }
        });

        Ok(channel)
    }

    async fn connect_media(
        &self,
        remote: &RoomCode,
        local: LocalAudio,
    ) -> Result<MediaSession, TransportError> {
        self.ensure_open()?;
        let (connection, writer, mut reader) = self
            .dial(remote, MEDIA_ALPN)
            .await
            .map_err(|e| TransportError::MediaNegotiation(e.user_message()))?;

        let closed = CancellationToken::new();
        self.links.track(closed.clone());

        let decision = tokio::select! {
            biased;
            _ = closed.cancelled() => None,
            frame = reader.next() => frame,
        };
        match decision {
            Some(Ok(frame)) if frame.as_ref() == [ACCEPTED] => {}
            Some(Ok(frame)) if frame.as_ref() == [REJECTED] => {
                close_connection(&connection, b"declined");
                return Err(TransportError::MediaNegotiation("call was declined".to_string()));
            }
            _ => {
                close_connection(&connection, b"no answer");
                return Err(TransportError::MediaNegotiation(
                    "peer went away before answering".to_string(),
                ));
            }
        }

        info!(%remote, "Call answered");
        let (to_callee, from_caller) = mpsc::channel(CAPTURE_BUFFER);
        let (to_caller, from_callee) = mpsc::channel(CAPTURE_BUFFER);
        bridge_media(
            remote.clone(),
            connection,
            writer,
            reader,
            from_caller,
            to_caller,
            closed.clone(),
        );
        Ok(MediaSession::establish(
            remote.clone(),
            local,
            to_callee,
            from_callee,
            closed,
        ))
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(code = %self.code, "Closing iroh transport");
        self.links.close_all();
        self.rendezvous.close();
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
    }
}
