//! Signaling transport
//!
//! A transport gives the local endpoint a [`RoomCode`] identity at some
//! discovery service and opens two kinds of links to other endpoints:
//!
//! ```text
//! ┌─────────────┐   connect_data   ┌─────────────┐
//! │  endpoint A │ ───────────────► │  endpoint B │  reliable, ordered frames
//! │   (123456)  │   connect_media  │   (654321)  │
//! │             │ ───────────────► │             │  offer → answer → audio
//! └─────────────┘                  └─────────────┘
//! ```
//!
//! Inbound links are delivered on the [`TransportEvents`] stream returned
//! when the transport is opened. All channel types in this module are
//! transport-agnostic; implementations bridge them onto their wire.
//!
//! - [`memory`]: in-process hub, used by tests and demos
//! - [`iroh`](self::iroh): QUIC endpoints with a [`rendezvous`] discovery service

pub mod iroh;
pub mod memory;
pub mod rendezvous;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::media::{AudioFrame, LocalAudio, RemoteAudio};
use crate::types::RoomCode;

/// Endpoint at a discovery service.
///
/// Object-safe so the controller can hold any implementation as
/// `Arc<dyn SignalingTransport>`.
#[async_trait]
pub trait SignalingTransport: Send + Sync + fmt::Debug {
    /// Code this endpoint is registered under
    fn local_code(&self) -> &RoomCode;

    /// False once [`SignalingTransport::close`] has run
    fn is_open(&self) -> bool;

    /// Open a reliable, ordered data channel to `remote`.
    ///
    /// Resolves once the remote side accepts the link. Fails with
    /// [`TransportError::PeerUnreachable`] when no endpoint holds the code
    /// and [`TransportError::LinkRefused`] when the remote turns it down.
    async fn connect_data(&self, remote: &RoomCode) -> Result<DataChannel, TransportError>;

    /// Offer a media session to `remote`, sending `local` once answered.
    ///
    /// Resolves when the callee answers. Rejection, hang-up before answer
    /// and transport failures are [`TransportError::MediaNegotiation`].
    /// Dropping the returned future withdraws the offer.
    async fn connect_media(
        &self,
        remote: &RoomCode,
        local: LocalAudio,
    ) -> Result<MediaSession, TransportError>;

    /// Unregister and tear down every channel. Idempotent.
    async fn close(&self);
}

/// Inbound link delivered by a transport
#[derive(Debug)]
pub enum TransportEvent {
    /// A peer opened a data channel to us and waits for acceptance
    IncomingData(IncomingLink),
    /// A peer is calling
    IncomingMedia(IncomingCall),
}

/// Stream of inbound links for one transport endpoint
#[derive(Debug)]
pub struct TransportEvents {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportEvents {
    /// Create the event stream and the sender a transport delivers on
    pub fn channel() -> (mpsc::UnboundedSender<TransportEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Wait for the next inbound link; `None` once the transport is gone
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    /// Next inbound link if one is already queued
    pub fn try_recv(&mut self) -> Option<TransportEvent> {
        self.rx.try_recv().ok()
    }
}

/// Open a transport under a fresh random code, retrying on code collisions.
///
/// `open` is called with a newly generated code for every attempt. Only
/// [`TransportError::RegistrationConflict`] is retried; any other error is
/// returned immediately.
pub async fn open_with_retry<T, F, Fut>(
    attempts: u32,
    mut open: F,
) -> Result<(T, TransportEvents), TransportError>
where
    F: FnMut(RoomCode) -> Fut,
    Fut: Future<Output = Result<(T, TransportEvents), TransportError>>,
{
    let max_attempts = attempts.max(1);

    for attempt in 1..=max_attempts {
        let code = RoomCode::generate();
        match open(code.clone()).await {
            Ok(opened) => return Ok(opened),
            Err(TransportError::RegistrationConflict(taken)) if attempt < max_attempts => {
                warn!(
                    attempt,
                    max_attempts,
                    code = %taken,
                    "Room code already registered, retrying with a fresh code"
                );
            }
            Err(e) => {
                warn!(attempt, error = %e, "Failed to open transport");
                return Err(e);
            }
        }
    }

    // the final attempt always returns from inside the loop
    Err(TransportError::Closed)
}

/// Cloneable sending half of a data channel.
///
/// Sending is fire-and-forget: a frame sent on a closed channel is dropped
/// and reported as `false`.
#[derive(Debug, Clone)]
pub struct DataSender {
    tx: mpsc::UnboundedSender<Bytes>,
    closed: CancellationToken,
}

impl DataSender {
    /// Queue a frame for the peer; `false` if the channel is closed
    pub fn send(&self, frame: Bytes) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.tx.send(frame).is_ok()
    }

    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    /// Close the channel for both ends
    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// Receiving half of a data channel
#[derive(Debug)]
pub struct DataReceiver {
    rx: mpsc::UnboundedReceiver<Bytes>,
    closed: CancellationToken,
}

impl DataReceiver {
    /// Next frame from the peer.
    ///
    /// Returns `None` once either end closed the channel; frames still in
    /// flight at that point are discarded.
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            frame = self.rx.recv() => {
                if frame.is_none() {
                    self.closed.cancel();
                }
                frame
            }
        }
    }
}

/// Reliable, ordered, bidirectional link to one peer
#[derive(Debug)]
pub struct DataChannel {
    peer: RoomCode,
    sender: DataSender,
    receiver: DataReceiver,
}

impl DataChannel {
    /// Assemble a channel from queues bridged by a transport.
    ///
    /// Cancelling `closed` closes the channel; the transport must cancel it
    /// when its wire goes away.
    pub fn new(
        peer: RoomCode,
        outbound: mpsc::UnboundedSender<Bytes>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            peer,
            sender: DataSender {
                tx: outbound,
                closed: closed.clone(),
            },
            receiver: DataReceiver {
                rx: inbound,
                closed,
            },
        }
    }

    /// Two directly connected ends sharing one close token.
    ///
    /// The first end talks to `b`, the second to `a`.
    pub fn pair(a: RoomCode, b: RoomCode) -> (DataChannel, DataChannel) {
        let closed = CancellationToken::new();
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            DataChannel::new(b, a_tx, a_rx, closed.clone()),
            DataChannel::new(a, b_tx, b_rx, closed),
        )
    }

    /// Code of the endpoint on the other end
    pub fn peer(&self) -> &RoomCode {
        &self.peer
    }

    pub fn sender(&self) -> DataSender {
        self.sender.clone()
    }

    pub fn send(&self, frame: Bytes) -> bool {
        self.sender.send(frame)
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    pub fn close(&self) {
        self.sender.close();
    }

    /// Token cancelled when the channel closes from either end
    pub fn closed_token(&self) -> CancellationToken {
        self.sender.closed.clone()
    }

    pub fn split(self) -> (RoomCode, DataSender, DataReceiver) {
        (self.peer, self.sender, self.receiver)
    }
}

/// A data link opened by a peer, waiting for a local decision.
///
/// The initiator's `connect_data` resolves only once the link is accepted.
/// Dropping it undecided refuses the link.
#[derive(Debug)]
pub struct IncomingLink {
    peer: RoomCode,
    channel: Option<DataChannel>,
    decision: Option<oneshot::Sender<bool>>,
}

impl IncomingLink {
    /// Wrap the local end of a link; `decision` goes back to the initiator
    pub fn new(channel: DataChannel, decision: oneshot::Sender<bool>) -> Self {
        Self {
            peer: channel.peer().clone(),
            channel: Some(channel),
            decision: Some(decision),
        }
    }

    /// Code of the initiator
    pub fn peer(&self) -> &RoomCode {
        &self.peer
    }

    /// Accept the link and take its channel.
    ///
    /// Fails if the initiator stopped waiting.
    pub fn accept(mut self) -> Result<DataChannel, TransportError> {
        let (Some(channel), Some(decision)) = (self.channel.take(), self.decision.take()) else {
            return Err(TransportError::Closed);
        };
        if decision.send(true).is_err() || !channel.is_open() {
            channel.close();
            return Err(TransportError::PeerUnreachable(self.peer.clone()));
        }
        debug!(peer = %self.peer, "Accepted data link");
        Ok(channel)
    }

    /// Turn the link down
    pub fn refuse(mut self) {
        self.decline();
    }

    fn decline(&mut self) {
        if let Some(decision) = self.decision.take() {
            let _ = decision.send(false);
            debug!(peer = %self.peer, "Refused data link");
        }
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }
}

impl Drop for IncomingLink {
    fn drop(&mut self) {
        self.decline();
    }
}

/// Wait for the remote side to decide on a link we opened.
///
/// Resolves to [`TransportError::LinkRefused`] if the link is turned down or
/// closes before a decision.
pub(crate) async fn await_acceptance(
    remote: &RoomCode,
    decision: oneshot::Receiver<bool>,
    closed: &CancellationToken,
) -> Result<(), TransportError> {
    let accepted = tokio::select! {
        biased;
        decision = decision => decision.unwrap_or(false),
        _ = closed.cancelled() => false,
    };
    if accepted {
        Ok(())
    } else {
        closed.cancel();
        Err(TransportError::LinkRefused(remote.clone()))
    }
}

/// An established media session.
///
/// Closing (or dropping) the session hangs up for both ends.
#[derive(Debug)]
pub struct MediaSession {
    peer: RoomCode,
    remote: Option<RemoteAudio>,
    closed: CancellationToken,
    pump: JoinHandle<()>,
}

impl MediaSession {
    /// Start forwarding `local` frames to `outbound` and expose `inbound`
    /// as the remote stream.
    ///
    /// The outbound pump runs until the session closes or the local track
    /// stops.
    pub fn establish(
        peer: RoomCode,
        mut local: LocalAudio,
        outbound: mpsc::Sender<AudioFrame>,
        inbound: mpsc::Receiver<AudioFrame>,
        closed: CancellationToken,
    ) -> Self {
        let pump_closed = closed.clone();
        let pump_peer = peer.clone();
        let pump = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = pump_closed.cancelled() => break,
                    frame = local.next_outbound() => frame,
                };
                let Some(frame) = frame else { break };
                if outbound.send(frame).await.is_err() {
                    // remote side is gone
                    pump_closed.cancel();
                    break;
                }
            }
            debug!(peer = %pump_peer, "Outbound audio pump finished");
        });

        Self {
            remote: Some(RemoteAudio {
                peer: peer.clone(),
                frames: inbound,
            }),
            peer,
            closed,
            pump,
        }
    }

    pub fn peer(&self) -> &RoomCode {
        &self.peer
    }

    /// Take the remote stream to hand to an audio sink
    pub fn take_remote(&mut self) -> Option<RemoteAudio> {
        self.remote.take()
    }

    /// Token cancelled when either end hangs up
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Hang up
    pub fn close(&self) {
        self.closed.cancel();
        self.pump.abort();
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// A call offered by a peer, waiting for a local decision.
///
/// Dropping it without answering rejects the call.
#[derive(Debug)]
pub struct IncomingCall {
    peer: RoomCode,
    decision: Option<oneshot::Sender<bool>>,
    outbound: mpsc::Sender<AudioFrame>,
    inbound: Option<mpsc::Receiver<AudioFrame>>,
    closed: CancellationToken,
}

impl IncomingCall {
    /// Assemble an offer from queues bridged by a transport.
    ///
    /// `decision` carries the answer back to the caller; `closed` is shared
    /// with the caller and fires if the offer is withdrawn.
    pub fn new(
        peer: RoomCode,
        decision: oneshot::Sender<bool>,
        outbound: mpsc::Sender<AudioFrame>,
        inbound: mpsc::Receiver<AudioFrame>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            peer,
            decision: Some(decision),
            outbound,
            inbound: Some(inbound),
            closed,
        }
    }

    /// Code of the caller
    pub fn peer(&self) -> &RoomCode {
        &self.peer
    }

    /// Token cancelled if the caller withdraws the offer
    pub fn cancelled(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Accept the call, sending `local` to the caller
    pub fn answer(mut self, local: LocalAudio) -> Result<MediaSession, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::MediaNegotiation(
                "caller hung up before the call was answered".to_string(),
            ));
        }
        let delivered = self
            .decision
            .take()
            .map(|decision| decision.send(true).is_ok())
            .unwrap_or(false);
        let inbound = self.inbound.take();
        let (true, Some(inbound)) = (delivered, inbound) else {
            self.closed.cancel();
            return Err(TransportError::MediaNegotiation(
                "caller is no longer waiting".to_string(),
            ));
        };

        debug!(peer = %self.peer, "Answered incoming call");
        Ok(MediaSession::establish(
            self.peer.clone(),
            local,
            self.outbound.clone(),
            inbound,
            self.closed.clone(),
        ))
    }

    /// Decline the call
    pub fn reject(mut self) {
        self.decline();
    }

    fn decline(&mut self) {
        if let Some(decision) = self.decision.take() {
            let _ = decision.send(false);
            self.closed.cancel();
            debug!(peer = %self.peer, "Rejected incoming call");
        }
    }
}

impl Drop for IncomingCall {
    fn drop(&mut self) {
        self.decline();
    }
}

/// Close tokens of every link an endpoint takes part in
#[derive(Debug, Clone, Default)]
pub(crate) struct LinkSet {
    tokens: Arc<Mutex<Vec<CancellationToken>>>,
}

impl LinkSet {
    pub fn track(&self, token: CancellationToken) {
        let mut tokens = self.tokens.lock();
        tokens.retain(|t| !t.is_cancelled());
        tokens.push(token);
    }

    pub fn close_all(&self) {
        for token in self.tokens.lock().drain(..) {
            token.cancel();
        }
    }
}

/// Caller-side half of a media offer made over in-process queues.
///
/// Used by transports that bridge an [`IncomingCall`] onto their wire: the
/// returned future resolves once the callee decides.
pub(crate) struct PendingOffer {
    decision: oneshot::Receiver<bool>,
    outbound: mpsc::Sender<AudioFrame>,
    inbound: mpsc::Receiver<AudioFrame>,
    closed: CancellationToken,
    withdraw: DropGuard,
}

impl PendingOffer {
    /// Create an offer from `caller` and the call the callee will see
    pub fn new(caller: RoomCode, buffer: usize) -> (Self, IncomingCall) {
        let closed = CancellationToken::new();
        let (decision_tx, decision_rx) = oneshot::channel();
        let (caller_tx, callee_rx) = mpsc::channel(buffer);
        let (callee_tx, caller_rx) = mpsc::channel(buffer);

        let call = IncomingCall::new(caller, decision_tx, callee_tx, callee_rx, closed.clone());
        let offer = Self {
            decision: decision_rx,
            outbound: caller_tx,
            inbound: caller_rx,
            withdraw: closed.clone().drop_guard(),
            closed,
        };
        (offer, call)
    }

    /// Wait for the callee and establish the session on acceptance.
    ///
    /// If this future is dropped before the callee decides, the offer is
    /// withdrawn.
    pub async fn negotiate(
        self,
        callee: RoomCode,
        local: LocalAudio,
    ) -> Result<MediaSession, TransportError> {
        let Self {
            decision,
            outbound,
            inbound,
            closed,
            withdraw,
        } = self;

        let accepted = tokio::select! {
            biased;
            decision = decision => decision.ok(),
            _ = closed.cancelled() => None,
        };

        match accepted {
            Some(true) => {
                withdraw.disarm();
                debug!(peer = %callee, "Call answered");
                Ok(MediaSession::establish(callee, local, outbound, inbound, closed))
            }
            Some(false) => Err(TransportError::MediaNegotiation("call was declined".to_string())),
            None => Err(TransportError::MediaNegotiation(
                "peer went away before answering".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::AudioTrack;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn code(s: &str) -> RoomCode {
        RoomCode::parse(s).unwrap()
    }

    fn local_audio() -> (LocalAudio, mpsc::Sender<AudioFrame>) {
        let (tx, rx) = mpsc::channel(8);
        (LocalAudio::new(AudioTrack::new(), rx), tx)
    }

    #[tokio::test]
    async fn test_data_pair_delivers_in_order() {
        let (mut a, mut b) = DataChannel::pair(code("111111"), code("222222"));
        assert_eq!(a.peer(), &code("222222"));
        assert_eq!(b.peer(), &code("111111"));

        for i in 0..3u8 {
            assert!(a.send(Bytes::from(vec![i])));
        }
        for i in 0..3u8 {
            assert_eq!(b.recv().await, Some(Bytes::from(vec![i])));
        }
        assert!(b.send(Bytes::from_static(b"back")));
        assert_eq!(a.recv().await, Some(Bytes::from_static(b"back")));
    }

    #[tokio::test]
    async fn test_closing_one_end_closes_both() {
        let (a, mut b) = DataChannel::pair(code("111111"), code("222222"));
        a.send(Bytes::from_static(b"in flight"));
        a.close();

        assert!(!b.is_open());
        assert_eq!(b.recv().await, None);
        assert!(!b.send(Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn test_accepted_link_delivers_frames() {
        let (local, remote) = DataChannel::pair(code("111111"), code("222222"));
        let (decision_tx, decision_rx) = oneshot::channel();
        let closed = local.closed_token();
        let incoming = IncomingLink::new(remote, decision_tx);
        assert_eq!(incoming.peer(), &code("111111"));

        let mut accepted = incoming.accept().unwrap();
        await_acceptance(&code("222222"), decision_rx, &closed)
            .await
            .unwrap();

        assert!(local.send(Bytes::from_static(b"hi")));
        assert_eq!(accepted.recv().await, Some(Bytes::from_static(b"hi")));
    }

    #[tokio::test]
    async fn test_dropped_link_is_refused() {
        let (local, remote) = DataChannel::pair(code("111111"), code("222222"));
        let (decision_tx, decision_rx) = oneshot::channel();
        let closed = local.closed_token();

        drop(IncomingLink::new(remote, decision_tx));

        let err = await_acceptance(&code("222222"), decision_rx, &closed)
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::LinkRefused(code("222222")));
        assert!(!local.is_open());
    }

    #[tokio::test]
    async fn test_accept_after_initiator_gave_up() {
        let (local, remote) = DataChannel::pair(code("111111"), code("222222"));
        let (decision_tx, decision_rx) = oneshot::channel();
        let incoming = IncomingLink::new(remote, decision_tx);

        drop(decision_rx);
        drop(local);

        assert!(incoming.accept().is_err());
    }

    #[tokio::test]
    async fn test_open_with_retry_regenerates_code() {
        let calls = AtomicU32::new(0);
        let taken = code("111111");

        let result: Result<(RoomCode, TransportEvents), _> = open_with_retry(3, |fresh| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            let taken = taken.clone();
            async move {
                if attempt == 0 {
                    Err(TransportError::RegistrationConflict(taken))
                } else {
                    Ok((fresh, TransportEvents::channel().1))
                }
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_open_with_retry_gives_up() {
        let result: Result<((), TransportEvents), _> = open_with_retry(2, |code| async move {
            Err(TransportError::RegistrationConflict(code))
        })
        .await;
        assert!(matches!(result, Err(TransportError::RegistrationConflict(_))));
    }

    #[tokio::test]
    async fn test_offer_answered() {
        let (offer, call) = PendingOffer::new(code("111111"), 8);
        let (caller_audio, caller_mic) = local_audio();
        let (callee_audio, _callee_mic) = local_audio();

        let negotiation = tokio::spawn(offer.negotiate(code("222222"), caller_audio));
        let mut callee = call.answer(callee_audio).unwrap();
        let mut caller = negotiation.await.unwrap().unwrap();

        caller_mic
            .send(AudioFrame(Bytes::from_static(b"hello")))
            .await
            .unwrap();
        let mut remote = callee.take_remote().unwrap();
        assert_eq!(remote.frames.recv().await.unwrap().0, Bytes::from_static(b"hello"));

        caller.close();
        assert!(callee.is_closed());
        assert!(caller.take_remote().is_some());
    }

    #[tokio::test]
    async fn test_offer_rejected() {
        let (offer, call) = PendingOffer::new(code("111111"), 8);
        let (caller_audio, _mic) = local_audio();

        call.reject();
        let err = offer.negotiate(code("222222"), caller_audio).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::MediaNegotiation("call was declined".to_string())
        );
    }

    #[tokio::test]
    async fn test_withdrawn_offer_cancels_incoming() {
        let (offer, call) = PendingOffer::new(code("111111"), 8);
        let (caller_audio, _mic) = local_audio();
        let cancelled = call.cancelled();

        let negotiation = tokio::spawn(offer.negotiate(code("222222"), caller_audio));
        negotiation.abort();
        let _ = negotiation.await;

        assert!(cancelled.is_cancelled());
        let (callee_audio, _callee_mic) = local_audio();
        assert!(call.answer(callee_audio).is_err());
    }
}
