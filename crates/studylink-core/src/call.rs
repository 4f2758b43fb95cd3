//! Voice call state machine
//!
//! ```text
//! idle       ── initiate ──────────────► calling
//! calling    ── answered ──────────────► connected
//! calling    ── failed / timeout / end ► idle
//! idle       ── incoming ──────────────► incoming
//! incoming   ── accept ────────────────► connected
//! incoming   ── reject / cancelled ────► idle
//! connected  ── end / remote hang-up ──► idle
//! any        ── link lost ─────────────► idle
//! ```
//!
//! The machine owns the local capture track: it is acquired on
//! `initiate`/`accept` and stopped on every path back to idle. Background
//! tasks (negotiation, hang-up watchers) report through [`CallSignal`]s
//! tagged with the attempt's call id, so signals from abandoned attempts
//! are recognised and dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{SessionError, SessionResult, TransportError};
use crate::events::{CallEndReason, SessionNotice};
use crate::media::{AudioCapture, AudioSink, AudioTrack, OutputRoute};
use crate::transport::{IncomingCall, MediaSession, SignalingTransport};
use crate::types::{CallState, RoomCode};

/// Outcome of toggling the speaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerRouting {
    /// The audio sink switched its output device
    Applied,
    /// Only the preference flag changed; the sink cannot route output
    PreferenceOnly,
}

/// Report from a call's background task
#[derive(Debug)]
pub(crate) enum CallSignal {
    /// Outgoing negotiation finished
    Answered {
        call_id: u64,
        result: Result<MediaSession, TransportError>,
    },
    /// The media session closed from the far end
    Ended { call_id: u64 },
    /// The caller withdrew an unanswered offer
    IncomingCancelled { call_id: u64 },
}

enum Phase {
    Idle,
    Calling {
        negotiation: JoinHandle<()>,
    },
    Incoming {
        call: IncomingCall,
        watcher: JoinHandle<()>,
    },
    Connected {
        session: MediaSession,
        watcher: JoinHandle<()>,
    },
}

impl Phase {
    fn state(&self) -> CallState {
        match self {
            Phase::Idle => CallState::Idle,
            Phase::Calling { .. } => CallState::Calling,
            Phase::Incoming { .. } => CallState::Incoming,
            Phase::Connected { .. } => CallState::Connected,
        }
    }
}

pub(crate) struct CallMachine {
    capture: Arc<dyn AudioCapture>,
    sink: Arc<dyn AudioSink>,
    phase: Phase,
    call_id: u64,
    track: Option<AudioTrack>,
    muted: bool,
    speaker_on: bool,
    call_timeout: Duration,
    signals_tx: mpsc::UnboundedSender<CallSignal>,
    signals_rx: mpsc::UnboundedReceiver<CallSignal>,
    notices: broadcast::Sender<SessionNotice>,
}

impl CallMachine {
    pub fn new(
        capture: Arc<dyn AudioCapture>,
        sink: Arc<dyn AudioSink>,
        call_timeout: Duration,
        notices: broadcast::Sender<SessionNotice>,
    ) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Self {
            capture,
            sink,
            phase: Phase::Idle,
            call_id: 0,
            track: None,
            muted: false,
            speaker_on: true,
            call_timeout,
            signals_tx,
            signals_rx,
            notices,
        }
    }

    pub fn state(&self) -> CallState {
        self.phase.state()
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn speaker_on(&self) -> bool {
        self.speaker_on
    }

    fn emit(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }

    fn next_call_id(&mut self) -> u64 {
        self.call_id += 1;
        self.call_id
    }

    fn invalid(&self, action: &'static str) -> SessionError {
        SessionError::InvalidCallTransition {
            state: self.state(),
            action,
        }
    }

    /// Start an outgoing call to `peer`
    pub async fn initiate(
        &mut self,
        transport: &Arc<dyn SignalingTransport>,
        peer: &RoomCode,
    ) -> SessionResult<()> {
        if !self.state().is_idle() {
            return Err(self.invalid("start a call"));
        }

        let local = match self.capture.acquire().await {
            Ok(local) => local,
            Err(e) => {
                warn!(error = %e, "Could not acquire capture for outgoing call");
                self.emit(SessionNotice::CallFailed {
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let call_id = self.next_call_id();
        self.track = Some(local.track.clone());
        self.muted = false;

        let signals = self.signals_tx.clone();
        let transport = transport.clone();
        let target = peer.clone();
        let timeout = self.call_timeout;
        let negotiation = tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, transport.connect_media(&target, local)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::MediaNegotiation(
                    "no answer from your study partner".to_string(),
                )),
            };
            let _ = signals.send(CallSignal::Answered { call_id, result });
        });

        info!(%peer, call_id, "Calling");
        self.phase = Phase::Calling { negotiation };
        Ok(())
    }

    /// A peer is calling. Busy unless idle.
    pub fn on_incoming(&mut self, call: IncomingCall) {
        if !self.state().is_idle() {
            debug!(peer = %call.peer(), state = %self.state(), "Rejecting call, already busy");
            call.reject();
            return;
        }

        let call_id = self.next_call_id();
        let cancelled = call.cancelled();
        let signals = self.signals_tx.clone();
        let watcher = tokio::spawn(async move {
            cancelled.cancelled().await;
            let _ = signals.send(CallSignal::IncomingCancelled { call_id });
        });

        let peer = call.peer().clone();
        info!(%peer, call_id, "Incoming call");
        self.phase = Phase::Incoming { call, watcher };
        self.emit(SessionNotice::IncomingCall { peer });
    }

    /// Answer the pending incoming call
    pub async fn accept(&mut self) -> SessionResult<()> {
        let (call, watcher) = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Incoming { call, watcher } => (call, watcher),
            other => {
                self.phase = other;
                return Err(self.invalid("accept a call"));
            }
        };
        watcher.abort();

        let local = match self.capture.acquire().await {
            Ok(local) => local,
            Err(e) => {
                warn!(error = %e, "Could not acquire capture, declining call");
                call.reject();
                self.release();
                self.emit(SessionNotice::CallFailed {
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let track = local.track.clone();
        match call.answer(local) {
            Ok(session) => {
                self.track = Some(track);
                self.muted = false;
                self.establish(session);
                Ok(())
            }
            Err(e) => {
                track.stop();
                self.release();
                self.emit(SessionNotice::CallFailed {
                    message: e.user_message(),
                });
                Err(e.into())
            }
        }
    }

    /// Decline the pending incoming call. Never touches capture.
    pub fn reject(&mut self) -> SessionResult<()> {
        if self.state() != CallState::Incoming {
            return Err(self.invalid("reject a call"));
        }
        self.teardown(Some(CallEndReason::Rejected));
        Ok(())
    }

    /// Hang up. Declines a ringing call; no-op while idle.
    pub fn end(&mut self) -> SessionResult<()> {
        match self.state() {
            CallState::Idle => Ok(()),
            CallState::Incoming => self.reject(),
            CallState::Calling | CallState::Connected => {
                self.teardown(Some(CallEndReason::HungUp));
                Ok(())
            }
        }
    }

    /// Return to idle because the data link went away
    pub fn force_idle(&mut self) {
        if !self.state().is_idle() {
            self.teardown(Some(CallEndReason::Disconnected));
        }
    }

    /// Flip the local track's enabled flag; returns the new muted state
    pub fn toggle_mute(&mut self) -> SessionResult<bool> {
        if !matches!(self.state(), CallState::Calling | CallState::Connected) {
            return Err(self.invalid("mute"));
        }
        self.muted = !self.muted;
        if let Some(track) = &self.track {
            track.set_enabled(!self.muted);
        }
        debug!(muted = self.muted, "Toggled mute");
        Ok(self.muted)
    }

    /// Flip the speaker preference, routing output when the sink can
    pub fn toggle_speaker(&mut self) -> SpeakerRouting {
        self.speaker_on = !self.speaker_on;
        if !self.sink.supports_routing() {
            debug!(speaker_on = self.speaker_on, "Speaker preference changed, sink cannot route");
            return SpeakerRouting::PreferenceOnly;
        }
        match self.sink.set_route(OutputRoute::for_speaker(self.speaker_on)) {
            Ok(()) => SpeakerRouting::Applied,
            Err(e) => {
                warn!(error = %e, "Failed to switch audio output");
                SpeakerRouting::PreferenceOnly
            }
        }
    }

    pub async fn next_signal(&mut self) -> Option<CallSignal> {
        self.signals_rx.recv().await
    }

    pub fn try_next_signal(&mut self) -> Option<CallSignal> {
        self.signals_rx.try_recv().ok()
    }

    /// Apply a background report, dropping those from stale attempts
    pub fn handle_signal(&mut self, signal: CallSignal) {
        match signal {
            CallSignal::Answered { call_id, result } => {
                if call_id != self.call_id || self.state() != CallState::Calling {
                    if let Ok(session) = result {
                        debug!(call_id, "Discarding late answer");
                        session.close();
                    }
                    return;
                }
                match result {
                    Ok(session) => {
                        self.phase = Phase::Idle;
                        self.establish(session);
                    }
                    Err(e) => {
                        info!(call_id, error = %e, "Outgoing call failed");
                        self.teardown(None);
                        self.emit(SessionNotice::CallFailed {
                            message: e.user_message(),
                        });
                    }
                }
            }
            CallSignal::Ended { call_id } => {
                if call_id == self.call_id && self.state() == CallState::Connected {
                    info!(call_id, "Peer hung up");
                    self.teardown(Some(CallEndReason::RemoteHungUp));
                }
            }
            CallSignal::IncomingCancelled { call_id } => {
                if call_id == self.call_id && self.state() == CallState::Incoming {
                    info!(call_id, "Caller withdrew the call");
                    self.teardown(Some(CallEndReason::CallerCancelled));
                }
            }
        }
    }

    /// Attach the remote stream and watch for hang-up
    fn establish(&mut self, mut session: MediaSession) {
        if let Some(remote) = session.take_remote() {
            self.sink.attach(remote);
        }
        if self.sink.supports_routing() {
            if let Err(e) = self.sink.set_route(OutputRoute::for_speaker(self.speaker_on)) {
                warn!(error = %e, "Failed to apply speaker preference");
            }
        }

        let call_id = self.call_id;
        let closed = session.closed_token();
        let signals = self.signals_tx.clone();
        let watcher = tokio::spawn(async move {
            closed.cancelled().await;
            let _ = signals.send(CallSignal::Ended { call_id });
        });

        info!(peer = %session.peer(), call_id, "Call connected");
        self.phase = Phase::Connected { session, watcher };
        self.emit(SessionNotice::CallConnected);
    }

    /// Drop whatever the current phase holds and release capture
    fn teardown(&mut self, reason: Option<CallEndReason>) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {}
            Phase::Calling { negotiation } => negotiation.abort(),
            Phase::Incoming { call, watcher } => {
                watcher.abort();
                call.reject();
            }
            Phase::Connected { session, watcher } => {
                watcher.abort();
                session.close();
                self.sink.detach();
            }
        }
        self.release();
        if let Some(reason) = reason {
            info!(%reason, "Call ended");
            self.emit(SessionNotice::CallEnded { reason });
        }
    }

    fn release(&mut self) {
        if let Some(track) = self.track.take() {
            track.stop();
        }
        self.muted = false;
    }
}

impl Drop for CallMachine {
    fn drop(&mut self) {
        self.teardown(None);
    }
}
