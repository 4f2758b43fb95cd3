//! Shared helpers for controller integration tests
//!
//! Peers run over an in-process [`MemoryHub`] with a fake microphone that
//! records every track it hands out, so tests can check capture release.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use studylink_core::{
    open_with_retry, AudioCapture, AudioTrack, CountingSink, DataChannel, LocalAudio, MediaError,
    MediaSession, MemoryHub, RoomCode, SessionConfig, SessionController, SessionNotice,
    SessionResult, SignalingTransport, SilenceCapture, TransportError,
};
use tokio::sync::broadcast;
use tokio::time::Instant;

pub const PUMP_TIMEOUT: Duration = Duration::from_secs(5);

/// Microphone that counts acquisitions and can be told to deny access
#[derive(Default)]
pub struct FakeCapture {
    acquired: AtomicUsize,
    deny: AtomicBool,
    tracks: Mutex<Vec<AudioTrack>>,
}

impl FakeCapture {
    pub fn acquisitions(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn set_deny(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// Tracks handed out that are still capturing
    pub fn live_tracks(&self) -> usize {
        self.tracks.lock().iter().filter(|t| t.is_live()).count()
    }
}

#[async_trait]
impl AudioCapture for FakeCapture {
    async fn acquire(&self) -> Result<LocalAudio, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::Acquisition("permission denied".to_string()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let local = SilenceCapture::new()
            .with_interval(Duration::from_millis(5))
            .acquire()
            .await?;
        self.tracks.lock().push(local.track.clone());
        Ok(local)
    }
}

/// Transport wrapper counting how often links are requested
#[derive(Debug)]
pub struct CountingTransport {
    inner: Arc<dyn SignalingTransport>,
    data_calls: AtomicUsize,
    media_calls: AtomicUsize,
}

impl CountingTransport {
    pub fn new(inner: Arc<dyn SignalingTransport>) -> Self {
        Self {
            inner,
            data_calls: AtomicUsize::new(0),
            media_calls: AtomicUsize::new(0),
        }
    }

    pub fn data_calls(&self) -> usize {
        self.data_calls.load(Ordering::SeqCst)
    }

    pub fn media_calls(&self) -> usize {
        self.media_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingTransport for CountingTransport {
    fn local_code(&self) -> &RoomCode {
        self.inner.local_code()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    async fn connect_data(&self, remote: &RoomCode) -> Result<DataChannel, TransportError> {
        self.data_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.connect_data(remote).await
    }

    async fn connect_media(
        &self,
        remote: &RoomCode,
        local: LocalAudio,
    ) -> Result<MediaSession, TransportError> {
        self.media_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.connect_media(remote, local).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

/// One side of a session with its fakes
pub struct Peer {
    pub controller: SessionController,
    pub transport: Arc<CountingTransport>,
    pub capture: Arc<FakeCapture>,
    pub sink: Arc<CountingSink>,
    pub notices: broadcast::Receiver<SessionNotice>,
}

impl Peer {
    pub async fn open(hub: &MemoryHub, config: SessionConfig) -> Self {
        let (transport, events) = open_with_retry(config.registration_attempts, |code| {
            std::future::ready(hub.open(code))
        })
        .await
        .unwrap();

        let transport = Arc::new(CountingTransport::new(Arc::new(transport)));
        let capture = Arc::new(FakeCapture::default());
        let sink = Arc::new(CountingSink::new());
        let controller = SessionController::new(
            transport.clone(),
            events,
            capture.clone(),
            sink.clone(),
            config,
        );
        let notices = controller.subscribe_notices();

        Self {
            controller,
            transport,
            capture,
            sink,
            notices,
        }
    }

    pub fn code(&self) -> RoomCode {
        self.controller.local_code().unwrap()
    }

    /// Notices emitted since the last drain
    pub fn drain_notices(&mut self) -> Vec<SessionNotice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            notices.push(notice);
        }
        notices
    }

    /// Pump events until `done` holds, failing after [`PUMP_TIMEOUT`]
    pub async fn pump_until<F>(&mut self, mut done: F)
    where
        F: FnMut(&SessionController) -> bool,
    {
        let deadline = Instant::now() + PUMP_TIMEOUT;
        while !done(&self.controller) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.controller.next_event()).await {
                Ok(true) => {}
                Ok(false) => panic!("controller ran out of event sources"),
                Err(_) => panic!("timed out pumping events"),
            }
        }
    }

    /// Join `host`'s room, pumping the host so it can decide on the link
    pub async fn join(&mut self, host: &mut Peer) -> SessionResult<()> {
        let code = host.code();
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

    /// Let background tasks run briefly, then apply whatever arrived
    pub async fn settle(&mut self) -> usize {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.controller.process_pending()
    }
}

/// Host and guest with an open data link
pub async fn connected_pair(config: SessionConfig) -> (MemoryHub, Peer, Peer) {
    let hub = MemoryHub::new();
    let mut host = Peer::open(&hub, config.clone()).await;
    let mut guest = Peer::open(&hub, config).await;

    host.controller.create_session().unwrap();
    guest.join(&mut host).await.unwrap();
    assert!(host.controller.session().connected);

    (hub, host, guest)
}

/// Bring a connected pair into an active call
pub async fn start_call(caller: &mut Peer, callee: &mut Peer) {
    caller.controller.initiate_call().await.unwrap();
    callee
        .pump_until(|c| c.session().call_state == studylink_core::CallState::Incoming)
        .await;
    callee.controller.accept_call().await.unwrap();
    caller
        .pump_until(|c| c.session().call_state == studylink_core::CallState::Connected)
        .await;
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("studylink_core=debug")
        .with_test_writer()
        .try_init();
}
