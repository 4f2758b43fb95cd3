//! Local media collaborators
//!
//! The session layer never decodes audio. It moves opaque [`AudioFrame`]s
//! from a capture device to the peer and hands the peer's stream to an
//! [`AudioSink`]. Both ends are traits so the platform (or a test) decides
//! what a microphone and a speaker are.
//!
//! ```text
//!   AudioCapture::acquire()          AudioSink::attach()
//!          │                                 ▲
//!          ▼                                 │
//!     LocalAudio ──► outbound pump ──► peer ─┴─► RemoteAudio
//!     (track + frames)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::MediaError;
use crate::types::RoomCode;

/// Frames buffered between a capture device and the outbound pump
pub const CAPTURE_BUFFER: usize = 32;

/// One opaque chunk of encoded audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame(pub Bytes);

impl AudioFrame {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

static NEXT_TRACK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct TrackInner {
    id: u64,
    enabled: AtomicBool,
    live: AtomicBool,
}

/// Handle to a live capture track.
///
/// Clones share state. Disabling a track mutes it (frames are dropped);
/// stopping it ends capture for good.
#[derive(Debug, Clone)]
pub struct AudioTrack {
    inner: Arc<TrackInner>,
}

impl AudioTrack {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed),
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the device is still capturing
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Release the capture device. Idempotent.
    pub fn stop(&self) {
        if self.inner.live.swap(false, Ordering::SeqCst) {
            debug!(track = self.inner.id, "Capture track stopped");
        }
    }
}

impl Default for AudioTrack {
    fn default() -> Self {
        Self::new()
    }
}

/// A captured local stream: the track handle plus the frames it produces
#[derive(Debug)]
pub struct LocalAudio {
    pub track: AudioTrack,
    pub frames: mpsc::Receiver<AudioFrame>,
}

impl LocalAudio {
    pub fn new(track: AudioTrack, frames: mpsc::Receiver<AudioFrame>) -> Self {
        Self { track, frames }
    }

    /// Next frame that should go on the wire.
    ///
    /// Frames captured while the track is disabled are dropped. Returns
    /// `None` once the track is stopped or the device stops producing.
    pub async fn next_outbound(&mut self) -> Option<AudioFrame> {
        loop {
            if !self.track.is_live() {
                return None;
            }
            let frame = self.frames.recv().await?;
            if !self.track.is_live() {
                return None;
            }
            if self.track.is_enabled() {
                return Some(frame);
            }
            trace!(track = self.track.id(), "Dropping frame from muted track");
        }
    }
}

/// Source of local audio (a microphone)
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Start capturing. Fails with [`MediaError::Acquisition`] when the
    /// device is missing or permission is denied.
    async fn acquire(&self) -> Result<LocalAudio, MediaError>;
}

/// The peer's audio stream
#[derive(Debug)]
pub struct RemoteAudio {
    pub peer: RoomCode,
    pub frames: mpsc::Receiver<AudioFrame>,
}

/// Where remote audio is played
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRoute {
    Speaker,
    Earpiece,
}

impl OutputRoute {
    pub fn for_speaker(speaker_on: bool) -> Self {
        if speaker_on {
            OutputRoute::Speaker
        } else {
            OutputRoute::Earpiece
        }
    }
}

/// Playback side of a call
pub trait AudioSink: Send + Sync {
    /// Start playing the peer's stream, replacing any previous one
    fn attach(&self, remote: RemoteAudio);

    /// Stop playback
    fn detach(&self);

    /// Whether [`AudioSink::set_route`] can switch the output device
    fn supports_routing(&self) -> bool {
        false
    }

    fn set_route(&self, _route: OutputRoute) -> Result<(), MediaError> {
        Err(MediaError::RoutingUnsupported)
    }
}

/// Synthetic microphone producing silent frames at a fixed interval
#[derive(Debug, Clone)]
pub struct SilenceCapture {
    interval: Duration,
    frame_len: usize,
}

impl SilenceCapture {
    /// 20ms frames of 16-bit mono at 48kHz
    pub fn new() -> Self {
        Self {
            interval: Duration::from_millis(20),
            frame_len: 1920,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl Default for SilenceCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioCapture for SilenceCapture {
    async fn acquire(&self) -> Result<LocalAudio, MediaError> {
        let track = AudioTrack::new();
        let (tx, rx) = mpsc::channel(CAPTURE_BUFFER);
        let frame = AudioFrame(Bytes::from(vec![0u8; self.frame_len]));
        let interval = self.interval;
        let producer = track.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            while producer.is_live() {
                ticker.tick().await;
                // Full buffer means nobody is draining; skip rather than block
                match tx.try_send(frame.clone()) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            trace!(track = producer.id(), "Silence capture finished");
        });

        debug!(track = track.id(), "Acquired silence capture");
        Ok(LocalAudio::new(track, rx))
    }
}

/// Sink that discards remote audio and counts what it received
#[derive(Default)]
pub struct CountingSink {
    frames: Arc<AtomicU64>,
    bytes: Arc<AtomicU64>,
    playback: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for CountingSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingSink")
            .field("frames", &self.frames())
            .field("bytes", &self.bytes())
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn is_attached(&self) -> bool {
        self.playback
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl AudioSink for CountingSink {
    fn attach(&self, mut remote: RemoteAudio) {
        let frames = self.frames.clone();
        let bytes = self.bytes.clone();
        let peer = remote.peer.clone();

        let handle = tokio::spawn(async move {
            while let Some(frame) = remote.frames.recv().await {
                frames.fetch_add(1, Ordering::Relaxed);
                bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
            }
            debug!(%peer, "Remote audio stream ended");
        });

        if let Some(previous) = self.playback.lock().replace(handle) {
            previous.abort();
        }
    }

    fn detach(&self) {
        if let Some(handle) = self.playback.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for CountingSink {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_muted_frames_are_dropped() {
        let track = AudioTrack::new();
        let (tx, rx) = mpsc::channel(8);
        let mut local = LocalAudio::new(track.clone(), rx);

        track.set_enabled(false);
        tx.send(AudioFrame(Bytes::from_static(b"muted"))).await.unwrap();
        let pending =
            tokio::time::timeout(Duration::from_millis(20), local.next_outbound()).await;
        assert!(pending.is_err());

        track.set_enabled(true);
        tx.send(AudioFrame(Bytes::from_static(b"live"))).await.unwrap();
        let frame = local.next_outbound().await.unwrap();
        assert_eq!(frame, AudioFrame(Bytes::from_static(b"live")));
    }

    #[tokio::test]
    async fn test_stopped_track_ends_stream() {
        let track = AudioTrack::new();
        let (tx, rx) = mpsc::channel(8);
        let mut local = LocalAudio::new(track.clone(), rx);

        tx.send(AudioFrame(Bytes::from_static(b"x"))).await.unwrap();
        track.stop();
        assert!(local.next_outbound().await.is_none());
        assert!(!track.is_live());
    }

    #[tokio::test]
    async fn test_silence_capture_produces_frames() {
        let capture = SilenceCapture::new().with_interval(Duration::from_millis(1));
        let mut local = capture.acquire().await.unwrap();
        let frame = local.next_outbound().await.unwrap();
        assert_eq!(frame.len(), 1920);

        local.track.stop();
        assert!(local.next_outbound().await.is_none());
    }

    #[tokio::test]
    async fn test_counting_sink_counts_frames() {
        let sink = CountingSink::new();
        let (tx, rx) = mpsc::channel(8);
        sink.attach(RemoteAudio {
            peer: RoomCode::parse("123456").unwrap(),
            frames: rx,
        });

        tx.send(AudioFrame(Bytes::from_static(b"abcd"))).await.unwrap();
        tx.send(AudioFrame(Bytes::from_static(b"ef"))).await.unwrap();
        drop(tx);

        for _ in 0..100 {
            if sink.frames() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.frames(), 2);
        assert_eq!(sink.bytes(), 6);
        assert!(!sink.supports_routing());
        assert_eq!(
            sink.set_route(OutputRoute::Earpiece),
            Err(MediaError::RoutingUnsupported)
        );
    }
}
