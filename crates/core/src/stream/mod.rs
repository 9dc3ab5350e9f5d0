//! Named streams: frame slot, encode worker and subscriber fan-out.
//!
//! A stream is served at RTSP path `/<name>`. It owns exactly one encoder,
//! which lives on the stream's worker thread; producers only ever touch
//! the [`FrameSlot`].

pub mod slot;
mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::config::StreamConfig;
use crate::error::{Result, RtspError};
use crate::media::encoder::{EncoderFactory, VideoEncoder};
use crate::media::frame::Frame;
use crate::media::params::ParameterSets;
use crate::media::{AccessUnit, Codec, DYNAMIC_PAYLOAD_TYPE};
use crate::session::{Delivery, Session};
pub use slot::{FrameSlot, Offer};

/// Point-in-time counters for one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub frames_accepted: u64,
    /// Frames overwritten in the slot before the worker got to them.
    pub frames_dropped: u64,
    pub frames_encoded: u64,
    /// Frames the encoder's rate control skipped without output.
    pub frames_skipped: u64,
    pub encode_failures: u64,
    pub access_units: u64,
    pub subscribers: usize,
    pub degraded: bool,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    dropped: AtomicU64,
    encoded: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
    access_units: AtomicU64,
}

pub struct Stream {
    name: String,
    config: StreamConfig,
    codec: Codec,
    slot: FrameSlot,
    subscribers: RwLock<Vec<Arc<Session>>>,
    params: RwLock<ParameterSets>,
    counters: Counters,
    consecutive_failures: AtomicU32,
    degraded: AtomicBool,
    stopped: AtomicBool,
    keyframe_requested: AtomicBool,
    last_pts90: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Stream {
    /// Register the stream state and start its encode worker.
    pub fn spawn(
        name: &str,
        config: StreamConfig,
        encoder: Box<dyn VideoEncoder>,
    ) -> Result<Arc<Self>> {
        let dims = config.width.zip(config.height);
        let stream = Arc::new(Self {
            name: name.to_string(),
            codec: encoder.codec(),
            config,
            slot: FrameSlot::new(dims),
            subscribers: RwLock::new(Vec::new()),
            params: RwLock::new(ParameterSets::default()),
            counters: Counters::default(),
            consecutive_failures: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            keyframe_requested: AtomicBool::new(true),
            last_pts90: AtomicU64::new(0),
            worker: Mutex::new(None),
        });

        let worker_stream = stream.clone();
        let handle = thread::Builder::new()
            .name(format!("encode-{name}"))
            .spawn(move || worker::run(worker_stream, encoder))
            .map_err(|e| RtspError::ResourceExhaustion(format!("encode worker: {e}")))?;
        *stream.worker.lock() = Some(handle);
        Ok(stream)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn payload_type(&self) -> u8 {
        DYNAMIC_PAYLOAD_TYPE
    }

    /// Copy a frame into the slot for the encode worker.
    pub fn put_frame(&self, frame: &Frame<'_>) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RtspError::StreamStopped(self.name.clone()));
        }
        if self.is_degraded() {
            return Err(RtspError::StreamDegraded(self.name.clone()));
        }
        match self.slot.offer(&self.name, frame, self.config.slot_wait) {
            Ok(outcome) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                if outcome == Offer::Replaced {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(stream = %self.name, "pending frame replaced");
                }
                Ok(())
            }
            Err(e) => {
                if e.counts_as_encode_failure() {
                    self.record_failure(&e);
                }
                Err(e)
            }
        }
    }

    pub(crate) fn record_success(&self) {
        self.counters.encoded.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// A skipped frame is not a failure, but produced nothing either.
    pub(crate) fn record_skip(&self) {
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    pub(crate) fn record_failure(&self, error: &RtspError) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(stream = %self.name, error = %error, failures, "encode failure");
        if failures >= self.config.max_consecutive_failures
            && !self.degraded.swap(true, Ordering::SeqCst)
        {
            tracing::error!(stream = %self.name, failures, "stream degraded");
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Swap in a rebuilt encoder and accept frames again.
    pub fn recover(&self, encoder: Box<dyn VideoEncoder>) {
        self.slot.replace_encoder(encoder);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.request_keyframe();
        self.degraded.store(false, Ordering::SeqCst);
        tracing::info!(stream = %self.name, "stream recovered with new encoder");
    }

    pub fn request_keyframe(&self) {
        self.keyframe_requested.store(true, Ordering::SeqCst);
    }

    fn take_keyframe_request(&self) -> bool {
        self.keyframe_requested.swap(false, Ordering::SeqCst)
    }

    /// Capture time of the newest accepted frame. Sessions entering PLAYING
    /// only see access units captured after it.
    pub fn last_accepted(&self) -> Option<Duration> {
        self.slot.last_accepted()
    }

    /// Presentation time of the newest access unit, for `RTP-Info`.
    pub fn last_pts90(&self) -> u64 {
        self.last_pts90.load(Ordering::SeqCst)
    }

    /// `a=fmtp` line for DESCRIBE.
    pub fn fmtp(&self) -> Option<String> {
        self.params.read().fmtp(self.codec, self.payload_type())
    }

    pub fn subscribe(&self, session: Arc<Session>) {
        let mut subs = self.subscribers.write();
        if !subs.iter().any(|s| s.id == session.id) {
            tracing::debug!(stream = %self.name, session_id = %session.id, "session subscribed");
            subs.push(session);
        }
    }

    pub fn unsubscribe(&self, session_id: &str) {
        let mut subs = self.subscribers.write();
        if let Some(pos) = subs.iter().position(|s| s.id == session_id) {
            subs.swap_remove(pos);
            tracing::debug!(stream = %self.name, session_id, "session unsubscribed");
        }
    }

    pub fn subscribers(&self) -> Vec<Arc<Session>> {
        self.subscribers.read().clone()
    }

    /// Offer one access unit to every subscriber. Slow consumers past their
    /// drop budget are closed and unsubscribed; the reaper releases them.
    fn fan_out(&self, au: Arc<AccessUnit>) {
        self.counters.access_units.fetch_add(1, Ordering::Relaxed);
        self.last_pts90.store(au.pts90, Ordering::SeqCst);

        let mut evicted = Vec::new();
        for session in self.subscribers.read().iter() {
            if session.offer(&au) == Delivery::Evict {
                evicted.push(session.id.clone());
                session.close("slow consumer");
            }
        }
        for id in evicted {
            tracing::warn!(stream = %self.name, session_id = %id, "session evicted");
            self.unsubscribe(&id);
        }
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            frames_accepted: self.counters.accepted.load(Ordering::Relaxed),
            frames_dropped: self.counters.dropped.load(Ordering::Relaxed),
            frames_encoded: self.counters.encoded.load(Ordering::Relaxed),
            frames_skipped: self.counters.skipped.load(Ordering::Relaxed),
            encode_failures: self.counters.failures.load(Ordering::Relaxed),
            access_units: self.counters.access_units.load(Ordering::Relaxed),
            subscribers: self.subscribers.read().len(),
            degraded: self.is_degraded(),
        }
    }

    /// Stop the worker and end every subscribed session. Returns the
    /// sessions that were subscribed so the caller can deregister them.
    pub fn stop(&self) -> Vec<Arc<Session>> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        self.slot.close();
        if let Some(handle) = self.worker.lock().take()
            && handle.join().is_err()
        {
            tracing::error!(stream = %self.name, "encode worker panicked");
        }
        let sessions = std::mem::take(&mut *self.subscribers.write());
        for session in &sessions {
            session.terminate("stream stopped");
        }
        tracing::info!(stream = %self.name, sessions = sessions.len(), "stream stopped");
        sessions
    }
}

/// Stream names double as RTSP path segments.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_graphic() && b != b'/') {
        return Err(RtspError::Configuration(format!(
            "invalid stream name {name:?}: must be a non-empty URL path segment"
        )));
    }
    Ok(())
}

/// Registry of named streams.
///
/// An optional default stream serves URIs whose path names no registered
/// stream, so single-stream deployments answer any path.
#[derive(Clone)]
pub struct StreamRegistry {
    streams: Arc<RwLock<HashMap<String, Arc<Stream>>>>,
    default_name: Option<String>,
}

impl StreamRegistry {
    pub fn new(default_name: Option<String>) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            default_name,
        }
    }

    /// Create the stream, or rebuild the encoder of a degraded one.
    /// A healthy existing stream is left untouched.
    pub fn initialize(
        &self,
        name: &str,
        config: &StreamConfig,
        factory: &dyn EncoderFactory,
    ) -> Result<()> {
        validate_name(name)?;
        config.validate()?;

        let mut streams = self.streams.write();
        if let Some(existing) = streams.get(name) {
            if existing.is_degraded() {
                let encoder = factory.create(&existing.config().encoder_settings())?;
                existing.recover(encoder);
            } else {
                tracing::debug!(stream = name, "stream already initialized");
            }
            return Ok(());
        }

        let encoder = factory.create(&config.encoder_settings())?;
        let codec = encoder.codec();
        let stream = Stream::spawn(name, config.clone(), encoder)?;
        streams.insert(name.to_string(), stream);
        tracing::info!(
            stream = name,
            %codec,
            fps = config.fps,
            bitrate_bps = config.bitrate_bps,
            gop = config.gop,
            "stream initialized"
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Stream>> {
        self.streams.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Stream>> {
        self.streams.write().remove(name)
    }

    /// Remove every stream, for shutdown.
    pub fn drain(&self) -> Vec<Arc<Stream>> {
        self.streams.write().drain().map(|(_, s)| s).collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }

    /// Resolve a stream from an RTSP URI, falling back to the default stream.
    pub fn resolve_from_uri(&self, uri: &str) -> Option<Arc<Stream>> {
        extract_stream_name(uri)
            .and_then(|name| self.get(name))
            .or_else(|| self.default_name.as_deref().and_then(|name| self.get(name)))
    }

    /// Unsubscribe a session from all streams (used during disconnect cleanup).
    pub fn unsubscribe_all(&self, session_id: &str) {
        for stream in self.streams.read().values() {
            stream.unsubscribe(session_id);
        }
    }
}

/// Extract the stream name from an RTSP URI.
///
/// `rtsp://host:8554/cam0/track1` → `cam0`
/// `rtsp://host:8554/cam0`        → `cam0`
/// `rtsp://host:8554/`            → `None`
/// `*`                            → `None`
pub fn extract_stream_name(uri: &str) -> Option<&str> {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        &after[after.find('/')?..]
    } else if uri.starts_with('/') {
        uri
    } else {
        return None;
    };

    let path = path.split(['?', '#']).next().unwrap_or(path);
    path.split('/').find(|segment| !segment.is_empty())
}
