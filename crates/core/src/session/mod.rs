//! RTSP session management (RFC 2326 §3, §12.37).
//!
//! An RTSP session is a server-side state object created during SETUP and
//! destroyed by TEARDOWN, timeout, RTCP BYE, control connection loss,
//! slow-consumer eviction, or the stream being stopped. It tracks:
//!
//! - A unique session ID (hex string, returned in the `Session` header).
//! - The playback state (see below).
//! - The negotiated [`Transport`] and the delivery thread feeding it.
//! - A last-activity instant checked against the configured timeout.
//!
//! ## Session lifecycle (RFC 2326 §A.1)
//!
//! ```text
//! (created)     -> Init
//! SETUP         -> Ready
//! PLAY          -> Playing
//! PAUSE         -> Ready    (from Playing)
//! PLAY          -> Playing  (from Ready)
//! TEARDOWN, timeout, BYE, eviction, stop -> Terminated
//! ```

pub mod delivery;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::{Mutex, RwLock};

use crate::config::ServerConfig;
use crate::error::{Result, RtspError};
use crate::media::{AccessUnit, Packetizer};
use crate::stream::StreamRegistry;
use crate::transport::{PortAllocator, RtpSink};
pub use transport::Transport;

/// RTSP session state machine (RFC 2326 §A.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered but transport not yet attached.
    Init,
    /// Transport negotiated, media not flowing.
    Ready,
    /// Media is being delivered.
    Playing,
    /// Ended; waiting for the reaper to release it.
    Terminated,
}

/// Result of offering an access unit to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Not playing, captured before PLAY, or waiting for a keyframe.
    Skipped,
    /// Queue full. The session now waits for the next keyframe.
    Dropped,
    /// Too many consecutive drops, or the delivery thread is gone.
    Evict,
}

/// Per-session delivery counters, also used for RTCP sender reports.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    pub packets: AtomicU64,
    pub octets: AtomicU64,
    pub dropped: AtomicU64,
}

/// A single RTSP session (RFC 2326 §3).
///
/// Interior mutability lets the connection thread, the encode worker, the
/// delivery thread and the reaper share one `Arc<Session>`.
pub struct Session {
    /// Unique session identifier (16-char hex string).
    pub id: String,
    /// The RTSP URI this session was created for (from the SETUP request).
    pub uri: String,
    /// Name of the stream this session subscribes to.
    pub stream: String,
    pub timeout: Duration,
    /// SSRC of the session's packetizer, advertised in SETUP and RTCP.
    pub ssrc: u32,
    /// Random offset added to every 90 kHz presentation timestamp.
    pub rtp_timestamp_base: u32,
    state: RwLock<SessionState>,
    transport: RwLock<Option<Transport>>,
    last_seen: Mutex<Instant>,
    play_after: Mutex<Option<Duration>>,
    awaiting_keyframe: AtomicBool,
    consecutive_drops: AtomicU32,
    max_drops: u32,
    next_sequence: AtomicU16,
    queue: Mutex<Option<Sender<Arc<AccessUnit>>>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
    pub stats: DeliveryStats,
}

impl Session {
    pub fn new(uri: &str, stream: &str, timeout: Duration, max_drops: u32) -> Self {
        Session {
            id: format!("{:016X}", rand::random::<u64>()),
            uri: uri.to_string(),
            stream: stream.to_string(),
            timeout,
            ssrc: rand::random::<u32>(),
            rtp_timestamp_base: rand::random::<u32>(),
            state: RwLock::new(SessionState::Init),
            transport: RwLock::new(None),
            last_seen: Mutex::new(Instant::now()),
            play_after: Mutex::new(None),
            awaiting_keyframe: AtomicBool::new(true),
            consecutive_drops: AtomicU32::new(0),
            max_drops,
            next_sequence: AtomicU16::new(0),
            queue: Mutex::new(None),
            delivery: Mutex::new(None),
            stats: DeliveryStats::default(),
        }
    }

    /// Attach the transport and start the delivery thread. Moves the session
    /// from Init to Ready.
    pub fn attach(
        self: &Arc<Self>,
        transport: Transport,
        packetizer: Box<dyn Packetizer>,
        sink: Box<dyn RtpSink>,
        config: &ServerConfig,
    ) -> Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(config.session_queue_len);
        self.next_sequence
            .store(packetizer.next_sequence(), Ordering::SeqCst);

        let worker = delivery::DeliveryWorker {
            session: Arc::downgrade(self),
            queue: rx,
            packetizer,
            sink,
            rtcp_interval: config.rtcp_interval,
        };
        let handle = thread::Builder::new()
            .name(format!("rtp-{}", &self.id[..8]))
            .spawn(move || worker.run())
            .map_err(|e| RtspError::ResourceExhaustion(format!("delivery thread: {e}")))?;

        tracing::debug!(session_id = %self.id, transport = %transport.describe(), "transport configured");
        *self.transport.write() = Some(transport);
        *self.queue.lock() = Some(tx);
        *self.delivery.lock() = Some(handle);
        self.set_state(SessionState::Ready);
        Ok(())
    }

    pub fn transport(&self) -> Option<Transport> {
        self.transport.read().clone()
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        if *current == SessionState::Terminated {
            return;
        }
        tracing::debug!(session_id = %self.id, old_state = ?*current, new_state = ?state, "state transition");
        *current = state;
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Whether this session is actively receiving media.
    pub fn is_playing(&self) -> bool {
        self.state() == SessionState::Playing
    }

    /// Start (or resume) delivery. Only access units captured after
    /// `after` are sent, beginning with a keyframe.
    pub fn play(&self, after: Option<Duration>) {
        *self.play_after.lock() = after;
        self.awaiting_keyframe.store(true, Ordering::SeqCst);
        self.consecutive_drops.store(0, Ordering::SeqCst);
        self.set_state(SessionState::Playing);
    }

    pub fn pause(&self) {
        self.set_state(SessionState::Ready);
    }

    /// Refresh liveness.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.idle() > self.timeout
    }

    /// Sequence number of the next RTP packet (for `RTP-Info`).
    pub fn next_sequence(&self) -> u16 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    pub(crate) fn set_next_sequence(&self, seq: u16) {
        self.next_sequence.store(seq, Ordering::SeqCst);
    }

    /// RTP timestamp corresponding to a 90 kHz presentation time.
    pub fn rtp_timestamp(&self, pts90: u64) -> u32 {
        self.rtp_timestamp_base.wrapping_add(pts90 as u32)
    }

    /// Hand an access unit to the delivery thread without blocking.
    pub fn offer(&self, au: &Arc<AccessUnit>) -> Delivery {
        if !self.is_playing() {
            return Delivery::Skipped;
        }
        if let Some(after) = *self.play_after.lock()
            && au.capture <= after
        {
            return Delivery::Skipped;
        }
        if self.awaiting_keyframe.load(Ordering::SeqCst) && !au.keyframe {
            return Delivery::Skipped;
        }

        let queue = self.queue.lock();
        let Some(tx) = queue.as_ref() else {
            return Delivery::Skipped;
        };
        match tx.try_send(au.clone()) {
            Ok(()) => {
                self.awaiting_keyframe.store(false, Ordering::SeqCst);
                self.consecutive_drops.store(0, Ordering::SeqCst);
                Delivery::Queued
            }
            Err(TrySendError::Full(_)) => {
                self.awaiting_keyframe.store(true, Ordering::SeqCst);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                let drops = self.consecutive_drops.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::trace!(session_id = %self.id, drops, "session queue full, access unit dropped");
                if drops > self.max_drops {
                    Delivery::Evict
                } else {
                    Delivery::Dropped
                }
            }
            Err(TrySendError::Disconnected(_)) => Delivery::Evict,
        }
    }

    /// Mark the session ended and let its delivery thread wind down
    /// (it sends RTCP BYE on the way out). Does not wait.
    pub fn close(&self, reason: &str) {
        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, SessionState::Terminated)
        };
        self.queue.lock().take();
        if previous != SessionState::Terminated {
            tracing::info!(session_id = %self.id, stream = %self.stream, reason, "session terminated");
        }
    }

    /// [`close`](Self::close), then wait for the delivery thread to finish.
    pub fn terminate(&self, reason: &str) {
        self.close(reason);
        let handle = self.delivery.lock().take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            tracing::error!(session_id = %self.id, "delivery thread panicked");
        }
    }

    /// Format the `Session` response header value per RFC 2326 §12.37.
    ///
    /// Example: `"1A2B3C4D5E6F7081;timeout=60"`
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout.as_secs().max(1))
    }
}

/// Thread-safe registry of active sessions.
///
/// Backed by `parking_lot::RwLock` for fast concurrent reads.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    ports: Arc<PortAllocator>,
}

impl SessionManager {
    pub fn new(rtp_port_range: (u16, u16)) -> Self {
        SessionManager {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ports: Arc::new(PortAllocator::new(rtp_port_range)),
        }
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Create a new session for the given URI and register it.
    pub fn create_session(&self, uri: &str, stream: &str, config: &ServerConfig) -> Arc<Session> {
        let session = Arc::new(Session::new(
            uri,
            stream,
            config.session_timeout,
            config.max_session_drops,
        ));
        let id = session.id.clone();
        let mut sessions = self.sessions.write();
        sessions.insert(id.clone(), session.clone());
        tracing::debug!(session_id = %id, uri, total_sessions = sessions.len(), "session created");
        session
    }

    /// Look up a session by ID.
    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove and return a session by ID.
    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session removed");
        }
        removed
    }

    /// Remove a session everywhere and shut its delivery down.
    pub fn release(&self, id: &str, streams: &StreamRegistry, reason: &str) -> bool {
        match self.remove_session(id) {
            Some(session) => {
                if let Some(stream) = streams.get(&session.stream) {
                    stream.unsubscribe(id);
                }
                session.terminate(reason);
                true
            }
            None => false,
        }
    }

    /// Release every terminated or idle session. Returns how many went.
    pub fn reap(&self, streams: &StreamRegistry) -> usize {
        let doomed: Vec<(Arc<Session>, Option<RtspError>)> = self
            .sessions
            .read()
            .values()
            .filter_map(|s| match s.state() {
                SessionState::Terminated => Some((s.clone(), None)),
                _ if s.is_expired() => Some((
                    s.clone(),
                    Some(RtspError::SessionTimeout {
                        id: s.id.clone(),
                        idle: s.idle(),
                    }),
                )),
                _ => None,
            })
            .collect();

        for (session, timeout) in &doomed {
            let reason = match timeout {
                Some(e) => {
                    tracing::info!(session_id = %session.id, error = %e, "reaping idle session");
                    "timeout"
                }
                None => "terminated",
            };
            self.release(&session.id, streams, reason);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Returns all sessions currently in the [`SessionState::Playing`] state.
    pub fn get_playing_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_playing())
            .cloned()
            .collect()
    }
}
