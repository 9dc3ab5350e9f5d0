use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{ServerConfig, StreamConfig};
use crate::error::{Result, RtspError};
use crate::media::encoder::EncoderFactory;
use crate::media::frame::Frame;
use crate::session::SessionManager;
use crate::stream::{StreamRegistry, StreamStats};
use crate::transport::tcp;

/// Longest the reaper sleeps between `running` checks.
const REAPER_POLL: Duration = Duration::from_millis(50);

/// Frame-ingest RTSP server.
///
/// Owns the stream registry, the session manager and the control-plane
/// threads. Frames go in through [`put_frame`](Self::put_frame); viewers
/// connect over RTSP at `rtsp://<host>:<port>/<stream>`.
///
/// The boolean ingest methods log failures and return `false`; the `try_*`
/// forms return the [`RtspError`] instead.
pub struct StreamServer {
    config: Arc<ServerConfig>,
    session_manager: SessionManager,
    streams: StreamRegistry,
    factory: Option<Arc<dyn EncoderFactory>>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    threads: Vec<JoinHandle<()>>,
}

#[cfg(feature = "openh264")]
fn default_factory() -> Option<Arc<dyn EncoderFactory>> {
    Some(Arc::new(crate::media::openh264::OpenH264Factory))
}

#[cfg(not(feature = "openh264"))]
fn default_factory() -> Option<Arc<dyn EncoderFactory>> {
    None
}

impl StreamServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            session_manager: SessionManager::new(config.rtp_port_range),
            streams: StreamRegistry::new(config.default_stream.clone()),
            factory: default_factory(),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            threads: Vec::new(),
            config: Arc::new(config),
        }
    }

    /// Replace the encoder used by streams initialized from now on.
    pub fn with_encoder_factory(mut self, factory: Arc<dyn EncoderFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Bind the RTSP listener and start the accept and reaper threads.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }
        self.config.validate()?;

        let listener = TcpListener::bind(&self.config.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        self.running.store(true, Ordering::SeqCst);

        let accept = {
            let running = self.running.clone();
            let session_manager = self.session_manager.clone();
            let streams = self.streams.clone();
            let config = self.config.clone();
            thread::Builder::new()
                .name("rtsp-accept".into())
                .spawn(move || {
                    tcp::accept_loop(listener, session_manager, streams, config, running);
                })
        };
        let reaper = {
            let running = self.running.clone();
            let session_manager = self.session_manager.clone();
            let streams = self.streams.clone();
            let interval = self.config.reaper_interval;
            thread::Builder::new()
                .name("session-reaper".into())
                .spawn(move || reap_loop(session_manager, streams, interval, running))
        };

        match (accept, reaper) {
            (Ok(accept), Ok(reaper)) => self.threads = vec![accept, reaper],
            (accept, reaper) => {
                self.running.store(false, Ordering::SeqCst);
                let mut error = None;
                for spawned in [accept, reaper] {
                    match spawned {
                        Ok(handle) => {
                            let _ = handle.join();
                        }
                        Err(e) => error = Some(e),
                    }
                }
                let reason = error.map(|e| e.to_string()).unwrap_or_default();
                return Err(RtspError::ResourceExhaustion(format!(
                    "control thread: {reason}"
                )));
            }
        }

        self.local_addr = Some(local_addr);
        tracing::info!(addr = %local_addr, "RTSP server listening");
        Ok(())
    }

    /// Stop accepting connections, end every session and stop every stream.
    pub fn shutdown(&mut self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::error!("control thread panicked");
            }
        }

        for stream in self.streams.drain() {
            for session in stream.stop() {
                self.session_manager.remove_session(&session.id);
            }
        }
        for session in self.session_manager.all() {
            self.session_manager
                .release(&session.id, &self.streams, "server shutdown");
        }
        self.local_addr = None;

        if was_running {
            tracing::info!("server stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound RTSP address. `None` until [`start`](Self::start) succeeds.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn session_count(&self) -> usize {
        self.session_manager.len()
    }

    /// Sessions currently receiving media.
    pub fn viewers(&self) -> Vec<Viewer> {
        self.session_manager
            .get_playing_sessions()
            .iter()
            .filter_map(|session| {
                session.transport().map(|transport| Viewer {
                    session_id: session.id.clone(),
                    stream: session.stream.clone(),
                    uri: session.uri.clone(),
                    transport: transport.describe(),
                    packets_sent: session.stats.packets.load(Ordering::Relaxed),
                })
            })
            .collect()
    }

    pub fn stream_names(&self) -> Vec<String> {
        self.streams.names()
    }

    pub fn stream_stats(&self, name: &str) -> Option<StreamStats> {
        self.streams.get(name).map(|s| s.stats())
    }

    /// Initialize `name` with [`ServerConfig::stream_defaults`].
    pub fn initialize(&self, name: &str) -> bool {
        log_failure(name, "initialize", self.try_initialize(name))
    }

    pub fn initialize_with(&self, name: &str, config: StreamConfig) -> bool {
        log_failure(name, "initialize", self.try_initialize_with(name, config))
    }

    pub fn put_frame(&self, name: &str, frame: &Frame<'_>) -> bool {
        log_failure(name, "put_frame", self.try_put_frame(name, frame))
    }

    pub fn stop(&self, name: &str) -> bool {
        log_failure(name, "stop", self.try_stop(name))
    }

    pub fn try_initialize(&self, name: &str) -> Result<()> {
        self.try_initialize_with(name, self.config.stream_defaults.clone())
    }

    /// Create the stream, or recover it if degraded. A healthy stream is
    /// left as is, whatever `config` says.
    pub fn try_initialize_with(&self, name: &str, config: StreamConfig) -> Result<()> {
        let factory = self.factory.as_deref().ok_or_else(|| {
            RtspError::Configuration("no encoder available: build with the openh264 feature or supply a factory".into())
        })?;
        self.streams.initialize(name, &config, factory)
    }

    pub fn try_put_frame(&self, name: &str, frame: &Frame<'_>) -> Result<()> {
        self.streams
            .get(name)
            .ok_or_else(|| RtspError::UnknownStream(name.to_string()))?
            .put_frame(frame)
    }

    pub fn try_stop(&self, name: &str) -> Result<()> {
        let stream = self
            .streams
            .remove(name)
            .ok_or_else(|| RtspError::UnknownStream(name.to_string()))?;
        for session in stream.stop() {
            self.session_manager.remove_session(&session.id);
        }
        Ok(())
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn log_failure(stream: &str, op: &str, result: Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e @ (RtspError::SlotBusy(_) | RtspError::OutOfOrder { .. })) => {
            tracing::debug!(stream, op, error = %e, "frame rejected");
            false
        }
        Err(e) => {
            tracing::warn!(stream, op, error = %e, "ingest call failed");
            false
        }
    }
}

fn reap_loop(
    session_manager: SessionManager,
    streams: StreamRegistry,
    interval: Duration,
    running: Arc<AtomicBool>,
) {
    let mut last = Instant::now();
    while running.load(Ordering::SeqCst) {
        thread::sleep(REAPER_POLL.min(interval));
        if last.elapsed() < interval {
            continue;
        }
        last = Instant::now();
        let reaped = session_manager.reap(&streams);
        if reaped > 0 {
            tracing::debug!(reaped, remaining = session_manager.len(), "reaper pass");
        }
    }
    tracing::debug!("reaper exited");
}

/// Information about a connected viewer (client in PLAY state).
#[derive(Debug, Clone)]
pub struct Viewer {
    pub session_id: String,
    pub stream: String,
    pub uri: String,
    /// e.g. `udp://10.0.0.5:5000` or `tcp interleaved ch 0`.
    pub transport: String,
    pub packets_sent: u64,
}
