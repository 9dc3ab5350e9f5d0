use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::ServerConfig;
use crate::protocol::MethodHandler;
use crate::protocol::RtspRequest;
use crate::protocol::RtspResponse;
use crate::session::SessionManager;
use crate::stream::StreamRegistry;
use crate::transport::RtpSink;

/// Write half of a control connection, shared between the request loop
/// and the delivery threads of interleaved sessions.
pub type SharedWriter = Arc<Mutex<TcpStream>>;

/// How long a blocked read waits before re-checking the `running` flag.
const READ_POLL: Duration = Duration::from_millis(200);
/// A client that stops draining its socket for this long is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// Header block size limit; anything larger is not an RTSP request.
const MAX_HEADER_BYTES: usize = 16 * 1024;
/// Largest `Content-Length` accepted; RTSP bodies here are short parameter lists.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::StreamServer::shutdown`] can terminate it promptly.
pub fn accept_loop(
    listener: TcpListener,
    session_manager: SessionManager,
    streams: StreamRegistry,
    config: Arc<ServerConfig>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let sm = session_manager.clone();
                let r = running.clone();
                let s = streams.clone();
                let c = config.clone();
                thread::spawn(move || {
                    Connection::handle(stream, sm, s, c, r);
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// One unit read off the control connection.
enum Inbound {
    Request(String),
    Interleaved { channel: u8, data: Vec<u8> },
}

/// A single RTSP client connection with its own lifecycle.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: SharedWriter,
    handler: MethodHandler,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    pub fn handle(
        stream: TcpStream,
        session_manager: SessionManager,
        streams: StreamRegistry,
        config: Arc<ServerConfig>,
        running: Arc<AtomicBool>,
    ) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };

        tracing::info!(%peer_addr, "client connected");

        if stream.set_read_timeout(Some(READ_POLL)).is_err()
            || stream.set_write_timeout(Some(WRITE_TIMEOUT)).is_err()
        {
            return;
        }
        // Interleaved packets are small and latency-sensitive.
        let _ = stream.set_nodelay(true);

        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };
        let writer: SharedWriter = Arc::new(Mutex::new(stream));

        let handler = MethodHandler::new(
            session_manager.clone(),
            peer_addr,
            streams.clone(),
            config,
            Some(writer.clone()),
        );

        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            writer,
            handler,
            peer_addr,
        };

        let reason = conn.run(&running);
        conn.cleanup(&session_manager, &streams);

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self, running: &AtomicBool) -> &'static str {
        while running.load(Ordering::SeqCst) {
            let inbound = match self.read_inbound(running) {
                Ok(Some(inbound)) => inbound,
                Ok(None) => return "connection closed by client",
                Err(e) if e.kind() == io::ErrorKind::Interrupted => break,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "unreadable request");
                    return "protocol error";
                }
                Err(_) => return "read error",
            };

            let request_text = match inbound {
                Inbound::Interleaved { channel, data } => {
                    self.handler.handle_interleaved(channel, &data);
                    continue;
                }
                Inbound::Request(text) => text,
            };

            if request_text.trim().is_empty() {
                continue;
            }

            let response = match RtspRequest::parse(&request_text) {
                Ok(mut request) => {
                    match request.content_length() {
                        Ok(0) => {}
                        Ok(len) if len > MAX_BODY_BYTES => {
                            tracing::warn!(
                                peer = %self.peer_addr,
                                content_length = len,
                                "request body too large"
                            );
                            let mut response = RtspResponse::request_too_large();
                            if let Some(cseq) = request.cseq() {
                                response = response.add_header("CSeq", cseq);
                            }
                            let _ = self
                                .writer
                                .lock()
                                .write_all(response.serialize().as_bytes());
                            return "protocol error";
                        }
                        Ok(len) => match self.read_body(len, running) {
                            Ok(body) => request.body = body,
                            Err(_) => return "read error",
                        },
                        Err(e) => {
                            tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                            return "protocol error";
                        }
                    }

                    tracing::debug!(
                        peer = %self.peer_addr,
                        method = %request.method,
                        uri = %request.uri,
                        version = %request.version,
                        "request"
                    );

                    let response = self.handler.handle(&request);

                    tracing::debug!(
                        peer = %self.peer_addr,
                        status = response.status_code,
                        "response"
                    );
                    response
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                    RtspResponse::bad_request()
                }
            };

            if self
                .writer
                .lock()
                .write_all(response.serialize().as_bytes())
                .is_err()
            {
                return "write error";
            }
        }

        "server shutting down"
    }

    /// Reads either a `$`-framed packet or a request header block.
    /// `Ok(None)` means the peer closed the connection.
    fn read_inbound(&mut self, running: &AtomicBool) -> io::Result<Option<Inbound>> {
        let first = loop {
            match self.reader.fill_buf() {
                Ok([]) => return Ok(None),
                Ok(buf) => break buf[0],
                Err(e) if is_timeout(&e) => {
                    if !running.load(Ordering::SeqCst) {
                        return Err(io::ErrorKind::Interrupted.into());
                    }
                }
                Err(e) => return Err(e),
            }
        };

        if first == b'$' {
            let mut header = [0u8; 4];
            self.read_exact_polling(&mut header, running)?;
            let len = u16::from_be_bytes([header[2], header[3]]) as usize;
            let mut data = vec![0u8; len];
            self.read_exact_polling(&mut data, running)?;
            return Ok(Some(Inbound::Interleaved {
                channel: header[1],
                data,
            }));
        }

        let mut raw = Vec::new();
        loop {
            let start = raw.len();
            match self.reader.read_until(b'\n', &mut raw) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    let line = &raw[start..];
                    if line == b"\r\n" || line == b"\n" {
                        break;
                    }
                }
                Err(e) if is_timeout(&e) => {
                    // read_until keeps the partial line in `raw`.
                    if !running.load(Ordering::SeqCst) {
                        return Err(io::ErrorKind::Interrupted.into());
                    }
                }
                Err(e) => return Err(e),
            }
            if raw.len() > MAX_HEADER_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request header too large",
                ));
            }
        }

        String::from_utf8(raw)
            .map(|text| Some(Inbound::Request(text)))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn read_body(&mut self, len: usize, running: &AtomicBool) -> io::Result<Vec<u8>> {
        if len > MAX_BODY_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request body too large",
            ));
        }
        let mut body = vec![0u8; len];
        self.read_exact_polling(&mut body, running)?;
        Ok(body)
    }

    /// `read_exact` that survives the poll timeout without losing bytes.
    fn read_exact_polling(&mut self, mut buf: &mut [u8], running: &AtomicBool) -> io::Result<()> {
        while !buf.is_empty() {
            match self.reader.read(buf) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => buf = &mut buf[n..],
                Err(e) if is_timeout(&e) => {
                    if !running.load(Ordering::SeqCst) {
                        return Err(io::ErrorKind::Interrupted.into());
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Release every session this connection created.
    fn cleanup(&self, session_manager: &SessionManager, streams: &StreamRegistry) {
        let orphaned = self.handler.session_ids().to_vec();
        if orphaned.is_empty() {
            return;
        }
        let removed = orphaned
            .iter()
            .filter(|id| session_manager.release(id, streams, "control connection closed"))
            .count();
        tracing::info!(peer = %self.peer_addr, removed, "cleaned up sessions on disconnect");
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// RTP and RTCP framed onto the RTSP control connection
/// (RFC 2326 §10.12): `$`, channel, 16-bit length, packet.
pub struct InterleavedSink {
    writer: SharedWriter,
    rtp_channel: u8,
    rtcp_channel: u8,
    frame: Vec<u8>,
}

impl InterleavedSink {
    pub fn new(writer: SharedWriter, rtp_channel: u8, rtcp_channel: u8) -> Self {
        InterleavedSink {
            writer,
            rtp_channel,
            rtcp_channel,
            frame: Vec::with_capacity(1500),
        }
    }

    fn send(&mut self, channel: u8, packet: &[u8]) -> io::Result<()> {
        let len = u16::try_from(packet.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "packet exceeds 65535 bytes"))?;
        self.frame.clear();
        self.frame.push(b'$');
        self.frame.push(channel);
        self.frame.extend_from_slice(&len.to_be_bytes());
        self.frame.extend_from_slice(packet);
        // One write per frame under the lock so responses never split a packet.
        self.writer.lock().write_all(&self.frame)
    }
}

impl RtpSink for InterleavedSink {
    fn send_rtp(&mut self, packet: &[u8]) -> io::Result<()> {
        self.send(self.rtp_channel, packet)
    }

    fn send_rtcp(&mut self, packet: &[u8]) -> io::Result<()> {
        self.send(self.rtcp_channel, packet)
    }
}
