use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp;
use crate::session::delivery::handle_rtcp;
use crate::session::transport::{TransportHeader, TransportRejection};
use crate::session::{Session, SessionManager, SessionState, Transport};
use crate::stream::{Stream, StreamRegistry};
use crate::transport::tcp::SharedWriter;
use crate::transport::{InterleavedSink, RtpSink, UdpSink};

/// Interleaved channel pair owned by one session on this connection.
struct ChannelPair {
    rtp: u8,
    rtcp: u8,
    session_id: String,
}

/// Handles RTSP method requests for a single TCP connection.
///
/// Tracks which sessions were created on this connection so they
/// can be cleaned up when the connection drops.
pub struct MethodHandler {
    session_manager: SessionManager,
    streams: StreamRegistry,
    client_addr: SocketAddr,
    config: Arc<ServerConfig>,
    /// Control connection writer, needed for interleaved transport.
    writer: Option<SharedWriter>,
    /// Session IDs created during this connection, for cleanup on disconnect.
    session_ids: Vec<String>,
    channels: Vec<ChannelPair>,
}

impl MethodHandler {
    pub fn new(
        session_manager: SessionManager,
        client_addr: SocketAddr,
        streams: StreamRegistry,
        config: Arc<ServerConfig>,
        writer: Option<SharedWriter>,
    ) -> Self {
        MethodHandler {
            session_manager,
            streams,
            client_addr,
            config,
            writer,
            session_ids: Vec::new(),
            channels: Vec::new(),
        }
    }

    /// Returns session IDs owned by this connection (for cleanup on disconnect).
    pub fn session_ids(&self) -> &[String] {
        &self.session_ids
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");

        // Any request on the owning connection keeps its sessions alive.
        for id in &self.session_ids {
            if let Some(session) = self.session_manager.get_session(id) {
                session.touch();
            }
        }

        match request.method.as_str() {
            "OPTIONS" => self.handle_options(cseq),
            "DESCRIBE" => self.handle_describe(cseq, &request.uri),
            "SETUP" => self.handle_setup(cseq, request),
            "PLAY" => self.handle_play(cseq, request),
            "PAUSE" => self.handle_pause(cseq, request),
            "TEARDOWN" => self.handle_teardown(cseq, request),
            "GET_PARAMETER" => self.handle_get_parameter(cseq, request),
            _ => {
                tracing::warn!(method = %request.method, %cseq, "unsupported RTSP method");
                RtspResponse::not_implemented().add_header("CSeq", cseq)
            }
        }
    }

    /// A `$`-framed packet from the client. RTCP on a session's odd channel
    /// is parsed; anything on a known channel refreshes liveness.
    pub fn handle_interleaved(&self, channel: u8, data: &[u8]) {
        let Some(pair) = self
            .channels
            .iter()
            .find(|p| p.rtp == channel || p.rtcp == channel)
        else {
            tracing::trace!(channel, "interleaved data on unknown channel");
            return;
        };
        let Some(session) = self.session_manager.get_session(&pair.session_id) else {
            return;
        };
        if channel == pair.rtcp {
            handle_rtcp(&session, data);
        } else {
            session.touch();
        }
    }

    fn handle_options(&self, cseq: &str) -> RtspResponse {
        tracing::debug!(%cseq, "OPTIONS");
        RtspResponse::ok().add_header("CSeq", cseq).add_header(
            "Public",
            "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER",
        )
    }

    /// Parses host from an RTSP URI (e.g. rtsp://host:8554/path -> host). Falls back to client IP if invalid.
    fn host_from_uri_or_client(&self, uri: &str) -> String {
        if let Some(host) = &self.config.public_host {
            return host.clone();
        }

        if let Some(after_scheme) = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
        {
            let authority = after_scheme.split('/').next().unwrap_or("");
            let host = match authority.strip_prefix('[') {
                Some(v6) => v6.split(']').next().unwrap_or(""),
                None => authority.split(':').next().unwrap_or(""),
            }
            .trim();
            if !host.is_empty() {
                return host.to_string();
            }
        }
        self.client_addr.ip().to_string()
    }

    fn resolve_stream(&self, uri: &str) -> Option<Arc<Stream>> {
        let stream = self.streams.resolve_from_uri(uri);
        if stream.is_none() {
            tracing::warn!(uri, "request for unknown stream");
        }
        stream
    }

    fn handle_describe(&self, cseq: &str, uri: &str) -> RtspResponse {
        tracing::debug!(%cseq, uri, "DESCRIBE");

        let Some(stream) = self.resolve_stream(uri) else {
            return RtspResponse::not_found().add_header("CSeq", cseq);
        };

        let host = self.host_from_uri_or_client(uri);
        let sdp = sdp::generate_sdp(&stream, &host, &self.config);

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &format!("{}/", uri.trim_end_matches('/')))
            .with_body(sdp)
    }

    fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(stream) = self.resolve_stream(&request.uri) else {
            return RtspResponse::not_found().add_header("CSeq", cseq);
        };

        if let Some(id) = request.session_id() {
            // One track per stream, so a second SETUP in a session has nothing to add.
            return if self.session_manager.get_session(id).is_some() {
                tracing::warn!(session_id = id, "SETUP for already configured session");
                RtspResponse::aggregate_not_allowed().add_header("CSeq", cseq)
            } else {
                RtspResponse::session_not_found().add_header("CSeq", cseq)
            };
        }

        let Some(transport_header) = request.get_header("Transport") else {
            tracing::warn!(%cseq, "SETUP missing Transport header");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };

        let requested = match TransportHeader::parse(transport_header) {
            Ok(t) => t,
            Err(TransportRejection::Unsupported) => {
                tracing::warn!(%cseq, transport = transport_header, "unsupported transport requested");
                return RtspResponse::unsupported_transport()
                    .add_header("CSeq", cseq)
                    .add_header("Unsupported", "multicast");
            }
            Err(TransportRejection::Malformed) => {
                tracing::warn!(%cseq, transport = transport_header, "SETUP invalid Transport header");
                return RtspResponse::bad_request().add_header("CSeq", cseq);
            }
        };

        let session = self
            .session_manager
            .create_session(&request.uri, stream.name(), &self.config);

        let (transport, sink) = match self.open_transport(&session, requested) {
            Ok(opened) => opened,
            Err(response) => {
                self.session_manager.remove_session(&session.id);
                return response.add_header("CSeq", cseq);
            }
        };

        let packetizer = stream.codec().packetizer(
            stream.payload_type(),
            session.ssrc,
            rand::random::<u16>(),
            self.config.mtu,
        );
        let transport_response = transport.response_header(session.ssrc);
        if let Err(e) = session.attach(transport, packetizer, sink, &self.config) {
            tracing::error!(session_id = %session.id, error = %e, "failed to start delivery");
            self.channels.retain(|p| p.session_id != session.id);
            self.session_manager.remove_session(&session.id);
            return RtspResponse::internal_error().add_header("CSeq", cseq);
        }

        stream.subscribe(session.clone());
        self.session_ids.push(session.id.clone());

        tracing::info!(
            session_id = %session.id,
            stream = %stream.name(),
            uri = %request.uri,
            peer = %self.client_addr,
            transport = %transport_response,
            "session created via SETUP"
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Transport", &transport_response)
            .add_header("Session", &session.session_header_value())
    }

    /// Bind UDP ports or claim interleaved channels for a new session.
    fn open_transport(
        &mut self,
        session: &Session,
        requested: TransportHeader,
    ) -> Result<(Transport, Box<dyn RtpSink>), RtspResponse> {
        match requested {
            TransportHeader::Udp {
                client_rtp_port,
                client_rtcp_port,
            } => {
                let pair = self.session_manager.ports().bind_pair().map_err(|e| {
                    tracing::error!(error = %e, "failed to allocate server ports");
                    RtspResponse::internal_error()
                })?;
                let client_ip = self.client_addr.ip();
                let sink = UdpSink::new(pair, client_ip, client_rtp_port, client_rtcp_port)
                    .map_err(|_| RtspResponse::internal_error())?;
                let (server_rtp_port, server_rtcp_port) = sink
                    .server_ports()
                    .map_err(|_| RtspResponse::internal_error())?;
                Ok((
                    Transport::Udp {
                        client_ip,
                        client_rtp_port,
                        client_rtcp_port,
                        server_rtp_port,
                        server_rtcp_port,
                    },
                    Box::new(sink),
                ))
            }
            TransportHeader::Interleaved { channels } => {
                let Some(writer) = self.writer.clone() else {
                    return Err(RtspResponse::unsupported_transport());
                };
                let Some((rtp, rtcp)) = channels.or_else(|| self.next_free_channels()) else {
                    tracing::warn!("no free interleaved channel pair");
                    return Err(RtspResponse::unsupported_transport());
                };
                if self
                    .channels
                    .iter()
                    .any(|p| [p.rtp, p.rtcp].iter().any(|c| *c == rtp || *c == rtcp))
                {
                    tracing::warn!(rtp, rtcp, "interleaved channels already in use");
                    return Err(RtspResponse::unsupported_transport());
                }
                self.channels.push(ChannelPair {
                    rtp,
                    rtcp,
                    session_id: session.id.clone(),
                });
                Ok((
                    Transport::Interleaved {
                        rtp_channel: rtp,
                        rtcp_channel: rtcp,
                    },
                    Box::new(InterleavedSink::new(writer, rtp, rtcp)),
                ))
            }
        }
    }

    /// Lowest even/odd channel pair no session on this connection uses.
    fn next_free_channels(&self) -> Option<(u8, u8)> {
        let in_use = |c: u8| self.channels.iter().any(|p| p.rtp == c || p.rtcp == c);
        (0..=u8::MAX / 2)
            .map(|n| (n * 2, n * 2 + 1))
            .find(|&(rtp, rtcp)| !in_use(rtp) && !in_use(rtcp))
    }

    /// Session named by the request, or the error response to send instead.
    /// A request with no `Session` header targets the Init state.
    fn lookup_session(&self, cseq: &str, request: &RtspRequest) -> Result<Arc<Session>, RtspResponse> {
        let Some(id) = request.session_id() else {
            tracing::warn!(%cseq, method = %request.method, "missing Session header");
            return Err(RtspResponse::method_not_valid().add_header("CSeq", cseq));
        };
        match self.session_manager.get_session(id) {
            Some(session) if session.state() != SessionState::Terminated => {
                session.touch();
                Ok(session)
            }
            _ => {
                tracing::warn!(session_id = id, method = %request.method, "unknown session");
                Err(RtspResponse::session_not_found().add_header("CSeq", cseq))
            }
        }
    }

    fn handle_play(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let session = match self.lookup_session(cseq, request) {
            Ok(s) => s,
            Err(response) => return response,
        };
        if session.state() == SessionState::Init {
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }
        let Some(stream) = self.streams.get(&session.stream) else {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        session.play(stream.last_accepted());
        stream.request_keyframe();
        tracing::info!(session_id = %session.id, stream = %stream.name(), "session started playing");

        let rtp_info = format!(
            "url={};seq={};rtptime={}",
            session.uri,
            session.next_sequence(),
            session.rtp_timestamp(stream.last_pts90())
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
            .add_header("Range", "npt=0.000-")
            .add_header("RTP-Info", &rtp_info)
    }

    fn handle_pause(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let session = match self.lookup_session(cseq, request) {
            Ok(s) => s,
            Err(response) => return response,
        };
        if session.state() == SessionState::Init {
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }
        session.pause();
        tracing::info!(session_id = %session.id, "session paused");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
    }

    fn handle_teardown(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session_id) = request.session_id().map(str::to_string) else {
            tracing::warn!(%cseq, "TEARDOWN missing Session header");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        if self
            .session_manager
            .release(&session_id, &self.streams, "TEARDOWN")
        {
            self.session_ids.retain(|id| id != &session_id);
            self.channels.retain(|p| p.session_id != session_id);
            RtspResponse::ok().add_header("CSeq", cseq)
        } else {
            tracing::warn!(session_id, "TEARDOWN for unknown session");
            RtspResponse::session_not_found().add_header("CSeq", cseq)
        }
    }

    /// GET_PARAMETER is used by clients (e.g. VLC) as a keepalive (RFC 2326 §10.8).
    fn handle_get_parameter(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(%cseq, "GET_PARAMETER keepalive");

        let mut resp = RtspResponse::ok().add_header("CSeq", cseq);

        if let Some(id) = request.session_id()
            && let Some(session) = self.session_manager.get_session(id)
        {
            session.touch();
            resp = resp.add_header("Session", &session.session_header_value());
        }

        resp
    }
}
