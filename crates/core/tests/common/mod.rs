//! Shared helpers for integration tests: fake encoders and a minimal RTSP client.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use rtsp_ingest::{
    Codec, EncodedFrame, EncoderFactory, EncoderSettings, I420Picture, Result, RtspError,
    VideoEncoder,
};

/// Emits a fixed-size H.264 access unit per picture. The first picture and
/// every forced one are keyframes carrying SPS and PPS ahead of the IDR slice.
pub struct FakeEncoder {
    pub idr_bytes: usize,
    pub slice_bytes: usize,
    pub started: bool,
}

impl FakeEncoder {
    pub fn new(idr_bytes: usize, slice_bytes: usize) -> Self {
        Self {
            idr_bytes,
            slice_bytes,
            started: false,
        }
    }
}

impl VideoEncoder for FakeEncoder {
    fn codec(&self) -> Codec {
        Codec::H264
    }

    fn encode(
        &mut self,
        _picture: &I420Picture,
        _pts90: u64,
        force_keyframe: bool,
    ) -> Result<Option<EncodedFrame>> {
        let keyframe = force_keyframe || !self.started;
        self.started = true;
        let mut data = Vec::new();
        if keyframe {
            data.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x42, 0xC0, 0x1F, 0xAA]);
            data.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80]);
            data.extend_from_slice(&[0, 0, 0, 1, 0x65]);
            data.resize(data.len() + self.idr_bytes, 0x11);
        } else {
            data.extend_from_slice(&[0, 0, 0, 1, 0x41]);
            data.resize(data.len() + self.slice_bytes, 0x22);
        }
        Ok(Some(EncodedFrame { data, keyframe }))
    }
}

/// H.265 counterpart of [`FakeEncoder`]: keyframes carry VPS, SPS and PPS
/// ahead of an IDR_W_RADL slice; other pictures are TRAIL_R slices.
pub struct FakeHevcEncoder {
    pub idr_bytes: usize,
    pub slice_bytes: usize,
    pub started: bool,
}

impl FakeHevcEncoder {
    pub fn new(idr_bytes: usize, slice_bytes: usize) -> Self {
        Self {
            idr_bytes,
            slice_bytes,
            started: false,
        }
    }
}

impl VideoEncoder for FakeHevcEncoder {
    fn codec(&self) -> Codec {
        Codec::H265
    }

    fn encode(
        &mut self,
        _picture: &I420Picture,
        _pts90: u64,
        force_keyframe: bool,
    ) -> Result<Option<EncodedFrame>> {
        let keyframe = force_keyframe || !self.started;
        self.started = true;
        let mut data = Vec::new();
        if keyframe {
            data.extend_from_slice(&[0, 0, 0, 1, 0x40, 0x01, 0x0C, 0x01, 0xFF]);
            data.extend_from_slice(&[0, 0, 0, 1, 0x42, 0x01, 0x01, 0x60, 0x90]);
            data.extend_from_slice(&[0, 0, 0, 1, 0x44, 0x01, 0xC1, 0x72]);
            data.extend_from_slice(&[0, 0, 0, 1, 0x26, 0x01]);
            data.resize(data.len() + self.idr_bytes, 0x11);
        } else {
            data.extend_from_slice(&[0, 0, 0, 1, 0x02, 0x01]);
            data.resize(data.len() + self.slice_bytes, 0x22);
        }
        Ok(Some(EncodedFrame { data, keyframe }))
    }
}

/// Fails every encode.
pub struct BrokenEncoder;

impl VideoEncoder for BrokenEncoder {
    fn codec(&self) -> Codec {
        Codec::H264
    }

    fn encode(&mut self, _: &I420Picture, _: u64, _: bool) -> Result<Option<EncodedFrame>> {
        Err(RtspError::Encode("injected failure".into()))
    }
}

/// Sleeps before each encode, to keep the worker busy.
pub struct SlowEncoder(pub Duration);

impl VideoEncoder for SlowEncoder {
    fn codec(&self) -> Codec {
        Codec::H264
    }

    fn encode(&mut self, _: &I420Picture, _: u64, keyframe: bool) -> Result<Option<EncodedFrame>> {
        std::thread::sleep(self.0);
        Ok(Some(EncodedFrame {
            data: vec![0, 0, 0, 1, if keyframe { 0x65 } else { 0x41 }, 0x01],
            keyframe,
        }))
    }
}

/// Factory for [`FakeEncoder`] that counts how many encoders it built.
pub struct CountingFactory {
    pub created: AtomicUsize,
    pub idr_bytes: usize,
}

impl CountingFactory {
    pub fn new(idr_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            created: AtomicUsize::new(0),
            idr_bytes,
        })
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl EncoderFactory for CountingFactory {
    fn create(&self, _settings: &EncoderSettings) -> Result<Box<dyn VideoEncoder>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeEncoder::new(self.idr_bytes, 200)))
    }
}

/// Hands out [`BrokenEncoder`]s until `healthy` is set.
#[derive(Default)]
pub struct ToggleFactory {
    pub healthy: AtomicBool,
}

impl EncoderFactory for ToggleFactory {
    fn create(&self, _settings: &EncoderSettings) -> Result<Box<dyn VideoEncoder>> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(Box::new(FakeEncoder::new(100, 50)))
        } else {
            Ok(Box::new(BrokenEncoder))
        }
    }
}

/// Tightly packed BGR24 test picture.
pub fn bgr_frame(width: u32, height: u32) -> Vec<u8> {
    vec![0x80; (width * height * 3) as usize]
}

pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Session id without the `;timeout=` suffix.
    pub fn session_id(&self) -> Option<String> {
        self.header("Session")
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_string())
    }
}

/// One `$`-framed packet read off the control connection.
#[derive(Debug, Clone)]
pub struct Interleaved {
    pub channel: u8,
    pub data: Vec<u8>,
}

/// Blocking RTSP client over one TCP connection. Interleaved packets that
/// arrive while waiting for a response are kept for [`next_packet`](Self::next_packet).
pub struct RtspClient {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
    cseq: u32,
    pending: Vec<Interleaved>,
}

impl RtspClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream =
            TcpStream::connect_timeout(&addr, Duration::from_secs(2)).expect("connect to server");
        stream
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        Self {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
            cseq: 0,
            pending: Vec::new(),
        }
    }

    pub fn request(&mut self, method: &str, uri: &str, headers: &[(&str, &str)]) -> Response {
        self.cseq += 1;
        let mut text = format!("{method} {uri} RTSP/1.0\r\nCSeq: {}\r\n", self.cseq);
        for (name, value) in headers {
            text.push_str(&format!("{name}: {value}\r\n"));
        }
        text.push_str("\r\n");
        self.writer.write_all(text.as_bytes()).unwrap();
        self.writer.flush().unwrap();

        loop {
            if self.peek_byte() == b'$' {
                let packet = self.read_interleaved();
                self.pending.push(packet);
                continue;
            }
            return self.read_response();
        }
    }

    /// Next interleaved packet, or `None` if nothing arrives within the
    /// socket read timeout.
    pub fn next_packet(&mut self) -> Option<Interleaved> {
        if !self.pending.is_empty() {
            return Some(self.pending.remove(0));
        }
        match self.reader.fill_buf() {
            Ok([]) | Err(_) => None,
            Ok(_) => Some(self.read_interleaved()),
        }
    }

    /// Next packet on `channel`, discarding others.
    pub fn next_on_channel(&mut self, channel: u8) -> Option<Vec<u8>> {
        loop {
            let packet = self.next_packet()?;
            if packet.channel == channel {
                return Some(packet.data);
            }
        }
    }

    fn peek_byte(&mut self) -> u8 {
        let buf = self.reader.fill_buf().expect("read from server");
        assert!(!buf.is_empty(), "server closed the connection");
        buf[0]
    }

    fn read_interleaved(&mut self) -> Interleaved {
        let mut header = [0u8; 4];
        self.reader.read_exact(&mut header).unwrap();
        assert_eq!(header[0], b'$');
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut data = vec![0u8; len];
        self.reader.read_exact(&mut data).unwrap();
        Interleaved {
            channel: header[1],
            data,
        }
    }

    fn read_response(&mut self) -> Response {
        let mut status_line = String::new();
        self.reader.read_line(&mut status_line).unwrap();
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| panic!("bad status line: {status_line:?}"));

        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).unwrap() == 0 {
                break;
            }
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((k, v)) = line.split_once(':') {
                headers.push((k.trim().to_string(), v.trim().to_string()));
            }
        }

        let mut response = Response {
            status,
            headers,
            body: String::new(),
        };
        if let Some(len) = response
            .header("Content-Length")
            .and_then(|v| v.parse::<usize>().ok())
        {
            let mut body = vec![0u8; len];
            self.reader.read_exact(&mut body).unwrap();
            response.body = String::from_utf8_lossy(&body).into_owned();
        }
        response
    }
}
