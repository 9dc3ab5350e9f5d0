//! Single-slot, latest-wins handoff between producers and the encode worker.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, RtspError};
use crate::media::encoder::VideoEncoder;
use crate::media::frame::{Frame, PixelFormat};

/// Buffers kept around for reuse once the worker is done with them.
const SPARE_BUFFERS: usize = 2;

/// A frame whose pixels the stream owns.
#[derive(Debug)]
pub struct OwnedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub stride: Option<usize>,
    pub timestamp: Duration,
}

impl OwnedFrame {
    pub fn as_frame(&self) -> Frame<'_> {
        Frame {
            data: &self.data,
            width: self.width,
            height: self.height,
            format: self.format,
            stride: self.stride,
            timestamp: self.timestamp,
        }
    }
}

/// What the worker should do next.
pub enum Work {
    Frame(OwnedFrame),
    /// Swap in a rebuilt encoder, pushed by a re-initialize of a degraded stream.
    Encoder(Box<dyn VideoEncoder>),
    Closed,
}

/// Outcome of a successful [`FrameSlot::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// An older pending frame was overwritten and is lost.
    Replaced,
}

struct SlotState {
    pending: Option<OwnedFrame>,
    spare: Vec<Vec<u8>>,
    replacement: Option<Box<dyn VideoEncoder>>,
    closed: bool,
    last_accepted: Option<Duration>,
    locked_dims: Option<(u32, u32)>,
}

pub struct FrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl FrameSlot {
    /// `dims` pins the accepted geometry up front; `None` locks it from
    /// the first accepted frame.
    pub fn new(dims: Option<(u32, u32)>) -> Self {
        Self {
            state: Mutex::new(SlotState {
                pending: None,
                spare: Vec::new(),
                replacement: None,
                closed: false,
                last_accepted: None,
                locked_dims: dims,
            }),
            ready: Condvar::new(),
        }
    }

    /// Copy `frame` into the slot.
    ///
    /// Waits at most `wait` for the slot lock. Geometry is checked before
    /// the lock is taken; ordering and locked dimensions under it.
    pub fn offer(&self, stream: &str, frame: &Frame<'_>, wait: Duration) -> Result<Offer> {
        let len = frame.validate()?;

        let mut state = self
            .state
            .try_lock_for(wait)
            .ok_or_else(|| RtspError::SlotBusy(stream.to_string()))?;

        if state.closed {
            return Err(RtspError::StreamStopped(stream.to_string()));
        }
        if let Some(last) = state.last_accepted
            && frame.timestamp <= last
        {
            return Err(RtspError::OutOfOrder {
                stream: stream.to_string(),
                timestamp: frame.timestamp,
                last,
            });
        }
        match state.locked_dims {
            Some((w, h)) if (w, h) != (frame.width, frame.height) => {
                return Err(RtspError::InvalidFrame(format!(
                    "{}x{} does not match stream geometry {w}x{h}",
                    frame.width, frame.height
                )));
            }
            Some(_) => {}
            None => state.locked_dims = Some((frame.width, frame.height)),
        }

        let mut data = state.spare.pop().unwrap_or_default();
        data.clear();
        data.extend_from_slice(&frame.data[..len]);

        let owned = OwnedFrame {
            data,
            width: frame.width,
            height: frame.height,
            format: frame.format,
            stride: frame.stride,
            timestamp: frame.timestamp,
        };
        state.last_accepted = Some(frame.timestamp);

        let outcome = match state.pending.replace(owned) {
            Some(old) => {
                if state.spare.len() < SPARE_BUFFERS {
                    state.spare.push(old.data);
                }
                Offer::Replaced
            }
            None => Offer::Queued,
        };
        drop(state);
        self.ready.notify_one();
        Ok(outcome)
    }

    /// Block until there is work for the encode worker.
    pub fn take(&self) -> Work {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Work::Closed;
            }
            if let Some(encoder) = state.replacement.take() {
                return Work::Encoder(encoder);
            }
            if let Some(frame) = state.pending.take() {
                return Work::Frame(frame);
            }
            self.ready.wait(&mut state);
        }
    }

    /// Hand a consumed frame's buffer back for reuse.
    pub fn recycle(&self, buffer: Vec<u8>) {
        let mut state = self.state.lock();
        if state.spare.len() < SPARE_BUFFERS {
            state.spare.push(buffer);
        }
    }

    pub fn replace_encoder(&self, encoder: Box<dyn VideoEncoder>) {
        self.state.lock().replacement = Some(encoder);
        self.ready.notify_one();
    }

    /// Wake the worker for the last time. Pending work is discarded.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending = None;
        state.replacement = None;
        drop(state);
        self.ready.notify_all();
    }

    /// Capture timestamp of the newest frame accepted so far.
    pub fn last_accepted(&self) -> Option<Duration> {
        self.state.lock().last_accepted
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.state.lock().locked_dims
    }
}
