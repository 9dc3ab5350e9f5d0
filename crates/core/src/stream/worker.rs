use std::sync::Arc;
use std::time::Duration;

use super::Stream;
use super::slot::{OwnedFrame, Work};
use crate::error::Result;
use crate::media::convert::{self, I420Picture};
use crate::media::encoder::{self, VideoEncoder};
use crate::media::{AccessUnit, pts90};

/// Encoder-side state that outlives encoder replacement, so presentation
/// timestamps stay continuous across a re-initialize.
struct Timeline {
    first_capture: Option<Duration>,
    since_keyframe: u32,
}

/// Encode loop for one stream. Runs until the slot is closed.
pub(super) fn run(stream: Arc<Stream>, mut encoder: Box<dyn VideoEncoder>) {
    let mut picture = I420Picture::default();
    let mut timeline = Timeline {
        first_capture: None,
        since_keyframe: 0,
    };
    tracing::debug!(stream = %stream.name, codec = %stream.codec, "encode worker started");

    loop {
        let frame = match stream.slot.take() {
            Work::Closed => break,
            Work::Encoder(replacement) => {
                encoder = replacement;
                tracing::debug!(stream = %stream.name, "encoder replaced");
                continue;
            }
            Work::Frame(frame) => frame,
        };

        match encode_one(&stream, encoder.as_mut(), &frame, &mut picture, &mut timeline) {
            Ok(Some(au)) => {
                stream.record_success();
                stream.fan_out(au);
            }
            Ok(None) => stream.record_skip(),
            Err(e) => stream.record_failure(&e),
        }
        stream.slot.recycle(frame.data);
    }

    tracing::debug!(stream = %stream.name, "encode worker exited");
}

fn encode_one(
    stream: &Stream,
    encoder: &mut dyn VideoEncoder,
    frame: &OwnedFrame,
    picture: &mut I420Picture,
    timeline: &mut Timeline,
) -> Result<Option<Arc<AccessUnit>>> {
    convert::to_i420(&frame.as_frame(), picture)?;

    let first = *timeline.first_capture.get_or_insert(frame.timestamp);
    let pts = pts90(frame.timestamp.saturating_sub(first));
    let force = stream.take_keyframe_request() || timeline.since_keyframe + 1 >= stream.config.gop;

    let Some(encoded) = encoder.encode(picture, pts, force)? else {
        timeline.since_keyframe = timeline.since_keyframe.saturating_add(1);
        return Ok(None);
    };

    let keyframe = encoded.keyframe || encoder::is_keyframe(stream.codec, &encoded.data);
    if keyframe {
        timeline.since_keyframe = 0;
        if stream.params.write().update(stream.codec, &encoded.data) {
            tracing::debug!(stream = %stream.name, "parameter sets updated");
        }
    } else {
        timeline.since_keyframe = timeline.since_keyframe.saturating_add(1);
    }

    tracing::trace!(
        stream = %stream.name,
        pts90 = pts,
        keyframe,
        bytes = encoded.data.len(),
        "access unit encoded"
    );

    Ok(Some(Arc::new(AccessUnit {
        data: encoded.data,
        capture: frame.timestamp,
        pts90: pts,
        keyframe,
    })))
}
