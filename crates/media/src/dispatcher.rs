//! Ordered frame delivery to the host.
//!
//! One [`FrameDispatcher`] exists per instance. It checks that sequenced
//! frames arrive with contiguous indices and non-decreasing timestamps, that
//! a codec-config frame precedes the first key frame of a stream, and it
//! stops delivering once the host has rejected a frame.
//!
//! Delivery is split into [`FrameDispatcher::begin`] and
//! [`FrameDispatcher::finish`] so the host callback runs without the
//! dispatcher borrowed. A host may call back into its instance (play, seek,
//! reload) from inside the callback.

use common::{DisplayRect, EngineError, EngineResult};
use tracing::{debug, warn};

use crate::frame::{Frame, MediaFrame};
use crate::host::{FrameTarget, HostAdapter, HOST_ACCEPTED};

/// What the stream must see next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Expecting {
    CodecConfig,
    KeyFrame,
    Any,
}

/// Result of handing a frame to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// The host returned a non-zero status; dispatch is now halted.
    Rejected(i32),
    /// The stream was restarted (seek, codec change, reload) while the host
    /// held the frame, so its status no longer applies.
    Superseded(i32),
}

/// A frame that passed validation and is being delivered.
#[derive(Debug)]
#[must_use]
pub struct DispatchTicket {
    epoch: u64,
}

/// Hand `frame` to the matching adapter callback and return the host status.
pub fn deliver(adapter: &dyn HostAdapter, target: &FrameTarget<'_>, frame: &Frame) -> i32 {
    match frame {
        Frame::Media(media) => adapter.on_frame(target, media),
        Frame::Video(media) => adapter.on_video_frame(target, media),
        Frame::Image(image) => adapter.on_image_frame(target, image),
    }
}

#[derive(Debug)]
pub struct FrameDispatcher {
    session_id: String,
    instance_id: String,
    next_idx: Option<u64>,
    last_pts: Option<i64>,
    last_dts: Option<i64>,
    expecting: Expecting,
    has_codec_config: bool,
    halted: Option<i32>,
    delivered: u64,
    epoch: u64,
    in_flight: bool,
}

impl FrameDispatcher {
    pub fn new(session_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            instance_id: instance_id.into(),
            next_idx: None,
            last_pts: None,
            last_dts: None,
            expecting: Expecting::CodecConfig,
            has_codec_config: false,
            halted: None,
            delivered: 0,
            epoch: 0,
            in_flight: false,
        }
    }

    /// Host status that halted dispatch, if halted.
    pub fn halted(&self) -> Option<i32> {
        self.halted
    }

    /// Number of frames the host accepted.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Index the next sequenced frame must carry, once known.
    pub fn next_idx(&self) -> Option<u64> {
        self.next_idx
    }

    /// Validate `frame` and deliver it in one step.
    ///
    /// Protocol violations (index gap, timestamps going backwards, a frame
    /// before its codec config) are returned as `InvalidState` and the frame
    /// is not delivered. A host rejection is not an error of the frame: it
    /// is reported as [`DispatchOutcome::Rejected`].
    pub fn dispatch(
        &mut self,
        adapter: &dyn HostAdapter,
        rect: DisplayRect,
        frame: &Frame,
    ) -> EngineResult<DispatchOutcome> {
        let ticket = self.begin(frame)?;
        let target = FrameTarget {
            session_id: &self.session_id,
            instance_id: &self.instance_id,
            rect,
        };
        let status = deliver(adapter, &target, frame);
        Ok(self.finish(ticket, frame, status))
    }

    /// Validate `frame` and reserve delivery for it.
    ///
    /// Only one frame may be in flight; a second `begin` before `finish` is
    /// `InvalidState`.
    pub fn begin(&mut self, frame: &Frame) -> EngineResult<DispatchTicket> {
        if let Some(status) = self.halted {
            return Err(EngineError::invalid_state(format!(
                "dispatch for '{}' halted after host status {}",
                self.instance_id, status
            )));
        }
        if self.in_flight {
            return Err(EngineError::invalid_state(format!(
                "a frame for '{}' is already being delivered",
                self.instance_id
            )));
        }
        if let Some(media) = frame.media() {
            self.check_order(media)?;
        }
        self.in_flight = true;
        Ok(DispatchTicket { epoch: self.epoch })
    }

    /// Record the host status for the frame reserved by `ticket`.
    pub fn finish(&mut self, ticket: DispatchTicket, frame: &Frame, status: i32) -> DispatchOutcome {
        self.in_flight = false;
        if ticket.epoch != self.epoch {
            debug!(
                instance = %self.instance_id,
                kind = frame.kind(),
                status,
                "Stream restarted during delivery, ignoring host status"
            );
            return DispatchOutcome::Superseded(status);
        }

        if status != HOST_ACCEPTED {
            warn!(
                session = %self.session_id,
                instance = %self.instance_id,
                kind = frame.kind(),
                status,
                "Host rejected frame, halting dispatch"
            );
            self.halted = Some(status);
            return DispatchOutcome::Rejected(status);
        }

        if let Some(media) = frame.media() {
            self.advance(media);
        }
        self.delivered += 1;
        DispatchOutcome::Delivered
    }

    fn check_order(&self, frame: &MediaFrame) -> EngineResult<()> {
        if frame.idx == u64::MAX {
            return Err(EngineError::invalid_state(format!(
                "frame index {} on '{}' leaves no successor",
                frame.idx, self.instance_id
            )));
        }
        if let Some(expected) = self.next_idx {
            if frame.idx != expected {
                return Err(EngineError::invalid_state(format!(
                    "frame index gap on '{}': expected {}, got {}",
                    self.instance_id, expected, frame.idx
                )));
            }
        }

        if frame.is_codec_config {
            return Ok(());
        }
        match self.expecting {
            Expecting::CodecConfig => {
                return Err(EngineError::invalid_state(format!(
                    "frame {} on '{}' precedes its codec config",
                    frame.idx, self.instance_id
                )));
            }
            Expecting::KeyFrame if !frame.is_key_frame => {
                return Err(EngineError::invalid_state(format!(
                    "frame {} on '{}' is not the key frame the stream needs",
                    frame.idx, self.instance_id
                )));
            }
            _ => {}
        }

        if self.last_pts.is_some_and(|pts| frame.pts < pts)
            || self.last_dts.is_some_and(|dts| frame.dts < dts)
        {
            return Err(EngineError::invalid_state(format!(
                "frame {} on '{}' goes back in time (pts {}, dts {})",
                frame.idx, self.instance_id, frame.pts, frame.dts
            )));
        }
        Ok(())
    }

    fn advance(&mut self, frame: &MediaFrame) {
        self.next_idx = frame.idx.checked_add(1);
        if frame.is_codec_config {
            self.has_codec_config = true;
            self.expecting = Expecting::KeyFrame;
            return;
        }
        self.last_pts = Some(frame.pts);
        self.last_dts = Some(frame.dts);
        if frame.is_key_frame {
            self.expecting = Expecting::Any;
        }
    }

    /// Resume after a host rejection. Delivery restarts at a key frame.
    pub fn rearm(&mut self) {
        if self.halted.take().is_some() {
            debug!(instance = %self.instance_id, "Frame dispatch re-armed");
            self.restart_at_key_frame();
        }
    }

    /// Timestamps restart at the seek target and the next frame must be a
    /// key frame.
    pub fn seek(&mut self) {
        self.epoch += 1;
        self.halted = None;
        self.last_pts = None;
        self.last_dts = None;
        self.restart_at_key_frame();
    }

    /// The codec changed: a new codec config must come first.
    pub fn reset_stream(&mut self) {
        self.epoch += 1;
        self.has_codec_config = false;
        self.expecting = Expecting::CodecConfig;
    }

    /// Forget the stream entirely, as for a new load.
    pub fn reset(&mut self) {
        self.epoch += 1;
        self.next_idx = None;
        self.last_pts = None;
        self.last_dts = None;
        self.expecting = Expecting::CodecConfig;
        self.has_codec_config = false;
        self.halted = None;
        self.delivered = 0;
    }

    fn restart_at_key_frame(&mut self) {
        self.expecting = if self.has_codec_config {
            Expecting::KeyFrame
        } else {
            Expecting::CodecConfig
        };
    }
}
