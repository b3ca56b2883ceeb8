//! Decoded frames delivered to the host.

use bytes::Bytes;

/// A decoded audio/video frame.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaFrame {
    /// Carries decoder initialization data rather than presentable media.
    pub is_codec_config: bool,
    pub is_key_frame: bool,
    /// Sequence index, strictly increasing per instance.
    pub idx: u64,
    /// Presentation timestamp, in stream ticks.
    pub pts: i64,
    /// Decode timestamp, in stream ticks.
    pub dts: i64,
    pub payload: Bytes,
}

impl MediaFrame {
    pub fn codec_config(idx: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            is_codec_config: true,
            is_key_frame: false,
            idx,
            pts: 0,
            dts: 0,
            payload: payload.into(),
        }
    }

    pub fn key(idx: u64, pts: i64, dts: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            is_codec_config: false,
            is_key_frame: true,
            idx,
            pts,
            dts,
            payload: payload.into(),
        }
    }

    pub fn delta(idx: u64, pts: i64, dts: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            is_key_frame: false,
            ..Self::key(idx, pts, dts, payload)
        }
    }
}

/// A composited UI image, optionally with a separate alpha plane.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageFrame {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    /// Full frame rather than a partial update of the given region.
    pub is_frame: bool,
    pub image: Bytes,
    pub alpha: Option<Bytes>,
}

/// Anything the dispatcher can deliver.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// Combined audio/video stream, delivered through `on_frame`.
    Media(MediaFrame),
    /// Video of a split-stream delivery, through `on_video_frame`.
    Video(MediaFrame),
    /// UI image of a split-stream delivery, through `on_image_frame`.
    Image(ImageFrame),
}

impl Frame {
    /// The sequenced part of the frame, if it has one.
    pub fn media(&self) -> Option<&MediaFrame> {
        match self {
            Frame::Media(frame) | Frame::Video(frame) => Some(frame),
            Frame::Image(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Media(_) => "media",
            Frame::Video(_) => "video",
            Frame::Image(_) => "image",
        }
    }
}
