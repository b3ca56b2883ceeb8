//! Host adapter interface.
//!
//! The engine reports frames and state changes to the host through one
//! [`HostAdapter`] per session. Frame callbacks return an integer status:
//! `0` accepts the frame, anything else rejects it and halts dispatch for
//! the instance. Session-level traffic (application messages and page
//! lifecycle events) goes through the same adapter.

use std::sync::Arc;

use common::{DisplayRect, EngineError, EngineResult};
use serde::Serialize;

use crate::frame::{ImageFrame, MediaFrame};
use crate::instance::{MediaNetworkState, MediaReadyState};

/// Status a host returns for an accepted event.
pub const HOST_ACCEPTED: i32 = 0;

/// Where a frame is going.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameTarget<'a> {
    pub session_id: &'a str,
    pub instance_id: &'a str,
    /// Display geometry at emission time.
    pub rect: DisplayRect,
}

/// Observable playback state of one instance.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSnapshot {
    pub ready_state: MediaReadyState,
    pub network_state: MediaNetworkState,
    pub paused: bool,
    pub seeking: bool,
    pub duration: f64,
    pub current_time: f64,
    pub video_width: u32,
    pub video_height: u32,
    pub visible: bool,
}

/// Page lifecycle notification for a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageEvent {
    Load,
    AddressBarChanged { url: String },
    TitleChanged { title: String },
    Close,
}

impl PageEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PageEvent::Load => "onPageLoad",
            PageEvent::AddressBarChanged { .. } => "onAddressBarChanged",
            PageEvent::TitleChanged { .. } => "onTitleChanged",
            PageEvent::Close => "onPageClose",
        }
    }
}

/// Receives engine events for one session.
pub trait HostAdapter: Send + Sync {
    /// A frame of a combined audio/video stream.
    fn on_frame(&self, target: &FrameTarget<'_>, frame: &MediaFrame) -> i32;

    /// A video frame of a split-stream delivery.
    fn on_video_frame(&self, target: &FrameTarget<'_>, frame: &MediaFrame) -> i32 {
        self.on_frame(target, frame)
    }

    /// A UI image of a split-stream delivery.
    fn on_image_frame(&self, _target: &FrameTarget<'_>, _frame: &ImageFrame) -> i32 {
        HOST_ACCEPTED
    }

    /// Pushed after a change of the instance's playback state.
    fn on_state_changed(&self, _session_id: &str, _instance_id: &str, _state: &PlaybackSnapshot) {}

    /// An application message addressed to the session. Returns the reply.
    fn on_message(&self, _session_id: &str, _message: &str) -> EngineResult<String> {
        Err(EngineError::not_supported("host does not handle application messages"))
    }

    fn on_page_event(&self, _session_id: &str, _event: &PageEvent) -> EngineResult<()> {
        Ok(())
    }
}

/// Supplies the adapter for a session created on first reference.
pub trait HostAdapterProvider: Send + Sync {
    fn adapter_for(&self, session_id: &str) -> Arc<dyn HostAdapter>;
}

impl<F> HostAdapterProvider for F
where
    F: Fn(&str) -> Arc<dyn HostAdapter> + Send + Sync,
{
    fn adapter_for(&self, session_id: &str) -> Arc<dyn HostAdapter> {
        self(session_id)
    }
}

/// Adapter that accepts and drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullHostAdapter;

impl HostAdapter for NullHostAdapter {
    fn on_frame(&self, _target: &FrameTarget<'_>, _frame: &MediaFrame) -> i32 {
        HOST_ACCEPTED
    }
}
