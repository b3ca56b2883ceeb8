//! Media playback control plane.
//!
//! This crate provides:
//! - Time ranges with MSE merge and removal semantics
//! - Source buffers and the segment append engine
//! - Media instances (load, play/pause/seek, ready and network state)
//! - Ordered frame dispatch to a host adapter

pub mod demux;
pub mod dispatcher;
pub mod frame;
pub mod host;
pub mod instance;
pub mod loader;
pub mod source_buffer;
pub mod time_ranges;

pub use demux::{CodedSample, DemuxError, RawSampleDemuxer, SegmentDemuxer};
pub use dispatcher::{DispatchOutcome, DispatchTicket, FrameDispatcher};
pub use frame::{Frame, ImageFrame, MediaFrame};
pub use host::{
    FrameTarget, HostAdapter, HostAdapterProvider, NullHostAdapter, PageEvent, PlaybackSnapshot,
    HOST_ACCEPTED,
};
pub use instance::{InstanceSettings, MediaInstance, MediaNetworkState, MediaReadyState};
pub use loader::{parse_media_url, LoadError, LoadTicket, LoadedMedia, MediaLoader};
pub use source_buffer::{AppendMode, AppendRequest, AppendWindow, SourceBuffer, MSE_VIDEO_BUFFER_SIZE};
pub use time_ranges::{BufferedArrays, TimeRange, TimeRanges};
