//! Media instance: one playback element.
//!
//! A [`MediaInstance`] holds the load target, the playback control state
//! (paused, seeking, current time, duration), the network and ready states,
//! the display geometry and the source buffers feeding it. It also owns the
//! frame dispatcher, so frames for one instance are delivered in order.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use url::Url;

use common::{DisplayRect, EngineError, EngineResult};

use crate::demux::SegmentDemuxer;
use crate::dispatcher::{deliver, DispatchOutcome, FrameDispatcher};
use crate::frame::Frame;
use crate::host::{FrameTarget, HostAdapter, PlaybackSnapshot};
use crate::loader::{parse_media_url, LoadError, LoadTicket, LoadedMedia, MediaLoader};
use crate::source_buffer::{AppendMode, AppendRequest, SourceBuffer, MSE_VIDEO_BUFFER_SIZE};
use crate::time_ranges::{TimeRange, TimeRanges};

/// Per-instance limits and thresholds.
#[derive(Clone, Debug)]
pub struct InstanceSettings {
    /// Most buffered ranges one source buffer may report.
    pub max_buffered_ranges: usize,
    /// Seconds buffered ahead of the playhead for `HaveFutureData`.
    pub future_data_threshold: f64,
    /// Seconds buffered ahead of the playhead for `HaveEnoughData`.
    pub enough_data_threshold: f64,
    /// Accepted container types, without codec parameters.
    pub supported_mime_types: Vec<String>,
    /// Push a snapshot to the host after each state change.
    pub notify_state_changes: bool,
}

impl InstanceSettings {
    /// Check a source buffer type. Parameters after `;` are ignored.
    pub fn is_type_supported(&self, mime_type: &str) -> bool {
        let essence = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.supported_mime_types.iter().any(|t| *t == essence)
    }
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            max_buffered_ranges: MSE_VIDEO_BUFFER_SIZE,
            future_data_threshold: 0.1,
            enough_data_threshold: 5.0,
            supported_mime_types: vec![
                "video/mp4".to_string(),
                "audio/mp4".to_string(),
                "video/webm".to_string(),
                "audio/webm".to_string(),
            ],
            notify_state_changes: true,
        }
    }
}

/// Media ready state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaReadyState {
    /// No information about media.
    HaveNothing = 0,
    /// Metadata available.
    HaveMetadata = 1,
    /// Current frame available.
    HaveCurrentData = 2,
    /// Some data ahead of the playhead.
    HaveFutureData = 3,
    /// Enough data for playback.
    HaveEnoughData = 4,
}

impl MediaReadyState {
    pub fn code(&self) -> i32 {
        *self as i32
    }
}

/// Media network state.
///
/// The discriminants are the host wire codes. A failed load is reported as
/// the network-error code, the only way this engine ends up without a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaNetworkState {
    /// Nothing loaded.
    Empty = 0,
    /// A load is in flight.
    Loading = 2,
    /// The load completed.
    Loaded = 3,
    /// The loader failed.
    NoSource = 5,
}

impl MediaNetworkState {
    pub fn code(&self) -> i32 {
        *self as i32
    }
}

#[derive(Clone, Copy, Debug)]
struct PlaybackState {
    paused: bool,
    seeking: bool,
    current_time: f64,
    seek_target: Option<f64>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            paused: true,
            seeking: false,
            current_time: 0.0,
            seek_target: None,
        }
    }
}

#[derive(Debug, Default)]
struct LoadSlot {
    generation: u64,
    task: Option<AbortHandle>,
}

impl LoadSlot {
    fn cancel_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// One playback element of a session.
pub struct MediaInstance {
    session_id: String,
    id: String,
    settings: Arc<InstanceSettings>,
    adapter: Arc<dyn HostAdapter>,
    /// Load target.
    url: RwLock<Option<Url>>,
    /// Paused/seeking/current time, updated together.
    playback: RwLock<PlaybackState>,
    /// Duration in seconds, NaN while unknown.
    duration: RwLock<f64>,
    network_state: RwLock<MediaNetworkState>,
    ready_state: RwLock<MediaReadyState>,
    video_size: RwLock<(u32, u32)>,
    rect: RwLock<DisplayRect>,
    visible: RwLock<bool>,
    error: RwLock<Option<EngineError>>,
    source_buffers: RwLock<IndexMap<String, Arc<SourceBuffer>>>,
    /// Buffered ranges of a direct URL load, reported by the decoder.
    implicit_buffered: RwLock<TimeRanges>,
    /// Set once media data was appended since the last load.
    has_media_data: RwLock<bool>,
    load: Mutex<LoadSlot>,
    dispatcher: Mutex<FrameDispatcher>,
    closed: RwLock<bool>,
}

impl std::fmt::Debug for MediaInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaInstance")
            .field("session_id", &self.session_id)
            .field("id", &self.id)
            .field("network_state", &self.network_state())
            .field("ready_state", &self.ready_state())
            .finish_non_exhaustive()
    }
}

impl MediaInstance {
    /// Create an idle instance reporting to `adapter`.
    pub fn new(
        session_id: impl Into<String>,
        id: impl Into<String>,
        settings: Arc<InstanceSettings>,
        adapter: Arc<dyn HostAdapter>,
    ) -> Self {
        let session_id = session_id.into();
        let id = id.into();
        Self {
            dispatcher: Mutex::new(FrameDispatcher::new(session_id.clone(), id.clone())),
            session_id,
            id,
            settings,
            adapter,
            url: RwLock::new(None),
            playback: RwLock::new(PlaybackState::default()),
            duration: RwLock::new(f64::NAN),
            network_state: RwLock::new(MediaNetworkState::Empty),
            ready_state: RwLock::new(MediaReadyState::HaveNothing),
            video_size: RwLock::new((0, 0)),
            rect: RwLock::new(DisplayRect::ZERO),
            visible: RwLock::new(true),
            error: RwLock::new(None),
            source_buffers: RwLock::new(IndexMap::new()),
            implicit_buffered: RwLock::new(TimeRanges::new()),
            has_media_data: RwLock::new(false),
            load: Mutex::new(LoadSlot::default()),
            closed: RwLock::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    // Loading

    /// Start loading `url`.
    ///
    /// Any previous load is cancelled and the instance is reset. A target
    /// that is not a valid URL is rejected before anything changes. With a
    /// loader, the fetch runs on the ambient tokio runtime; without one the
    /// instance stays `Loading` until [`finish_load`](Self::finish_load).
    pub fn load(
        self: &Arc<Self>,
        url: &str,
        loader: Option<Arc<dyn MediaLoader>>,
    ) -> EngineResult<LoadTicket> {
        let runtime = match loader {
            Some(_) => Some(tokio::runtime::Handle::try_current().map_err(|_| {
                EngineError::invalid_state("media loader needs a tokio runtime")
            })?),
            None => None,
        };

        let parsed = parse_media_url(url).map_err(|err| {
            let err = EngineError::from(err);
            warn!(instance = %self.id, %err, "Rejected load target");
            err
        })?;

        let mut slot = self.load.lock();
        slot.cancel_task();
        slot.generation += 1;
        let ticket = LoadTicket(slot.generation);
        self.reset_media();

        *self.url.write() = Some(parsed.clone());
        *self.network_state.write() = MediaNetworkState::Loading;

        if let (Some(loader), Some(runtime)) = (loader, runtime) {
            let instance = Arc::clone(self);
            let task = runtime.spawn(async move {
                let result = loader.fetch(&parsed).await;
                instance.complete_load(ticket, result);
            });
            slot.task = Some(task.abort_handle());
        }
        drop(slot);

        info!(session = %self.session_id, instance = %self.id, url, "Loading media");
        self.notify();
        Ok(ticket)
    }

    /// Apply the outcome of the load identified by `ticket`.
    ///
    /// Returns `false` when the load was superseded or cancelled meanwhile.
    pub fn complete_load(&self, ticket: LoadTicket, result: Result<LoadedMedia, LoadError>) -> bool {
        let mut slot = self.load.lock();
        if slot.generation != ticket.0 || self.network_state() != MediaNetworkState::Loading {
            debug!(instance = %self.id, "Ignoring stale load completion");
            return false;
        }
        slot.task = None;

        match result {
            Ok(media) => {
                *self.network_state.write() = MediaNetworkState::Loaded;
                if let Some(duration) = media.duration {
                    *self.duration.write() = duration;
                }
                if media.video_width > 0 && media.video_height > 0 {
                    *self.video_size.write() = (media.video_width, media.video_height);
                }
                self.raise_ready_state(MediaReadyState::HaveMetadata);
                info!(instance = %self.id, "Media loaded");
            }
            Err(err) => {
                warn!(instance = %self.id, %err, "Media load failed");
                *self.network_state.write() = MediaNetworkState::NoSource;
                *self.error.write() = Some(err.into());
            }
        }
        drop(slot);
        self.notify();
        true
    }

    /// Complete the current load from the decoder side.
    pub fn finish_load(&self, result: Result<LoadedMedia, LoadError>) -> bool {
        let ticket = LoadTicket(self.load.lock().generation);
        self.complete_load(ticket, result)
    }

    /// Cancel an in-flight load and return to `Empty`.
    ///
    /// Everything the load set up (source buffers, buffered data, duration,
    /// playback position) is discarded. Returns `false`, changing nothing,
    /// when no load is in flight.
    pub fn cancel_load(&self) -> bool {
        let mut slot = self.load.lock();
        if self.network_state() != MediaNetworkState::Loading {
            return false;
        }
        slot.cancel_task();
        slot.generation += 1;
        self.reset_media();
        *self.url.write() = None;
        *self.network_state.write() = MediaNetworkState::Empty;
        drop(slot);

        info!(instance = %self.id, "Load cancelled");
        self.notify();
        true
    }

    fn reset_media(&self) {
        for (_, sb) in self.source_buffers.write().drain(..) {
            sb.abort();
        }
        self.implicit_buffered.write().clear();
        *self.has_media_data.write() = false;
        *self.playback.write() = PlaybackState::default();
        *self.duration.write() = f64::NAN;
        *self.ready_state.write() = MediaReadyState::HaveNothing;
        *self.video_size.write() = (0, 0);
        *self.error.write() = None;
        self.dispatcher.lock().reset();
    }

    // Playback control

    fn ensure_loaded(&self) -> EngineResult<()> {
        if self.network_state() == MediaNetworkState::Empty {
            return Err(EngineError::invalid_state(format!(
                "no media loaded on instance '{}'",
                self.id
            )));
        }
        Ok(())
    }

    /// Start playback. Playing an already playing instance is a no-op.
    pub fn play(&self) -> EngineResult<()> {
        self.ensure_loaded()?;
        let was_paused = std::mem::replace(&mut self.playback.write().paused, false);
        self.dispatcher.lock().rearm();
        if was_paused {
            debug!(instance = %self.id, "Playing");
            self.notify();
        }
        Ok(())
    }

    pub fn pause(&self) -> EngineResult<()> {
        self.ensure_loaded()?;
        let was_paused = std::mem::replace(&mut self.playback.write().paused, true);
        if !was_paused {
            debug!(instance = %self.id, "Paused");
            self.notify();
        }
        Ok(())
    }

    /// Start seeking to `time`, clamped to a known duration.
    ///
    /// `seeking` stays set until [`complete_seek`](Self::complete_seek).
    pub fn seek(&self, time: f64) -> EngineResult<()> {
        if !time.is_finite() || time < 0.0 {
            return Err(EngineError::range(format!("invalid seek target {}", time)));
        }
        self.ensure_loaded()?;

        let duration = self.duration();
        let target = if duration.is_finite() { time.min(duration) } else { time };
        {
            let mut playback = self.playback.write();
            playback.seeking = true;
            playback.current_time = target;
            playback.seek_target = Some(target);
        }
        self.dispatcher.lock().seek();
        self.refresh_ready_state();

        debug!(instance = %self.id, target, "Seeking");
        self.notify();
        Ok(())
    }

    /// The decoder reports the pending seek as done.
    ///
    /// When the instance tracks buffered data, the target must be buffered.
    /// Returns `false` if no seek was pending.
    pub fn complete_seek(&self) -> EngineResult<bool> {
        let target = match *self.playback.read() {
            PlaybackState {
                seeking: true,
                seek_target: Some(target),
                ..
            } => target,
            _ => return Ok(false),
        };

        if self.tracks_buffered() && !self.buffered().contains(target) {
            return Err(EngineError::invalid_state(format!(
                "seek target {} is not buffered",
                target
            )));
        }

        {
            let mut playback = self.playback.write();
            if playback.seek_target != Some(target) {
                return Ok(false);
            }
            playback.seeking = false;
            playback.seek_target = None;
        }
        self.refresh_ready_state();
        debug!(instance = %self.id, target, "Seek completed");
        self.notify();
        Ok(true)
    }

    /// Playback position reported by the decoder while playing.
    pub fn update_current_time(&self, time: f64) -> EngineResult<()> {
        if !time.is_finite() || time < 0.0 {
            return Err(EngineError::range(format!("invalid current time {}", time)));
        }
        {
            let mut playback = self.playback.write();
            if playback.seeking {
                return Ok(());
            }
            playback.current_time = time;
        }
        if self.refresh_ready_state() {
            self.notify();
        }
        Ok(())
    }

    /// Metadata from the decoder. `duration` may be infinite for live media.
    pub fn set_metadata(&self, duration: f64, video_width: u32, video_height: u32) -> EngineResult<()> {
        if duration.is_nan() || duration < 0.0 {
            return Err(EngineError::range(format!("invalid duration {}", duration)));
        }
        *self.duration.write() = duration;
        *self.video_size.write() = (video_width, video_height);
        self.raise_ready_state(MediaReadyState::HaveMetadata);
        self.notify();
        Ok(())
    }

    /// Ready state pushed by the decoder.
    pub fn set_ready_state(&self, state: MediaReadyState) {
        let previous = std::mem::replace(&mut *self.ready_state.write(), state);
        if previous != state {
            self.notify();
        }
    }

    /// Buffered media of a direct URL load, reported by the decoder.
    pub fn report_buffered(&self, start: f64, end: f64) -> EngineResult<()> {
        if start.is_nan() || end.is_nan() || start < 0.0 || end < start {
            return Err(EngineError::range(format!(
                "invalid buffered range [{}, {})",
                start, end
            )));
        }
        let mut next = self.implicit_buffered.read().clone();
        next.add(start, end);
        next.check_invariant()?;
        *self.implicit_buffered.write() = next;
        Ok(())
    }

    /// Display geometry; applies from the next emitted frame on.
    pub fn set_rect(&self, rect: DisplayRect) {
        *self.rect.write() = rect;
    }

    pub fn set_visible(&self, visible: bool) {
        let previous = std::mem::replace(&mut *self.visible.write(), visible);
        if previous != visible {
            self.notify();
        }
    }

    // Reads

    pub fn url(&self) -> Option<String> {
        self.url.read().as_ref().map(Url::to_string)
    }

    pub fn paused(&self) -> bool {
        self.playback.read().paused
    }

    pub fn seeking(&self) -> bool {
        self.playback.read().seeking
    }

    pub fn current_time(&self) -> f64 {
        self.playback.read().current_time
    }

    /// Duration in seconds; NaN while unknown.
    pub fn duration(&self) -> f64 {
        *self.duration.read()
    }

    pub fn network_state(&self) -> MediaNetworkState {
        *self.network_state.read()
    }

    pub fn ready_state(&self) -> MediaReadyState {
        *self.ready_state.read()
    }

    pub fn rect(&self) -> DisplayRect {
        *self.rect.read()
    }

    pub fn visible(&self) -> bool {
        *self.visible.read()
    }

    pub fn video_size(&self) -> (u32, u32) {
        *self.video_size.read()
    }

    pub fn error(&self) -> Option<EngineError> {
        self.error.read().clone()
    }

    /// Latest time a seek can reach.
    pub fn max_time_seekable(&self) -> f64 {
        let duration = self.duration();
        if duration.is_finite() {
            return duration;
        }
        self.buffered().last().map_or(0.0, |r| r.end)
    }

    /// Buffered ranges: the intersection of all source buffers, or the
    /// decoder-reported ranges of a direct URL load.
    pub fn buffered(&self) -> TimeRanges {
        let source_buffers = self.source_buffers.read();
        let mut buffers = source_buffers.values();
        match buffers.next() {
            Some(first) => buffers.fold(first.buffered(), |acc, sb| acc.intersection(&sb.buffered())),
            None => self.implicit_buffered.read().clone(),
        }
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        let playback = *self.playback.read();
        let (video_width, video_height) = self.video_size();
        PlaybackSnapshot {
            ready_state: self.ready_state(),
            network_state: self.network_state(),
            paused: playback.paused,
            seeking: playback.seeking,
            duration: self.duration(),
            current_time: playback.current_time,
            video_width,
            video_height,
            visible: self.visible(),
        }
    }

    // Source buffers

    pub fn add_source_buffer(&self, source_id: &str, mime_type: &str) -> EngineResult<()> {
        if !self.settings.is_type_supported(mime_type) {
            return Err(EngineError::not_supported(format!(
                "source buffer type '{}'",
                mime_type
            )));
        }
        let mut source_buffers = self.source_buffers.write();
        if source_buffers.contains_key(source_id) {
            return Err(EngineError::invalid_state(format!(
                "source buffer '{}' already exists on '{}'",
                source_id, self.id
            )));
        }
        source_buffers.insert(
            source_id.to_string(),
            Arc::new(SourceBuffer::new(source_id, mime_type)),
        );
        info!(instance = %self.id, source = source_id, mime_type, "Added source buffer");
        Ok(())
    }

    /// Detach a source buffer, discarding any append in flight on it.
    pub fn remove_source_buffer(&self, source_id: &str) -> EngineResult<()> {
        let removed = self
            .source_buffers
            .write()
            .shift_remove(source_id)
            .ok_or_else(|| self.unknown_source(source_id))?;
        removed.abort();
        info!(instance = %self.id, source = source_id, "Removed source buffer");
        if self.refresh_ready_state() {
            self.notify();
        }
        Ok(())
    }

    pub fn source_buffer(&self, source_id: &str) -> EngineResult<Arc<SourceBuffer>> {
        self.source_buffers
            .read()
            .get(source_id)
            .cloned()
            .ok_or_else(|| self.unknown_source(source_id))
    }

    /// Source buffer ids in creation order.
    pub fn source_buffer_ids(&self) -> Vec<String> {
        self.source_buffers.read().keys().cloned().collect()
    }

    pub fn abort_source_buffer(&self, source_id: &str) -> EngineResult<()> {
        self.source_buffer(source_id)?.abort();
        Ok(())
    }

    /// Append a segment to `source_id` and return its buffered ranges.
    pub fn append_buffer(
        &self,
        source_id: &str,
        demuxer: &dyn SegmentDemuxer,
        request: AppendRequest<'_>,
    ) -> EngineResult<Vec<TimeRange>> {
        let sb = self.source_buffer(source_id)?;
        let ranges = sb.append(demuxer, request, self.settings.max_buffered_ranges)?;

        let first_data = !std::mem::replace(&mut *self.has_media_data.write(), true);
        if first_data {
            self.raise_ready_state(MediaReadyState::HaveMetadata);
        }
        if self.refresh_ready_state() || first_data {
            self.notify();
        }
        Ok(ranges)
    }

    pub fn remove_buffer_range(
        &self,
        source_id: &str,
        start: f64,
        end: f64,
    ) -> EngineResult<Vec<TimeRange>> {
        let ranges = self
            .source_buffer(source_id)?
            .remove(start, end, self.settings.max_buffered_ranges)?;
        if self.refresh_ready_state() {
            self.notify();
        }
        Ok(ranges)
    }

    pub fn set_append_mode(&self, source_id: &str, mode: AppendMode) -> EngineResult<()> {
        self.source_buffer(source_id)?.set_mode(mode)
    }

    pub fn set_append_timestamp_offset(&self, source_id: &str, offset: f64) -> EngineResult<()> {
        self.source_buffer(source_id)?.set_timestamp_offset(offset)
    }

    /// Switch the container type of `source_id`. The frame stream must
    /// restart with a codec-config frame.
    pub fn change_source_buffer_type(&self, source_id: &str, mime_type: &str) -> EngineResult<()> {
        if !self.settings.is_type_supported(mime_type) {
            return Err(EngineError::not_supported(format!(
                "source buffer type '{}'",
                mime_type
            )));
        }
        self.source_buffer(source_id)?.change_type(mime_type)?;
        self.dispatcher.lock().reset_stream();
        info!(instance = %self.id, source = source_id, mime_type, "Changed source buffer type");
        Ok(())
    }

    // Frames

    /// Deliver a decoded frame to the host.
    ///
    /// A host rejection pauses the instance and records the error; playback
    /// resumes only on a new `play` or `seek`.
    pub fn dispatch(&self, frame: &Frame) -> EngineResult<DispatchOutcome> {
        if self.is_closed() {
            return Err(EngineError::invalid_state(format!(
                "instance '{}' was removed",
                self.id
            )));
        }
        let ticket = self.dispatcher.lock().begin(frame)?;
        let target = FrameTarget {
            session_id: &self.session_id,
            instance_id: &self.id,
            rect: self.rect(),
        };
        // The dispatcher stays unlocked while the host runs so the callback
        // may call back into this instance.
        let status = deliver(self.adapter.as_ref(), &target, frame);
        let outcome = self.dispatcher.lock().finish(ticket, frame, status);

        if let DispatchOutcome::Rejected(status) = outcome {
            self.playback.write().paused = true;
            *self.error.write() = Some(EngineError::invalid_state(format!(
                "host rejected frame with status {}",
                status
            )));
            self.notify();
        }
        Ok(outcome)
    }

    /// Host status that halted frame dispatch, if any.
    pub fn dispatch_halted(&self) -> Option<i32> {
        self.dispatcher.lock().halted()
    }

    // Lifecycle

    /// Cancel loads and appends and stop reporting to the host.
    pub fn close(&self) {
        *self.closed.write() = true;
        {
            let mut slot = self.load.lock();
            slot.cancel_task();
            slot.generation += 1;
        }
        for (_, sb) in self.source_buffers.write().drain(..) {
            sb.abort();
        }
        debug!(instance = %self.id, "Instance closed");
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    // Internal

    fn unknown_source(&self, source_id: &str) -> EngineError {
        EngineError::not_found(format!(
            "source buffer '{}' on instance '{}'",
            source_id, self.id
        ))
    }

    fn tracks_buffered(&self) -> bool {
        !self.source_buffers.read().is_empty() || !self.implicit_buffered.read().is_empty()
    }

    fn raise_ready_state(&self, floor: MediaReadyState) {
        let mut ready = self.ready_state.write();
        if *ready < floor {
            *ready = floor;
        }
    }

    /// Derive the ready state of an MSE instance from buffered data around
    /// the playhead. Returns whether it changed.
    fn refresh_ready_state(&self) -> bool {
        if self.source_buffers.read().is_empty() || !*self.has_media_data.read() {
            return false;
        }

        let buffered = self.buffered();
        let time = self.current_time();
        let duration = self.duration();
        let next = match buffered.range_for(time) {
            None => MediaReadyState::HaveMetadata,
            Some(range) => {
                let ahead = range.end - time;
                if ahead >= self.settings.enough_data_threshold
                    || (duration.is_finite() && range.end >= duration)
                {
                    MediaReadyState::HaveEnoughData
                } else if ahead >= self.settings.future_data_threshold {
                    MediaReadyState::HaveFutureData
                } else {
                    MediaReadyState::HaveCurrentData
                }
            }
        };

        let previous = std::mem::replace(&mut *self.ready_state.write(), next);
        previous != next
    }

    fn notify(&self) {
        if !self.settings.notify_state_changes || self.is_closed() {
            return;
        }
        let snapshot = self.snapshot();
        self.adapter
            .on_state_changed(&self.session_id, &self.id, &snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::{CodedSample, RawSampleDemuxer};
    use crate::frame::MediaFrame;
    use crate::host::{FrameTarget, HOST_ACCEPTED};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::{mpsc, OnceLock, Weak};
    use std::thread;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Recorder {
        states: parking_lot::Mutex<Vec<PlaybackSnapshot>>,
        status: parking_lot::Mutex<i32>,
    }

    impl HostAdapter for Recorder {
        fn on_frame(&self, _target: &FrameTarget<'_>, _frame: &MediaFrame) -> i32 {
            *self.status.lock()
        }

        fn on_state_changed(&self, _session_id: &str, _instance_id: &str, state: &PlaybackSnapshot) {
            self.states.lock().push(state.clone());
        }
    }

    fn instance_with(host: Arc<Recorder>) -> Arc<MediaInstance> {
        Arc::new(MediaInstance::new(
            "session",
            "video-1",
            Arc::new(InstanceSettings::default()),
            host,
        ))
    }

    fn instance() -> Arc<MediaInstance> {
        instance_with(Arc::new(Recorder::default()))
    }

    fn loaded_instance() -> Arc<MediaInstance> {
        let instance = instance();
        instance.load("blob:https://app.example.com/ms", None).unwrap();
        instance
    }

    fn segment(start: f64, end: f64) -> Vec<u8> {
        RawSampleDemuxer::encode(&[CodedSample::new(start, end - start)])
    }

    fn append(instance: &MediaInstance, source: &str, start: f64, end: f64) -> EngineResult<Vec<TimeRange>> {
        let payload = segment(start, end);
        instance.append_buffer(source, &RawSampleDemuxer, AppendRequest::whole(1, &payload))
    }

    #[test]
    fn test_initial_state() {
        let instance = instance();
        assert!(instance.paused());
        assert!(!instance.seeking());
        assert!(instance.duration().is_nan());
        assert_eq!(instance.current_time(), 0.0);
        assert_eq!(instance.network_state(), MediaNetworkState::Empty);
        assert_eq!(instance.ready_state(), MediaReadyState::HaveNothing);
        assert!(matches!(instance.play(), Err(EngineError::InvalidState(_))));
    }

    #[test]
    fn test_load_and_finish() {
        let instance = instance();
        instance.load("https://cdn.example.com/movie.mp4", None).unwrap();
        assert_eq!(instance.network_state(), MediaNetworkState::Loading);

        assert!(instance.finish_load(Ok(LoadedMedia {
            duration: Some(60.0),
            video_width: 1920,
            video_height: 1080,
            ..Default::default()
        })));
        assert_eq!(instance.network_state(), MediaNetworkState::Loaded);
        assert_eq!(instance.ready_state(), MediaReadyState::HaveMetadata);
        assert_eq!(instance.duration(), 60.0);
        assert_eq!(instance.video_size(), (1920, 1080));
        assert_eq!(instance.max_time_seekable(), 60.0);
    }

    #[test]
    fn test_cancel_after_load_is_noop() {
        let instance = instance();
        instance.load("https://cdn.example.com/movie.mp4", None).unwrap();
        instance.finish_load(Ok(LoadedMedia::default()));
        assert!(!instance.cancel_load());
        assert_eq!(instance.network_state(), MediaNetworkState::Loaded);
    }

    #[test]
    fn test_cancel_in_flight_reverts_to_empty() {
        let instance = instance();
        let ticket = instance.load("https://cdn.example.com/movie.mp4", None).unwrap();
        assert!(instance.cancel_load());
        assert_eq!(instance.network_state(), MediaNetworkState::Empty);
        assert!(instance.url().is_none());

        // A completion that raced the cancel is ignored.
        assert!(!instance.complete_load(ticket, Ok(LoadedMedia::default())));
        assert_eq!(instance.network_state(), MediaNetworkState::Empty);
    }

    #[test]
    fn test_cancel_discards_loaded_media() {
        let instance = instance();
        instance.load("https://cdn.example.com/movie.mp4", None).unwrap();
        instance.add_source_buffer("video", "video/mp4").unwrap();
        append(&instance, "video", 0.0, 10.0).unwrap();
        instance.set_metadata(20.0, 1280, 720).unwrap();
        assert!(instance.ready_state() > MediaReadyState::HaveNothing);

        assert!(instance.cancel_load());
        assert_eq!(instance.network_state(), MediaNetworkState::Empty);
        assert_eq!(instance.ready_state(), MediaReadyState::HaveNothing);
        assert!(instance.duration().is_nan());
        assert_eq!(instance.video_size(), (0, 0));
        assert!(instance.source_buffer_ids().is_empty());
        assert!(instance.buffered().is_empty());
        assert!(matches!(
            append(&instance, "video", 10.0, 12.0),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_reload_supersedes_previous_load() {
        let instance = instance();
        let first = instance.load("https://cdn.example.com/a.mp4", None).unwrap();
        let second = instance.load("https://cdn.example.com/b.mp4", None).unwrap();
        assert_ne!(first, second);
        assert!(!instance.complete_load(first, Ok(LoadedMedia::default())));
        assert!(instance.complete_load(second, Ok(LoadedMedia::default())));
        assert_eq!(instance.url().as_deref(), Some("https://cdn.example.com/b.mp4"));
    }

    #[test]
    fn test_failed_load() {
        let instance = instance();
        instance.load("https://cdn.example.com/missing.mp4", None).unwrap();
        instance.finish_load(Err(LoadError::Http { status: 404 }));
        assert_eq!(instance.network_state(), MediaNetworkState::NoSource);
        assert!(matches!(instance.error(), Some(EngineError::Network(_))));
    }

    #[test]
    fn test_invalid_url() {
        let instance = instance();
        let err = instance.load("::not a url::", None).unwrap_err();
        assert!(matches!(err, EngineError::Network(_)));
        assert_eq!(instance.network_state(), MediaNetworkState::Empty);
        assert!(instance.url().is_none());
    }

    #[test]
    fn test_invalid_url_keeps_current_load() {
        let instance = instance();
        instance.load("https://cdn.example.com/a.mp4", None).unwrap();
        instance.add_source_buffer("video", "video/mp4").unwrap();
        append(&instance, "video", 0.0, 4.0).unwrap();

        assert!(instance.load("::bad::", None).is_err());
        assert_eq!(instance.url().as_deref(), Some("https://cdn.example.com/a.mp4"));
        assert_eq!(instance.network_state(), MediaNetworkState::Loading);
        assert_eq!(instance.source_buffer_ids(), vec!["video"]);
        assert_eq!(instance.buffered().as_slice(), &[TimeRange::new(0.0, 4.0)]);
        assert!(instance.finish_load(Ok(LoadedMedia::default())));
    }

    #[test]
    fn test_play_pause() {
        let host = Arc::new(Recorder::default());
        let instance = instance_with(Arc::clone(&host));
        instance.load("https://cdn.example.com/movie.mp4", None).unwrap();
        let before = host.states.lock().len();

        instance.play().unwrap();
        assert!(!instance.paused());
        instance.play().unwrap();
        assert!(!instance.paused());
        // The second play changed nothing and pushed nothing.
        assert_eq!(host.states.lock().len(), before + 1);

        instance.pause().unwrap();
        assert!(instance.paused());
    }

    #[test]
    fn test_seek_waits_for_buffered_target() {
        let instance = loaded_instance();
        instance.add_source_buffer("video", "video/mp4").unwrap();

        instance.seek(12.0).unwrap();
        assert!(instance.seeking());
        assert_eq!(instance.current_time(), 12.0);
        assert!(matches!(instance.complete_seek(), Err(EngineError::InvalidState(_))));
        assert!(instance.seeking());

        append(&instance, "video", 10.0, 20.0).unwrap();
        assert!(instance.complete_seek().unwrap());
        assert!(!instance.seeking());
        assert!(!instance.complete_seek().unwrap());
    }

    #[test]
    fn test_seek_validation_and_clamp() {
        let instance = loaded_instance();
        assert!(matches!(instance.seek(-1.0), Err(EngineError::Range(_))));
        assert!(matches!(instance.seek(f64::NAN), Err(EngineError::Range(_))));

        instance.set_metadata(30.0, 640, 360).unwrap();
        instance.seek(45.0).unwrap();
        assert_eq!(instance.current_time(), 30.0);
    }

    #[test]
    fn test_ready_state_follows_buffered_data() {
        let instance = loaded_instance();
        instance.add_source_buffer("video", "video/mp4").unwrap();
        append(&instance, "video", 0.0, 0.05).unwrap();
        assert_eq!(instance.ready_state(), MediaReadyState::HaveCurrentData);

        append(&instance, "video", 0.05, 1.0).unwrap();
        assert_eq!(instance.ready_state(), MediaReadyState::HaveFutureData);

        append(&instance, "video", 1.0, 10.0).unwrap();
        assert_eq!(instance.ready_state(), MediaReadyState::HaveEnoughData);

        instance.remove_buffer_range("video", 0.0, 10.0).unwrap();
        assert_eq!(instance.ready_state(), MediaReadyState::HaveMetadata);
    }

    #[test]
    fn test_buffered_intersects_source_buffers() {
        let instance = loaded_instance();
        instance.add_source_buffer("video", "video/mp4").unwrap();
        instance.add_source_buffer("audio", "audio/mp4; codecs=\"mp4a.40.2\"").unwrap();
        append(&instance, "video", 0.0, 10.0).unwrap();
        append(&instance, "audio", 2.0, 12.0).unwrap();

        let buffered = instance.buffered();
        assert_eq!(buffered.as_slice(), &[TimeRange::new(2.0, 10.0)]);
        assert_eq!(instance.max_time_seekable(), 10.0);
        assert_eq!(instance.source_buffer_ids(), vec!["video", "audio"]);
    }

    #[test]
    fn test_source_buffer_errors() {
        let instance = loaded_instance();
        assert!(matches!(
            instance.add_source_buffer("v", "video/x-msvideo"),
            Err(EngineError::NotSupported(_))
        ));
        instance.add_source_buffer("v", "video/webm").unwrap();
        assert!(matches!(
            instance.add_source_buffer("v", "video/webm"),
            Err(EngineError::InvalidState(_))
        ));
        assert!(matches!(
            append(&instance, "missing", 0.0, 1.0),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            instance.remove_source_buffer("missing"),
            Err(EngineError::NotFound(_))
        ));
        instance.remove_source_buffer("v").unwrap();
        assert!(instance.source_buffer_ids().is_empty());
    }

    #[test]
    fn test_new_load_detaches_source_buffers() {
        let instance = loaded_instance();
        instance.add_source_buffer("video", "video/mp4").unwrap();
        append(&instance, "video", 0.0, 4.0).unwrap();

        instance.load("blob:https://app.example.com/other", None).unwrap();
        assert!(instance.source_buffer_ids().is_empty());
        assert_eq!(instance.ready_state(), MediaReadyState::HaveNothing);
        assert!(instance.buffered().is_empty());
    }

    #[test]
    fn test_host_rejection_pauses_until_play() {
        let host = Arc::new(Recorder::default());
        let instance = instance_with(Arc::clone(&host));
        instance.load("https://cdn.example.com/movie.mp4", None).unwrap();
        instance.play().unwrap();

        instance
            .dispatch(&Frame::Media(MediaFrame::codec_config(0, Bytes::new())))
            .unwrap();
        *host.status.lock() = 3;
        let outcome = instance
            .dispatch(&Frame::Media(MediaFrame::key(1, 0, 0, Bytes::new())))
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Rejected(3));
        assert!(instance.paused());
        assert_eq!(instance.dispatch_halted(), Some(3));
        assert!(instance.error().is_some());

        *host.status.lock() = HOST_ACCEPTED;
        instance.play().unwrap();
        assert_eq!(instance.dispatch_halted(), None);
        assert_eq!(
            instance
                .dispatch(&Frame::Media(MediaFrame::key(1, 0, 0, Bytes::new())))
                .unwrap(),
            DispatchOutcome::Delivered
        );
    }

    /// Calls back into its own instance from inside the frame callback.
    #[derive(Default)]
    struct Reentrant {
        instance: OnceLock<Weak<MediaInstance>>,
        halted: parking_lot::Mutex<Vec<Option<i32>>>,
        nested: parking_lot::Mutex<Vec<EngineResult<DispatchOutcome>>>,
    }

    impl HostAdapter for Reentrant {
        fn on_frame(&self, _target: &FrameTarget<'_>, _frame: &MediaFrame) -> i32 {
            if let Some(instance) = self.instance.get().and_then(Weak::upgrade) {
                instance.play().unwrap();
                self.halted.lock().push(instance.dispatch_halted());
                let nested = instance.dispatch(&Frame::Media(MediaFrame::key(1, 0, 0, Bytes::new())));
                self.nested.lock().push(nested);
            }
            HOST_ACCEPTED
        }
    }

    #[test]
    fn test_host_may_call_back_during_frame() {
        let host = Arc::new(Reentrant::default());
        let instance = Arc::new(MediaInstance::new(
            "session",
            "video-1",
            Arc::new(InstanceSettings::default()),
            Arc::clone(&host) as Arc<dyn HostAdapter>,
        ));
        host.instance.set(Arc::downgrade(&instance)).unwrap();
        instance.load("https://cdn.example.com/movie.mp4", None).unwrap();

        let (tx, rx) = mpsc::channel();
        let worker = Arc::clone(&instance);
        thread::spawn(move || {
            let outcome = worker.dispatch(&Frame::Media(MediaFrame::codec_config(0, Bytes::new())));
            let _ = tx.send(outcome);
        });
        let outcome = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("dispatch did not return");

        assert_eq!(outcome.unwrap(), DispatchOutcome::Delivered);
        assert!(!instance.paused());
        assert_eq!(host.halted.lock().as_slice(), &[None]);
        // Only one frame may be in flight per instance.
        assert!(matches!(
            host.nested.lock().as_slice(),
            [Err(EngineError::InvalidState(_))]
        ));
        assert_eq!(instance.dispatch_halted(), None);
    }

    #[test]
    fn test_change_type_requires_codec_config() {
        let instance = loaded_instance();
        instance.add_source_buffer("video", "video/mp4").unwrap();
        instance
            .dispatch(&Frame::Media(MediaFrame::codec_config(0, Bytes::new())))
            .unwrap();
        instance
            .dispatch(&Frame::Media(MediaFrame::key(1, 0, 0, Bytes::new())))
            .unwrap();

        instance.change_source_buffer_type("video", "video/webm").unwrap();
        assert_eq!(instance.source_buffer("video").unwrap().mime_type(), "video/webm");
        assert!(instance
            .dispatch(&Frame::Media(MediaFrame::key(2, 10, 10, Bytes::new())))
            .is_err());
    }

    #[test]
    fn test_state_change_notifications() {
        let host = Arc::new(Recorder::default());
        let instance = instance_with(Arc::clone(&host));
        instance.load("https://cdn.example.com/movie.mp4", None).unwrap();
        instance.set_metadata(20.0, 1280, 720).unwrap();
        instance.set_visible(false);

        let states = host.states.lock();
        let last = states.last().unwrap();
        assert_eq!(last.network_state, MediaNetworkState::Loading);
        assert_eq!(last.ready_state, MediaReadyState::HaveMetadata);
        assert_eq!((last.video_width, last.video_height), (1280, 720));
        assert!(!last.visible);
    }

    #[test]
    fn test_closed_instance_rejects_frames() {
        let instance = loaded_instance();
        instance.close();
        assert!(instance.is_closed());
        assert!(instance
            .dispatch(&Frame::Media(MediaFrame::codec_config(0, Bytes::new())))
            .is_err());
    }

    #[test]
    fn test_set_rect_applies_to_next_frame() {
        let instance = loaded_instance();
        instance.set_rect(DisplayRect::new(0, 0, 640, 360));
        assert_eq!(instance.rect(), DisplayRect::new(0, 0, 640, 360));
    }

    #[test]
    fn test_type_support_ignores_parameters() {
        let settings = InstanceSettings::default();
        assert!(settings.is_type_supported("video/mp4; codecs=\"avc1.42E01E\""));
        assert!(settings.is_type_supported("VIDEO/WEBM"));
        assert!(!settings.is_type_supported("video/ogg"));
    }

    struct GatedLoader {
        gate: Arc<Notify>,
        result: Result<LoadedMedia, LoadError>,
    }

    #[async_trait]
    impl MediaLoader for GatedLoader {
        async fn fetch(&self, _url: &Url) -> Result<LoadedMedia, LoadError> {
            self.gate.notified().await;
            self.result.clone()
        }
    }

    async fn wait_for(instance: &MediaInstance, state: MediaNetworkState) {
        for _ in 0..100 {
            if instance.network_state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("instance never reached {:?}", state);
    }

    #[tokio::test]
    async fn test_loader_completes_load() {
        let gate = Arc::new(Notify::new());
        let loader = Arc::new(GatedLoader {
            gate: Arc::clone(&gate),
            result: Ok(LoadedMedia {
                duration: Some(42.0),
                ..Default::default()
            }),
        });
        let instance = instance();
        instance
            .load("https://cdn.example.com/movie.mp4", Some(loader))
            .unwrap();
        assert_eq!(instance.network_state(), MediaNetworkState::Loading);

        gate.notify_one();
        wait_for(&instance, MediaNetworkState::Loaded).await;
        assert_eq!(instance.duration(), 42.0);
    }

    #[tokio::test]
    async fn test_cancel_stops_loader() {
        let gate = Arc::new(Notify::new());
        let loader = Arc::new(GatedLoader {
            gate: Arc::clone(&gate),
            result: Ok(LoadedMedia::default()),
        });
        let instance = instance();
        instance
            .load("https://cdn.example.com/movie.mp4", Some(loader))
            .unwrap();
        assert!(instance.cancel_load());

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(instance.network_state(), MediaNetworkState::Empty);
    }

    #[test]
    fn test_loader_requires_runtime() {
        let loader = Arc::new(GatedLoader {
            gate: Arc::new(Notify::new()),
            result: Ok(LoadedMedia::default()),
        });
        let instance = instance();
        let err = instance
            .load("https://cdn.example.com/movie.mp4", Some(loader))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
        assert_eq!(instance.network_state(), MediaNetworkState::Empty);
    }
}
