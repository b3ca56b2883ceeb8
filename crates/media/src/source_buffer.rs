//! Source buffer append engine.
//!
//! A [`SourceBuffer`] receives media segments for one stream of an instance
//! and keeps the buffered ranges those segments cover. Every mutation of one
//! buffer is serialized: a second `append` while one is in flight is
//! rejected, and an `abort` makes the in-flight append discard its result
//! instead of merging it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, error, warn};

use common::{EngineError, EngineResult};

use crate::demux::{CodedSample, SegmentDemuxer};
use crate::time_ranges::{TimeRange, TimeRanges};

/// Maximum number of buffered ranges reported by one append.
pub const MSE_VIDEO_BUFFER_SIZE: usize = 10;

/// How appended segments are placed on the timeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppendMode {
    /// Segment timestamps are honoured (shifted by the timestamp offset).
    #[default]
    Segments,
    /// Each segment is placed right after the previous one.
    Sequence,
}

impl AppendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppendMode::Segments => "segments",
            AppendMode::Sequence => "sequence",
        }
    }
}

impl FromStr for AppendMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "segments" => Ok(AppendMode::Segments),
            "sequence" => Ok(AppendMode::Sequence),
            other => Err(EngineError::not_supported(format!("append mode '{}'", other))),
        }
    }
}

/// Presentation interval outside of which appended samples are dropped.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendWindow {
    pub start: f64,
    pub end: f64,
}

impl AppendWindow {
    pub const fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.start.is_nan() || self.end.is_nan() {
            return Err(EngineError::range("append window bound is NaN"));
        }
        if self.start < 0.0 || self.start.is_infinite() {
            return Err(EngineError::range(format!(
                "append window start {} must be finite and non-negative",
                self.start
            )));
        }
        if self.end <= self.start {
            return Err(EngineError::range(format!(
                "append window end {} must be greater than start {}",
                self.end, self.start
            )));
        }
        Ok(())
    }
}

impl Default for AppendWindow {
    fn default() -> Self {
        Self::new(0.0, f64::INFINITY)
    }
}

/// One `appendBuffer` call.
#[derive(Clone, Copy, Debug)]
pub struct AppendRequest<'a> {
    /// Host-assigned identifier of the payload, echoed in logs.
    pub buffer_id: u64,
    pub payload: &'a [u8],
    pub offset: usize,
    pub length: usize,
    pub window: AppendWindow,
}

impl<'a> AppendRequest<'a> {
    /// Request covering the whole payload with the default window.
    pub fn whole(buffer_id: u64, payload: &'a [u8]) -> Self {
        Self {
            buffer_id,
            payload,
            offset: 0,
            length: payload.len(),
            window: AppendWindow::default(),
        }
    }

    pub fn with_window(mut self, start: f64, end: f64) -> Self {
        self.window = AppendWindow::new(start, end);
        self
    }

    fn segment(&self) -> EngineResult<&'a [u8]> {
        self.offset
            .checked_add(self.length)
            .and_then(|end| self.payload.get(self.offset..end))
            .ok_or_else(|| {
                EngineError::range(format!(
                    "segment [{}, +{}) exceeds payload of {} bytes",
                    self.offset,
                    self.length,
                    self.payload.len()
                ))
            })
    }
}

#[derive(Debug)]
struct SourceBufferState {
    mime_type: String,
    mode: AppendMode,
    timestamp_offset: f64,
    window: AppendWindow,
    buffered: TimeRanges,
    updating: bool,
    /// Bumped by `abort`; an append whose ticket no longer matches is stale.
    generation: u64,
    /// End of the last appended media, where a sequence-mode append starts.
    sequence_anchor: Option<f64>,
}

/// Placement settings captured when an append starts.
#[derive(Clone, Copy, Debug)]
struct Placement {
    mode: AppendMode,
    timestamp_offset: f64,
    window: AppendWindow,
    sequence_anchor: Option<f64>,
}

/// Where the samples of one segment land on the timeline.
#[derive(Debug, PartialEq)]
struct AppendPlan {
    intervals: Vec<TimeRange>,
    timestamp_offset: f64,
    end: Option<f64>,
}

impl Placement {
    fn plan(&self, samples: &[CodedSample]) -> AppendPlan {
        let mut offset = self.timestamp_offset;
        if self.mode == AppendMode::Sequence {
            let segment_start = samples.iter().map(|s| s.pts).reduce(f64::min);
            if let (Some(anchor), Some(start)) = (self.sequence_anchor, segment_start) {
                offset = anchor - start;
            }
        }

        let intervals: Vec<TimeRange> = samples
            .iter()
            .filter_map(|s| {
                TimeRange::new(s.pts + offset, s.end() + offset)
                    .clip(self.window.start, self.window.end)
            })
            .collect();
        let end = intervals.iter().map(|r| r.end).reduce(f64::max);

        AppendPlan {
            intervals,
            timestamp_offset: offset,
            end,
        }
    }
}

/// One MSE-style source buffer.
#[derive(Debug)]
pub struct SourceBuffer {
    id: String,
    state: Mutex<SourceBufferState>,
}

impl SourceBuffer {
    /// Create an empty source buffer for `mime_type`.
    pub fn new(id: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(SourceBufferState {
                mime_type: mime_type.into(),
                mode: AppendMode::Segments,
                timestamp_offset: 0.0,
                window: AppendWindow::default(),
                buffered: TimeRanges::new(),
                updating: false,
                generation: 0,
                sequence_anchor: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mime_type(&self) -> String {
        self.state.lock().mime_type.clone()
    }

    pub fn mode(&self) -> AppendMode {
        self.state.lock().mode
    }

    pub fn timestamp_offset(&self) -> f64 {
        self.state.lock().timestamp_offset
    }

    pub fn append_window(&self) -> AppendWindow {
        self.state.lock().window
    }

    /// Whether an append is in flight.
    pub fn is_updating(&self) -> bool {
        self.state.lock().updating
    }

    pub fn buffered(&self) -> TimeRanges {
        self.state.lock().buffered.clone()
    }

    /// Append one segment and return the resulting buffered ranges.
    ///
    /// The segment is demuxed without holding the buffer lock, so `abort` can
    /// run concurrently. The buffered ranges change only if the append
    /// completes without being aborted, passes the invariant check and stays
    /// within `max_ranges`; otherwise they are left exactly as they were.
    pub fn append(
        &self,
        demuxer: &dyn SegmentDemuxer,
        request: AppendRequest<'_>,
        max_ranges: usize,
    ) -> EngineResult<Vec<TimeRange>> {
        request.window.validate()?;
        let segment = request.segment()?;

        let (ticket, placement, mime_type) = {
            let mut state = self.state.lock();
            if state.updating {
                return Err(EngineError::invalid_state(format!(
                    "source buffer '{}' is already appending",
                    self.id
                )));
            }
            state.updating = true;
            state.window = request.window;
            let placement = Placement {
                mode: state.mode,
                timestamp_offset: state.timestamp_offset,
                window: state.window,
                sequence_anchor: state.sequence_anchor,
            };
            (state.generation, placement, state.mime_type.clone())
        };

        debug!(
            source = %self.id,
            buffer_id = request.buffer_id,
            bytes = segment.len(),
            mode = placement.mode.as_str(),
            "Appending segment"
        );
        let demuxed = demuxer.demux(&mime_type, segment);

        let mut state = self.state.lock();
        if state.generation != ticket {
            warn!(
                source = %self.id,
                buffer_id = request.buffer_id,
                "Append aborted, discarding segment"
            );
            return Err(EngineError::invalid_state(format!(
                "append of buffer {} on '{}' was aborted",
                request.buffer_id, self.id
            )));
        }
        state.updating = false;

        let samples = demuxed?;
        let plan = placement.plan(&samples);

        let mut next = state.buffered.clone();
        for interval in &plan.intervals {
            next.add(interval.start, interval.end);
        }
        if let Err(err) = next.check_invariant() {
            error!(source = %self.id, %err, "Buffered ranges corrupted by append");
            return Err(err);
        }
        let exported = next.export(max_ranges)?;

        state.buffered = next;
        state.timestamp_offset = plan.timestamp_offset;
        if plan.end.is_some() {
            state.sequence_anchor = plan.end;
        }
        Ok(exported)
    }

    /// Remove `[start, end)` from the buffered ranges.
    ///
    /// A removal that would leave more than `max_ranges` ranges is rejected
    /// and the buffered ranges stay as they were.
    pub fn remove(&self, start: f64, end: f64, max_ranges: usize) -> EngineResult<Vec<TimeRange>> {
        if start.is_nan() || end.is_nan() || start < 0.0 {
            return Err(EngineError::range(format!(
                "invalid removal range [{}, {})",
                start, end
            )));
        }
        if end < start {
            return Err(EngineError::range(format!(
                "removal end {} precedes start {}",
                end, start
            )));
        }

        let mut state = self.state.lock();
        if state.updating {
            return Err(EngineError::invalid_state(format!(
                "source buffer '{}' is appending",
                self.id
            )));
        }

        let mut next = state.buffered.clone();
        next.remove(start, end);
        next.check_invariant()?;
        let exported = next.export(max_ranges)?;
        state.buffered = next;
        Ok(exported)
    }

    /// Cancel the in-flight append, if any, and reset the append window.
    ///
    /// Returns whether an append was cancelled.
    pub fn abort(&self) -> bool {
        let mut state = self.state.lock();
        state.window = AppendWindow::default();
        if !state.updating {
            return false;
        }
        state.generation += 1;
        state.updating = false;
        debug!(source = %self.id, "Aborted in-flight append");
        true
    }

    /// Switch the container type. Not allowed while appending.
    pub fn change_type(&self, mime_type: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        if state.updating {
            return Err(EngineError::invalid_state(format!(
                "cannot change type of '{}' while appending",
                self.id
            )));
        }
        state.mime_type = mime_type.to_string();
        Ok(())
    }

    pub fn set_mode(&self, mode: AppendMode) -> EngineResult<()> {
        let mut state = self.state.lock();
        if state.updating {
            return Err(EngineError::invalid_state(format!(
                "cannot change mode of '{}' while appending",
                self.id
            )));
        }
        state.mode = mode;
        Ok(())
    }

    /// Set the timestamp offset. The next sequence-mode append honours it
    /// instead of following the previous segment.
    pub fn set_timestamp_offset(&self, offset: f64) -> EngineResult<()> {
        if !offset.is_finite() {
            return Err(EngineError::range(format!(
                "timestamp offset {} is not finite",
                offset
            )));
        }
        let mut state = self.state.lock();
        if state.updating {
            return Err(EngineError::invalid_state(format!(
                "cannot change timestamp offset of '{}' while appending",
                self.id
            )));
        }
        state.timestamp_offset = offset;
        state.sequence_anchor = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::{DemuxError, RawSampleDemuxer};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    fn segment(start: f64, end: f64) -> Vec<u8> {
        RawSampleDemuxer::encode(&[CodedSample::new(start, end - start)])
    }

    fn pairs(ranges: &[TimeRange]) -> Vec<(f64, f64)> {
        ranges.iter().map(|r| (r.start, r.end)).collect()
    }

    fn append(sb: &SourceBuffer, payload: &[u8]) -> EngineResult<Vec<TimeRange>> {
        sb.append(
            &RawSampleDemuxer,
            AppendRequest::whole(1, payload),
            MSE_VIDEO_BUFFER_SIZE,
        )
    }

    fn remove(sb: &SourceBuffer, start: f64, end: f64) -> EngineResult<Vec<TimeRange>> {
        sb.remove(start, end, MSE_VIDEO_BUFFER_SIZE)
    }

    /// Blocks inside `demux` until released, to hold an append in flight.
    struct GatedDemuxer {
        started: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl SegmentDemuxer for GatedDemuxer {
        fn demux(&self, mime: &str, payload: &[u8]) -> Result<Vec<CodedSample>, DemuxError> {
            let _ = self.started.lock().send(());
            let _ = self.release.lock().recv();
            RawSampleDemuxer.demux(mime, payload)
        }
    }

    fn gated() -> (Arc<GatedDemuxer>, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let demuxer = Arc::new(GatedDemuxer {
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        });
        (demuxer, started_rx, release_tx)
    }

    #[test]
    fn test_segments_mode_merges_adjacent() {
        let sb = SourceBuffer::new("video", "video/mp4");
        append(&sb, &segment(0.0, 5.0)).unwrap();
        let ranges = append(&sb, &segment(5.0, 10.0)).unwrap();
        assert_eq!(pairs(&ranges), vec![(0.0, 10.0)]);
    }

    #[test]
    fn test_segments_mode_applies_offset() {
        let sb = SourceBuffer::new("video", "video/mp4");
        sb.set_timestamp_offset(100.0).unwrap();
        let ranges = append(&sb, &segment(0.0, 2.0)).unwrap();
        assert_eq!(pairs(&ranges), vec![(100.0, 102.0)]);
    }

    #[test]
    fn test_sequence_mode_concatenates() {
        let sb = SourceBuffer::new("video", "video/mp4");
        sb.set_mode(AppendMode::Sequence).unwrap();
        assert_eq!(pairs(&append(&sb, &segment(0.0, 5.0)).unwrap()), vec![(0.0, 5.0)]);

        let ranges = append(&sb, &segment(10.0, 15.0)).unwrap();
        assert_eq!(pairs(&ranges), vec![(0.0, 10.0)]);
        assert_eq!(sb.timestamp_offset(), -5.0);
    }

    #[test]
    fn test_sequence_mode_honours_explicit_offset() {
        let sb = SourceBuffer::new("video", "video/mp4");
        sb.set_mode(AppendMode::Sequence).unwrap();
        append(&sb, &segment(0.0, 5.0)).unwrap();
        sb.set_timestamp_offset(20.0).unwrap();

        let ranges = append(&sb, &segment(0.0, 1.0)).unwrap();
        assert_eq!(pairs(&ranges), vec![(0.0, 5.0), (20.0, 21.0)]);
    }

    #[test]
    fn test_append_window_clips() {
        let sb = SourceBuffer::new("video", "video/mp4");
        let payload = segment(0.0, 10.0);
        let ranges = sb
            .append(
                &RawSampleDemuxer,
                AppendRequest::whole(7, &payload).with_window(2.0, 8.0),
                MSE_VIDEO_BUFFER_SIZE,
            )
            .unwrap();
        assert_eq!(pairs(&ranges), vec![(2.0, 8.0)]);
        assert_eq!(sb.append_window(), AppendWindow::new(2.0, 8.0));
    }

    #[test]
    fn test_append_window_drops_samples_outside() {
        let sb = SourceBuffer::new("video", "video/mp4");
        let payload = RawSampleDemuxer::encode(&[
            CodedSample::new(0.0, 1.0),
            CodedSample::new(1.0, 1.0),
            CodedSample::new(5.0, 1.0),
        ]);
        let ranges = sb
            .append(
                &RawSampleDemuxer,
                AppendRequest::whole(1, &payload).with_window(1.0, 3.0),
                MSE_VIDEO_BUFFER_SIZE,
            )
            .unwrap();
        assert_eq!(pairs(&ranges), vec![(1.0, 2.0)]);
    }

    #[test]
    fn test_malformed_window_rejected() {
        let sb = SourceBuffer::new("video", "video/mp4");
        let payload = segment(0.0, 1.0);
        let err = sb
            .append(
                &RawSampleDemuxer,
                AppendRequest::whole(1, &payload).with_window(8.0, 2.0),
                MSE_VIDEO_BUFFER_SIZE,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Range(_)));
        assert!(!sb.is_updating());
    }

    #[test]
    fn test_payload_bounds_checked() {
        let sb = SourceBuffer::new("video", "video/mp4");
        let payload = segment(0.0, 1.0);
        let request = AppendRequest {
            offset: 10,
            length: payload.len(),
            ..AppendRequest::whole(1, &payload)
        };
        let err = sb.append(&RawSampleDemuxer, request, MSE_VIDEO_BUFFER_SIZE).unwrap_err();
        assert!(matches!(err, EngineError::Range(_)));
    }

    #[test]
    fn test_subslice_append() {
        let sb = SourceBuffer::new("video", "video/mp4");
        let mut payload = vec![0xAA; 3];
        payload.extend(segment(4.0, 6.0));
        payload.extend([0xBB; 2]);
        let request = AppendRequest {
            offset: 3,
            length: RawSampleDemuxer::RECORD_LEN,
            ..AppendRequest::whole(1, &payload)
        };
        let ranges = sb.append(&RawSampleDemuxer, request, MSE_VIDEO_BUFFER_SIZE).unwrap();
        assert_eq!(pairs(&ranges), vec![(4.0, 6.0)]);
    }

    #[test]
    fn test_overlapping_reappend_is_idempotent() {
        let sb = SourceBuffer::new("video", "video/mp4");
        append(&sb, &segment(0.0, 4.0)).unwrap();
        append(&sb, &segment(2.0, 6.0)).unwrap();
        let ranges = append(&sb, &segment(0.0, 6.0)).unwrap();
        assert_eq!(pairs(&ranges), vec![(0.0, 6.0)]);
    }

    #[test]
    fn test_capacity_exceeded_leaves_state_unchanged() {
        let sb = SourceBuffer::new("video", "video/mp4");
        for i in 0..MSE_VIDEO_BUFFER_SIZE {
            let start = i as f64 * 10.0;
            append(&sb, &segment(start, start + 1.0)).unwrap();
        }
        let before = sb.buffered();

        let err = append(&sb, &segment(500.0, 501.0)).unwrap_err();
        assert_eq!(
            err,
            EngineError::capacity(MSE_VIDEO_BUFFER_SIZE + 1, MSE_VIDEO_BUFFER_SIZE)
        );
        assert_eq!(sb.buffered(), before);
        assert!(!sb.is_updating());

        // Bridging two ranges lowers the count and is accepted.
        let ranges = append(&sb, &segment(0.0, 15.0)).unwrap();
        assert_eq!(ranges.len(), MSE_VIDEO_BUFFER_SIZE - 1);
    }

    #[test]
    fn test_remove_range() {
        let sb = SourceBuffer::new("video", "video/mp4");
        append(&sb, &segment(0.0, 10.0)).unwrap();
        let ranges = remove(&sb, 2.0, 3.0).unwrap();
        assert_eq!(pairs(&ranges), vec![(0.0, 2.0), (3.0, 10.0)]);

        assert!(remove(&sb, 20.0, 30.0).is_ok());
        assert!(matches!(remove(&sb, 5.0, 4.0), Err(EngineError::Range(_))));
        assert!(matches!(remove(&sb, f64::NAN, 4.0), Err(EngineError::Range(_))));
    }

    #[test]
    fn test_remove_split_past_capacity_rejected() {
        let sb = SourceBuffer::new("video", "video/mp4");
        for i in 0..MSE_VIDEO_BUFFER_SIZE {
            let start = 10_000.0 + i as f64 * 10.0;
            append(&sb, &segment(start, start + 5.0)).unwrap();
        }
        let before = sb.buffered();

        let err = remove(&sb, 10_001.0, 10_002.0).unwrap_err();
        assert_eq!(
            err,
            EngineError::capacity(MSE_VIDEO_BUFFER_SIZE + 1, MSE_VIDEO_BUFFER_SIZE)
        );
        assert_eq!(sb.buffered(), before);

        // Re-appending time already buffered still succeeds.
        let ranges = append(&sb, &segment(10_000.0, 10_000.5)).unwrap();
        assert_eq!(ranges.len(), MSE_VIDEO_BUFFER_SIZE);

        // Trimming the head of a range does not split it.
        let ranges = remove(&sb, 10_000.0, 10_001.0).unwrap();
        assert_eq!(ranges.len(), MSE_VIDEO_BUFFER_SIZE);
        assert_eq!(ranges[0], TimeRange::new(10_001.0, 10_005.0));
    }

    #[test]
    fn test_concurrent_append_rejected() {
        let sb = Arc::new(SourceBuffer::new("video", "video/mp4"));
        let (demuxer, started, release) = gated();

        let worker = {
            let sb = Arc::clone(&sb);
            let demuxer = Arc::clone(&demuxer);
            thread::spawn(move || {
                let payload = segment(0.0, 5.0);
                sb.append(demuxer.as_ref(), AppendRequest::whole(1, &payload), 10)
            })
        };

        started.recv().unwrap();
        assert!(sb.is_updating());
        let err = append(&sb, &segment(3.0, 8.0)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
        assert!(matches!(sb.change_type("video/webm"), Err(EngineError::InvalidState(_))));
        assert!(matches!(remove(&sb, 0.0, 1.0), Err(EngineError::InvalidState(_))));

        release.send(()).unwrap();
        let ranges = worker.join().unwrap().unwrap();
        assert_eq!(pairs(&ranges), vec![(0.0, 5.0)]);
        sb.buffered().check_invariant().unwrap();
    }

    #[test]
    fn test_abort_discards_in_flight_append() {
        let sb = Arc::new(SourceBuffer::new("video", "video/mp4"));
        append(&sb, &segment(0.0, 1.0)).unwrap();
        let (demuxer, started, release) = gated();

        let worker = {
            let sb = Arc::clone(&sb);
            let demuxer = Arc::clone(&demuxer);
            thread::spawn(move || {
                let payload = segment(1.0, 5.0);
                sb.append(demuxer.as_ref(), AppendRequest::whole(2, &payload), 10)
            })
        };

        started.recv().unwrap();
        assert!(sb.abort());
        assert!(!sb.is_updating());
        release.send(()).unwrap();

        let err = worker.join().unwrap().unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
        assert_eq!(pairs(sb.buffered().as_slice()), vec![(0.0, 1.0)]);

        // The buffer is usable again after the abort.
        assert_eq!(pairs(&append(&sb, &segment(1.0, 2.0)).unwrap()), vec![(0.0, 2.0)]);
    }

    #[test]
    fn test_abort_idle_resets_window() {
        let sb = SourceBuffer::new("video", "video/mp4");
        let payload = segment(0.0, 1.0);
        sb.append(
            &RawSampleDemuxer,
            AppendRequest::whole(1, &payload).with_window(0.5, 3.0),
            10,
        )
        .unwrap();
        assert!(!sb.abort());
        assert_eq!(sb.append_window(), AppendWindow::default());
    }

    #[test]
    fn test_append_mode_parse() {
        assert_eq!("sequence".parse::<AppendMode>().unwrap(), AppendMode::Sequence);
        assert_eq!("segments".parse::<AppendMode>().unwrap(), AppendMode::Segments);
        assert!("Sequence".parse::<AppendMode>().is_err());
    }
}
