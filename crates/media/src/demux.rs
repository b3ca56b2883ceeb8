//! Segment demuxing collaborator.
//!
//! The engine never parses containers itself. A [`SegmentDemuxer`] turns the
//! bytes of one appended segment into coded samples carrying their
//! timestamps; the source buffer only needs those timestamps to update its
//! buffered ranges.

use common::EngineError;

/// One coded sample of an appended segment, timestamps in seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CodedSample {
    pub pts: f64,
    pub dts: f64,
    pub duration: f64,
    pub is_key_frame: bool,
}

impl CodedSample {
    pub fn new(pts: f64, duration: f64) -> Self {
        Self {
            pts,
            dts: pts,
            duration,
            is_key_frame: true,
        }
    }

    /// Presentation end time.
    #[inline]
    pub fn end(&self) -> f64 {
        self.pts + self.duration
    }
}

/// Demuxer error.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DemuxError {
    #[error("Malformed segment: {0}")]
    Malformed(String),

    #[error("Unsupported container: {0}")]
    Unsupported(String),
}

impl From<DemuxError> for EngineError {
    fn from(err: DemuxError) -> Self {
        match err {
            DemuxError::Malformed(msg) => {
                EngineError::invalid_state(format!("segment parsing failed: {}", msg))
            }
            DemuxError::Unsupported(msg) => EngineError::not_supported(msg),
        }
    }
}

/// Parses appended segments into coded samples.
pub trait SegmentDemuxer: Send + Sync {
    /// Demux one segment. An empty result (an initialization segment, for
    /// example) is valid and leaves the buffered ranges untouched.
    fn demux(&self, mime_type: &str, payload: &[u8]) -> Result<Vec<CodedSample>, DemuxError>;
}

/// Demuxer for a fixed-width sample table.
///
/// Each record is 25 bytes: `pts`, `dts` and `duration` as little-endian
/// `f64`, then a flags byte whose low bit marks a key frame. Harnesses and
/// tests use it to drive the append path without a real container parser.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawSampleDemuxer;

impl RawSampleDemuxer {
    pub const RECORD_LEN: usize = 25;

    /// Serialize samples into the table layout read by [`demux`](SegmentDemuxer::demux).
    pub fn encode(samples: &[CodedSample]) -> Vec<u8> {
        let mut out = Vec::with_capacity(samples.len() * Self::RECORD_LEN);
        for sample in samples {
            out.extend_from_slice(&sample.pts.to_le_bytes());
            out.extend_from_slice(&sample.dts.to_le_bytes());
            out.extend_from_slice(&sample.duration.to_le_bytes());
            out.push(u8::from(sample.is_key_frame));
        }
        out
    }

    fn read_f64(bytes: &[u8]) -> Result<f64, DemuxError> {
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| DemuxError::Malformed("truncated timestamp".to_string()))?;
        Ok(f64::from_le_bytes(raw))
    }
}

impl SegmentDemuxer for RawSampleDemuxer {
    fn demux(&self, _mime_type: &str, payload: &[u8]) -> Result<Vec<CodedSample>, DemuxError> {
        if payload.len() % Self::RECORD_LEN != 0 {
            return Err(DemuxError::Malformed(format!(
                "{} bytes is not a whole number of {}-byte records",
                payload.len(),
                Self::RECORD_LEN
            )));
        }

        payload
            .chunks_exact(Self::RECORD_LEN)
            .map(|record| {
                let (pts, rest) = record.split_at(8);
                let (dts, rest) = rest.split_at(8);
                let (duration, flags) = rest.split_at(8);
                let sample = CodedSample {
                    pts: Self::read_f64(pts)?,
                    dts: Self::read_f64(dts)?,
                    duration: Self::read_f64(duration)?,
                    is_key_frame: flags.first().is_some_and(|f| f & 1 == 1),
                };
                if !sample.pts.is_finite() || !(sample.duration >= 0.0) {
                    return Err(DemuxError::Malformed(format!(
                        "invalid sample timing pts={} duration={}",
                        sample.pts, sample.duration
                    )));
                }
                Ok(sample)
            })
            .collect()
    }
}
