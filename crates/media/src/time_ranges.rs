//! Buffered time ranges.
//!
//! A [`TimeRanges`] value is the set of `[start, end)` intervals (in
//! seconds) for which decodable media is available. Ranges are kept sorted
//! by start and strictly separated: two ranges that touch or overlap are
//! always merged into one.

use common::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};

/// A half-open interval of media time, in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    #[inline]
    pub const fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    #[inline]
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }

    /// The part of this range that lies within `[start, end]`, if any.
    pub fn clip(&self, start: f64, end: f64) -> Option<TimeRange> {
        let clipped = TimeRange::new(self.start.max(start), self.end.min(end));
        if clipped.start < clipped.end {
            Some(clipped)
        } else {
            None
        }
    }
}

/// Buffered ranges in the flat form used across the host boundary.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferedArrays {
    pub start: Vec<f64>,
    pub end: Vec<f64>,
    pub count: usize,
}

/// Sorted, disjoint, non-adjacent set of time ranges.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimeRanges {
    ranges: Vec<TimeRange>,
}

impl TimeRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `[start, end)`, merging with every range it overlaps or touches.
    ///
    /// Empty and NaN intervals are ignored.
    pub fn add(&mut self, start: f64, end: f64) {
        if !(start < end) {
            return;
        }

        // First range that ends at or after `start` (touching counts).
        let first = self.ranges.partition_point(|r| r.end < start);
        // One past the last range that starts at or before `end`.
        let last = self.ranges.partition_point(|r| r.start <= end);

        if first >= last {
            self.ranges.insert(first, TimeRange::new(start, end));
            return;
        }

        let merged = TimeRange::new(
            start.min(self.ranges[first].start),
            end.max(self.ranges[last - 1].end),
        );
        self.ranges.splice(first..last, std::iter::once(merged));
    }

    /// Subtract `[start, end)`, splitting any range it bisects.
    ///
    /// Removing time that is not buffered is a no-op.
    pub fn remove(&mut self, start: f64, end: f64) {
        if !(start < end) {
            return;
        }

        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for range in self.ranges.drain(..) {
            if range.end <= start || range.start >= end {
                kept.push(range);
                continue;
            }
            if range.start < start {
                kept.push(TimeRange::new(range.start, start));
            }
            if range.end > end {
                kept.push(TimeRange::new(end, range.end));
            }
        }
        self.ranges = kept;
    }

    /// Ranges covered by both `self` and `other`.
    pub fn intersection(&self, other: &TimeRanges) -> TimeRanges {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while let (Some(a), Some(b)) = (self.ranges.get(i), other.ranges.get(j)) {
            let start = a.start.max(b.start);
            let end = a.end.min(b.end);
            if start < end {
                out.push(TimeRange::new(start, end));
            }
            if a.end < b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        TimeRanges { ranges: out }
    }

    /// Number of disjoint ranges.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn start(&self, idx: usize) -> Option<f64> {
        self.ranges.get(idx).map(|r| r.start)
    }

    pub fn end(&self, idx: usize) -> Option<f64> {
        self.ranges.get(idx).map(|r| r.end)
    }

    pub fn first(&self) -> Option<&TimeRange> {
        self.ranges.first()
    }

    pub fn last(&self) -> Option<&TimeRange> {
        self.ranges.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TimeRange> {
        self.ranges.iter()
    }

    pub fn as_slice(&self) -> &[TimeRange] {
        &self.ranges
    }

    /// The range containing `time`, if any.
    pub fn range_for(&self, time: f64) -> Option<&TimeRange> {
        let idx = self.ranges.partition_point(|r| r.end <= time);
        self.ranges.get(idx).filter(|r| r.contains(time))
    }

    pub fn contains(&self, time: f64) -> bool {
        self.range_for(time).is_some()
    }

    /// Seconds of contiguous media buffered from `time` onwards.
    pub fn buffered_ahead(&self, time: f64) -> f64 {
        self.range_for(time).map_or(0.0, |r| r.end - time)
    }

    /// Total covered time.
    pub fn total_duration(&self) -> f64 {
        self.ranges.iter().map(TimeRange::duration).sum()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Verify the sorted/disjoint/non-adjacent invariant.
    pub fn check_invariant(&self) -> EngineResult<()> {
        for range in &self.ranges {
            if !(range.start < range.end) {
                return Err(EngineError::internal(format!(
                    "degenerate buffered range [{}, {})",
                    range.start, range.end
                )));
            }
        }
        for pair in self.ranges.windows(2) {
            if let [a, b] = pair {
                if !(a.end < b.start) {
                    return Err(EngineError::internal(format!(
                        "buffered ranges [{}, {}) and [{}, {}) overlap or touch",
                        a.start, a.end, b.start, b.end
                    )));
                }
            }
        }
        Ok(())
    }

    /// Export the ranges, refusing to truncate when there are more than `max`.
    pub fn export(&self, max: usize) -> EngineResult<Vec<TimeRange>> {
        if self.ranges.len() > max {
            return Err(EngineError::capacity(self.ranges.len(), max));
        }
        Ok(self.ranges.clone())
    }

    /// Parallel start/end arrays plus count.
    pub fn to_arrays(&self) -> BufferedArrays {
        BufferedArrays {
            start: self.ranges.iter().map(|r| r.start).collect(),
            end: self.ranges.iter().map(|r| r.end).collect(),
            count: self.ranges.len(),
        }
    }
}

impl<'a> IntoIterator for &'a TimeRanges {
    type Item = &'a TimeRange;
    type IntoIter = std::slice::Iter<'a, TimeRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}

impl FromIterator<TimeRange> for TimeRanges {
    fn from_iter<I: IntoIterator<Item = TimeRange>>(iter: I) -> Self {
        let mut ranges = TimeRanges::new();
        for range in iter {
            ranges.add(range.start, range.end);
        }
        ranges
    }
}
