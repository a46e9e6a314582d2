//! Replication progress vector

use std::fmt;

use serde::{Deserialize, Serialize};

use super::segment::ProgressSegment;
use crate::errors::{ChaosError, ChaosResult};
use crate::types::{Key, Timestamp};

/// Replication progress of one replica
///
/// # Invariants
///
/// - at least one segment
/// - segment lower keys strictly increase
/// - every lower key is below `upper_key`
/// - `upper_key` is never `Key::Min`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationProgress {
    segments: Vec<ProgressSegment>,
    upper_key: Key,
}

impl ReplicationProgress {
    /// Build a progress from explicit segments
    pub fn new(segments: Vec<ProgressSegment>, upper_key: Key) -> ChaosResult<Self> {
        let progress = Self {
            segments,
            upper_key,
        };
        progress.validate()?;
        Ok(progress)
    }

    /// Progress covering the whole key space at a single timestamp
    pub fn uniform(timestamp: Timestamp) -> Self {
        Self {
            segments: vec![ProgressSegment::new(Key::Min, timestamp)],
            upper_key: Key::Max,
        }
    }

    /// Progress covering `[lower, upper)` at a single timestamp
    pub fn over_range(lower: Key, upper: Key, timestamp: Timestamp) -> ChaosResult<Self> {
        Self::new(vec![ProgressSegment::new(lower, timestamp)], upper)
    }

    /// Check the structural invariants
    pub fn validate(&self) -> ChaosResult<()> {
        if self.segments.is_empty() {
            return Err(ChaosError::invalid_request(
                "replication progress must have at least one segment",
            ));
        }
        if self.upper_key.is_min() {
            return Err(ChaosError::invalid_request(
                "replication progress upper key cannot be the minimum key",
            ));
        }
        for pair in self.segments.windows(2) {
            if pair[0].lower_key >= pair[1].lower_key {
                return Err(ChaosError::invalid_request(format!(
                    "replication progress segments are not sorted: {} >= {}",
                    pair[0].lower_key, pair[1].lower_key
                )));
            }
        }
        let last = &self.segments[self.segments.len() - 1];
        if last.lower_key >= self.upper_key {
            return Err(ChaosError::invalid_request(format!(
                "replication progress segment {} is not below upper key {}",
                last.lower_key, self.upper_key
            )));
        }
        Ok(())
    }

    pub fn segments(&self) -> &[ProgressSegment] {
        &self.segments
    }

    pub fn upper_key(&self) -> &Key {
        &self.upper_key
    }

    /// First key covered by this progress
    pub fn lower_key(&self) -> &Key {
        &self.segments[0].lower_key
    }

    /// Whether `[lower, upper)` lies entirely inside the covered range
    pub fn covers(&self, lower: &Key, upper: &Key) -> bool {
        self.lower_key() <= lower && upper <= &self.upper_key
    }

    fn segment_end(&self, index: usize) -> &Key {
        self.segments
            .get(index + 1)
            .map(|s| &s.lower_key)
            .unwrap_or(&self.upper_key)
    }

    fn find_segment(&self, key: &Key) -> Option<usize> {
        if key < self.lower_key() || key >= &self.upper_key {
            return None;
        }
        let position = self.segments.partition_point(|s| &s.lower_key <= key);
        Some(position - 1)
    }

    /// Introduce a segment boundary at `key` without changing any timestamp
    fn split_at(&mut self, key: &Key) {
        if let Some(index) = self.find_segment(key) {
            if &self.segments[index].lower_key != key {
                let timestamp = self.segments[index].timestamp;
                self.segments
                    .insert(index + 1, ProgressSegment::new(key.clone(), timestamp));
            }
        }
    }

    /// Coalesce adjacent segments with equal timestamps
    pub fn canonicalize(&mut self) {
        self.segments.dedup_by(|next, prev| next.timestamp == prev.timestamp);
    }

    /// Raise every key in `[lower, upper)` to at least `timestamp`
    ///
    /// Keys outside the covered range are ignored; progress never
    /// decreases.
    pub fn advance(&mut self, lower: &Key, upper: &Key, timestamp: Timestamp) -> ChaosResult<()> {
        if lower > upper {
            return Err(ChaosError::invalid_request(format!(
                "invalid key range [{}, {})",
                lower, upper
            )));
        }
        if lower == upper {
            return Ok(());
        }

        self.split_at(lower);
        self.split_at(upper);
        for segment in self.segments.iter_mut() {
            if &segment.lower_key >= lower && &segment.lower_key < upper {
                segment.timestamp = segment.timestamp.max(timestamp);
            }
        }
        self.canonicalize();
        Ok(())
    }

    /// Raise the whole covered range to at least `timestamp`
    pub fn advance_all(&mut self, timestamp: Timestamp) {
        for segment in self.segments.iter_mut() {
            segment.timestamp = segment.timestamp.max(timestamp);
        }
        self.canonicalize();
    }

    /// Pointwise maximum with `other` over the range both cover
    pub fn update(&mut self, other: &ReplicationProgress) -> ChaosResult<()> {
        other.validate()?;
        let ranges: Vec<(Key, Key, Timestamp)> = (0..other.segments.len())
            .map(|i| {
                (
                    other.segments[i].lower_key.clone(),
                    other.segment_end(i).clone(),
                    other.segments[i].timestamp,
                )
            })
            .collect();
        for (lower, upper, timestamp) in ranges {
            self.advance(&lower, &upper, timestamp)?;
        }
        Ok(())
    }

    /// Pointwise minimum with `other` over the range this progress covers
    ///
    /// Keys `other` does not cover keep their own timestamp.
    pub fn intersect(&self, other: &ReplicationProgress) -> ReplicationProgress {
        let mut points: Vec<&Key> = self
            .segments
            .iter()
            .chain(other.segments.iter())
            .map(|s| &s.lower_key)
            .filter(|k| *k >= self.lower_key() && **k < self.upper_key)
            .collect();
        points.sort();
        points.dedup();

        let segments = points
            .into_iter()
            .filter_map(|point| {
                let mine = self.timestamp_at(point)?;
                let timestamp = other.timestamp_at(point).map_or(mine, |t| t.min(mine));
                Some(ProgressSegment::new(point.clone(), timestamp))
            })
            .collect();
        let mut result = Self {
            segments,
            upper_key: self.upper_key.clone(),
        };
        result.canonicalize();
        result
    }

    /// Re-derive segments for a new tablet partitioning
    ///
    /// Existing segments are split at each pivot key and every piece keeps
    /// the timestamp of the segment it came from. Pivots outside the
    /// covered range are ignored and the upper key is preserved, so the
    /// operation is idempotent.
    pub fn reshape(&mut self, pivots: &[Key]) {
        for pivot in pivots {
            self.split_at(pivot);
        }
    }

    pub fn min_timestamp(&self) -> Timestamp {
        self.segments
            .iter()
            .map(|s| s.timestamp)
            .min()
            .unwrap_or(Timestamp::MIN)
    }

    pub fn max_timestamp(&self) -> Timestamp {
        self.segments
            .iter()
            .map(|s| s.timestamp)
            .max()
            .unwrap_or(Timestamp::MIN)
    }

    /// Timestamp of the segment containing `key`
    pub fn timestamp_at(&self, key: &Key) -> Option<Timestamp> {
        self.find_segment(key).map(|i| self.segments[i].timestamp)
    }

    /// Minimum timestamp over segments intersecting `[lower, upper)`
    pub fn min_timestamp_in(&self, lower: &Key, upper: &Key) -> Option<Timestamp> {
        (0..self.segments.len())
            .filter(|&i| &self.segments[i].lower_key < upper && self.segment_end(i) > lower)
            .map(|i| self.segments[i].timestamp)
            .min()
    }

    /// Whether every covered key is replicated up to `timestamp`
    pub fn is_at_least(&self, timestamp: Timestamp) -> bool {
        self.min_timestamp() >= timestamp
    }

    /// Restriction of this progress to `[lower, upper)`
    pub fn slice(&self, lower: &Key, upper: &Key) -> Option<ReplicationProgress> {
        let lower = lower.max(self.lower_key());
        let upper = upper.min(&self.upper_key);
        if lower >= upper {
            return None;
        }
        let first = self.find_segment(lower)?;
        let mut segments = vec![ProgressSegment::new(
            lower.clone(),
            self.segments[first].timestamp,
        )];
        segments.extend(
            self.segments[first + 1..]
                .iter()
                .take_while(|s| &s.lower_key < upper)
                .cloned(),
        );
        Some(Self {
            segments,
            upper_key: upper.clone(),
        })
    }

    /// Whether this progress is at least `other` at every key both cover
    pub fn is_greater_or_equal(&self, other: &ReplicationProgress) -> bool {
        let lower = self.lower_key().max(other.lower_key());
        let upper = self.upper_key.clone().min(other.upper_key.clone());
        if lower >= &upper {
            return true;
        }

        let mut points: Vec<&Key> = vec![lower];
        points.extend(
            self.segments
                .iter()
                .chain(other.segments.iter())
                .map(|s| &s.lower_key)
                .filter(|k| *k > lower && **k < upper),
        );
        points.into_iter().all(|point| {
            match (self.timestamp_at(point), other.timestamp_at(point)) {
                (Some(mine), Some(theirs)) => mine >= theirs,
                _ => true,
            }
        })
    }
}

impl fmt::Display for ReplicationProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", segment.lower_key, segment.timestamp)?;
        }
        write!(f, "}} upper {}", self.upper_key)
    }
}
