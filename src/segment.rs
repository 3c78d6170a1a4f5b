//! The emitted segment record, the sink it is delivered to, and expansion of a stored
//! group segment into per-series segments.

use crate::encoding::{bytes_to_ints, ints_to_bytes, write_i32};
use crate::error::CoreError;
use crate::models::{ModelTypeRegistry, Mtid};
use crate::types::{Gid, SamplingInterval, Tid, Timestamp, Value};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// One fitted model covering every non-gapped series of a (sub)group over `[start, end]`.
///
/// `gaps` holds the ids of the group's series the model does not represent, packed as
/// big-endian `i32`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentGroup {
    pub gid: Gid,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub sampling_interval: SamplingInterval,
    pub mtid: Mtid,
    pub model: Vec<u8>,
    pub gaps: Vec<u8>,
}

impl SegmentGroup {
    pub fn new(
        gid: Gid,
        start_time: Timestamp,
        sampling_interval: SamplingInterval,
        end_time: Timestamp,
        mtid: Mtid,
        model: Vec<u8>,
        gaps: Vec<u8>,
    ) -> Self {
        Self {
            gid,
            start_time,
            end_time,
            sampling_interval,
            mtid,
            model,
            gaps,
        }
    }

    pub fn gap_ids(&self) -> Result<Vec<Tid>, CoreError> {
        bytes_to_ints(&self.gaps)
    }

    /// Number of timestamps covered.
    pub fn length(&self) -> usize {
        if self.sampling_interval <= 0 || self.end_time < self.start_time {
            return 0;
        }
        ((self.end_time - self.start_time) / self.sampling_interval as i64 + 1) as usize
    }

    /// Expands a stored group segment into one segment per represented series.
    ///
    /// Each produced segment has `gid` set to the series id and its gaps replaced by 12 bytes:
    /// group offset (1-based), stored group size and temporal offset. A negative trailing gap
    /// entry is not a series id but a temporal offset from `start_time`. Derived series get a
    /// copy of their source's segment.
    pub fn explode(
        &self,
        metadata: &GroupMetadataCache,
        derived: &DerivedSeriesCache,
    ) -> Result<Vec<SegmentGroup>, CoreError> {
        let group = metadata.get(self.gid).ok_or_else(|| {
            CoreError::Internal(format!("No metadata is cached for group {}", self.gid))
        })?;
        let mut gaps = self.gap_ids()?;
        let mut temporal_offset = 0;
        if let Some(&last) = gaps.last() {
            if last < 0 {
                temporal_offset = -last;
                gaps.pop();
            }
        }
        let stored_group_size = group.tids.len().saturating_sub(gaps.len()) as i32;

        let mut segments: Vec<SegmentGroup> = Vec::with_capacity(group.tids.len());
        for &tid in group.tids.iter().filter(|tid| !gaps.contains(tid)) {
            let mut offsets = Vec::with_capacity(12);
            write_i32(&mut offsets, segments.len() as i32 + 1);
            write_i32(&mut offsets, stored_group_size);
            write_i32(&mut offsets, temporal_offset);
            segments.push(self.with_series(tid, offsets));
        }

        let stored = segments.len();
        for &(source, derived_tid) in derived.get(self.gid) {
            if let Some(segment) = segments[..stored].iter().find(|s| s.gid == source) {
                let copy = self.with_series(derived_tid, segment.gaps.clone());
                segments.push(copy);
            }
        }
        Ok(segments)
    }

    /// Decodes the values of every represented series, in id order, keyed by series id.
    pub fn reconstruct(
        &self,
        registry: &ModelTypeRegistry,
        metadata: &GroupMetadataCache,
    ) -> Result<Vec<(Tid, Vec<(Timestamp, Value)>)>, CoreError> {
        let group = metadata.get(self.gid).ok_or_else(|| {
            CoreError::Internal(format!("No metadata is cached for group {}", self.gid))
        })?;
        let kind = registry.kind_of(self.mtid).ok_or_else(|| {
            CoreError::Serialization(format!("Unknown model type id {}", self.mtid))
        })?;
        let gaps = self.gap_ids()?;
        let mut tids: Vec<Tid> = group
            .tids
            .iter()
            .copied()
            .filter(|tid| !gaps.contains(tid))
            .collect();
        tids.sort_unstable();

        let rows = kind.decode(
            &self.model,
            self.start_time,
            self.end_time,
            self.sampling_interval,
            tids.len(),
        )?;
        Ok(tids
            .iter()
            .enumerate()
            .map(|(column, &tid)| {
                let values = rows
                    .iter()
                    .enumerate()
                    .map(|(row, values)| {
                        (
                            self.start_time + row as i64 * self.sampling_interval as i64,
                            values[column],
                        )
                    })
                    .collect();
                (tid, values)
            })
            .collect())
    }

    fn with_series(&self, tid: Tid, gaps: Vec<u8>) -> SegmentGroup {
        SegmentGroup::new(
            tid,
            self.start_time,
            self.sampling_interval,
            self.end_time,
            self.mtid,
            self.model.clone(),
            gaps,
        )
    }
}

impl fmt::Display for SegmentGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Segment: [gid: {} | start: {} | end: {} | si: {} | mtid: {}",
            self.gid, self.start_time, self.end_time, self.sampling_interval, self.mtid
        )?;
        match self.gap_ids() {
            Ok(gaps) if !gaps.is_empty() => write!(f, " | gaps: {:?}", gaps)?,
            Ok(_) => {}
            Err(_) => write!(f, " | gaps: <{} bytes>", self.gaps.len())?,
        }
        f.write_str("]")
    }
}

/// Packs sorted gap ids for a segment record.
pub fn gaps_to_bytes<'a>(gaps: impl IntoIterator<Item = &'a Tid>) -> Vec<u8> {
    let ids: Vec<Tid> = gaps.into_iter().copied().collect();
    ints_to_bytes(&ids)
}

/// Authoritative or latency-bounded preview segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Finalized,
    /// Superseded by the next finalized or temporary segment covering the same span.
    Temporary,
}

impl SegmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentKind::Finalized => "finalized",
            SegmentKind::Temporary => "temporary",
        }
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives emitted segments. Shared across group workers, so implementations must be `Sync`.
pub trait SegmentSink: fmt::Debug + Send + Sync + 'static {
    fn emit(&self, kind: SegmentKind, segment: SegmentGroup) -> Result<(), CoreError>;
}

/// Keeps every emitted segment in memory, split by kind.
#[derive(Debug, Default)]
pub struct CollectingSink {
    finalized: Mutex<Vec<SegmentGroup>>,
    temporary: Mutex<Vec<SegmentGroup>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finalized(&self) -> Result<Vec<SegmentGroup>, CoreError> {
        Ok(self.finalized.lock()?.clone())
    }

    pub fn temporary(&self) -> Result<Vec<SegmentGroup>, CoreError> {
        Ok(self.temporary.lock()?.clone())
    }

    pub fn take_finalized(&self) -> Result<Vec<SegmentGroup>, CoreError> {
        Ok(std::mem::take(&mut *self.finalized.lock()?))
    }
}

impl SegmentSink for CollectingSink {
    fn emit(&self, kind: SegmentKind, segment: SegmentGroup) -> Result<(), CoreError> {
        match kind {
            SegmentKind::Finalized => self.finalized.lock()?.push(segment),
            SegmentKind::Temporary => self.temporary.lock()?.push(segment),
        }
        Ok(())
    }
}

/// Drops everything. Used when only metrics or events are of interest.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardingSink;

impl SegmentSink for DiscardingSink {
    fn emit(&self, _kind: SegmentKind, _segment: SegmentGroup) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Stored layout of a group: its sampling interval and member series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub sampling_interval: SamplingInterval,
    pub tids: Vec<Tid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupMetadataCache {
    groups: HashMap<Gid, GroupMetadata>,
}

impl GroupMetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Member ids are stored sorted, matching the column order of emitted models.
    pub fn insert(&mut self, gid: Gid, sampling_interval: SamplingInterval, tids: &[Tid]) {
        let mut tids = tids.to_vec();
        tids.sort_unstable();
        self.groups.insert(
            gid,
            GroupMetadata {
                sampling_interval,
                tids,
            },
        );
    }

    pub fn get(&self, gid: Gid) -> Option<&GroupMetadata> {
        self.groups.get(&gid)
    }
}

/// Series whose data is derived from another series of the same group, as
/// `(source, derived)` pairs per group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DerivedSeriesCache {
    derived: HashMap<Gid, Vec<(Tid, Tid)>>,
}

impl DerivedSeriesCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, gid: Gid, source: Tid, derived: Tid) {
        self.derived.entry(gid).or_default().push((source, derived));
    }

    pub fn get(&self, gid: Gid) -> &[(Tid, Tid)] {
        self.derived.get(&gid).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::bytes_to_ints;

    fn stored(gaps: &[i32]) -> SegmentGroup {
        SegmentGroup::new(1, 100, 100, 500, 2, vec![0, 0, 128, 63], ints_to_bytes(gaps))
    }

    fn offsets(segment: &SegmentGroup) -> Vec<i32> {
        bytes_to_ints(&segment.gaps).unwrap()
    }

    #[test]
    fn display_lists_gaps_only_when_present() {
        assert_eq!(
            stored(&[]).to_string(),
            "Segment: [gid: 1 | start: 100 | end: 500 | si: 100 | mtid: 2]"
        );
        assert_eq!(
            stored(&[2, 3]).to_string(),
            "Segment: [gid: 1 | start: 100 | end: 500 | si: 100 | mtid: 2 | gaps: [2, 3]]"
        );
    }

    #[test]
    fn explode_skips_gapped_series() {
        let mut metadata = GroupMetadataCache::new();
        metadata.insert(1, 100, &[3, 1, 2]);
        let segments = stored(&[2])
            .explode(&metadata, &DerivedSeriesCache::new())
            .unwrap();

        let tids: Vec<Tid> = segments.iter().map(|s| s.gid).collect();
        assert_eq!(tids, vec![1, 3]);
        assert_eq!(offsets(&segments[0]), vec![1, 2, 0]);
        assert_eq!(offsets(&segments[1]), vec![2, 2, 0]);
        assert!(segments.iter().all(|s| s.model == stored(&[]).model));
    }

    #[test]
    fn explode_reads_a_trailing_temporal_offset() {
        let mut metadata = GroupMetadataCache::new();
        metadata.insert(1, 100, &[1, 2]);
        let segments = stored(&[-300])
            .explode(&metadata, &DerivedSeriesCache::new())
            .unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(offsets(&segments[1]), vec![2, 2, 300]);
    }

    #[test]
    fn explode_copies_segments_for_derived_series() {
        let mut metadata = GroupMetadataCache::new();
        metadata.insert(1, 100, &[1, 2]);
        let mut derived = DerivedSeriesCache::new();
        derived.insert(1, 2, 20);
        derived.insert(1, 1, 10);

        let segments = stored(&[]).explode(&metadata, &derived).unwrap();
        let tids: Vec<Tid> = segments.iter().map(|s| s.gid).collect();
        assert_eq!(tids, vec![1, 2, 20, 10]);
        assert_eq!(segments[2].gaps, segments[1].gaps);
        assert_eq!(segments[3].gaps, segments[0].gaps);

        // Derived series of a gapped source are skipped too.
        let gapped = stored(&[2]).explode(&metadata, &derived).unwrap();
        let tids: Vec<Tid> = gapped.iter().map(|s| s.gid).collect();
        assert_eq!(tids, vec![1, 10]);
    }

    #[test]
    fn explode_requires_group_metadata() {
        assert!(stored(&[])
            .explode(&GroupMetadataCache::new(), &DerivedSeriesCache::new())
            .is_err());
    }

    #[test]
    fn collecting_sink_separates_kinds() {
        let sink = CollectingSink::new();
        sink.emit(SegmentKind::Temporary, stored(&[])).unwrap();
        sink.emit(SegmentKind::Finalized, stored(&[1])).unwrap();
        assert_eq!(sink.temporary().unwrap().len(), 1);
        assert_eq!(sink.take_finalized().unwrap().len(), 1);
        assert!(sink.finalized().unwrap().is_empty());
    }
}
