//! Time-aligned batches of data points.

use crate::error::CoreError;
use crate::types::{SamplingInterval, Tid, Timestamp, ValueDataPoint};

use std::collections::{BTreeSet, HashMap};

/// All readings of a group's series for one logical timestamp step.
///
/// Every point shares the slice's sampling interval and the points are kept ordered by tid.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSlice {
    sampling_interval: SamplingInterval,
    timestamp: Timestamp,
    points: Vec<ValueDataPoint>,
}

impl DataSlice {
    /// Builds a slice from a non-empty batch. The first point provides the slice timestamp.
    ///
    /// # Errors
    /// Returns [`CoreError::MixedSamplingIntervals`] if any point has another sampling interval,
    /// and [`CoreError::Internal`] for an empty batch.
    pub fn new(
        mut points: Vec<ValueDataPoint>,
        sampling_interval: SamplingInterval,
    ) -> Result<Self, CoreError> {
        let timestamp = match points.first() {
            Some(p) => p.timestamp,
            None => {
                return Err(CoreError::Internal(
                    "Refusing to build a slice without data points".to_string(),
                ))
            }
        };
        if let Some(p) = points
            .iter()
            .find(|p| p.sampling_interval != sampling_interval)
        {
            return Err(CoreError::MixedSamplingIntervals {
                expected: sampling_interval,
                found: p.sampling_interval,
                tid: p.tid,
            });
        }
        points.sort_by_key(|p| p.tid);
        Ok(Self {
            sampling_interval,
            timestamp,
            points,
        })
    }

    /// An empty slice, e.g. the share of a partition no point was routed to.
    pub fn empty(timestamp: Timestamp, sampling_interval: SamplingInterval) -> Self {
        Self {
            sampling_interval,
            timestamp,
            points: Vec::new(),
        }
    }

    pub fn sampling_interval(&self) -> SamplingInterval {
        self.sampling_interval
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn points(&self) -> &[ValueDataPoint] {
        &self.points
    }

    pub fn into_points(self) -> Vec<ValueDataPoint> {
        self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn tids(&self) -> BTreeSet<Tid> {
        self.points.iter().map(|p| p.tid).collect()
    }

    /// Inserts a gap point at the slice timestamp for every id in `all_tids` without a point.
    pub fn add_gaps_for_missing<'a, I>(&mut self, all_tids: I)
    where
        I: IntoIterator<Item = &'a Tid>,
    {
        let present = self.tids();
        let before = self.points.len();
        for &tid in all_tids {
            if !present.contains(&tid) {
                self.points.push(ValueDataPoint::gap(
                    tid,
                    self.timestamp,
                    self.sampling_interval,
                ));
            }
        }
        if self.points.len() != before {
            self.points.sort_by_key(|p| p.tid);
        }
    }

    /// Drops every point whose id is not in `tids`.
    pub fn retain_tids(&mut self, tids: &BTreeSet<Tid>) {
        self.points.retain(|p| tids.contains(&p.tid));
    }

    /// Splits the slice into one sub-slice per id set, in the order of `covers`.
    ///
    /// The sets are expected to be disjoint; points whose id is in none of them are dropped.
    pub fn partition(&self, covers: &[&BTreeSet<Tid>]) -> Vec<DataSlice> {
        let mut owner: HashMap<Tid, usize> = HashMap::new();
        for (index, cover) in covers.iter().enumerate() {
            for &tid in cover.iter() {
                owner.insert(tid, index);
            }
        }

        let mut parts: Vec<DataSlice> = covers
            .iter()
            .map(|_| DataSlice::empty(self.timestamp, self.sampling_interval))
            .collect();
        for point in &self.points {
            if let Some(&index) = owner.get(&point.tid) {
                parts[index].points.push(*point);
            }
        }
        parts
    }
}
