//! Aligns independently paced series into time-ordered slices.

use crate::error::CoreError;
use crate::slice::DataSlice;
use crate::source::TimeSeries;
use crate::types::{
    ConfigurationEvent, DataPoint, Gid, SamplingInterval, Tid, Timestamp, ValueDataPoint,
};

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashSet};
use std::fmt;

type QueueKey = Reverse<(Timestamp, SamplingInterval, Tid, usize)>;

/// A fixed set of series whose points are merged into [`DataSlice`]s.
///
/// Interval changes found while reading ahead are kept aside and must be fetched with
/// [`TimeSeriesGroup::pending_configuration_events`] before the next slice is processed.
pub struct TimeSeriesGroup {
    gid: Gid,
    bounded: bool,
    series: Vec<Box<dyn TimeSeries>>,
    tids: BTreeSet<Tid>,
    heads: Vec<Option<ValueDataPoint>>,
    queue: BinaryHeap<QueueKey>,
    live: usize,
    pending: Vec<ConfigurationEvent>,
    initialized: bool,
}

impl fmt::Debug for TimeSeriesGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeSeriesGroup")
            .field("gid", &self.gid)
            .field("tids", &self.tids)
            .field("bounded", &self.bounded)
            .field("live", &self.live)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl TimeSeriesGroup {
    /// # Errors
    /// [`CoreError::EmptyGroup`] without series, [`CoreError::MixedBoundedness`] when bounded
    /// and unbounded series are mixed, [`CoreError::Configuration`] on duplicate ids.
    pub fn new(gid: Gid, series: Vec<Box<dyn TimeSeries>>) -> Result<Self, CoreError> {
        let bounded = match series.first() {
            Some(first) => first.is_bounded(),
            None => return Err(CoreError::EmptyGroup),
        };
        if series.iter().any(|s| s.is_bounded() != bounded) {
            return Err(CoreError::MixedBoundedness);
        }
        let mut seen = HashSet::with_capacity(series.len());
        for s in &series {
            if !seen.insert(s.tid()) {
                return Err(CoreError::Configuration(format!(
                    "time series {} occurs more than once in group {}",
                    s.tid(),
                    gid
                )));
            }
        }

        Ok(Self {
            gid,
            bounded,
            tids: series.iter().map(|s| s.tid()).collect(),
            heads: vec![None; series.len()],
            queue: BinaryHeap::with_capacity(series.len()),
            live: 0,
            pending: Vec::new(),
            initialized: false,
            series,
        })
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn tids(&self) -> &BTreeSet<Tid> {
        &self.tids
    }

    pub fn size(&self) -> usize {
        self.series.len()
    }

    pub fn is_bounded(&self) -> bool {
        self.bounded
    }

    /// Number of series that still have unread value points.
    pub fn active_series(&self) -> usize {
        self.live
    }

    /// Opens every series and reads up to its first value point.
    pub fn initialize(&mut self) -> Result<(), CoreError> {
        if self.initialized {
            return Ok(());
        }
        for index in 0..self.series.len() {
            self.series[index].open()?;
            if self.advance(index)? {
                self.live += 1;
            }
        }
        self.initialized = true;
        Ok(())
    }

    pub fn has_next(&self) -> bool {
        self.live != 0
    }

    /// Collects every head point sharing the minimum `(timestamp, sampling interval)`,
    /// refills the queue from the consumed series and gap-fills the remaining group ids.
    pub fn get_slice(&mut self) -> Result<DataSlice, CoreError> {
        if !self.initialized {
            return Err(CoreError::Internal(format!(
                "group {} was read before it was initialized",
                self.gid
            )));
        }
        let Reverse((timestamp, sampling_interval, _, first)) =
            self.queue.pop().ok_or_else(|| {
                CoreError::Internal(format!("group {} has no data points left", self.gid))
            })?;

        let mut batch = Vec::new();
        let mut index = first;
        loop {
            let point = self.heads[index].take().ok_or_else(|| {
                CoreError::Internal(format!("queued series {} has no head point", index))
            })?;
            batch.push(point);
            if !self.advance(index)? {
                self.live -= 1;
            }

            let same_step = matches!(
                self.queue.peek(),
                Some(Reverse((ts, si, _, _))) if *ts == timestamp && *si == sampling_interval
            );
            if !same_step {
                break;
            }
            match self.queue.pop() {
                Some(Reverse((.., next))) => index = next,
                None => break,
            }
        }

        let mut slice = DataSlice::new(batch, sampling_interval)?;
        slice.add_gaps_for_missing(&self.tids);
        Ok(slice)
    }

    /// Drains the interval changes seen since the last call.
    pub fn pending_configuration_events(&mut self) -> Vec<ConfigurationEvent> {
        std::mem::take(&mut self.pending)
    }

    pub fn close(&mut self) -> Result<(), CoreError> {
        for series in &mut self.series {
            series.close()?;
        }
        Ok(())
    }

    /// Reads the next value point of one series into the queue, recording configuration
    /// events on the way. Returns false once the series is exhausted.
    fn advance(&mut self, index: usize) -> Result<bool, CoreError> {
        let series = &mut self.series[index];
        while series.has_next()? {
            match series.next()? {
                DataPoint::Configuration(event) => self.pending.push(event),
                DataPoint::Value(point) => {
                    self.queue.push(Reverse((
                        point.timestamp,
                        point.sampling_interval,
                        point.tid,
                        index,
                    )));
                    self.heads[index] = Some(point);
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}
