//! Point types flowing from the sources through the generators.

use serde::{Deserialize, Serialize};

/// Time series id.
pub type Tid = i32;

/// Time series group id.
pub type Gid = i32;

/// Timestamp type (milliseconds since epoch). Signed so deltas are cheap to compute.
pub type Timestamp = i64;

/// Value type.
pub type Value = f32;

/// Nominal spacing between two consecutive timestamps of a series.
pub type SamplingInterval = i32;

/// A single reading, or a synthesized gap when `value` is NaN.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueDataPoint {
    pub tid: Tid,
    pub timestamp: Timestamp,
    pub value: Value,
    pub sampling_interval: SamplingInterval,
}

impl ValueDataPoint {
    pub fn new(
        tid: Tid,
        timestamp: Timestamp,
        value: Value,
        sampling_interval: SamplingInterval,
    ) -> Self {
        Self {
            tid,
            timestamp,
            value,
            sampling_interval,
        }
    }

    /// Creates a gap point: no reading existed for `tid` at `timestamp`.
    pub fn gap(tid: Tid, timestamp: Timestamp, sampling_interval: SamplingInterval) -> Self {
        Self::new(tid, timestamp, Value::NAN, sampling_interval)
    }

    #[inline]
    pub fn is_gap(&self) -> bool {
        self.value.is_nan()
    }
}

/// Signals that a series changed its sampling interval.
///
/// `previous_sampling_interval == None` marks the initial interval of the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigurationEvent {
    pub tid: Tid,
    pub new_sampling_interval: SamplingInterval,
    pub previous_sampling_interval: Option<SamplingInterval>,
}

impl ConfigurationEvent {
    pub fn initial(tid: Tid, sampling_interval: SamplingInterval) -> Self {
        Self {
            tid,
            new_sampling_interval: sampling_interval,
            previous_sampling_interval: None,
        }
    }

    pub fn changed(tid: Tid, new: SamplingInterval, previous: SamplingInterval) -> Self {
        Self {
            tid,
            new_sampling_interval: new,
            previous_sampling_interval: Some(previous),
        }
    }
}

/// Anything a per-series source can produce.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataPoint {
    Value(ValueDataPoint),
    Configuration(ConfigurationEvent),
}

impl DataPoint {
    pub fn tid(&self) -> Tid {
        match self {
            DataPoint::Value(p) => p.tid,
            DataPoint::Configuration(c) => c.tid,
        }
    }
}

impl From<ValueDataPoint> for DataPoint {
    fn from(point: ValueDataPoint) -> Self {
        DataPoint::Value(point)
    }
}

impl From<ConfigurationEvent> for DataPoint {
    fn from(event: ConfigurationEvent) -> Self {
        DataPoint::Configuration(event)
    }
}
