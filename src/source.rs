//! Per-series point sources.
//!
//! Every source announces its initial sampling interval with a [`ConfigurationEvent`] before
//! the first value, and synthesizes a gap point (NaN) whenever the expected next timestamp
//! did not arrive. Raw input is modelled as a stream of [`Reading`]s so the gap detection is
//! shared by the in-memory, CSV and channel-fed sources.

use crate::error::CoreError;
use crate::types::{
    ConfigurationEvent, DataPoint, SamplingInterval, Tid, Timestamp, Value, ValueDataPoint,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

/// One raw input record before gap detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Sample { timestamp: Timestamp, value: Value },
    /// The series switches to a new sampling interval from here on.
    SamplingInterval(SamplingInterval),
}

impl Reading {
    pub fn sample(timestamp: Timestamp, value: Value) -> Self {
        Reading::Sample { timestamp, value }
    }
}

/// Polling interface of a single time series.
pub trait TimeSeries: fmt::Debug + Send {
    fn tid(&self) -> Tid;

    /// Bounded series end; unbounded ones block in [`TimeSeries::has_next`] until data arrives
    /// or the producer goes away.
    fn is_bounded(&self) -> bool {
        true
    }

    fn open(&mut self) -> Result<(), CoreError> {
        Ok(())
    }

    fn has_next(&mut self) -> Result<bool, CoreError>;

    /// # Errors
    /// [`CoreError::SourceExhausted`] when called after [`TimeSeries::has_next`] returned false.
    fn next(&mut self) -> Result<DataPoint, CoreError>;

    fn close(&mut self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Gap detection and interval bookkeeping shared by all sources.
#[derive(Debug, Clone)]
struct Cursor {
    tid: Tid,
    sampling_interval: SamplingInterval,
    expected: Option<Timestamp>,
    announced: bool,
    peeked: Option<Reading>,
}

impl Cursor {
    fn new(tid: Tid, sampling_interval: SamplingInterval) -> Self {
        Self {
            tid,
            sampling_interval,
            expected: None,
            announced: false,
            peeked: None,
        }
    }

    fn fill<I>(&mut self, readings: &mut I) -> Result<(), CoreError>
    where
        I: Iterator<Item = Result<Reading, CoreError>>,
    {
        if self.peeked.is_none() {
            self.peeked = readings.next().transpose()?;
        }
        Ok(())
    }

    fn has_next<I>(&mut self, readings: &mut I) -> Result<bool, CoreError>
    where
        I: Iterator<Item = Result<Reading, CoreError>>,
    {
        if !self.announced {
            return Ok(true);
        }
        self.fill(readings)?;
        Ok(self.peeked.is_some())
    }

    fn next<I>(&mut self, readings: &mut I) -> Result<DataPoint, CoreError>
    where
        I: Iterator<Item = Result<Reading, CoreError>>,
    {
        if !self.announced {
            self.announced = true;
            return Ok(ConfigurationEvent::initial(self.tid, self.sampling_interval).into());
        }
        self.fill(readings)?;
        let reading = self
            .peeked
            .ok_or(CoreError::SourceExhausted { tid: self.tid })?;

        match reading {
            Reading::SamplingInterval(new) => {
                self.peeked = None;
                if new <= 0 {
                    return Err(CoreError::Configuration(format!(
                        "series {} switched to non-positive sampling interval {}",
                        self.tid, new
                    )));
                }
                let previous = self.sampling_interval;
                if let Some(expected) = self.expected {
                    // Realign on the new cadence, measured from the last emitted timestamp.
                    let last = expected - previous as i64;
                    let new = new as i64;
                    self.expected = Some(last + (new - last.rem_euclid(new)));
                }
                self.sampling_interval = new;
                Ok(ConfigurationEvent::changed(self.tid, new, previous).into())
            }
            Reading::Sample { timestamp, value } => {
                let expected = *self.expected.get_or_insert(timestamp);
                if timestamp < expected {
                    return Err(CoreError::OutOfOrder {
                        tid: self.tid,
                        expected,
                        found: timestamp,
                    });
                }
                let point = if timestamp == expected {
                    self.peeked = None;
                    ValueDataPoint::new(self.tid, expected, value, self.sampling_interval)
                } else {
                    ValueDataPoint::gap(self.tid, expected, self.sampling_interval)
                };
                self.expected = Some(expected + self.sampling_interval as i64);
                Ok(point.into())
            }
        }
    }
}

/// Bounded series backed by readings held in memory.
#[derive(Debug, Clone)]
pub struct MemoryTimeSeries {
    cursor: Cursor,
    readings: std::vec::IntoIter<Reading>,
}

impl MemoryTimeSeries {
    pub fn new(tid: Tid, sampling_interval: SamplingInterval, readings: Vec<Reading>) -> Self {
        Self {
            cursor: Cursor::new(tid, sampling_interval),
            readings: readings.into_iter(),
        }
    }

    /// Series of `(timestamp, value)` samples at a fixed interval.
    pub fn from_samples(
        tid: Tid,
        sampling_interval: SamplingInterval,
        samples: impl IntoIterator<Item = (Timestamp, Value)>,
    ) -> Self {
        Self::new(
            tid,
            sampling_interval,
            samples
                .into_iter()
                .map(|(timestamp, value)| Reading::sample(timestamp, value))
                .collect(),
        )
    }
}

impl TimeSeries for MemoryTimeSeries {
    fn tid(&self) -> Tid {
        self.cursor.tid
    }

    fn has_next(&mut self) -> Result<bool, CoreError> {
        self.cursor.has_next(&mut (&mut self.readings).map(Ok))
    }

    fn next(&mut self) -> Result<DataPoint, CoreError> {
        self.cursor.next(&mut (&mut self.readings).map(Ok))
    }
}

/// How the timestamp column of a CSV file is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    /// Seconds since epoch.
    Unix,
    /// Milliseconds since epoch.
    #[default]
    Millis,
}

/// Layout of a CSV source.
///
/// Lines are split on `separator` as plain text. Quoting and escaping are not supported, so a
/// quoted field is reported as a parse error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvFormat {
    pub separator: String,
    pub has_header: bool,
    pub timestamp_column: usize,
    pub value_column: usize,
    pub timestamp_format: TimestampFormat,
}

impl Default for CsvFormat {
    fn default() -> Self {
        Self {
            separator: ";".to_string(),
            has_header: false,
            timestamp_column: 0,
            value_column: 1,
            timestamp_format: TimestampFormat::Millis,
        }
    }
}

#[derive(Debug)]
struct CsvReadings {
    source_name: String,
    format: CsvFormat,
    lines: Lines<BufReader<File>>,
    line: usize,
}

impl CsvReadings {
    fn parse_error(&self, details: String) -> CoreError {
        CoreError::Parse {
            source_name: self.source_name.clone(),
            line: self.line,
            details,
        }
    }

    fn parse(&self, text: &str) -> Result<Reading, CoreError> {
        let fields: Vec<&str> = text.split(self.format.separator.as_str()).collect();
        if fields[0].trim() == "SI" {
            let field = fields
                .get(1)
                .ok_or_else(|| self.parse_error("SI line without an interval".to_string()))?;
            let interval = field
                .trim()
                .parse::<SamplingInterval>()
                .map_err(|e| self.parse_error(format!("invalid sampling interval {field:?}: {e}")))?;
            return Ok(Reading::SamplingInterval(interval));
        }

        let field = |index: usize, name: &str| {
            fields
                .get(index)
                .map(|f| f.trim())
                .ok_or_else(|| self.parse_error(format!("missing {name} column {index}")))
        };
        let ts_field = field(self.format.timestamp_column, "timestamp")?;
        let value_field = field(self.format.value_column, "value")?;
        let raw = ts_field
            .parse::<i64>()
            .map_err(|e| self.parse_error(format!("invalid timestamp {ts_field:?}: {e}")))?;
        let timestamp = match self.format.timestamp_format {
            TimestampFormat::Unix => raw.saturating_mul(1000),
            TimestampFormat::Millis => raw,
        };
        let value = value_field
            .parse::<Value>()
            .map_err(|e| self.parse_error(format!("invalid value {value_field:?}: {e}")))?;
        Ok(Reading::sample(timestamp, value))
    }
}

impl Iterator for CsvReadings {
    type Item = Result<Reading, CoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(self.parse(&line));
        }
    }
}

/// Bounded series read lazily from a CSV file with one reading per line.
#[derive(Debug)]
pub struct CsvTimeSeries {
    path: PathBuf,
    format: CsvFormat,
    cursor: Cursor,
    readings: Option<CsvReadings>,
}

impl CsvTimeSeries {
    pub fn new(
        path: impl AsRef<Path>,
        tid: Tid,
        sampling_interval: SamplingInterval,
        format: CsvFormat,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            format,
            cursor: Cursor::new(tid, sampling_interval),
            readings: None,
        }
    }
}

fn not_opened(path: &Path) -> CoreError {
    CoreError::Internal(format!("{} was read before it was opened", path.display()))
}

impl TimeSeries for CsvTimeSeries {
    fn tid(&self) -> Tid {
        self.cursor.tid
    }

    fn open(&mut self) -> Result<(), CoreError> {
        if self.readings.is_some() {
            return Ok(());
        }
        let file = File::open(&self.path)?;
        let mut lines = BufReader::new(file).lines();
        let mut line = 0;
        if self.format.has_header {
            if let Some(header) = lines.next() {
                header?;
                line += 1;
            }
        }
        let source_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string());
        self.readings = Some(CsvReadings {
            source_name,
            format: self.format.clone(),
            lines,
            line,
        });
        Ok(())
    }

    fn has_next(&mut self) -> Result<bool, CoreError> {
        let readings = self
            .readings
            .as_mut()
            .ok_or_else(|| not_opened(&self.path))?;
        self.cursor.has_next(readings)
    }

    fn next(&mut self) -> Result<DataPoint, CoreError> {
        let readings = self
            .readings
            .as_mut()
            .ok_or_else(|| not_opened(&self.path))?;
        self.cursor.next(readings)
    }

    fn close(&mut self) -> Result<(), CoreError> {
        self.readings = None;
        Ok(())
    }
}

/// Unbounded series fed by a producer thread through a channel.
///
/// The series ends when every [`mpsc::Sender`] has been dropped.
#[derive(Debug)]
pub struct ChannelTimeSeries {
    cursor: Cursor,
    receiver: mpsc::Receiver<Reading>,
}

impl ChannelTimeSeries {
    pub fn new(tid: Tid, sampling_interval: SamplingInterval) -> (Self, mpsc::Sender<Reading>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                cursor: Cursor::new(tid, sampling_interval),
                receiver,
            },
            sender,
        )
    }
}

impl TimeSeries for ChannelTimeSeries {
    fn tid(&self) -> Tid {
        self.cursor.tid
    }

    fn is_bounded(&self) -> bool {
        false
    }

    fn has_next(&mut self) -> Result<bool, CoreError> {
        self.cursor
            .has_next(&mut self.receiver.iter().map(Ok))
    }

    fn next(&mut self) -> Result<DataPoint, CoreError> {
        self.cursor.next(&mut self.receiver.iter().map(Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn drain(series: &mut dyn TimeSeries) -> Vec<DataPoint> {
        let mut out = Vec::new();
        while series.has_next().unwrap() {
            out.push(series.next().unwrap());
        }
        out
    }

    fn values(points: &[DataPoint]) -> Vec<(Timestamp, Option<Value>, SamplingInterval)> {
        points
            .iter()
            .filter_map(|p| match p {
                DataPoint::Value(v) => Some((
                    v.timestamp,
                    if v.is_gap() { None } else { Some(v.value) },
                    v.sampling_interval,
                )),
                DataPoint::Configuration(_) => None,
            })
            .collect()
    }

    #[test]
    fn initial_interval_is_announced_first() {
        let mut series = MemoryTimeSeries::from_samples(7, 100, vec![(100, 1.0)]);
        let points = drain(&mut series);
        assert_eq!(
            points[0],
            DataPoint::Configuration(ConfigurationEvent::initial(7, 100))
        );
        assert_eq!(points.len(), 2);
        assert!(matches!(
            series.next(),
            Err(CoreError::SourceExhausted { tid: 7 })
        ));
    }

    #[test]
    fn missing_timestamps_become_gaps() {
        let mut series =
            MemoryTimeSeries::from_samples(1, 100, vec![(100, 1.0), (400, 4.0), (500, 5.0)]);
        let points = drain(&mut series);
        assert_eq!(
            values(&points),
            vec![
                (100, Some(1.0), 100),
                (200, None, 100),
                (300, None, 100),
                (400, Some(4.0), 100),
                (500, Some(5.0), 100),
            ]
        );
    }

    #[test]
    fn interval_change_realigns_the_expected_timestamp() {
        let mut series = MemoryTimeSeries::new(
            1,
            100,
            vec![
                Reading::sample(300, 1.0),
                Reading::SamplingInterval(200),
                Reading::sample(400, 2.0),
                Reading::sample(600, 3.0),
            ],
        );
        let points = drain(&mut series);
        assert_eq!(
            points[2],
            DataPoint::Configuration(ConfigurationEvent::changed(1, 200, 100))
        );
        assert_eq!(
            values(&points),
            vec![(300, Some(1.0), 100), (400, Some(2.0), 200), (600, Some(3.0), 200)]
        );
    }

    #[test]
    fn timestamps_behind_the_cadence_are_rejected() {
        let mut series = MemoryTimeSeries::from_samples(1, 100, vec![(100, 1.0), (150, 1.0)]);
        series.next().unwrap();
        series.next().unwrap();
        // 200 is expected, 150 can never be reached.
        assert!(matches!(
            series.next(),
            Err(CoreError::OutOfOrder {
                expected: 200,
                found: 150,
                ..
            })
        ));
    }

    #[test]
    fn csv_source_parses_values_and_interval_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "time;value").unwrap();
        writeln!(file, "1;1.5").unwrap();
        writeln!(file, "2;2.5").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "SI;2000").unwrap();
        writeln!(file, "4;4.5").unwrap();
        file.flush().unwrap();

        let format = CsvFormat {
            has_header: true,
            timestamp_format: TimestampFormat::Unix,
            ..CsvFormat::default()
        };
        let mut series = CsvTimeSeries::new(file.path(), 3, 1000, format);
        assert!(series.has_next().is_err());
        series.open().unwrap();
        let points = drain(&mut series);
        assert_eq!(
            values(&points),
            vec![
                (1000, Some(1.5), 1000),
                (2000, Some(2.5), 1000),
                (4000, Some(4.5), 2000),
            ]
        );
        series.close().unwrap();
    }

    #[test]
    fn csv_source_reports_the_failing_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "100;1.0").unwrap();
        writeln!(file, "200;abc").unwrap();
        file.flush().unwrap();

        let mut series = CsvTimeSeries::new(file.path(), 1, 100, CsvFormat::default());
        series.open().unwrap();
        series.next().unwrap();
        series.next().unwrap();
        match series.next() {
            Err(CoreError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected a parse error, got {other:?}"),
        }
    }

    #[test]
    fn csv_source_does_not_unquote_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "100;1.0").unwrap();
        writeln!(file, "200;\"2.0\"").unwrap();
        file.flush().unwrap();

        let mut series = CsvTimeSeries::new(file.path(), 1, 100, CsvFormat::default());
        series.open().unwrap();
        series.next().unwrap();
        series.next().unwrap();
        match series.next() {
            Err(CoreError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected a parse error, got {other:?}"),
        }
    }

    #[test]
    fn channel_source_ends_when_the_producer_hangs_up() {
        let (mut series, sender) = ChannelTimeSeries::new(4, 100);
        assert!(!series.is_bounded());
        let producer = std::thread::spawn(move || {
            for i in 1..=3 {
                sender.send(Reading::sample(i * 100, i as f32)).unwrap();
            }
        });
        let points = drain(&mut series);
        producer.join().unwrap();
        assert_eq!(values(&points).len(), 3);
    }
}
