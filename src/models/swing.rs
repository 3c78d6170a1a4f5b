use super::{check_percentage_bound, outside_percentage_error_bound};
use super::{ModelType, ModelTypeKind, Mtid, Row};
use crate::encoding::{fits_in_f32, read_f32, read_f64, write_f32, write_f64};
use crate::error::CoreError;
use crate::types::{SamplingInterval, Timestamp, Value, ValueDataPoint};

#[derive(Debug, Clone, Copy, PartialEq)]
struct LinearFunction {
    a: f64,
    b: f64,
}

impl LinearFunction {
    fn through(ts: Timestamp, vs: f64, te: Timestamp, ve: f64) -> Self {
        let a = (ve - vs) / (te - ts) as f64;
        Self {
            a,
            b: vs - a * ts as f64,
        }
    }

    #[inline]
    fn at(&self, ts: Timestamp) -> f64 {
        self.a * ts as f64 + self.b
    }
}

/// Swing filter: a line anchored in the first row, kept between an upper and a lower bound
/// that are narrowed by every appended value.
#[derive(Debug, Clone)]
pub struct Swing {
    mtid: Mtid,
    error_bound: f32,
    length: usize,
    initial: Option<(Timestamp, f64)>,
    upper: Option<LinearFunction>,
    lower: Option<LinearFunction>,
    within: bool,
}

impl Swing {
    pub fn new(mtid: Mtid, error_bound: f32) -> Result<Self, CoreError> {
        check_percentage_bound(ModelTypeKind::Swing, error_bound)?;
        Ok(Self {
            mtid,
            error_bound,
            length: 0,
            initial: None,
            upper: None,
            lower: None,
            within: true,
        })
    }

    fn deviation(&self, value: f64) -> f64 {
        (value * (self.error_bound as f64 / 100.1)).abs()
    }

    /// The line halfway between both bounds.
    fn line(&self) -> Option<LinearFunction> {
        match (self.upper, self.lower) {
            (Some(u), Some(l)) => Some(LinearFunction {
                a: (u.a + l.a) / 2.0,
                b: (u.b + l.b) / 2.0,
            }),
            _ => self
                .initial
                .map(|(_, value)| LinearFunction { a: 0.0, b: value }),
        }
    }

    fn append_first(&mut self, row: &[ValueDataPoint]) -> bool {
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        let mut sum = 0.0;
        for point in row {
            let value = point.value as f64;
            min = min.min(value);
            max = max.max(value);
            sum += value;
        }
        let average = sum / row.len() as f64;
        if outside_percentage_error_bound(self.error_bound, average, min)
            || outside_percentage_error_bound(self.error_bound, average, max)
        {
            self.within = false;
            return false;
        }
        self.initial = Some((row[0].timestamp, average));
        self.length = 1;
        true
    }
}

impl ModelType for Swing {
    fn mtid(&self) -> Mtid {
        self.mtid
    }

    fn kind(&self) -> ModelTypeKind {
        ModelTypeKind::Swing
    }

    fn error_bound(&self) -> f32 {
        self.error_bound
    }

    fn reset(&mut self) {
        self.length = 0;
        self.initial = None;
        self.upper = None;
        self.lower = None;
        self.within = true;
    }

    fn append(&mut self, row: &[ValueDataPoint]) -> bool {
        if !self.within || row.is_empty() {
            self.within = false;
            return false;
        }
        let (initial_ts, initial_value) = match self.initial {
            Some(initial) => initial,
            None => return self.append_first(row),
        };

        // Bounds are only committed once the whole row fits.
        let mut upper = self.upper;
        let mut lower = self.lower;
        for point in row {
            let ts = point.timestamp;
            let value = point.value as f64;
            let deviation = self.deviation(value);
            match (upper, lower) {
                (Some(u), Some(l)) => {
                    let upper_bound = u.at(ts);
                    let lower_bound = l.at(ts);
                    if upper_bound + deviation < value || lower_bound - deviation > value {
                        self.within = false;
                        return false;
                    }
                    if upper_bound - deviation > value {
                        upper = Some(LinearFunction::through(
                            initial_ts,
                            initial_value,
                            ts,
                            value + deviation,
                        ));
                    }
                    if lower_bound + deviation < value {
                        lower = Some(LinearFunction::through(
                            initial_ts,
                            initial_value,
                            ts,
                            value - deviation,
                        ));
                    }
                }
                _ => {
                    upper = Some(LinearFunction::through(
                        initial_ts,
                        initial_value,
                        ts,
                        value + deviation,
                    ));
                    lower = Some(LinearFunction::through(
                        initial_ts,
                        initial_value,
                        ts,
                        value - deviation,
                    ));
                }
            }
        }
        self.upper = upper;
        self.lower = lower;
        self.length += 1;
        true
    }

    fn length(&self) -> usize {
        self.length
    }

    fn model_bytes(
        &self,
        _start_time: Timestamp,
        _end_time: Timestamp,
        _sampling_interval: SamplingInterval,
        _buffer: &[Row],
    ) -> Result<Vec<u8>, CoreError> {
        let line = self
            .line()
            .ok_or_else(|| CoreError::Internal("Swing model represents no rows".to_string()))?;
        let mut out = Vec::with_capacity(16);
        match (fits_in_f32(line.a), fits_in_f32(line.b)) {
            (true, true) => {
                write_f32(&mut out, line.a as f32);
                write_f32(&mut out, line.b as f32);
            }
            (true, false) => {
                write_f32(&mut out, line.a as f32);
                write_f64(&mut out, line.b);
            }
            _ => {
                write_f64(&mut out, line.a);
                write_f64(&mut out, line.b);
            }
        }
        Ok(out)
    }

    fn size(
        &self,
        _start_time: Timestamp,
        _end_time: Timestamp,
        _sampling_interval: SamplingInterval,
        buffer: &[Row],
    ) -> f32 {
        if self.length < 2 {
            return f32::NAN;
        }
        let line = match self.line() {
            Some(line) => line,
            None => return f32::NAN,
        };

        // The averaged line can drift from the bounds, so every represented point is checked.
        for row in buffer.iter().take(self.length) {
            for point in row {
                let approximation = line.at(point.timestamp) as f32;
                if outside_percentage_error_bound(
                    self.error_bound,
                    approximation as f64,
                    point.value as f64,
                ) {
                    return f32::NAN;
                }
            }
        }

        match (fits_in_f32(line.a), fits_in_f32(line.b)) {
            (true, true) => 8.0,
            (true, false) => 12.0,
            _ => 16.0,
        }
    }
}

pub(super) fn decode(
    model: &[u8],
    start_time: Timestamp,
    sampling_interval: SamplingInterval,
    rows: usize,
    columns: usize,
) -> Result<Vec<Vec<Value>>, CoreError> {
    let mut r = model;
    let (a, b) = match model.len() {
        8 => (read_f32(&mut r)? as f64, read_f32(&mut r)? as f64),
        12 => (read_f32(&mut r)? as f64, read_f64(&mut r)?),
        16 => (read_f64(&mut r)?, read_f64(&mut r)?),
        other => {
            return Err(CoreError::Serialization(format!(
                "swing model has {} bytes, expected 8, 12 or 16",
                other
            )))
        }
    };
    Ok((0..rows)
        .map(|i| {
            let ts = start_time + i as i64 * sampling_interval as i64;
            vec![(a * ts as f64 + b) as f32; columns]
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ts: Timestamp, values: &[f32]) -> Row {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| ValueDataPoint::new(i as i32 + 1, ts, *v, 100))
            .collect()
    }

    #[test]
    fn a_single_row_has_no_size() {
        let mut swing = Swing::new(3, 5.0).unwrap();
        let buffer = vec![row(100, &[1.0])];
        assert!(swing.append(&buffer[0]));
        assert!(swing.size(100, 100, 100, &buffer).is_nan());
        assert!(swing
            .compression_ratio(100, 100, 100, &buffer, 0)
            .is_nan());
    }

    #[test]
    fn represents_a_linear_trend_exactly() {
        let mut swing = Swing::new(3, 0.0).unwrap();
        let buffer: Vec<Row> = (1..=4)
            .map(|i| row(i * 100, &[(i * 100) as f32, (i * 100) as f32]))
            .collect();
        for r in &buffer {
            assert!(swing.append(r));
        }
        assert_eq!(swing.length(), 4);
        assert_eq!(swing.size(100, 400, 100, &buffer), 8.0);

        let bytes = swing.model_bytes(100, 400, 100, &buffer).unwrap();
        let decoded = ModelTypeKind::Swing.decode(&bytes, 100, 400, 100, 2).unwrap();
        for (i, values) in decoded.iter().enumerate() {
            assert_eq!(values, &vec![((i + 1) * 100) as f32; 2]);
        }
    }

    #[test]
    fn rejects_a_point_outside_both_bounds() {
        let mut swing = Swing::new(3, 1.0).unwrap();
        assert!(swing.append(&row(100, &[10.0])));
        assert!(swing.append(&row(200, &[10.0])));
        assert!(!swing.append(&row(300, &[30.0])));
        assert!(!swing.append(&row(400, &[10.0])));
        assert_eq!(swing.length(), 2);
    }

    #[test]
    fn first_row_must_fit_its_own_average() {
        let mut swing = Swing::new(3, 1.0).unwrap();
        assert!(!swing.append(&row(100, &[1.0, 2.0])));
        assert_eq!(swing.length(), 0);
    }

    #[test]
    fn coefficient_width_follows_the_model_length() {
        assert!(matches!(
            decode(&[0u8; 5], 100, 100, 1, 1),
            Err(CoreError::Serialization(_))
        ));
        let mut bytes = Vec::new();
        write_f32(&mut bytes, 0.5);
        write_f64(&mut bytes, 0.1);
        let decoded = decode(&bytes, 0, 100, 2, 1).unwrap();
        assert_eq!(decoded[0][0], 0.1f64 as f32);
        assert_eq!(decoded[1][0], 50.1f64 as f32);
    }
}
