use super::{check_model_len, check_percentage_bound, outside_percentage_error_bound};
use super::{ModelType, ModelTypeKind, Mtid, Row};
use crate::encoding::{read_f32, write_f32};
use crate::error::CoreError;
use crate::types::{SamplingInterval, Timestamp, Value, ValueDataPoint};

/// Poor Man's Compression, mean variant: all values are represented by their average.
#[derive(Debug, Clone)]
pub struct PmcMean {
    mtid: Mtid,
    error_bound: f32,
    length: usize,
    points: usize,
    min: f64,
    max: f64,
    sum: f64,
    within: bool,
}

impl PmcMean {
    pub fn new(mtid: Mtid, error_bound: f32) -> Result<Self, CoreError> {
        check_percentage_bound(ModelTypeKind::PmcMean, error_bound)?;
        Ok(Self {
            mtid,
            error_bound,
            length: 0,
            points: 0,
            min: f64::MAX,
            max: f64::MIN,
            sum: 0.0,
            within: true,
        })
    }

    fn mean(&self) -> f32 {
        (self.sum / self.points as f64) as f32
    }
}

impl ModelType for PmcMean {
    fn mtid(&self) -> Mtid {
        self.mtid
    }

    fn kind(&self) -> ModelTypeKind {
        ModelTypeKind::PmcMean
    }

    fn error_bound(&self) -> f32 {
        self.error_bound
    }

    fn reset(&mut self) {
        self.length = 0;
        self.points = 0;
        self.min = f64::MAX;
        self.max = f64::MIN;
        self.sum = 0.0;
        self.within = true;
    }

    fn append(&mut self, row: &[ValueDataPoint]) -> bool {
        if !self.within || row.is_empty() {
            self.within = false;
            return false;
        }

        let mut next_min = self.min;
        let mut next_max = self.max;
        let mut next_sum = self.sum;
        for point in row {
            let value = point.value as f64;
            next_sum += value;
            next_min = next_min.min(value);
            next_max = next_max.max(value);
        }

        let next_points = self.points + row.len();
        let average = next_sum / next_points as f64;
        if outside_percentage_error_bound(self.error_bound, average, next_min)
            || outside_percentage_error_bound(self.error_bound, average, next_max)
        {
            self.within = false;
            return false;
        }

        self.min = next_min;
        self.max = next_max;
        self.sum = next_sum;
        self.points = next_points;
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
        if self.length == 0 {
            return Err(CoreError::Internal(
                "PMC-Mean model represents no rows".to_string(),
            ));
        }
        let mut out = Vec::with_capacity(4);
        write_f32(&mut out, self.mean());
        Ok(out)
    }

    fn size(
        &self,
        _start_time: Timestamp,
        _end_time: Timestamp,
        _sampling_interval: SamplingInterval,
        _buffer: &[Row],
    ) -> f32 {
        if self.length == 0 {
            f32::NAN
        } else {
            4.0
        }
    }
}

pub(super) fn decode(model: &[u8], rows: usize, columns: usize) -> Result<Vec<Vec<Value>>, CoreError> {
    check_model_len(ModelTypeKind::PmcMean, model, 4)?;
    let value = read_f32(&mut &model[..])?;
    Ok(vec![vec![value; columns]; rows])
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
    fn accepts_rows_while_the_mean_stays_in_bound() {
        let mut pmc = PmcMean::new(2, 10.0).unwrap();
        assert!(pmc.append(&row(100, &[10.0, 10.5])));
        assert!(pmc.append(&row(200, &[9.8, 10.2])));
        assert!(!pmc.append(&row(300, &[20.0, 10.0])));
        // Frozen until reset.
        assert!(!pmc.append(&row(400, &[10.0, 10.0])));
        assert_eq!(pmc.length(), 2);

        let buffer = vec![row(100, &[10.0, 10.5]), row(200, &[9.8, 10.2])];
        let bytes = pmc.model_bytes(100, 200, 100, &buffer).unwrap();
        let decoded = ModelTypeKind::PmcMean.decode(&bytes, 100, 200, 100, 2).unwrap();
        assert_eq!(decoded.len(), 2);
        assert!((decoded[0][0] - 10.125).abs() < 1e-6);
    }

    #[test]
    fn zero_bound_requires_identical_values() {
        let mut pmc = PmcMean::new(2, 0.0).unwrap();
        assert!(pmc.append(&row(100, &[3.0, 3.0, 3.0])));
        assert!(!pmc.append(&row(200, &[3.0, 3.0, 3.000_1])));
    }

    #[test]
    fn initialize_replays_the_buffer() {
        let mut pmc = PmcMean::new(2, 0.0).unwrap();
        assert!(!pmc.append(&row(100, &[1.0, 2.0])));
        pmc.initialize(&[row(100, &[1.0]), row(200, &[1.0]), row(300, &[4.0])]);
        assert_eq!(pmc.length(), 2);
        assert_eq!(pmc.size(100, 200, 100, &[]), 4.0);
    }

    #[test]
    fn error_bound_must_be_a_percentage() {
        assert!(PmcMean::new(2, -0.5).is_err());
        assert!(PmcMean::new(2, 100.5).is_err());
        assert!(PmcMean::new(2, 100.0).is_ok());
    }
}
