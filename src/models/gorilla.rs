use super::{ModelType, ModelTypeKind, Mtid, Row};
use crate::encoding::{decode_gorilla_xor_u32, encode_gorilla_xor_u32};
use crate::error::CoreError;
use crate::types::{SamplingInterval, Timestamp, Value, ValueDataPoint};

/// Lossless XOR compression of the raw values, row-major, capped at `length_bound` rows.
#[derive(Debug, Clone)]
pub struct Gorilla {
    mtid: Mtid,
    error_bound: f32,
    length_bound: usize,
    length: usize,
    bits: Vec<u32>,
    within: bool,
}

impl Gorilla {
    pub fn new(mtid: Mtid, error_bound: f32, length_bound: usize) -> Result<Self, CoreError> {
        if length_bound == 0 {
            return Err(CoreError::Configuration(
                "for gorilla the length bound must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            mtid,
            error_bound,
            length_bound,
            length: 0,
            bits: Vec::new(),
            within: true,
        })
    }

    fn encode(&self) -> Result<Vec<u8>, CoreError> {
        let mut out = Vec::with_capacity(4 + self.bits.len() / 2);
        encode_gorilla_xor_u32(&self.bits, &mut out)?;
        Ok(out)
    }
}

impl ModelType for Gorilla {
    fn mtid(&self) -> Mtid {
        self.mtid
    }

    fn kind(&self) -> ModelTypeKind {
        ModelTypeKind::Gorilla
    }

    fn error_bound(&self) -> f32 {
        self.error_bound
    }

    fn reset(&mut self) {
        self.length = 0;
        self.bits.clear();
        self.within = true;
    }

    fn append(&mut self, row: &[ValueDataPoint]) -> bool {
        if !self.within || row.is_empty() || self.length >= self.length_bound {
            self.within = false;
            return false;
        }
        self.bits.extend(row.iter().map(|p| p.value.to_bits()));
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
        self.encode()
    }

    fn size(
        &self,
        _start_time: Timestamp,
        _end_time: Timestamp,
        _sampling_interval: SamplingInterval,
        _buffer: &[Row],
    ) -> f32 {
        match self.encode() {
            Ok(bytes) => bytes.len() as f32,
            Err(_) => f32::NAN,
        }
    }
}

pub(super) fn decode(model: &[u8], rows: usize, columns: usize) -> Result<Vec<Vec<Value>>, CoreError> {
    let bits = decode_gorilla_xor_u32(&mut &model[..], rows * columns)?;
    Ok(bits
        .chunks(columns.max(1))
        .map(|row| row.iter().map(|b| f32::from_bits(*b)).collect())
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
    fn stops_at_the_length_bound() {
        let mut gorilla = Gorilla::new(4, 0.0, 2).unwrap();
        assert!(gorilla.append(&row(100, &[1.0, 2.0])));
        assert!(gorilla.append(&row(200, &[1.5, 2.5])));
        assert!(!gorilla.append(&row(300, &[1.0, 2.0])));
        assert_eq!(gorilla.length(), 2);
    }

    #[test]
    fn stores_values_losslessly() {
        let buffer = vec![
            row(100, &[1.0, -7.25]),
            row(200, &[1.0, 1.0e-3]),
            row(300, &[f32::MAX, 0.0]),
        ];
        let mut gorilla = Gorilla::new(4, 0.0, 10).unwrap();
        gorilla.initialize(&buffer);
        assert_eq!(gorilla.length(), 3);

        let bytes = gorilla.model_bytes(100, 300, 100, &buffer).unwrap();
        assert_eq!(gorilla.size(100, 300, 100, &buffer), bytes.len() as f32);
        let decoded = ModelTypeKind::Gorilla.decode(&bytes, 100, 300, 100, 2).unwrap();
        let expected: Vec<Vec<f32>> = buffer
            .iter()
            .map(|r| r.iter().map(|p| p.value).collect())
            .collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn constant_rows_compress_to_a_few_bytes() {
        let buffer: Vec<Row> = (1..=5).map(|i| row(i * 100, &[1.0])).collect();
        let mut gorilla = Gorilla::new(4, 0.0, 50).unwrap();
        gorilla.initialize(&buffer);
        assert_eq!(gorilla.size(100, 500, 100, &buffer), 5.0);
    }
}
