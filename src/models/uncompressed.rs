use super::{check_model_len, ModelType, ModelTypeKind, Mtid, Row};
use crate::encoding::{read_f32, write_f32};
use crate::error::CoreError;
use crate::types::{SamplingInterval, Timestamp, Value, ValueDataPoint};

/// Stores every value as a raw big-endian `f32`. Accepts any row, which makes it the
/// default fallback.
#[derive(Debug, Clone)]
pub struct Uncompressed {
    mtid: Mtid,
    error_bound: f32,
    length: usize,
    values: Vec<Value>,
}

impl Uncompressed {
    pub fn new(mtid: Mtid, error_bound: f32) -> Self {
        Self {
            mtid,
            error_bound,
            length: 0,
            values: Vec::new(),
        }
    }
}

impl ModelType for Uncompressed {
    fn mtid(&self) -> Mtid {
        self.mtid
    }

    fn kind(&self) -> ModelTypeKind {
        ModelTypeKind::Uncompressed
    }

    fn error_bound(&self) -> f32 {
        self.error_bound
    }

    fn reset(&mut self) {
        self.length = 0;
        self.values.clear();
    }

    fn append(&mut self, row: &[ValueDataPoint]) -> bool {
        self.values.extend(row.iter().map(|p| p.value));
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
        let mut out = Vec::with_capacity(self.values.len() * 4);
        for value in &self.values {
            write_f32(&mut out, *value);
        }
        Ok(out)
    }

    fn size(
        &self,
        _start_time: Timestamp,
        _end_time: Timestamp,
        _sampling_interval: SamplingInterval,
        _buffer: &[Row],
    ) -> f32 {
        (self.values.len() * 4) as f32
    }
}

pub(super) fn decode(model: &[u8], rows: usize, columns: usize) -> Result<Vec<Vec<Value>>, CoreError> {
    check_model_len(ModelTypeKind::Uncompressed, model, rows * columns * 4)?;
    let mut r = model;
    let mut out = Vec::with_capacity(rows);
    for _ in 0..rows {
        let mut row = Vec::with_capacity(columns);
        for _ in 0..columns {
            row.push(read_f32(&mut r)?);
        }
        out.push(row);
    }
    Ok(out)
}
