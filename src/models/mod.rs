//! Model types: stateful fitters that capture the longest prefix of buffered rows they can
//! represent within an error bound, and serialize the fitted parameters.
//!
//! Candidates are configured as an ordered list of [`ModelTypeKind`]s plus one fallback kind.
//! The [`ModelTypeRegistry`] validates that list once and hands out fresh instances to every
//! generator, since each instance carries fitting state.

mod gorilla;
mod pmc_mean;
mod swing;
mod uncompressed;

pub use gorilla::Gorilla;
pub use pmc_mean::PmcMean;
pub use swing::Swing;
pub use uncompressed::Uncompressed;

use crate::error::CoreError;
use crate::types::{SamplingInterval, Timestamp, Value, ValueDataPoint};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Model type id stored in every segment.
pub type Mtid = i32;

/// Model type id reserved for the fallback model type.
pub const FALLBACK_MTID: Mtid = 1;

/// One buffered row: the non-gap points of a group for a single timestamp.
pub type Row = Vec<ValueDataPoint>;

/// Shared contract of all model types.
///
/// Once [`ModelType::append`] returns `false` it must keep returning `false` until the
/// instance is re-initialized.
pub trait ModelType: fmt::Debug + Send {
    fn mtid(&self) -> Mtid;

    fn kind(&self) -> ModelTypeKind;

    /// Allowed deviation in percent of the represented value.
    fn error_bound(&self) -> f32;

    /// Clears all fitting state.
    fn reset(&mut self);

    /// Tries to extend the model with one row of same-timestamp values.
    fn append(&mut self, row: &[ValueDataPoint]) -> bool;

    /// Number of rows currently represented.
    fn length(&self) -> usize;

    /// Serializes the fitted parameters for the first [`ModelType::length`] rows of `buffer`.
    fn model_bytes(
        &self,
        start_time: Timestamp,
        end_time: Timestamp,
        sampling_interval: SamplingInterval,
        buffer: &[Row],
    ) -> Result<Vec<u8>, CoreError>;

    /// Size in bytes of the serialized model, NaN if the model is unusable.
    fn size(
        &self,
        start_time: Timestamp,
        end_time: Timestamp,
        sampling_interval: SamplingInterval,
        buffer: &[Row],
    ) -> f32;

    /// Resets the model and replays `buffer`, stopping at the first row it cannot represent.
    fn initialize(&mut self, buffer: &[Row]) {
        self.reset();
        for row in buffer {
            if !self.append(row) {
                return;
            }
        }
    }

    /// Data points represented per byte stored, NaN if nothing is represented.
    ///
    /// A data point is accounted as 16 bytes (tid, timestamp, value) while a segment costs
    /// 24 bytes of metadata, the model and 4 bytes per gapped series.
    fn compression_ratio(
        &self,
        start_time: Timestamp,
        end_time: Timestamp,
        sampling_interval: SamplingInterval,
        buffer: &[Row],
        gaps: usize,
    ) -> f32 {
        let length = self.length();
        let columns = match buffer.first() {
            Some(row) if length > 0 => row.len(),
            _ => return f32::NAN,
        };
        let size = self.size(start_time, end_time, sampling_interval, buffer);
        if size.is_nan() {
            return f32::NAN;
        }
        let data_points = (length * columns) as f32;
        (16.0 * data_points) / (24.0 + size + 4.0 * gaps as f32)
    }

    /// The error function used when deciding if two series are correlated.
    fn within_error_bound(
        &self,
        error_bound: f32,
        a: &mut dyn Iterator<Item = Value>,
        b: &mut dyn Iterator<Item = Value>,
    ) -> bool {
        within_error_bound(error_bound, a, b)
    }
}

/// The model types that can be configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTypeKind {
    /// Constant function, the mean of all represented values.
    PmcMean,
    /// Linear function fitted with the swing filter.
    Swing,
    /// Lossless XOR compression of the raw values.
    Gorilla,
    /// Raw values. Always succeeds, so it is the usual fallback.
    Uncompressed,
}

impl ModelTypeKind {
    pub fn name(&self) -> &'static str {
        match self {
            ModelTypeKind::PmcMean => "pmc_mean",
            ModelTypeKind::Swing => "swing",
            ModelTypeKind::Gorilla => "gorilla",
            ModelTypeKind::Uncompressed => "uncompressed",
        }
    }

    /// Creates a fresh instance.
    ///
    /// # Errors
    /// Returns [`CoreError::Configuration`] if the bounds are invalid for this kind.
    pub fn build(
        &self,
        mtid: Mtid,
        error_bound: f32,
        length_bound: usize,
    ) -> Result<Box<dyn ModelType>, CoreError> {
        Ok(match self {
            ModelTypeKind::PmcMean => Box::new(PmcMean::new(mtid, error_bound)?),
            ModelTypeKind::Swing => Box::new(Swing::new(mtid, error_bound)?),
            ModelTypeKind::Gorilla => Box::new(Gorilla::new(mtid, error_bound, length_bound)?),
            ModelTypeKind::Uncompressed => Box::new(Uncompressed::new(mtid, error_bound)),
        })
    }

    /// Reconstructs the `rows x columns` values stored in a model of this kind.
    pub fn decode(
        &self,
        model: &[u8],
        start_time: Timestamp,
        end_time: Timestamp,
        sampling_interval: SamplingInterval,
        columns: usize,
    ) -> Result<Vec<Vec<Value>>, CoreError> {
        if sampling_interval <= 0 || end_time < start_time {
            return Err(CoreError::Serialization(format!(
                "Invalid segment span [{}, {}] with sampling interval {}",
                start_time, end_time, sampling_interval
            )));
        }
        let rows = ((end_time - start_time) / sampling_interval as i64 + 1) as usize;
        match self {
            ModelTypeKind::PmcMean => pmc_mean::decode(model, rows, columns),
            ModelTypeKind::Swing => {
                swing::decode(model, start_time, sampling_interval, rows, columns)
            }
            ModelTypeKind::Gorilla => gorilla::decode(model, rows, columns),
            ModelTypeKind::Uncompressed => uncompressed::decode(model, rows, columns),
        }
    }
}

impl fmt::Display for ModelTypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Validated, ordered set of candidate model types plus the fallback.
///
/// The fallback gets [`FALLBACK_MTID`]; candidates are numbered from 2 in configured order.
#[derive(Debug, Clone)]
pub struct ModelTypeRegistry {
    candidates: Vec<(ModelTypeKind, Mtid)>,
    fallback: ModelTypeKind,
    error_bound: f32,
    length_bound: usize,
}

impl ModelTypeRegistry {
    pub fn new(
        candidates: &[ModelTypeKind],
        fallback: ModelTypeKind,
        error_bound: f32,
        length_bound: usize,
    ) -> Result<Self, CoreError> {
        if candidates.is_empty() {
            return Err(CoreError::Configuration(
                "At least one candidate model type must be configured".to_string(),
            ));
        }
        let registry = Self {
            candidates: candidates
                .iter()
                .enumerate()
                .map(|(i, kind)| (*kind, FALLBACK_MTID + 1 + i as Mtid))
                .collect(),
            fallback,
            error_bound,
            length_bound,
        };
        // Fail at startup rather than when the first generator is created.
        registry.instantiate()?;
        registry.fallback()?;
        Ok(registry)
    }

    /// Fresh candidate instances in priority order.
    pub fn instantiate(&self) -> Result<Vec<Box<dyn ModelType>>, CoreError> {
        self.candidates
            .iter()
            .map(|(kind, mtid)| kind.build(*mtid, self.error_bound, self.length_bound))
            .collect()
    }

    pub fn fallback(&self) -> Result<Box<dyn ModelType>, CoreError> {
        self.fallback
            .build(FALLBACK_MTID, self.error_bound, self.length_bound)
    }

    pub fn error_bound(&self) -> f32 {
        self.error_bound
    }

    pub fn length_bound(&self) -> usize {
        self.length_bound
    }

    /// Id assigned to the first candidate of `kind`, or the fallback id.
    pub fn mtid_of(&self, kind: ModelTypeKind) -> Option<Mtid> {
        self.candidates
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, mtid)| *mtid)
            .or(if kind == self.fallback {
                Some(FALLBACK_MTID)
            } else {
                None
            })
    }

    pub fn kind_of(&self, mtid: Mtid) -> Option<ModelTypeKind> {
        if mtid == FALLBACK_MTID {
            return Some(self.fallback);
        }
        self.candidates
            .iter()
            .find(|(_, m)| *m == mtid)
            .map(|(kind, _)| *kind)
    }
}

/// Relative error in percent; zero when both values are equal (also for two zeros).
pub fn percentage_error(approximation: f64, real: f64) -> f64 {
    if approximation == real {
        return 0.0;
    }
    ((approximation - real) / real).abs() * 100.0
}

/// True unless `approximation` is provably within `error_bound` percent of `real`.
pub fn outside_percentage_error_bound(error_bound: f32, approximation: f64, real: f64) -> bool {
    !(percentage_error(approximation, real) <= error_bound as f64)
}

/// Pairwise comparison of two value sequences, stopping at the shorter one.
pub fn within_error_bound(
    error_bound: f32,
    a: &mut dyn Iterator<Item = Value>,
    b: &mut dyn Iterator<Item = Value>,
) -> bool {
    a.zip(b)
        .all(|(x, y)| !outside_percentage_error_bound(error_bound, x as f64, y as f64))
}

pub(crate) fn check_percentage_bound(kind: ModelTypeKind, error_bound: f32) -> Result<(), CoreError> {
    if !(0.0..=100.0).contains(&error_bound) {
        return Err(CoreError::Configuration(format!(
            "for {} the error bound must be a percentage, got {}",
            kind, error_bound
        )));
    }
    Ok(())
}

pub(crate) fn check_model_len(kind: ModelTypeKind, model: &[u8], expected: usize) -> Result<(), CoreError> {
    if model.len() != expected {
        return Err(CoreError::Serialization(format!(
            "{} model has {} bytes, expected {}",
            kind,
            model.len(),
            expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_error_of_equal_values_is_zero() {
        assert_eq!(percentage_error(0.0, 0.0), 0.0);
        assert_eq!(percentage_error(2.0, 2.0), 0.0);
        assert!((percentage_error(11.0, 10.0) - 10.0).abs() < 1e-9);
        assert!(outside_percentage_error_bound(5.0, 1.0, 0.0));
        assert!(outside_percentage_error_bound(5.0, f64::NAN, 1.0));
    }

    #[test]
    fn registry_numbers_candidates_after_the_fallback() {
        let registry = ModelTypeRegistry::new(
            &[ModelTypeKind::PmcMean, ModelTypeKind::Swing, ModelTypeKind::Gorilla],
            ModelTypeKind::Uncompressed,
            1.0,
            50,
        )
        .unwrap();
        assert_eq!(registry.mtid_of(ModelTypeKind::Uncompressed), Some(1));
        assert_eq!(registry.mtid_of(ModelTypeKind::PmcMean), Some(2));
        assert_eq!(registry.mtid_of(ModelTypeKind::Gorilla), Some(4));
        assert_eq!(registry.kind_of(3), Some(ModelTypeKind::Swing));
        assert_eq!(registry.kind_of(9), None);

        let instances = registry.instantiate().unwrap();
        let mtids: Vec<Mtid> = instances.iter().map(|m| m.mtid()).collect();
        assert_eq!(mtids, vec![2, 3, 4]);
        assert_eq!(registry.fallback().unwrap().mtid(), FALLBACK_MTID);
    }

    #[test]
    fn registry_rejects_invalid_configuration() {
        assert!(matches!(
            ModelTypeRegistry::new(&[], ModelTypeKind::Uncompressed, 0.0, 50),
            Err(CoreError::Configuration(_))
        ));
        assert!(matches!(
            ModelTypeRegistry::new(&[ModelTypeKind::Swing], ModelTypeKind::Uncompressed, 120.0, 50),
            Err(CoreError::Configuration(_))
        ));
        assert!(matches!(
            ModelTypeRegistry::new(&[ModelTypeKind::Gorilla], ModelTypeKind::Uncompressed, 0.0, 0),
            Err(CoreError::Configuration(_))
        ));
    }

    #[test]
    fn kind_serde_uses_snake_case() {
        use serde::de::value::{Error as ValueError, StrDeserializer};
        let kind =
            ModelTypeKind::deserialize(StrDeserializer::<ValueError>::new("pmc_mean")).unwrap();
        assert_eq!(kind, ModelTypeKind::PmcMean);
        assert_eq!(kind.to_string(), "pmc_mean");
        assert!(ModelTypeKind::deserialize(StrDeserializer::<ValueError>::new("lz4")).is_err());
    }
}
