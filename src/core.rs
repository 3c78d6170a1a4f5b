//! Ingestion entry points: configuration and the per-group compression loop.

use crate::controller::SegmentGeneratorController;
use crate::error::CoreError;
use crate::generator::GeneratorContext;
use crate::group::TimeSeriesGroup;
use crate::models::{ModelTypeKind, ModelTypeRegistry};
use crate::segment::SegmentSink;
use crate::telemetry::{ingest_metrics, noop_event_listener, IngestEvent, IngestEventListener};
use crate::types::{Gid, SamplingInterval};
use crate::DEFAULT_SAMPLING_INTERVAL;

use rayon::prelude::*;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;

/// Configuration options for group-based compression.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Allowed deviation in percent of each value. 0 means lossless models only.
    pub error_bound: f32,
    /// Maximum number of rows a lossless model such as Gorilla may represent.
    pub length_bound: usize,
    /// Emit a temporary segment after this many unemitted rows; 0 disables them.
    pub maximum_latency: usize,
    /// Split when a segment compresses worse than this fraction of the running average.
    pub dynamic_split_fraction: f32,
    /// Candidate model types in priority order.
    pub model_types: Vec<ModelTypeKind>,
    /// Model type used when no candidate represents a row.
    pub fallback_model_type: ModelTypeKind,
    /// Sampling interval assumed for series that do not declare one.
    pub default_sampling_interval: SamplingInterval,
    /// Structured event hook for observability (no-op by default).
    #[serde(skip, default = "noop_event_listener")]
    pub event_listener: Arc<dyn IngestEventListener>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            error_bound: 0.0,
            length_bound: 50,
            maximum_latency: 0,
            dynamic_split_fraction: 1.0,
            model_types: vec![
                ModelTypeKind::PmcMean,
                ModelTypeKind::Swing,
                ModelTypeKind::Gorilla,
            ],
            fallback_model_type: ModelTypeKind::Uncompressed,
            default_sampling_interval: DEFAULT_SAMPLING_INTERVAL,
            event_listener: noop_event_listener(),
        }
    }
}

impl IngestConfig {
    /// Checks every setting and that the model types accept the error bound.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !self.error_bound.is_finite() || self.error_bound < 0.0 {
            return Err(CoreError::Configuration(format!(
                "error_bound must be a non-negative percentage, got {}",
                self.error_bound
            )));
        }
        if self.length_bound == 0 {
            return Err(CoreError::Configuration(
                "length_bound must be at least 1".to_string(),
            ));
        }
        if !self.dynamic_split_fraction.is_finite() || self.dynamic_split_fraction < 0.0 {
            return Err(CoreError::Configuration(format!(
                "dynamic_split_fraction must be a finite non-negative number, got {}",
                self.dynamic_split_fraction
            )));
        }
        if self.default_sampling_interval <= 0 {
            return Err(CoreError::Configuration(format!(
                "default_sampling_interval must be positive, got {}",
                self.default_sampling_interval
            )));
        }
        self.registry().map(|_| ())
    }

    /// Builds the model type registry described by this configuration.
    pub fn registry(&self) -> Result<ModelTypeRegistry, CoreError> {
        ModelTypeRegistry::new(
            &self.model_types,
            self.fallback_model_type,
            self.error_bound,
            self.length_bound,
        )
    }

    fn context(&self, sink: Arc<dyn SegmentSink>) -> Result<Arc<GeneratorContext>, CoreError> {
        self.validate()?;
        Ok(Arc::new(GeneratorContext {
            registry: self.registry()?,
            maximum_latency: self.maximum_latency,
            dynamic_split_fraction: self.dynamic_split_fraction,
            sink,
            listener: self.event_listener.clone(),
        }))
    }
}

/// Compresses one group until all of its series are exhausted.
///
/// Segments are handed to `sink` as they are produced, so segments emitted before an
/// error remain valid.
pub fn ingest_group(
    config: &IngestConfig,
    group: TimeSeriesGroup,
    sink: Arc<dyn SegmentSink>,
) -> Result<(), CoreError> {
    let ctx = config.context(sink)?;
    run_group(ctx, group)
}

/// Compresses independent groups in parallel and returns one result per group, in input
/// order.
pub fn ingest_groups(
    config: &IngestConfig,
    groups: Vec<TimeSeriesGroup>,
    sink: Arc<dyn SegmentSink>,
) -> Result<Vec<(Gid, Result<(), CoreError>)>, CoreError> {
    let ctx = config.context(sink)?;
    Ok(groups
        .into_par_iter()
        .map(|group| {
            let gid = group.gid();
            (gid, run_group(ctx.clone(), group))
        })
        .collect())
}

fn run_group(ctx: Arc<GeneratorContext>, group: TimeSeriesGroup) -> Result<(), CoreError> {
    let gid = group.gid();
    let listener = ctx.listener.clone();
    let started = Instant::now();

    let mut controller = SegmentGeneratorController::new(group, ctx);
    let result = controller.run();
    ingest_metrics::record_group(started.elapsed());

    if let Err(e) = &result {
        listener.on_event(IngestEvent::GroupIngestFailed {
            gid,
            error: e.to_string(),
        });
    }
    result
}
