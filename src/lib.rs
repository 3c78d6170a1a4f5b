#![doc = include_str!("../README.md")]
// Declare modules
pub mod controller;
pub mod core;
pub mod encoding;
pub mod error;
pub mod generator;
pub mod group;
pub mod models;
pub mod segment;
pub mod slice;
pub mod source;
pub mod telemetry;
pub mod types;

/// Configuration options for group-based compression.
pub use crate::core::IngestConfig;
/// Compress one group, or many groups in parallel.
pub use crate::core::{ingest_group, ingest_groups};
/// Routes slices to one generator per sampling interval.
pub use crate::controller::{SegmentGeneratorController, SegmentGeneratorSupplier};
/// Error type for ingestion and compression.
pub use crate::error::CoreError;
/// Adaptive split/join segment generation for one cohort.
pub use crate::generator::{GeneratorContext, GeneratorState, SegmentGenerator};
/// Time-aligned group of series.
pub use crate::group::TimeSeriesGroup;
/// Model types and their registry.
pub use crate::models::{ModelType, ModelTypeKind, ModelTypeRegistry, Mtid};
/// Stored segments and the sinks receiving them.
pub use crate::segment::{
    CollectingSink, DerivedSeriesCache, DiscardingSink, GroupMetadataCache, SegmentGroup,
    SegmentKind, SegmentSink,
};
/// Timestamp-aligned batch of points.
pub use crate::slice::DataSlice;
/// Per-series point sources.
pub use crate::source::{
    ChannelTimeSeries, CsvFormat, CsvTimeSeries, MemoryTimeSeries, Reading, TimeSeries,
    TimestampFormat,
};
/// Structured event hook for observability.
pub use crate::telemetry::{IngestEvent, IngestEventListener};
/// Core identifiers and data points.
pub use crate::types::{
    ConfigurationEvent, DataPoint, Gid, SamplingInterval, Tid, Timestamp, Value, ValueDataPoint,
};

/// The sampling interval assumed for series that do not declare one.
pub const DEFAULT_SAMPLING_INTERVAL: SamplingInterval = 100;
