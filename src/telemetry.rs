use std::sync::Arc;

#[cfg(feature = "prometheus")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "prometheus")]
use std::sync::Mutex;
#[cfg(feature = "prometheus")]
use std::thread::JoinHandle;
use std::time::Duration;

use crate::models::Mtid;
use crate::segment::SegmentKind;
use crate::types::{Gid, SamplingInterval, Tid, Timestamp};

/// Structured, in-process event hook for observability.
///
/// The library never prints. Callers that want logs provide an implementation that forwards
/// these events to `tracing`, `log`, stderr or a custom sink.
pub trait IngestEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: IngestEvent);
}

/// Structured events emitted while compressing groups.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    GeneratorCreated {
        gid: Gid,
        sampling_interval: SamplingInterval,
        tids: Vec<Tid>,
    },
    GeneratorClosed {
        gid: Gid,
        sampling_interval: SamplingInterval,
    },
    SamplingIntervalChanged {
        gid: Gid,
        tid: Tid,
        previous: Option<SamplingInterval>,
        new: SamplingInterval,
    },

    GroupSplit {
        gid: Gid,
        sampling_interval: SamplingInterval,
        classes: Vec<Vec<Tid>>,
    },
    GroupsJoined {
        gid: Gid,
        sampling_interval: SamplingInterval,
        tids: Vec<Tid>,
        /// The join restored the generator's full series set.
        restored: bool,
    },

    SegmentEmitted {
        gid: Gid,
        kind: SegmentKind,
        start_time: Timestamp,
        end_time: Timestamp,
        mtid: Mtid,
        compression_ratio: f32,
    },

    GroupIngestFailed {
        gid: Gid,
        error: String,
    },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl IngestEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: IngestEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn IngestEventListener> {
    Arc::new(NoopEventListener)
}

/// Metrics instrumentation and in-process scraping.
///
/// Emitting metrics is a no-op until a recorder is installed, so library users pay nothing
/// unless they opt in. With the `prometheus` feature, [`ingest_metrics::InProcessPrometheus`]
/// installs a recorder whose exposition text can be rendered without an HTTP server.
pub mod ingest_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // Counters are exposed as `<name>_total` by the Prometheus exporter.
    pub const INGEST_POINTS: &str = "groupseg_ingest_points";
    pub const INGEST_SLICES: &str = "groupseg_ingest_slices";
    pub const FINALIZED_SEGMENTS: &str = "groupseg_finalized_segments";
    pub const TEMPORARY_SEGMENTS: &str = "groupseg_temporary_segments";
    pub const SPLITS: &str = "groupseg_splits";
    pub const JOINS: &str = "groupseg_joins";

    pub const COMPRESSION_RATIO: &str = "groupseg_compression_ratio";
    pub const GROUP_DURATION_SECONDS: &str = "groupseg_group_duration_seconds";

    pub const ACTIVE_GENERATORS: &str = "groupseg_active_generators";

    /// Handle to the in-process Prometheus recorder.
    ///
    /// This does **not** start an HTTP server. Call [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    #[derive(Debug)]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs the global recorder (once per process) and starts the upkeep thread that
        /// keeps histograms bounded.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("groupseg-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_slice(points: u64) {
        ::metrics::counter!(INGEST_SLICES).increment(1);
        if points > 0 {
            ::metrics::counter!(INGEST_POINTS).increment(points);
        }
    }

    #[inline]
    pub fn record_segment(kind: SegmentKind, compression_ratio: f32) {
        match kind {
            SegmentKind::Finalized => {
                ::metrics::counter!(FINALIZED_SEGMENTS).increment(1);
                if compression_ratio.is_finite() {
                    ::metrics::histogram!(COMPRESSION_RATIO).record(compression_ratio as f64);
                }
            }
            SegmentKind::Temporary => ::metrics::counter!(TEMPORARY_SEGMENTS).increment(1),
        }
    }

    #[inline]
    pub fn record_split() {
        ::metrics::counter!(SPLITS).increment(1);
    }

    #[inline]
    pub fn record_join() {
        ::metrics::counter!(JOINS).increment(1);
    }

    #[inline]
    pub fn record_generator_opened() {
        ::metrics::gauge!(ACTIVE_GENERATORS).increment(1.0);
    }

    #[inline]
    pub fn record_generator_closed() {
        ::metrics::gauge!(ACTIVE_GENERATORS).decrement(1.0);
    }

    #[inline]
    pub fn record_group(duration: Duration) {
        ::metrics::histogram!(GROUP_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    #[cfg_attr(not(feature = "prometheus"), allow(dead_code))]
    fn describe_all() {
        // Counters
        describe_counter!(
            INGEST_POINTS,
            Unit::Count,
            "Total number of data points, gaps included, consumed by root generators."
        );
        describe_counter!(
            INGEST_SLICES,
            Unit::Count,
            "Total number of slices delegated to root generators."
        );
        describe_counter!(
            FINALIZED_SEGMENTS,
            Unit::Count,
            "Total number of finalized segments emitted."
        );
        describe_counter!(
            TEMPORARY_SEGMENTS,
            Unit::Count,
            "Total number of temporary segments emitted to bound latency."
        );
        describe_counter!(SPLITS, Unit::Count, "Total number of dynamic group splits.");
        describe_counter!(JOINS, Unit::Count, "Total number of dynamic group joins.");

        // Histograms
        describe_histogram!(
            COMPRESSION_RATIO,
            Unit::Count,
            "Compression ratio of finalized segments (data points per stored byte, scaled)."
        );
        describe_histogram!(
            GROUP_DURATION_SECONDS,
            Unit::Seconds,
            "Wall time spent compressing one group from initialization to close."
        );

        // Gauges
        describe_gauge!(
            ACTIVE_GENERATORS,
            Unit::Count,
            "Number of root segment generators currently open."
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Recording(std::sync::Mutex<Vec<IngestEvent>>);

    impl IngestEventListener for Recording {
        fn on_event(&self, event: IngestEvent) {
            if let Ok(mut events) = self.0.lock() {
                events.push(event);
            }
        }
    }

    #[test]
    fn listeners_receive_events_through_a_trait_object() {
        let recording = Arc::new(Recording::default());
        let listener: Arc<dyn IngestEventListener> = recording.clone();
        listener.on_event(IngestEvent::GeneratorClosed {
            gid: 1,
            sampling_interval: 100,
        });
        noop_event_listener().on_event(IngestEvent::GeneratorClosed {
            gid: 1,
            sampling_interval: 100,
        });
        assert_eq!(recording.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn recording_without_a_recorder_is_a_noop() {
        ingest_metrics::record_slice(3);
        ingest_metrics::record_segment(SegmentKind::Finalized, f32::NAN);
        ingest_metrics::record_segment(SegmentKind::Temporary, 1.0);
        ingest_metrics::record_generator_opened();
        ingest_metrics::record_generator_closed();
        ingest_metrics::record_group(Duration::from_millis(1));
    }
}
