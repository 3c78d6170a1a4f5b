//! Routes a group's slices to one root generator per active sampling interval.

use crate::error::CoreError;
use crate::generator::{GeneratorContext, SegmentGenerator};
use crate::group::TimeSeriesGroup;
use crate::slice::DataSlice;
use crate::telemetry::{ingest_metrics, IngestEvent};
use crate::types::{ConfigurationEvent, Gid, SamplingInterval, Tid};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Builds root generators for the cohorts of one group.
#[derive(Debug, Clone)]
pub struct SegmentGeneratorSupplier {
    ctx: Arc<GeneratorContext>,
    gid: Gid,
    group_tids: BTreeSet<Tid>,
}

impl SegmentGeneratorSupplier {
    pub fn new(ctx: Arc<GeneratorContext>, gid: Gid, group_tids: BTreeSet<Tid>) -> Self {
        Self {
            ctx,
            gid,
            group_tids,
        }
    }

    /// A generator for `tids`. Group members outside the cohort are reported as permanent
    /// gaps so every segment accounts for the whole group.
    pub fn supply(
        &self,
        sampling_interval: SamplingInterval,
        tids: BTreeSet<Tid>,
    ) -> Result<SegmentGenerator, CoreError> {
        let permanent_gaps = self.group_tids.difference(&tids).copied().collect();
        let generator = SegmentGenerator::new(
            self.ctx.clone(),
            self.gid,
            sampling_interval,
            tids.clone(),
            permanent_gaps,
        )?;
        ingest_metrics::record_generator_opened();
        self.ctx.listener.on_event(IngestEvent::GeneratorCreated {
            gid: self.gid,
            sampling_interval,
            tids: tids.into_iter().collect(),
        });
        Ok(generator)
    }

    fn retire(&self, mut generator: SegmentGenerator) -> Result<(), CoreError> {
        generator.close()?;
        ingest_metrics::record_generator_closed();
        self.ctx.listener.on_event(IngestEvent::GeneratorClosed {
            gid: self.gid,
            sampling_interval: generator.sampling_interval(),
        });
        Ok(())
    }
}

/// Drives one [`TimeSeriesGroup`] to exhaustion.
#[derive(Debug)]
pub struct SegmentGeneratorController {
    group: TimeSeriesGroup,
    supplier: SegmentGeneratorSupplier,
    generators: BTreeMap<SamplingInterval, SegmentGenerator>,
    cohorts: BTreeMap<SamplingInterval, BTreeSet<Tid>>,
    assignments: BTreeMap<Tid, SamplingInterval>,
}

impl SegmentGeneratorController {
    pub fn new(group: TimeSeriesGroup, ctx: Arc<GeneratorContext>) -> Self {
        let supplier = SegmentGeneratorSupplier::new(ctx, group.gid(), group.tids().clone());
        Self {
            group,
            supplier,
            generators: BTreeMap::new(),
            cohorts: BTreeMap::new(),
            assignments: BTreeMap::new(),
        }
    }

    pub fn gid(&self) -> Gid {
        self.group.gid()
    }

    /// Sampling intervals that currently have a root generator.
    pub fn sampling_intervals(&self) -> Vec<SamplingInterval> {
        self.generators.keys().copied().collect()
    }

    pub fn generator(&self, sampling_interval: SamplingInterval) -> Option<&SegmentGenerator> {
        self.generators.get(&sampling_interval)
    }

    /// Moves series between cohorts. Every cohort that changed is closed and, if it still
    /// has members, replaced by a fresh generator.
    pub fn handle_configuration_events(
        &mut self,
        events: Vec<ConfigurationEvent>,
    ) -> Result<(), CoreError> {
        let gid = self.gid();
        let mut affected = BTreeSet::new();
        for event in events {
            let previous = self.assignments.get(&event.tid).copied();
            if previous == Some(event.new_sampling_interval) {
                continue;
            }
            if let Some(previous) = previous {
                if let Some(cohort) = self.cohorts.get_mut(&previous) {
                    cohort.remove(&event.tid);
                }
                affected.insert(previous);
            }
            self.cohorts
                .entry(event.new_sampling_interval)
                .or_default()
                .insert(event.tid);
            self.assignments.insert(event.tid, event.new_sampling_interval);
            affected.insert(event.new_sampling_interval);

            self.supplier
                .ctx
                .listener
                .on_event(IngestEvent::SamplingIntervalChanged {
                    gid,
                    tid: event.tid,
                    previous,
                    new: event.new_sampling_interval,
                });
        }

        for sampling_interval in affected {
            if let Some(generator) = self.generators.remove(&sampling_interval) {
                self.supplier.retire(generator)?;
            }
            match self.cohorts.get(&sampling_interval) {
                Some(tids) if !tids.is_empty() => {
                    let generator = self.supplier.supply(sampling_interval, tids.clone())?;
                    self.generators.insert(sampling_interval, generator);
                }
                _ => {
                    self.cohorts.remove(&sampling_interval);
                }
            }
        }
        Ok(())
    }

    /// # Errors
    /// [`CoreError::NoGeneratorForSamplingInterval`] if no series currently uses the slice's
    /// sampling interval.
    pub fn delegate_slice(&mut self, slice: DataSlice) -> Result<(), CoreError> {
        let sampling_interval = slice.sampling_interval();
        let generator = self
            .generators
            .get_mut(&sampling_interval)
            .ok_or(CoreError::NoGeneratorForSamplingInterval(sampling_interval))?;
        ingest_metrics::record_slice(slice.len() as u64);
        generator.consume_slice(slice)
    }

    /// Initializes the group, consumes every slice and closes all generators.
    pub fn run(&mut self) -> Result<(), CoreError> {
        self.group.initialize()?;
        while self.group.has_next() {
            let events = self.group.pending_configuration_events();
            if !events.is_empty() {
                self.handle_configuration_events(events)?;
            }
            let slice = self.group.get_slice()?;
            self.delegate_slice(slice)?;
        }
        self.close()
    }

    /// Closes every root generator and the group's sources. Safe to call repeatedly.
    pub fn close(&mut self) -> Result<(), CoreError> {
        let generators = std::mem::take(&mut self.generators);
        for (_, generator) in generators {
            self.supplier.retire(generator)?;
        }
        self.cohorts.clear();
        self.assignments.clear();
        self.group.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModelTypeKind, ModelTypeRegistry};
    use crate::segment::CollectingSink;
    use crate::source::{MemoryTimeSeries, Reading, TimeSeries};
    use crate::telemetry::noop_event_listener;
    use crate::types::ValueDataPoint;

    fn context(sink: Arc<CollectingSink>) -> Arc<GeneratorContext> {
        let registry = ModelTypeRegistry::new(
            &[ModelTypeKind::PmcMean, ModelTypeKind::Swing],
            ModelTypeKind::Uncompressed,
            0.0,
            50,
        )
        .unwrap();
        Arc::new(GeneratorContext {
            registry,
            maximum_latency: 0,
            dynamic_split_fraction: 1.0,
            sink,
            listener: noop_event_listener(),
        })
    }

    fn constant(tid: Tid, from: i64, to: i64) -> Box<dyn TimeSeries> {
        Box::new(MemoryTimeSeries::from_samples(
            tid,
            100,
            (from..=to).step_by(100).map(|ts| (ts, 1.0)),
        ))
    }

    #[test]
    fn unknown_sampling_interval_is_rejected() {
        let sink = Arc::new(CollectingSink::new());
        let group = TimeSeriesGroup::new(1, vec![constant(1, 100, 200)]).unwrap();
        let mut controller = SegmentGeneratorController::new(group, context(sink));
        let slice = DataSlice::new(vec![ValueDataPoint::new(1, 100, 1.0, 300)], 300).unwrap();
        assert!(matches!(
            controller.delegate_slice(slice),
            Err(CoreError::NoGeneratorForSamplingInterval(300))
        ));
    }

    #[test]
    fn interval_changes_move_series_between_generators() {
        let sink = Arc::new(CollectingSink::new());
        let group = TimeSeriesGroup::new(1, vec![constant(1, 100, 200), constant(2, 100, 200)])
            .unwrap();
        let mut controller = SegmentGeneratorController::new(group, context(sink));

        controller
            .handle_configuration_events(vec![
                ConfigurationEvent::initial(1, 100),
                ConfigurationEvent::initial(2, 100),
            ])
            .unwrap();
        assert_eq!(controller.sampling_intervals(), vec![100]);

        controller
            .handle_configuration_events(vec![ConfigurationEvent::changed(2, 200, 100)])
            .unwrap();
        assert_eq!(controller.sampling_intervals(), vec![100, 200]);
        let tids = |si| controller.generator(si).unwrap().tids().unwrap().clone();
        assert_eq!(tids(100), [1].into_iter().collect());
        assert_eq!(tids(200), [2].into_iter().collect());

        controller
            .handle_configuration_events(vec![ConfigurationEvent::changed(1, 200, 100)])
            .unwrap();
        assert_eq!(controller.sampling_intervals(), vec![200]);
        controller.close().unwrap();
        assert!(controller.sampling_intervals().is_empty());
    }

    #[test]
    fn run_emits_one_lifetime_per_interval() {
        let sink = Arc::new(CollectingSink::new());
        let mut readings: Vec<Reading> =
            (100..=500).step_by(100).map(|ts| Reading::sample(ts, 1.0)).collect();
        readings.push(Reading::SamplingInterval(200));
        readings.extend([600, 800, 1000].into_iter().map(|ts| Reading::sample(ts, 1.0)));
        let series: Box<dyn TimeSeries> = Box::new(MemoryTimeSeries::new(1, 100, readings));

        let group = TimeSeriesGroup::new(1, vec![series]).unwrap();
        let mut controller = SegmentGeneratorController::new(group, context(sink.clone()));
        controller.run().unwrap();

        let segments: Vec<_> = sink
            .finalized()
            .unwrap()
            .iter()
            .map(|s| (s.start_time, s.end_time, s.sampling_interval))
            .collect();
        assert_eq!(segments, vec![(100, 500, 100), (600, 1000, 200)]);
    }
}
