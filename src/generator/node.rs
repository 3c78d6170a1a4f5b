use super::GeneratorContext;
use crate::error::CoreError;
use crate::models::{ModelType, Row};
use crate::segment::{gaps_to_bytes, SegmentGroup, SegmentKind};
use crate::slice::DataSlice;
use crate::telemetry::{ingest_metrics, IngestEvent};
use crate::types::{Gid, SamplingInterval, Tid, ValueDataPoint};

use std::collections::BTreeSet;
use std::sync::Arc;

/// Which fitted model a segment was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ModelSlot {
    Candidate(usize),
    Fallback,
}

/// One compressor in a generator tree: buffers rows for a fixed id set and emits segments.
///
/// Split and join decisions are not taken here; the node raises `split_requested` or
/// `join_check_due` and the owning tree acts on them once the current row is consumed.
#[derive(Debug)]
pub(crate) struct Node {
    ctx: Arc<GeneratorContext>,
    gid: Gid,
    sampling_interval: SamplingInterval,

    pub(crate) tids: BTreeSet<Tid>,
    pub(crate) permanent_gaps: BTreeSet<Tid>,
    pub(crate) gaps: BTreeSet<Tid>,
    pub(crate) buffer: Vec<Row>,
    /// Created by a split or a partial join.
    pub(crate) is_split: bool,

    models: Vec<Box<dyn ModelType>>,
    fallback: Box<dyn ModelType>,
    cursor: usize,
    last_emitted: Option<ModelSlot>,
    pub(crate) rows_not_yet_emitted: usize,

    finalized_segments: usize,
    average_ratio: f32,
    segments_since_join_check: usize,
    join_check_interval: usize,

    pub(crate) split_requested: bool,
    pub(crate) join_check_due: bool,
}

impl Node {
    pub(crate) fn new(
        ctx: Arc<GeneratorContext>,
        gid: Gid,
        sampling_interval: SamplingInterval,
        tids: BTreeSet<Tid>,
        permanent_gaps: BTreeSet<Tid>,
    ) -> Result<Self, CoreError> {
        let models = ctx.registry.instantiate()?;
        let fallback = ctx.registry.fallback()?;
        Ok(Self {
            ctx,
            gid,
            sampling_interval,
            tids,
            permanent_gaps,
            gaps: BTreeSet::new(),
            buffer: Vec::new(),
            is_split: false,
            models,
            fallback,
            cursor: 0,
            last_emitted: None,
            rows_not_yet_emitted: 0,
            finalized_segments: 0,
            average_ratio: 0.0,
            segments_since_join_check: 0,
            join_check_interval: 1,
            split_requested: false,
            join_check_due: false,
        })
    }

    /// The model whose error function decides correlation: the last emitted one, or the
    /// fallback before anything was emitted.
    pub(crate) fn correlation_model(&self) -> &dyn ModelType {
        match self.last_emitted {
            Some(slot) => self.model(slot),
            None => self.fallback.as_ref(),
        }
    }

    fn model(&self, slot: ModelSlot) -> &dyn ModelType {
        match slot {
            ModelSlot::Candidate(i) => self.models[i].as_ref(),
            ModelSlot::Fallback => self.fallback.as_ref(),
        }
    }

    pub(crate) fn consume_slice(&mut self, mut slice: DataSlice) -> Result<(), CoreError> {
        slice.retain_tids(&self.tids);
        slice.add_gaps_for_missing(&self.tids);
        self.consume_points(slice.points())
    }

    fn consume_points(&mut self, points: &[ValueDataPoint]) -> Result<(), CoreError> {
        if points.is_empty() {
            return Ok(());
        }

        // A model never spans a change in which series are gapped.
        for point in points {
            if point.is_gap() {
                if !self.gaps.contains(&point.tid) {
                    self.flush()?;
                    self.gaps.insert(point.tid);
                }
            } else if self.gaps.contains(&point.tid) {
                self.flush()?;
                self.gaps.remove(&point.tid);
            }
        }

        let row: Row = points.iter().filter(|p| !p.is_gap()).copied().collect();
        if row.is_empty() {
            return Ok(());
        }
        self.rows_not_yet_emitted += 1;
        self.buffer.push(row);
        self.append_to_models()?;

        if self.split_requested {
            return Ok(());
        }
        let latency = self.ctx.maximum_latency;
        if latency > 0 && self.rows_not_yet_emitted >= latency {
            self.emit_temporary()?;
        }
        Ok(())
    }

    fn append_to_models(&mut self) -> Result<(), CoreError> {
        let row = match self.buffer.last() {
            Some(row) => row,
            None => return Ok(()),
        };
        if self.models[self.cursor].append(row) {
            return Ok(());
        }
        loop {
            self.cursor += 1;
            if self.cursor == self.models.len() {
                // No candidate covers the buffer: emit the best prefix and retry the rest.
                self.emit_finalized(true)?;
                self.reset_cursor();
                return Ok(());
            }
            let model = &mut self.models[self.cursor];
            model.initialize(&self.buffer);
            if model.length() == self.buffer.len() {
                return Ok(());
            }
        }
    }

    pub(crate) fn reset_cursor(&mut self) {
        self.cursor = 0;
        self.models[0].initialize(&self.buffer);
    }

    /// Emits finalized segments until the buffer is empty. Splitting is suppressed since
    /// flushed tails compress poorly regardless of correlation.
    pub(crate) fn flush(&mut self) -> Result<(), CoreError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        for model in self.models.iter_mut().skip(self.cursor + 1) {
            model.initialize(&self.buffer);
        }
        while !self.buffer.is_empty() {
            self.emit_finalized(false)?;
            for model in self.models.iter_mut() {
                model.initialize(&self.buffer);
            }
        }
        self.reset_cursor();
        Ok(())
    }

    fn compression_ratio(&self, model: &dyn ModelType) -> f32 {
        let length = model.length();
        if length == 0 || length > self.buffer.len() {
            return f32::NAN;
        }
        model.compression_ratio(
            self.buffer[0][0].timestamp,
            self.buffer[length - 1][0].timestamp,
            self.sampling_interval,
            &self.buffer,
            self.gaps.len(),
        )
    }

    /// Highest ratio wins, ties keep the earlier candidate, NaN never wins.
    fn best_candidate(&self) -> Option<(usize, f32)> {
        let mut best: Option<(usize, f32)> = None;
        for (index, model) in self.models.iter().enumerate() {
            let ratio = self.compression_ratio(model.as_ref());
            if ratio.is_nan() || model.length() == 0 {
                continue;
            }
            match best {
                Some((_, best_ratio)) if ratio <= best_ratio => {}
                _ => best = Some((index, ratio)),
            }
        }
        best
    }

    fn emit_finalized(&mut self, allow_split: bool) -> Result<(), CoreError> {
        let slot = match self.best_candidate() {
            Some((index, _)) => ModelSlot::Candidate(index),
            None => {
                self.fallback.initialize(&self.buffer);
                ModelSlot::Fallback
            }
        };
        let (length, ratio) = self.emit_segment(SegmentKind::Finalized, slot)?;
        self.buffer.drain(..length);
        self.rows_not_yet_emitted = self.rows_not_yet_emitted.min(self.buffer.len());
        self.last_emitted = Some(slot);

        let fraction = if allow_split {
            self.ctx.dynamic_split_fraction
        } else {
            0.0
        };
        let below_average = ratio < fraction * self.average_ratio;
        if ratio.is_finite() {
            let n = self.finalized_segments as f32;
            self.average_ratio = (self.average_ratio * n + ratio) / (n + 1.0);
            self.finalized_segments += 1;
        }
        self.segments_since_join_check += 1;

        let splittable = self.buffer.first().map_or(false, |row| row.len() > 1);
        if allow_split && below_average && splittable {
            self.split_requested = true;
        } else if self.is_split && self.segments_since_join_check >= self.join_check_interval {
            self.join_check_due = true;
            self.segments_since_join_check = 0;
            self.join_check_interval *= 2;
        }
        Ok(())
    }

    /// Emits a preview of everything buffered, unless nothing new arrived since the last
    /// emission.
    pub(crate) fn emit_temporary(&mut self) -> Result<(), CoreError> {
        if self.rows_not_yet_emitted == 0 || self.buffer.is_empty() {
            return Ok(());
        }
        let current = self.models[self.cursor].as_ref();
        let slot = if current.length() == self.buffer.len()
            && !self.compression_ratio(current).is_nan()
        {
            ModelSlot::Candidate(self.cursor)
        } else {
            self.fallback.initialize(&self.buffer);
            ModelSlot::Fallback
        };
        self.emit_segment(SegmentKind::Temporary, slot)?;
        self.rows_not_yet_emitted = 0;
        Ok(())
    }

    /// Sends one segment for the rows covered by `slot` and returns `(rows, ratio)`.
    fn emit_segment(&self, kind: SegmentKind, slot: ModelSlot) -> Result<(usize, f32), CoreError> {
        let model = self.model(slot);
        let length = model.length();
        if length == 0 || length > self.buffer.len() {
            return Err(CoreError::Internal(format!(
                "model type {} covers {} of {} buffered rows",
                model.mtid(),
                length,
                self.buffer.len()
            )));
        }
        let start_time = self.buffer[0][0].timestamp;
        let end_time = self.buffer[length - 1][0].timestamp;
        let ratio = self.compression_ratio(model);
        let bytes = model.model_bytes(start_time, end_time, self.sampling_interval, &self.buffer)?;
        let gaps: BTreeSet<Tid> = self.gaps.union(&self.permanent_gaps).copied().collect();

        let segment = SegmentGroup::new(
            self.gid,
            start_time,
            self.sampling_interval,
            end_time,
            model.mtid(),
            bytes,
            gaps_to_bytes(&gaps),
        );
        self.ctx.sink.emit(kind, segment)?;

        ingest_metrics::record_segment(kind, ratio);
        self.ctx.listener.on_event(IngestEvent::SegmentEmitted {
            gid: self.gid,
            kind,
            start_time,
            end_time,
            mtid: model.mtid(),
            compression_ratio: ratio,
        });
        Ok((length, ratio))
    }
}
