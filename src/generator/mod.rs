//! Adaptive segment generation for one sampling-interval cohort of a group.
//!
//! A [`SegmentGenerator`] owns a small arena of compressor nodes. Node 0 is the root and
//! covers every series of the cohort. When the series stop compressing well together the
//! active node is split into correlated subgroups; the subgroups then receive their share of
//! every slice until they correlate again and are joined back, possibly restoring the root.

mod correlation;
mod node;

use correlation::{correlation_classes, tails_correlated};
use node::Node;

use crate::error::CoreError;
use crate::models::ModelTypeRegistry;
use crate::segment::SegmentSink;
use crate::slice::DataSlice;
use crate::telemetry::{ingest_metrics, IngestEvent, IngestEventListener};
use crate::types::{Gid, SamplingInterval, Tid};

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

type NodeId = usize;

const ROOT: NodeId = 0;

/// Immutable settings and collaborators shared by every generator of an ingestion run.
pub struct GeneratorContext {
    pub registry: ModelTypeRegistry,
    /// Rows after which a temporary segment is emitted; 0 disables temporary segments.
    pub maximum_latency: usize,
    /// A finalized segment below this fraction of the running average ratio triggers a
    /// split attempt; 0 disables splitting.
    pub dynamic_split_fraction: f32,
    pub sink: Arc<dyn SegmentSink>,
    pub listener: Arc<dyn IngestEventListener>,
}

impl fmt::Debug for GeneratorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorContext")
            .field("registry", &self.registry)
            .field("maximum_latency", &self.maximum_latency)
            .field("dynamic_split_fraction", &self.dynamic_split_fraction)
            .field("sink", &self.sink)
            .field("listener", &self.listener)
            .finish()
    }
}

/// Observable state of a generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    /// The root consumes slices itself.
    Active,
    /// Slices are partitioned over split subgroups.
    Delegating,
    /// Closed; no further input is accepted.
    Finalized,
}

#[derive(Debug)]
pub struct SegmentGenerator {
    gid: Gid,
    sampling_interval: SamplingInterval,
    ctx: Arc<GeneratorContext>,
    nodes: Vec<Option<Node>>,
    /// Vacated arena slots, reused before the arena grows.
    vacant: Vec<NodeId>,
    /// Leaves receiving slices while delegating, in creation order. Empty while active.
    children: Vec<NodeId>,
    join_candidates: BTreeSet<NodeId>,
    finalized: bool,
}

impl SegmentGenerator {
    /// Creates a generator for `tids`. `permanent_gaps` are group members outside this
    /// cohort; they are reported as gaps in every emitted segment.
    pub fn new(
        ctx: Arc<GeneratorContext>,
        gid: Gid,
        sampling_interval: SamplingInterval,
        tids: BTreeSet<Tid>,
        permanent_gaps: BTreeSet<Tid>,
    ) -> Result<Self, CoreError> {
        if tids.is_empty() {
            return Err(CoreError::EmptyGroup);
        }
        let permanent_gaps = permanent_gaps.difference(&tids).copied().collect();
        let root = Node::new(ctx.clone(), gid, sampling_interval, tids, permanent_gaps)?;
        Ok(Self {
            gid,
            sampling_interval,
            ctx,
            nodes: vec![Some(root)],
            vacant: Vec::new(),
            children: Vec::new(),
            join_candidates: BTreeSet::new(),
            finalized: false,
        })
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn sampling_interval(&self) -> SamplingInterval {
        self.sampling_interval
    }

    pub fn tids(&self) -> Result<&BTreeSet<Tid>, CoreError> {
        Ok(&self.node(ROOT)?.tids)
    }

    pub fn state(&self) -> GeneratorState {
        if self.finalized {
            GeneratorState::Finalized
        } else if self.children.is_empty() {
            GeneratorState::Active
        } else {
            GeneratorState::Delegating
        }
    }

    /// The id sets currently compressed together.
    pub fn partitions(&self) -> Vec<BTreeSet<Tid>> {
        let leaves: &[NodeId] = if self.children.is_empty() {
            &[ROOT]
        } else {
            &self.children
        };
        leaves
            .iter()
            .filter_map(|id| self.nodes.get(*id).and_then(Option::as_ref))
            .map(|node| node.tids.clone())
            .collect()
    }

    /// Rows buffered but not yet covered by a finalized segment, over all leaves.
    pub fn buffered_rows(&self) -> usize {
        self.nodes
            .iter()
            .flatten()
            .map(|node| node.buffer.len())
            .sum()
    }

    /// Feeds one slice of this cohort's sampling interval through the tree.
    ///
    /// # Errors
    /// [`CoreError::MixedSamplingIntervals`] for a slice of another interval, and
    /// [`CoreError::Internal`] once the generator is closed.
    pub fn consume_slice(&mut self, mut slice: DataSlice) -> Result<(), CoreError> {
        if self.finalized {
            return Err(CoreError::Internal(format!(
                "generator for group {} and SI {} is closed",
                self.gid, self.sampling_interval
            )));
        }
        if slice.sampling_interval() != self.sampling_interval {
            return Err(CoreError::MixedSamplingIntervals {
                expected: self.sampling_interval,
                found: slice.sampling_interval(),
                tid: slice.points().first().map_or(0, |p| p.tid),
            });
        }

        let tids = self.node(ROOT)?.tids.clone();
        slice.retain_tids(&tids);
        slice.add_gaps_for_missing(&tids);

        if self.children.is_empty() {
            self.node_mut(ROOT)?.consume_slice(slice)?;
            if self.node(ROOT)?.split_requested {
                self.split(ROOT)?;
            }
            return Ok(());
        }

        let children = self.children.clone();
        let covers = children
            .iter()
            .map(|id| Ok(self.node(*id)?.tids.clone()))
            .collect::<Result<Vec<_>, CoreError>>()?;
        let cover_refs: Vec<&BTreeSet<Tid>> = covers.iter().collect();
        let parts = slice.partition(&cover_refs);

        for (id, part) in children.into_iter().zip(parts) {
            let node = self.node_mut(id)?;
            node.consume_slice(part)?;
            if node.split_requested {
                self.split(id)?;
            } else if node.join_check_due {
                node.join_check_due = false;
                self.join_candidates.insert(id);
            }
        }
        self.join_if_correlated()
    }

    /// Flushes every leaf. Calling it again does nothing.
    pub fn close(&mut self) -> Result<(), CoreError> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        for id in self.children.clone() {
            self.node_mut(id)?.flush()?;
        }
        self.node_mut(ROOT)?.flush()
    }

    fn node(&self, id: NodeId) -> Result<&Node, CoreError> {
        self.nodes
            .get(id)
            .and_then(Option::as_ref)
            .ok_or_else(|| CoreError::Internal(format!("generator node {} does not exist", id)))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, CoreError> {
        self.nodes
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or_else(|| CoreError::Internal(format!("generator node {} does not exist", id)))
    }

    fn add_node(&mut self, node: Node) -> NodeId {
        match self.vacant.pop() {
            Some(id) => {
                self.nodes[id] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn remove_node(&mut self, id: NodeId) -> Result<Node, CoreError> {
        let node = self
            .nodes
            .get_mut(id)
            .and_then(Option::take)
            .ok_or_else(|| CoreError::Internal(format!("generator node {} does not exist", id)))?;
        self.vacant.push(id);
        Ok(node)
    }

    fn doubled_error_bound(&self) -> f32 {
        2.0 * self.ctx.registry.error_bound()
    }

    /// Replaces node `id` by one node per correlation class of its buffer, plus one node
    /// for the series that are currently gapped. Does nothing if all series correlate.
    fn split(&mut self, id: NodeId) -> Result<(), CoreError> {
        let bound = self.doubled_error_bound();
        let node = self.node_mut(id)?;
        node.split_requested = false;

        let columns: Vec<Tid> = match node.buffer.first() {
            Some(row) => row.iter().map(|p| p.tid).collect(),
            None => return Ok(()),
        };
        let classes = correlation_classes(&node.buffer, node.correlation_model(), bound);
        if classes.len() <= 1 {
            return Ok(());
        }

        let mut partitions: Vec<(BTreeSet<Tid>, Vec<usize>)> = classes
            .into_iter()
            .map(|class| (class.iter().map(|&c| columns[c]).collect(), class))
            .collect();
        let gapped: BTreeSet<Tid> = node
            .tids
            .iter()
            .copied()
            .filter(|tid| !columns.contains(tid))
            .collect();
        if !gapped.is_empty() {
            partitions.push((gapped, Vec::new()));
        }

        let parent_tids = node.tids.clone();
        let parent_permanent_gaps = node.permanent_gaps.clone();
        let parent_buffer = std::mem::take(&mut node.buffer);
        node.rows_not_yet_emitted = 0;
        node.reset_cursor();

        let mut new_ids = Vec::with_capacity(partitions.len());
        for (tids, class) in &partitions {
            let permanent_gaps = parent_tids
                .difference(tids)
                .chain(parent_permanent_gaps.iter())
                .copied()
                .collect();
            let mut child = Node::new(
                self.ctx.clone(),
                self.gid,
                self.sampling_interval,
                tids.clone(),
                permanent_gaps,
            )?;
            child.is_split = true;
            if class.is_empty() {
                child.gaps = tids.clone();
            } else {
                child.buffer = parent_buffer
                    .iter()
                    .map(|row| class.iter().map(|&c| row[c]).collect())
                    .collect();
            }
            child.rows_not_yet_emitted = child.buffer.len();
            child.reset_cursor();
            // The combined temporary segment no longer applies to any single child.
            if self.ctx.maximum_latency > 0 {
                child.emit_temporary()?;
            }
            new_ids.push(self.add_node(child));
        }

        if id == ROOT {
            self.children = new_ids;
        } else {
            self.remove_node(id)?;
            self.join_candidates.remove(&id);
            let position = self.children.iter().position(|c| *c == id).ok_or_else(|| {
                CoreError::Internal(format!("split node {} is not delegated to", id))
            })?;
            self.children.splice(position..=position, new_ids);
        }

        ingest_metrics::record_split();
        self.ctx.listener.on_event(IngestEvent::GroupSplit {
            gid: self.gid,
            sampling_interval: self.sampling_interval,
            classes: partitions
                .iter()
                .map(|(tids, _)| tids.iter().copied().collect())
                .collect(),
        });
        Ok(())
    }

    /// Checks every node due for a join against the other leaves and merges those whose
    /// newest rows agree.
    fn join_if_correlated(&mut self) -> Result<(), CoreError> {
        let bound = self.doubled_error_bound();
        let mut claimed: HashSet<NodeId> = HashSet::new();
        let mut joined: Vec<NodeId> = Vec::new();

        while let Some(seed) = self.join_candidates.pop_first() {
            if claimed.contains(&seed) || !self.children.contains(&seed) {
                continue;
            }
            claimed.insert(seed);

            let mut members = vec![seed];
            {
                let model = self.node(ROOT)?.correlation_model();
                let seed_node = self.node(seed)?;
                for &other in &self.children {
                    if other == seed || claimed.contains(&other) {
                        continue;
                    }
                    let other_node = self.node(other)?;
                    if tails_correlated(&seed_node.buffer, &other_node.buffer, model, bound) {
                        members.push(other);
                    }
                }
            }
            if members.len() < 2 {
                continue;
            }
            for member in &members {
                claimed.insert(*member);
                self.join_candidates.remove(member);
            }
            if let Some(id) = self.merge(members)? {
                joined.push(id);
            }
            if self.children.is_empty() {
                self.join_candidates.clear();
                break;
            }
        }
        self.children.extend(joined);
        Ok(())
    }

    /// Flushes `members` and replaces them by one node over the union of their ids. Returns
    /// the new node, or `None` when the union restored the root.
    fn merge(&mut self, mut members: Vec<NodeId>) -> Result<Option<NodeId>, CoreError> {
        members.sort_by_key(|id| self.children.iter().position(|c| c == id));

        let mut tids = BTreeSet::new();
        let mut gaps = BTreeSet::new();
        for &id in &members {
            let mut node = self.remove_node(id)?;
            node.flush()?;
            tids.extend(node.tids.iter().copied());
            gaps.extend(node.gaps.iter().copied());
        }
        self.children.retain(|id| !members.contains(id));

        let root = self.node_mut(ROOT)?;
        let restored = tids == root.tids;
        let id = if restored {
            root.gaps = gaps;
            root.buffer.clear();
            root.rows_not_yet_emitted = 0;
            root.reset_cursor();
            ROOT
        } else {
            let permanent_gaps = root
                .tids
                .difference(&tids)
                .chain(root.permanent_gaps.iter())
                .copied()
                .collect();
            let mut node = Node::new(
                self.ctx.clone(),
                self.gid,
                self.sampling_interval,
                tids.clone(),
                permanent_gaps,
            )?;
            node.is_split = true;
            node.gaps = gaps;
            self.add_node(node)
        };
        // Supersedes the temporary segments of the joined nodes.
        if self.ctx.maximum_latency > 0 {
            self.node_mut(id)?.emit_temporary()?;
        }

        ingest_metrics::record_join();
        self.ctx.listener.on_event(IngestEvent::GroupsJoined {
            gid: self.gid,
            sampling_interval: self.sampling_interval,
            tids: tids.into_iter().collect(),
            restored,
        });
        Ok(if restored { None } else { Some(id) })
    }
}
