//! Edge runners
//!
//! Given an envelope and an edge it may traverse, an edge runner decides who
//! receives the message this superstep:
//!
//! - **Direct**: the single sink, unless the envelope is addressed elsewhere,
//!   the condition rejects it, or the sink cannot handle its type.
//! - **FanOut**: the assigned (or all) sinks narrowed to the explicit target,
//!   then to those that can handle the type. Partial delivery is normal.
//! - **FanIn**: buffers one envelope per source and releases a round once
//!   every source has contributed.
//!
//! Drops are not errors. They only show up as the `delivery_status` field of
//! the `chase_edge` tracing span.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::workflow::edge::{DirectEdgeData, Edge, EdgeId, FanInEdgeData, FanOutEdgeData};
use crate::workflow::executor::{BoxedExecutor, ExecutorId};
use crate::workflow::message::MessageEnvelope;

/// Outcome tag recorded for each edge resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    Buffered,
    DroppedTypeMismatch,
    DroppedTargetMismatch,
    DroppedConditionFalse,
    Exception,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Buffered => "buffered",
            DeliveryStatus::DroppedTypeMismatch => "dropped_type_mismatch",
            DeliveryStatus::DroppedTargetMismatch => "dropped_target_mismatch",
            DeliveryStatus::DroppedConditionFalse => "dropped_condition_false",
            DeliveryStatus::Exception => "exception",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an edge produced no delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    TypeMismatch,
    TargetMismatch,
    ConditionFalse,
}

/// Envelopes and the executors that should receive them this superstep
///
/// Every target receives every envelope, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryMapping {
    pub envelopes: Vec<MessageEnvelope>,
    pub targets: Vec<ExecutorId>,
}

impl DeliveryMapping {
    fn single(envelope: &MessageEnvelope, target: ExecutorId) -> Self {
        Self {
            envelopes: vec![envelope.clone()],
            targets: vec![target],
        }
    }
}

/// Result of resolving an envelope against one edge
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeOutcome {
    Deliver(DeliveryMapping),
    /// Absorbed by a fan-in barrier that is still waiting
    Buffered,
    Dropped(DropReason),
}

impl EdgeOutcome {
    pub fn status(&self) -> DeliveryStatus {
        match self {
            EdgeOutcome::Deliver(_) => DeliveryStatus::Delivered,
            EdgeOutcome::Buffered => DeliveryStatus::Buffered,
            EdgeOutcome::Dropped(DropReason::TypeMismatch) => DeliveryStatus::DroppedTypeMismatch,
            EdgeOutcome::Dropped(DropReason::TargetMismatch) => DeliveryStatus::DroppedTargetMismatch,
            EdgeOutcome::Dropped(DropReason::ConditionFalse) => DeliveryStatus::DroppedConditionFalse,
        }
    }

    pub fn into_mapping(self) -> Option<DeliveryMapping> {
        match self {
            EdgeOutcome::Deliver(mapping) => Some(mapping),
            _ => None,
        }
    }
}

/// Barrier state of one fan-in edge
///
/// Each source has a FIFO of contributions; round N pairs the N-th
/// envelope of every source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FanInState {
    pending: BTreeMap<ExecutorId, VecDeque<MessageEnvelope>>,
    released_rounds: u64,
}

impl FanInState {
    /// Envelopes buffered across all sources
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    pub fn released_rounds(&self) -> u64 {
        self.released_rounds
    }

    pub fn is_empty(&self) -> bool {
        self.pending_count() == 0
    }
}

/// Resolves executor ids to the run's instances
pub trait ExecutorLookup {
    fn executor(&self, id: &ExecutorId) -> Option<&BoxedExecutor>;
}

impl ExecutorLookup for HashMap<ExecutorId, BoxedExecutor> {
    fn executor(&self, id: &ExecutorId) -> Option<&BoxedExecutor> {
        self.get(id)
    }
}

impl ExecutorLookup for BTreeMap<ExecutorId, BoxedExecutor> {
    fn executor(&self, id: &ExecutorId) -> Option<&BoxedExecutor> {
        self.get(id)
    }
}

fn resolve<'a>(executors: &'a impl ExecutorLookup, id: &ExecutorId) -> Result<&'a BoxedExecutor, WorkflowError> {
    executors
        .executor(id)
        .ok_or_else(|| WorkflowError::UnknownExecutor(id.clone()))
}

/// Resolve an envelope against a direct edge
pub fn run_direct_edge(
    edge: &DirectEdgeData,
    envelope: &MessageEnvelope,
    executors: &impl ExecutorLookup,
) -> Result<EdgeOutcome, WorkflowError> {
    if !envelope.allows_target(&edge.sink) {
        return Ok(EdgeOutcome::Dropped(DropReason::TargetMismatch));
    }
    if let Some(condition) = &edge.condition {
        if !condition(envelope.message()) {
            return Ok(EdgeOutcome::Dropped(DropReason::ConditionFalse));
        }
    }

    let sink = resolve(executors, &edge.sink)?;
    if !sink.can_handle(envelope.message_type()) {
        return Ok(EdgeOutcome::Dropped(DropReason::TypeMismatch));
    }
    Ok(EdgeOutcome::Deliver(DeliveryMapping::single(envelope, edge.sink.clone())))
}

/// Resolve an envelope against a fan-out edge
pub fn run_fan_out_edge(
    edge: &FanOutEdgeData,
    envelope: &MessageEnvelope,
    executors: &impl ExecutorLookup,
) -> Result<EdgeOutcome, WorkflowError> {
    let candidates: Vec<&ExecutorId> = match &edge.assigner {
        Some(assigner) => {
            let mut indices = assigner(envelope.message(), edge.sinks.len());
            indices.retain(|&i| i < edge.sinks.len());
            let mut seen = Vec::with_capacity(indices.len());
            for index in indices {
                if !seen.contains(&index) {
                    seen.push(index);
                }
            }
            seen.into_iter().map(|i| &edge.sinks[i]).collect()
        }
        None => edge.sinks.iter().collect(),
    };

    let candidates: Vec<&ExecutorId> = candidates
        .into_iter()
        .filter(|id| envelope.allows_target(id))
        .collect();
    if candidates.is_empty() {
        return Ok(EdgeOutcome::Dropped(DropReason::TargetMismatch));
    }

    let mut targets = Vec::with_capacity(candidates.len());
    for id in candidates {
        if resolve(executors, id)?.can_handle(envelope.message_type()) {
            targets.push(id.clone());
        }
    }
    if targets.is_empty() {
        return Ok(EdgeOutcome::Dropped(DropReason::TypeMismatch));
    }

    Ok(EdgeOutcome::Deliver(DeliveryMapping {
        envelopes: vec![envelope.clone()],
        targets,
    }))
}

/// Resolve an envelope against a fan-in edge, updating its barrier
pub fn run_fan_in_edge(
    edge: &FanInEdgeData,
    envelope: &MessageEnvelope,
    state: &mut FanInState,
    executors: &impl ExecutorLookup,
) -> Result<EdgeOutcome, WorkflowError> {
    let Some(source) = envelope.source().filter(|s| edge.sources.contains(*s)) else {
        return Ok(EdgeOutcome::Dropped(DropReason::TargetMismatch));
    };
    if !envelope.allows_target(&edge.sink) {
        return Ok(EdgeOutcome::Dropped(DropReason::TargetMismatch));
    }
    // Checked before buffering so a message the sink would reject cannot
    // occupy a slot in the barrier
    if !resolve(executors, &edge.sink)?.can_handle(envelope.message_type()) {
        return Ok(EdgeOutcome::Dropped(DropReason::TypeMismatch));
    }

    state
        .pending
        .entry(source.clone())
        .or_default()
        .push_back(envelope.clone());

    let complete = edge
        .sources
        .iter()
        .all(|s| state.pending.get(s).is_some_and(|queue| !queue.is_empty()));
    if !complete {
        return Ok(EdgeOutcome::Buffered);
    }

    let mut envelopes = Vec::with_capacity(edge.sources.len());
    for source in &edge.sources {
        if let Some(queue) = state.pending.get_mut(source) {
            if let Some(queued) = queue.pop_front() {
                envelopes.push(queued);
            }
        }
    }
    state.pending.retain(|_, queue| !queue.is_empty());
    state.released_rounds += 1;

    Ok(EdgeOutcome::Deliver(DeliveryMapping {
        envelopes,
        targets: vec![edge.sink.clone()],
    }))
}

/// Resolve an envelope against any edge kind
///
/// Records the outcome as `delivery_status` on a `chase_edge` span.
pub fn chase_edge(
    edge: &Edge,
    envelope: &MessageEnvelope,
    fan_in_states: &mut BTreeMap<EdgeId, FanInState>,
    executors: &impl ExecutorLookup,
) -> Result<EdgeOutcome, WorkflowError> {
    let span = tracing::debug_span!(
        "chase_edge",
        edge_id = %edge.id(),
        edge_kind = %edge.kind(),
        envelope = %envelope.id(),
        message_type = %envelope.message_type(),
        delivery_status = tracing::field::Empty,
    );
    let _guard = span.enter();

    let outcome = match edge {
        Edge::Direct(data) => run_direct_edge(data, envelope, executors),
        Edge::FanOut(data) => run_fan_out_edge(data, envelope, executors),
        Edge::FanIn(data) => {
            let state = fan_in_states.entry(data.id.clone()).or_default();
            run_fan_in_edge(data, envelope, state, executors)
        }
    };

    match &outcome {
        Ok(resolved) => {
            span.record("delivery_status", resolved.status().as_str());
            tracing::debug!(delivery_status = %resolved.status(), "Edge resolved");
        }
        Err(err) => {
            span.record("delivery_status", DeliveryStatus::Exception.as_str());
            tracing::debug!(
                delivery_status = %DeliveryStatus::Exception,
                error = %err,
                "Edge resolution failed"
            );
        }
    }
    outcome
}
