//! Workflow builder DSL.
//!
//! Provides a fluent API for registering executors and edges, then validates
//! and freezes the graph into a [`Workflow`] that many runs can share.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;

use super::edge::{DirectEdgeData, Edge, EdgeId, EdgeKind, FanInEdgeData, FanOutEdgeData};
use super::executor::{BoxedExecutor, Executor, ExecutorFactory, ExecutorId, ExecutorRegistration};
use super::message::{Message, MessageType};

/// Errors that can occur while building a workflow.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkflowBuildError {
    #[error("unknown executor id: {0}")]
    UnknownExecutor(String),
    #[error("duplicate executor id: {0}")]
    DuplicateExecutor(String),
    #[error("fan-out edge from {0} has no sinks")]
    EmptyFanOut(String),
    #[error("fan-out edge from {from} lists sink {sink} more than once")]
    DuplicateFanOutSink { from: String, sink: String },
    #[error("fan-in edge into {0} has no sources")]
    EmptyFanIn(String),
    #[error("fan-in edge into {sink} lists source {from} more than once")]
    DuplicateFanInSource { sink: String, from: String },
}

/// Builder for constructing workflows with fluent API.
pub struct WorkflowBuilder {
    name: String,
    start: ExecutorId,
    registrations: Vec<ExecutorRegistration>,
    edges: Vec<Edge>,
    outputs: Vec<ExecutorId>,
    errors: Vec<WorkflowBuildError>,
}

impl WorkflowBuilder {
    /// Create a builder whose external input goes to `start`.
    pub fn new(start: impl Into<ExecutorId>) -> Self {
        Self {
            name: "workflow".to_string(),
            start: start.into(),
            registrations: Vec::new(),
            edges: Vec::new(),
            outputs: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Set the workflow name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add an executor instance shared by every run.
    pub fn add_executor(self, executor: impl Executor + 'static) -> Self {
        self.register(ExecutorRegistration::shared(Arc::new(executor)))
    }

    /// Add a pre-built shared executor.
    pub fn add_shared(self, executor: BoxedExecutor) -> Self {
        self.register(ExecutorRegistration::shared(executor))
    }

    /// Add an executor built per run by a factory.
    pub fn add_factory(
        self,
        id: impl Into<ExecutorId>,
        input_types: Vec<MessageType>,
        factory: impl ExecutorFactory + 'static,
    ) -> Self {
        self.register(ExecutorRegistration::factory(id, input_types, factory))
    }

    /// Add an explicit registration.
    pub fn register(mut self, registration: ExecutorRegistration) -> Self {
        if self.registrations.iter().any(|r| r.id() == registration.id()) {
            self.errors
                .push(WorkflowBuildError::DuplicateExecutor(registration.id().to_string()));
        } else {
            self.registrations.push(registration);
        }
        self
    }

    /// Add a direct edge.
    pub fn add_edge(mut self, source: impl Into<ExecutorId>, sink: impl Into<ExecutorId>) -> Self {
        let id = self.next_edge_id(EdgeKind::Direct);
        self.edges.push(Edge::Direct(DirectEdgeData {
            id,
            source: source.into(),
            sink: sink.into(),
            condition: None,
            label: None,
        }));
        self
    }

    /// Add a direct edge that only passes messages accepted by `condition`.
    pub fn add_conditional_edge<F>(
        mut self,
        source: impl Into<ExecutorId>,
        sink: impl Into<ExecutorId>,
        label: impl Into<String>,
        condition: F,
    ) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        let id = self.next_edge_id(EdgeKind::Direct);
        self.edges.push(Edge::Direct(DirectEdgeData {
            id,
            source: source.into(),
            sink: sink.into(),
            condition: Some(Arc::new(condition)),
            label: Some(label.into()),
        }));
        self
    }

    /// Add a fan-out edge broadcasting to every sink.
    pub fn add_fan_out_edge<I, T>(mut self, source: impl Into<ExecutorId>, sinks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ExecutorId>,
    {
        let id = self.next_edge_id(EdgeKind::FanOut);
        self.edges.push(Edge::FanOut(FanOutEdgeData {
            id,
            source: source.into(),
            sinks: sinks.into_iter().map(Into::into).collect(),
            assigner: None,
        }));
        self
    }

    /// Add a fan-out edge whose `assigner` picks sink indices per message.
    ///
    /// Out-of-range indices are ignored.
    pub fn add_partitioned_edge<I, T, F>(mut self, source: impl Into<ExecutorId>, sinks: I, assigner: F) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ExecutorId>,
        F: Fn(&Message, usize) -> Vec<usize> + Send + Sync + 'static,
    {
        let id = self.next_edge_id(EdgeKind::FanOut);
        self.edges.push(Edge::FanOut(FanOutEdgeData {
            id,
            source: source.into(),
            sinks: sinks.into_iter().map(Into::into).collect(),
            assigner: Some(Arc::new(assigner)),
        }));
        self
    }

    /// Add a fan-in edge: `sink` fires once every source has contributed.
    pub fn add_fan_in_edge<I, T>(mut self, sources: I, sink: impl Into<ExecutorId>) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ExecutorId>,
    {
        let id = self.next_edge_id(EdgeKind::FanIn);
        self.edges.push(Edge::FanIn(FanInEdgeData {
            id,
            sources: sources.into_iter().map(Into::into).collect(),
            sink: sink.into(),
        }));
        self
    }

    /// Designate executors whose yielded values become workflow outputs.
    pub fn with_output_from<I, T>(mut self, executors: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ExecutorId>,
    {
        self.outputs.extend(executors.into_iter().map(Into::into));
        self
    }

    fn next_edge_id(&self, kind: EdgeKind) -> EdgeId {
        EdgeId::for_kind(kind, self.edges.len())
    }

    /// Validate and freeze the workflow.
    pub fn build(self) -> Result<Workflow, WorkflowBuildError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }

        let known: BTreeSet<&ExecutorId> = self.registrations.iter().map(|r| r.id()).collect();
        let check = |id: &ExecutorId| {
            if known.contains(id) {
                Ok(())
            } else {
                Err(WorkflowBuildError::UnknownExecutor(id.to_string()))
            }
        };

        check(&self.start)?;
        for output in &self.outputs {
            check(output)?;
        }

        for edge in &self.edges {
            for id in edge.sources().into_iter().chain(edge.sinks()) {
                check(id)?;
            }
            match edge {
                Edge::Direct(_) => {}
                Edge::FanOut(data) => {
                    if data.sinks.is_empty() {
                        return Err(WorkflowBuildError::EmptyFanOut(data.source.to_string()));
                    }
                    if let Some(sink) = first_duplicate(&data.sinks) {
                        return Err(WorkflowBuildError::DuplicateFanOutSink {
                            from: data.source.to_string(),
                            sink: sink.to_string(),
                        });
                    }
                }
                Edge::FanIn(data) => {
                    if data.sources.is_empty() {
                        return Err(WorkflowBuildError::EmptyFanIn(data.sink.to_string()));
                    }
                    if let Some(source) = first_duplicate(&data.sources) {
                        return Err(WorkflowBuildError::DuplicateFanInSource {
                            sink: data.sink.to_string(),
                            from: source.to_string(),
                        });
                    }
                }
            }
        }

        let mut outgoing: BTreeMap<ExecutorId, Vec<usize>> = BTreeMap::new();
        for (index, edge) in self.edges.iter().enumerate() {
            for source in edge.sources() {
                outgoing.entry(source.clone()).or_default().push(index);
            }
        }

        Ok(Workflow {
            inner: Arc::new(WorkflowInner {
                name: self.name,
                start: self.start,
                registrations: self.registrations,
                edges: self.edges,
                outgoing,
                outputs: self.outputs.into_iter().collect(),
            }),
        })
    }
}

fn first_duplicate(ids: &[ExecutorId]) -> Option<&ExecutorId> {
    let mut seen = BTreeSet::new();
    ids.iter().find(|id| !seen.insert(*id))
}

#[derive(Debug)]
struct WorkflowInner {
    name: String,
    start: ExecutorId,
    registrations: Vec<ExecutorRegistration>,
    edges: Vec<Edge>,
    outgoing: BTreeMap<ExecutorId, Vec<usize>>,
    outputs: BTreeSet<ExecutorId>,
}

/// A validated, immutable workflow graph
///
/// Cloning is cheap; clones share the same graph.
#[derive(Debug, Clone)]
pub struct Workflow {
    inner: Arc<WorkflowInner>,
}

impl Workflow {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Executor receiving untargeted external input
    pub fn start_executor_id(&self) -> &ExecutorId {
        &self.inner.start
    }

    pub fn registration(&self, id: &ExecutorId) -> Option<&ExecutorRegistration> {
        self.inner.registrations.iter().find(|r| r.id() == id)
    }

    /// Registrations in the order they were added
    pub fn registrations(&self) -> &[ExecutorRegistration] {
        &self.inner.registrations
    }

    pub fn executor_ids(&self) -> Vec<&ExecutorId> {
        self.inner.registrations.iter().map(|r| r.id()).collect()
    }

    pub fn contains(&self, id: &ExecutorId) -> bool {
        self.registration(id).is_some()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.inner.edges
    }

    /// Edges that carry messages sent by `source`, in declaration order
    pub fn outgoing_edges<'a>(&'a self, source: &ExecutorId) -> impl Iterator<Item = &'a Edge> + 'a {
        let indices = self.inner.outgoing.get(source).cloned().unwrap_or_default();
        indices.into_iter().map(move |index| &self.inner.edges[index])
    }

    pub fn is_output_executor(&self, id: &ExecutorId) -> bool {
        self.inner.outputs.contains(id)
    }

    pub fn output_executors(&self) -> impl Iterator<Item = &ExecutorId> {
        self.inner.outputs.iter()
    }

    /// Whether two handles share the same frozen graph
    pub fn ptr_eq(&self, other: &Workflow) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::executor::FunctionExecutor;

    fn passthrough(id: &str) -> FunctionExecutor {
        FunctionExecutor::new(id, |text: String| async move { Ok(text) })
    }

    #[test]
    fn test_workflow_builder_basic() {
        let workflow = WorkflowBuilder::new("start")
            .name("basic")
            .add_executor(passthrough("start"))
            .add_executor(passthrough("next"))
            .add_edge("start", "next")
            .build()
            .unwrap();

        assert_eq!(workflow.name(), "basic");
        assert_eq!(workflow.start_executor_id().as_str(), "start");
        assert!(workflow.contains(&ExecutorId::new("next")));

        let outgoing: Vec<_> = workflow.outgoing_edges(&ExecutorId::new("start")).collect();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].kind(), EdgeKind::Direct);
        assert_eq!(workflow.outgoing_edges(&ExecutorId::new("next")).count(), 0);
    }

    #[test]
    fn test_workflow_builder_unknown_start() {
        let result = WorkflowBuilder::new("missing")
            .add_executor(passthrough("start"))
            .build();

        assert_eq!(
            result.unwrap_err(),
            WorkflowBuildError::UnknownExecutor("missing".to_string())
        );
    }

    #[test]
    fn test_workflow_builder_invalid_edge() {
        let result = WorkflowBuilder::new("start")
            .add_executor(passthrough("start"))
            .add_edge("start", "missing")
            .build();

        assert_eq!(
            result.unwrap_err(),
            WorkflowBuildError::UnknownExecutor("missing".to_string())
        );
    }

    #[test]
    fn test_workflow_builder_duplicate_executor() {
        let result = WorkflowBuilder::new("start")
            .add_executor(passthrough("start"))
            .add_executor(passthrough("start"))
            .build();

        assert_eq!(
            result.unwrap_err(),
            WorkflowBuildError::DuplicateExecutor("start".to_string())
        );
    }

    #[test]
    fn test_workflow_builder_fan_in_validation() {
        let result = WorkflowBuilder::new("a")
            .add_executor(passthrough("a"))
            .add_executor(passthrough("c"))
            .add_fan_in_edge(["a", "a"], "c")
            .build();

        assert_eq!(
            result.unwrap_err(),
            WorkflowBuildError::DuplicateFanInSource {
                sink: "c".to_string(),
                from: "a".to_string()
            }
        );

        let result = WorkflowBuilder::new("a")
            .add_executor(passthrough("a"))
            .add_fan_in_edge(Vec::<&str>::new(), "a")
            .build();
        assert_eq!(result.unwrap_err(), WorkflowBuildError::EmptyFanIn("a".to_string()));
    }

    #[test]
    fn test_workflow_builder_fan_out_validation() {
        let result = WorkflowBuilder::new("a")
            .add_executor(passthrough("a"))
            .add_fan_out_edge("a", Vec::<&str>::new())
            .build();

        assert_eq!(result.unwrap_err(), WorkflowBuildError::EmptyFanOut("a".to_string()));
    }

    #[test]
    fn test_fan_in_edge_is_outgoing_for_every_source() {
        let workflow = WorkflowBuilder::new("a")
            .add_executor(passthrough("a"))
            .add_executor(passthrough("b"))
            .add_executor(passthrough("c"))
            .add_fan_out_edge("a", ["b", "c"])
            .add_fan_in_edge(["a", "b"], "c")
            .build()
            .unwrap();

        let from_a: Vec<_> = workflow
            .outgoing_edges(&ExecutorId::new("a"))
            .map(|e| e.id().to_string())
            .collect();
        assert_eq!(from_a, vec!["fan_out:0", "fan_in:1"]);
        assert_eq!(workflow.outgoing_edges(&ExecutorId::new("b")).count(), 1);
    }

    #[test]
    fn test_output_executors() {
        let workflow = WorkflowBuilder::new("a")
            .add_executor(passthrough("a"))
            .add_executor(passthrough("b"))
            .add_edge("a", "b")
            .with_output_from(["b"])
            .build()
            .unwrap();

        assert!(workflow.is_output_executor(&ExecutorId::new("b")));
        assert!(!workflow.is_output_executor(&ExecutorId::new("a")));

        let result = WorkflowBuilder::new("a")
            .add_executor(passthrough("a"))
            .with_output_from(["ghost"])
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_workflow_clone_shares_graph() {
        let workflow = WorkflowBuilder::new("a")
            .add_executor(passthrough("a"))
            .build()
            .unwrap();
        let clone = workflow.clone();
        assert!(workflow.ptr_eq(&clone));
    }
}
