//! Edge topology
//!
//! Edges are a tagged union over three kinds:
//!
//! - **Direct**: one source, one sink, optional condition
//! - **FanOut**: one source, ordered sinks, optional partition assigner
//! - **FanIn**: several sources feeding one sink behind a barrier

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::executor::ExecutorId;
use super::message::Message;

/// Identifier of an edge within a workflow
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub String);

impl EdgeId {
    pub(crate) fn for_kind(kind: EdgeKind, index: usize) -> Self {
        Self(format!("{}:{}", kind, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    Direct,
    FanOut,
    FanIn,
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EdgeKind::Direct => "direct",
            EdgeKind::FanOut => "fan_out",
            EdgeKind::FanIn => "fan_in",
        };
        write!(f, "{}", name)
    }
}

/// Predicate deciding whether a message may cross a direct edge
pub type EdgeCondition = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Maps a message and the sink count to the sink indices that receive it
pub type PartitionAssigner = Arc<dyn Fn(&Message, usize) -> Vec<usize> + Send + Sync>;

#[derive(Clone)]
pub struct DirectEdgeData {
    pub id: EdgeId,
    pub source: ExecutorId,
    pub sink: ExecutorId,
    pub condition: Option<EdgeCondition>,
    /// Label shown on conditional edges in diagrams
    pub label: Option<String>,
}

impl std::fmt::Debug for DirectEdgeData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectEdgeData")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("sink", &self.sink)
            .field("conditional", &self.condition.is_some())
            .field("label", &self.label)
            .finish()
    }
}

#[derive(Clone)]
pub struct FanOutEdgeData {
    pub id: EdgeId,
    pub source: ExecutorId,
    pub sinks: Vec<ExecutorId>,
    /// Without an assigner every message goes to all sinks
    pub assigner: Option<PartitionAssigner>,
}

impl std::fmt::Debug for FanOutEdgeData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutEdgeData")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("sinks", &self.sinks)
            .field("partitioned", &self.assigner.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct FanInEdgeData {
    pub id: EdgeId,
    pub sources: Vec<ExecutorId>,
    pub sink: ExecutorId,
}

/// An edge in the workflow graph
#[derive(Debug, Clone)]
pub enum Edge {
    Direct(DirectEdgeData),
    FanOut(FanOutEdgeData),
    FanIn(FanInEdgeData),
}

impl Edge {
    pub fn kind(&self) -> EdgeKind {
        match self {
            Edge::Direct(_) => EdgeKind::Direct,
            Edge::FanOut(_) => EdgeKind::FanOut,
            Edge::FanIn(_) => EdgeKind::FanIn,
        }
    }

    pub fn id(&self) -> &EdgeId {
        match self {
            Edge::Direct(data) => &data.id,
            Edge::FanOut(data) => &data.id,
            Edge::FanIn(data) => &data.id,
        }
    }

    /// Executors whose messages travel along this edge
    pub fn sources(&self) -> Vec<&ExecutorId> {
        match self {
            Edge::Direct(data) => vec![&data.source],
            Edge::FanOut(data) => vec![&data.source],
            Edge::FanIn(data) => data.sources.iter().collect(),
        }
    }

    /// Executors this edge can deliver to
    pub fn sinks(&self) -> Vec<&ExecutorId> {
        match self {
            Edge::Direct(data) => vec![&data.sink],
            Edge::FanOut(data) => data.sinks.iter().collect(),
            Edge::FanIn(data) => vec![&data.sink],
        }
    }

    pub fn has_source(&self, id: &ExecutorId) -> bool {
        self.sources().contains(&id)
    }
}
