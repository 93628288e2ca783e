//! Workflow graph: executors, messages and edges
//!
//! This module holds everything that describes a workflow, independent of
//! any particular run of it.
//!
//! # Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Workflow                             │
//! │                                                              │
//! │   ┌──────┐ Direct ┌───────┐ FanOut ┌────────┐                │
//! │   │ echo │──────→ │ upper │──────→ │ logger │──┐             │
//! │   └──────┘        └───────┘   │    └────────┘  │ FanIn       │
//! │                               │    ┌─────────┐ │  ┌────────┐ │
//! │                               └──→ │ counter │─┴─→│ report │ │
//! │                                    └─────────┘    └────────┘ │
//! │                                                              │
//! │  Build via WorkflowBuilder → Workflow (immutable, shared)    │
//! │  Execute via execution::Run                                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use deepagents_workflow::workflow::{FunctionExecutor, WorkflowBuilder};
//!
//! let workflow = WorkflowBuilder::new("echo")
//!     .name("shout")
//!     .add_executor(FunctionExecutor::new("echo", |s: String| async move { Ok(s) }))
//!     .add_executor(FunctionExecutor::new("upper", |s: String| async move {
//!         Ok(s.to_uppercase())
//!     }))
//!     .add_edge("echo", "upper")
//!     .with_output_from(["upper"])
//!     .build()?;
//! ```

pub mod context;
pub mod edge;
pub mod event;
pub mod executor;
pub mod graph;
pub mod message;
pub mod port;
pub mod visualization;

pub use context::WorkflowContext;
pub use edge::{
    DirectEdgeData, Edge, EdgeCondition, EdgeId, EdgeKind, FanInEdgeData, FanOutEdgeData,
    PartitionAssigner,
};
pub use event::WorkflowEvent;
pub use executor::{
    BoxedExecutor, Executor, ExecutorFactory, ExecutorId, ExecutorOptions, ExecutorRegistration,
    FunctionExecutor,
};
pub use graph::{Workflow, WorkflowBuildError, WorkflowBuilder};
pub use message::{EnvelopeId, Message, MessageEnvelope, MessagePayload, MessageType};
pub use port::{ExternalRequest, ExternalResponse, InputPort};
pub use visualization::{render_edge, render_node, sanitize_id};
