//! deepagents-workflow: superstep workflow engine
//!
//! Executors exchange typed messages over Direct, FanOut and FanIn edges.
//! A run advances in supersteps, can pause on external requests, and can be
//! checkpointed and resumed at any superstep boundary.
//!
//! - `Executor` trait: typed message handlers with a context for side effects
//! - `WorkflowBuilder`: validated, immutable graphs shared across runs
//! - `Run`: status, event log, resume and time travel
//! - `CheckpointManager`: memory, file and SQLite checkpoint stores
//!
//! # Example
//!
//! ```rust,ignore
//! use deepagents_workflow::{FunctionExecutor, Run, RunOptions, RunStatus, WorkflowBuilder};
//!
//! let workflow = WorkflowBuilder::new("upper")
//!     .add_executor(FunctionExecutor::new("upper", |s: String| async move {
//!         Ok(s.to_uppercase())
//!     }))
//!     .with_output_from(["upper"])
//!     .build()?;
//!
//! let run = Run::start(&workflow, &"hi".to_string(), RunOptions::new()).await?;
//! assert_eq!(run.status(), RunStatus::Idle);
//! ```

pub mod checkpoint;
pub mod error;
pub mod execution;
pub mod workflow;

// Re-exports for convenience
pub use error::{ExecutorError, Result, WorkflowError};
pub use workflow::{
    BoxedExecutor, Edge, EdgeKind, Executor, ExecutorFactory, ExecutorId, ExecutorOptions,
    ExecutorRegistration, ExternalRequest, ExternalResponse, FunctionExecutor, InputPort, Message,
    MessagePayload, MessageType, Workflow, WorkflowBuildError, WorkflowBuilder, WorkflowContext,
    WorkflowEvent,
};
pub use execution::{
    RetryPolicy, Run, RunOptions, RunStatus, RunnerConfig, ScopeId, ScopedState,
};
pub use checkpoint::{
    create_checkpoint_store, Checkpoint, CheckpointCodec, CheckpointInfo, CheckpointManager,
    CheckpointStore, CheckpointStoreConfig, FileCheckpointStore, MemoryCheckpointStore,
};
#[cfg(feature = "checkpoint-sqlite")]
pub use checkpoint::SqliteCheckpointStore;
