//! Execution engine
//!
//! Drives a [`Workflow`](crate::workflow::Workflow) in synchronized
//! supersteps: every message produced in superstep N is routed and handled
//! together in superstep N+1.
//!
//! ```text
//! Run ──▶ RunnerContext::run_superstep ──▶ edge runners ──▶ executors
//!  │              │                                            │
//!  │              └──────────── effects (messages, state) ◀────┘
//!  └──▶ CheckpointManager (at superstep boundaries)
//! ```

pub mod config;
pub mod edge_runner;
pub mod run;
pub mod runner;
pub mod state;

pub use config::{RetryPolicy, RunnerConfig};
pub use edge_runner::{
    chase_edge, run_direct_edge, run_fan_in_edge, run_fan_out_edge, DeliveryMapping,
    DeliveryStatus, DropReason, EdgeOutcome, ExecutorLookup, FanInState,
};
pub use run::{Run, RunOptions, RunStatus};
pub use runner::{RunnerContext, SuperstepReport};
pub use state::{RunnerStateData, ScopeId, ScopeKey, ScopedState, StateUpdate};
