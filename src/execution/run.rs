//! Run handle
//!
//! A [`Run`] drives one execution of a [`Workflow`] through supersteps until
//! it halts, records every event, and exposes the controls callers need:
//! status, event cursor, resume with external responses or new input,
//! checkpoint time travel and disposal.
//!
//! # Status transitions
//!
//! ```text
//! NotStarted ──▶ Running ──┬──▶ Idle ───────────────────┐
//!                   ▲      ├──▶ AwaitingExternalResponse ┤ (resume / send)
//!                   │      ├──▶ Completed  (terminal)    │
//!                   │      └──▶ Faulted    (terminal)    │
//!                   └────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::config::RunnerConfig;
use super::runner::RunnerContext;
use super::state::RunnerStateData;
use crate::checkpoint::{CheckpointInfo, CheckpointManager};
use crate::error::WorkflowError;
use crate::workflow::event::WorkflowEvent;
use crate::workflow::executor::ExecutorId;
use crate::workflow::graph::Workflow;
use crate::workflow::message::{Message, MessagePayload};
use crate::workflow::port::{ExternalRequest, ExternalResponse};

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    NotStarted,
    Running,
    /// Queue drained, nothing pending; new input resumes the run
    Idle,
    /// Halted until pending external requests are answered
    AwaitingExternalResponse,
    /// An executor requested a halt
    Completed,
    Faulted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Faulted)
    }

    /// Halted but resumable
    pub fn is_halted(&self) -> bool {
        matches!(self, RunStatus::Idle | RunStatus::AwaitingExternalResponse)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStatus::NotStarted => "not_started",
            RunStatus::Running => "running",
            RunStatus::Idle => "idle",
            RunStatus::AwaitingExternalResponse => "awaiting_external_response",
            RunStatus::Completed => "completed",
            RunStatus::Faulted => "faulted",
        };
        write!(f, "{}", name)
    }
}

/// Options for starting a run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run id, a random UUID when unset
    pub run_id: Option<String>,
    pub config: RunnerConfig,
    /// Where checkpoints go, none when unset
    pub checkpoints: Option<CheckpointManager>,
    /// Token observed by every handler of the run
    pub cancellation: Option<CancellationToken>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_checkpoints(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// One execution of a workflow
///
/// The event log is single-consumer: [`new_events`](Self::new_events)
/// advances one shared bookmark. Use [`subscribe`](Self::subscribe) for
/// additional live listeners.
pub struct Run {
    runner: RunnerContext,
    status: RunStatus,
    events: Vec<WorkflowEvent>,
    bookmark: usize,
    terminal_error: Option<WorkflowError>,
    checkpoints: Option<CheckpointManager>,
    checkpoint_infos: Vec<CheckpointInfo>,
    cancellation: CancellationToken,
    event_tx: broadcast::Sender<WorkflowEvent>,
    leases: Vec<OwnedMutexGuard<()>>,
    disposed: bool,
}

impl Run {
    /// Create a run without driving it
    ///
    /// Runs over non-concurrent shared executors wait here until earlier
    /// runs holding those executors are disposed or dropped. Resettable
    /// leased executors are reset once the lease is held, so a run never
    /// sees state left by a predecessor that was dropped without `dispose`.
    pub async fn new(workflow: &Workflow, options: RunOptions) -> Result<Self, WorkflowError> {
        let run_id = options.run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let leases = acquire_leases(workflow, &run_id).await?;
        let (event_tx, _) = broadcast::channel(options.config.event_channel_capacity.max(1));
        let runner = RunnerContext::new(workflow.clone(), run_id, options.config).await?;

        Ok(Self {
            runner,
            status: RunStatus::NotStarted,
            events: Vec::new(),
            bookmark: 0,
            terminal_error: None,
            checkpoints: options.checkpoints,
            checkpoint_infos: Vec::new(),
            cancellation: options.cancellation.unwrap_or_default(),
            event_tx,
            leases,
            disposed: false,
        })
    }

    /// Start a run with one input for the start executor and drive it until it halts
    ///
    /// Configuration problems (factory failures, an input the start executor
    /// cannot handle) are returned as errors. Failures while running are
    /// reflected in [`status`](Self::status) and [`outcome`](Self::outcome).
    pub async fn start<T: MessagePayload>(
        workflow: &Workflow,
        input: &T,
        options: RunOptions,
    ) -> Result<Self, WorkflowError> {
        let message = Message::new(input)?;
        Self::start_with_message(workflow, message, options).await
    }

    pub async fn start_with_message(
        workflow: &Workflow,
        message: Message,
        options: RunOptions,
    ) -> Result<Self, WorkflowError> {
        let mut run = Self::new(workflow, options).await?;
        run.send(message, None).await?;
        Ok(run)
    }

    /// Rebuild a run from a stored checkpoint, e.g. after a process restart
    ///
    /// The run takes the checkpoint's run id. It is driven further only if
    /// the checkpoint was taken while the run was still running.
    pub async fn resume_from_checkpoint(
        workflow: &Workflow,
        info: &CheckpointInfo,
        options: RunOptions,
    ) -> Result<Self, WorkflowError> {
        if options.checkpoints.is_none() {
            return Err(WorkflowError::config("resuming from a checkpoint needs a checkpoint manager"));
        }
        let options = RunOptions {
            run_id: Some(info.run_id.clone()),
            ..options
        };

        let mut run = Self::new(workflow, options).await?;
        run.restore_checkpoint(info).await?;
        Ok(run)
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn run_id(&self) -> &str {
        self.runner.run_id()
    }

    pub fn workflow(&self) -> &Workflow {
        self.runner.workflow()
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Every event so far, in order
    pub fn outgoing_events(&self) -> &[WorkflowEvent] {
        &self.events
    }

    /// Events since the previous call, advancing the bookmark
    pub fn new_events(&mut self) -> Vec<WorkflowEvent> {
        let fresh = self.events[self.bookmark..].to_vec();
        self.bookmark = self.events.len();
        fresh
    }

    pub fn new_event_count(&self) -> usize {
        self.events.len() - self.bookmark
    }

    pub fn pending_requests(&self) -> Vec<&ExternalRequest> {
        self.runner.pending_requests().collect()
    }

    pub fn queued_message_count(&self) -> usize {
        self.runner.queued_message_count()
    }

    /// Supersteps completed so far
    pub fn superstep(&self) -> usize {
        self.runner.superstep()
    }

    /// Values yielded by output executors, in order
    pub fn outputs(&self) -> Vec<&Message> {
        self.events
            .iter()
            .filter_map(|event| match event {
                WorkflowEvent::WorkflowOutput { data, .. } => Some(data),
                _ => None,
            })
            .collect()
    }

    /// Live feed of events appended from now on
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.event_tx.subscribe()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Checkpoints written by this run, oldest first
    pub fn checkpoints(&self) -> &[CheckpointInfo] {
        &self.checkpoint_infos
    }

    /// Engine state at the current superstep boundary
    pub async fn snapshot(&self) -> Result<RunnerStateData, WorkflowError> {
        self.runner.export_state().await
    }

    /// Result of the run so far
    ///
    /// A cancellation or engine fault takes precedence. Otherwise a single
    /// executor failure surfaces as [`WorkflowError::ExecutorFailed`] and
    /// several as [`WorkflowError::Aggregate`].
    pub fn outcome(&self) -> Result<RunStatus, WorkflowError> {
        if let Some(error) = &self.terminal_error {
            return Err(error.clone());
        }

        let mut failures: Vec<WorkflowError> = self
            .events
            .iter()
            .filter_map(|event| match event {
                WorkflowEvent::ExecutorFailed { executor_id, error, .. } => {
                    Some(WorkflowError::executor_failed(executor_id.clone(), Arc::clone(error)))
                }
                _ => None,
            })
            .collect();

        match failures.len() {
            0 => Ok(self.status),
            1 => Err(failures.remove(0)),
            _ => Err(WorkflowError::Aggregate(failures)),
        }
    }

    // =========================================================================
    // Driving
    // =========================================================================

    /// Send a value to the start executor and drive the run
    ///
    /// Returns whether new events were produced.
    pub async fn send_message<T: MessagePayload>(&mut self, value: &T) -> Result<bool, WorkflowError> {
        let message = Message::new(value)?;
        self.send(message, None).await
    }

    /// Send a message to `target` (the start executor when `None`) and drive the run
    pub async fn send(&mut self, message: Message, target: Option<ExecutorId>) -> Result<bool, WorkflowError> {
        self.ensure_resumable()?;
        self.runner.enqueue_message(message, target)?;
        Ok(self.drive().await)
    }

    /// Answer pending external requests and drive the run
    ///
    /// Every response is validated before any is enqueued: an unknown
    /// request id, a repeated id or a payload that does not match the
    /// port's response type rejects the whole batch.
    pub async fn resume(&mut self, responses: Vec<ExternalResponse>) -> Result<bool, WorkflowError> {
        self.ensure_resumable()?;

        let mut seen = HashSet::new();
        for response in &responses {
            if !seen.insert(response.request_id.as_str()) {
                return Err(WorkflowError::UnknownRequest(response.request_id.clone()));
            }
            self.runner.validate_response(response)?;
        }
        for response in responses {
            self.runner.enqueue_response(response)?;
        }

        Ok(self.drive().await)
    }

    /// Resume with arbitrary typed messages
    ///
    /// [`ExternalResponse`] values are matched to pending requests; any
    /// other type goes to the start executor.
    pub async fn resume_with<T: MessagePayload>(&mut self, messages: Vec<T>) -> Result<bool, WorkflowError> {
        let messages = messages
            .iter()
            .map(Message::new)
            .collect::<Result<Vec<_>, _>>()?;

        if T::TYPE_NAME == ExternalResponse::TYPE_NAME {
            let responses = messages
                .iter()
                .map(|message| message.decode::<ExternalResponse>())
                .collect::<Result<Vec<_>, _>>()?;
            return self.resume(responses).await;
        }

        self.ensure_resumable()?;
        for message in messages {
            self.runner.enqueue_message(message, None)?;
        }
        Ok(self.drive().await)
    }

    /// Rewind the run to a stored checkpoint of the same workflow
    ///
    /// Events already recorded stay in the log. Returns whether the restored
    /// run produced new events.
    pub async fn restore_checkpoint(&mut self, info: &CheckpointInfo) -> Result<bool, WorkflowError> {
        if self.disposed {
            return Err(WorkflowError::InvalidRunState("run has been disposed".into()));
        }
        let manager = self
            .checkpoints
            .clone()
            .ok_or_else(|| WorkflowError::config("run has no checkpoint manager"))?;

        let checkpoint = manager.restore(self.runner.workflow(), info).await?;
        self.runner.import_state(checkpoint.state).await?;
        self.status = checkpoint.status;
        self.terminal_error = None;
        self.checkpoint_infos.retain(|existing| existing.sequence <= info.sequence);
        if !self.checkpoint_infos.contains(info) {
            self.checkpoint_infos.push(info.clone());
        }

        tracing::info!(
            run_id = %self.run_id(),
            checkpoint = %info,
            status = %self.status,
            "Run restored"
        );

        if self.status == RunStatus::Running {
            return Ok(self.drive().await);
        }
        Ok(false)
    }

    /// Release the run's resources
    ///
    /// Resets resettable shared executors, writes a final checkpoint and
    /// releases shared-executor leases. Calling it again does nothing.
    pub async fn dispose(&mut self) -> Result<(), WorkflowError> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;

        let flushed = if self.status == RunStatus::NotStarted {
            Ok(())
        } else {
            self.write_checkpoint(self.status).await
        };

        for registration in self.runner.workflow().registrations() {
            if let Err(e) = registration.reset_shared().await {
                tracing::warn!(executor_id = %registration.id(), error = %e, "Failed to reset shared executor");
            }
        }
        self.leases.clear();

        tracing::debug!(run_id = %self.run_id(), status = %self.status, "Run disposed");
        flushed
    }

    fn ensure_resumable(&self) -> Result<(), WorkflowError> {
        if self.disposed {
            return Err(WorkflowError::InvalidRunState("run has been disposed".into()));
        }
        if self.status.is_terminal() {
            return Err(WorkflowError::InvalidRunState(format!("run is {}", self.status)));
        }
        Ok(())
    }

    /// Run supersteps until the run halts; returns whether events were produced
    async fn drive(&mut self) -> bool {
        let before = self.events.len();
        let run_timeout = self.runner.config().run_timeout;
        let token = self.cancellation.child_token();

        self.status = RunStatus::Running;
        tracing::info!(
            run_id = %self.run_id(),
            superstep = self.runner.superstep(),
            queued = self.runner.queued_message_count(),
            "Driving run"
        );

        let result = match tokio::time::timeout(run_timeout, self.drive_supersteps(&token)).await {
            Ok(result) => result,
            Err(_) => {
                // Stop handlers still in flight from the abandoned superstep
                token.cancel();
                Err(WorkflowError::RunTimeout(run_timeout))
            }
        };

        if let Err(error) = result {
            tracing::warn!(run_id = %self.run_id(), error = %error, "Run faulted");
            self.status = RunStatus::Faulted;
            self.terminal_error = Some(error);
        }

        tracing::info!(
            run_id = %self.run_id(),
            status = %self.status,
            superstep = self.runner.superstep(),
            events = self.events.len() - before,
            "Run halted"
        );
        self.events.len() > before
    }

    async fn drive_supersteps(&mut self, cancel: &CancellationToken) -> Result<(), WorkflowError> {
        let max_supersteps = self.runner.config().max_supersteps;

        loop {
            if cancel.is_cancelled() {
                return Err(WorkflowError::Cancelled);
            }
            if !self.runner.has_queued_messages() {
                self.status = self.halted_status();
                return Ok(());
            }
            if self.runner.superstep() >= max_supersteps {
                return Err(WorkflowError::MaxSuperstepsExceeded(max_supersteps));
            }

            let report = self.runner.run_superstep(cancel).await?;
            self.publish(report.events);

            if cancel.is_cancelled() {
                return Err(WorkflowError::Cancelled);
            }

            let status = if report.failures > 0 && self.runner.config().halt_on_executor_failure {
                RunStatus::Faulted
            } else if self.runner.halt_requested() || self.runner.has_pending_requests() {
                self.halted_status()
            } else if self.runner.has_queued_messages() {
                RunStatus::Running
            } else {
                self.halted_status()
            };

            let superstep = self.runner.superstep();
            if status != RunStatus::Running || self.runner.config().should_checkpoint(superstep) {
                self.write_checkpoint(status).await?;
            }

            self.status = status;
            if status != RunStatus::Running {
                return Ok(());
            }
        }
    }

    /// Status of a run that stopped dispatching
    fn halted_status(&self) -> RunStatus {
        if self.runner.halt_requested() {
            RunStatus::Completed
        } else if self.runner.has_pending_requests() {
            RunStatus::AwaitingExternalResponse
        } else {
            RunStatus::Idle
        }
    }

    fn publish(&mut self, events: Vec<WorkflowEvent>) {
        for event in events {
            // No subscribers is fine
            let _ = self.event_tx.send(event.clone());
            self.events.push(event);
        }
    }

    async fn write_checkpoint(&mut self, status: RunStatus) -> Result<(), WorkflowError> {
        let Some(manager) = self.checkpoints.clone() else {
            return Ok(());
        };

        let state = self.runner.export_state().await?;
        let sequence = state.superstep as u64;
        let parent = self
            .checkpoint_infos
            .iter()
            .rev()
            .find(|info| info.sequence < sequence)
            .cloned();

        let info = manager
            .create_checkpoint(self.runner.workflow(), self.runner.run_id(), status, state, parent)
            .await?;
        if self.checkpoint_infos.last() != Some(&info) {
            self.checkpoint_infos.push(info);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("run_id", &self.run_id())
            .field("status", &self.status)
            .field("superstep", &self.runner.superstep())
            .field("events", &self.events.len())
            .field("disposed", &self.disposed)
            .finish()
    }
}

/// Lock every non-concurrent shared executor of the workflow, in id order,
/// resetting the resettable ones once locked
async fn acquire_leases(workflow: &Workflow, run_id: &str) -> Result<Vec<OwnedMutexGuard<()>>, WorkflowError> {
    let mut locks: Vec<_> = workflow
        .registrations()
        .iter()
        .filter_map(|registration| registration.run_lease().map(|lock| (registration, lock)))
        .collect();
    locks.sort_by(|a, b| a.0.id().cmp(b.0.id()));

    let mut guards = Vec::with_capacity(locks.len());
    for (registration, lock) in locks {
        tracing::debug!(run_id = %run_id, executor_id = %registration.id(), "Acquiring shared executor lease");
        guards.push(lock.lock_owned().await);
        registration
            .reset_shared()
            .await
            .map_err(|source| WorkflowError::Instantiation {
                executor_id: registration.id().clone(),
                source,
            })?;
    }
    Ok(guards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutorError;
    use crate::workflow::context::WorkflowContext;
    use crate::workflow::executor::{Executor, FunctionExecutor};
    use crate::workflow::message::MessageType;
    use crate::workflow::graph::WorkflowBuilder;
    use std::time::Duration;

    fn echo_workflow() -> Workflow {
        WorkflowBuilder::new("echo")
            .add_executor(FunctionExecutor::new("echo", |s: String| async move { Ok(s) }))
            .with_output_from(["echo"])
            .build()
            .unwrap()
    }

    #[test]
    fn test_run_status_classification() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Faulted.is_terminal());
        assert!(RunStatus::Idle.is_halted());
        assert!(RunStatus::AwaitingExternalResponse.is_halted());
        assert!(!RunStatus::Running.is_halted());
        assert_eq!(RunStatus::AwaitingExternalResponse.to_string(), "awaiting_external_response");
    }

    #[tokio::test]
    async fn test_new_run_is_not_started() {
        let run = Run::new(&echo_workflow(), RunOptions::new().with_run_id("r1")).await.unwrap();
        assert_eq!(run.status(), RunStatus::NotStarted);
        assert_eq!(run.run_id(), "r1");
        assert!(run.outgoing_events().is_empty());
    }

    #[tokio::test]
    async fn test_generated_run_id_is_uuid() {
        let run = Run::new(&echo_workflow(), RunOptions::new()).await.unwrap();
        assert!(Uuid::parse_str(run.run_id()).is_ok());
    }

    #[tokio::test]
    async fn test_start_rejects_unhandled_input() {
        let err = Run::start(&echo_workflow(), &42i64, RunOptions::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InputTypeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_new_events_bookmark() {
        let mut run = Run::start(&echo_workflow(), &"a".to_string(), RunOptions::new()).await.unwrap();
        assert_eq!(run.status(), RunStatus::Idle);

        let first = run.new_events();
        assert_eq!(first.len(), 3); // invoked, output, completed
        assert_eq!(run.new_event_count(), 0);
        assert!(run.new_events().is_empty());

        assert!(run.send_message(&"b".to_string()).await.unwrap());
        assert_eq!(run.new_event_count(), 3);
        assert_eq!(run.outgoing_events().len(), 6);
        assert_eq!(run.outputs(), vec![&Message::text("a"), &Message::text("b")]);
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let mut run = Run::new(&echo_workflow(), RunOptions::new()).await.unwrap();
        let mut rx = run.subscribe();

        run.send_message(&"hi".to_string()).await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind(), "executor_invoked");
    }

    struct Halter {
        id: ExecutorId,
    }

    #[async_trait::async_trait]
    impl Executor for Halter {
        fn id(&self) -> &ExecutorId {
            &self.id
        }

        fn input_types(&self) -> Vec<MessageType> {
            vec![MessageType::of::<String>()]
        }

        async fn handle(&self, _message: Message, ctx: &mut WorkflowContext) -> Result<Option<Message>, ExecutorError> {
            ctx.request_halt();
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_halt_request_completes_run() {
        let workflow = WorkflowBuilder::new("stopper")
            .add_executor(Halter {
                id: ExecutorId::new("stopper"),
            })
            .build()
            .unwrap();

        let mut run = Run::start(&workflow, &"x".to_string(), RunOptions::new()).await.unwrap();
        assert_eq!(run.status(), RunStatus::Completed);
        assert!(run.outcome().is_ok());

        let err = run.send_message(&"again".to_string()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidRunState(_)));
    }

    #[tokio::test]
    async fn test_run_timeout_faults() {
        let slow = FunctionExecutor::new("slow", |s: String| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(s)
        });
        let workflow = WorkflowBuilder::new("slow").add_executor(slow).build().unwrap();
        let config = RunnerConfig::default().with_run_timeout(Duration::from_millis(30));

        let run = Run::start(&workflow, &"x".to_string(), RunOptions::new().with_config(config))
            .await
            .unwrap();
        assert_eq!(run.status(), RunStatus::Faulted);
        assert!(matches!(run.outcome(), Err(WorkflowError::RunTimeout(_))));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let mut run = Run::start(&echo_workflow(), &"a".to_string(), RunOptions::new()).await.unwrap();
        run.dispose().await.unwrap();
        run.dispose().await.unwrap();

        let err = run.send_message(&"b".to_string()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidRunState(_)));
    }

    #[tokio::test]
    async fn test_restore_without_manager_is_config_error() {
        let mut run = Run::new(&echo_workflow(), RunOptions::new()).await.unwrap();
        let err = run.restore_checkpoint(&CheckpointInfo::new("x", 1)).await.unwrap_err();
        assert!(err.is_configuration());
    }
}
