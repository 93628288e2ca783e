//! Superstep engine
//!
//! [`RunnerContext`] owns the live state of one run: the executor instances,
//! the queued envelopes, fan-in barriers, pending external requests and the
//! scoped state. Each call to [`RunnerContext::run_superstep`] performs one
//! synchronized round:
//!
//! ```text
//! take queue → resolve edges → group by target → dispatch (concurrent)
//!            → join in dispatch order → apply effects → next queue
//! ```
//!
//! Messages produced in superstep N are only visible in superstep N+1, and
//! events are reported in dispatch order regardless of which handler
//! finished first.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::config::{RetryPolicy, RunnerConfig};
use super::edge_runner::{chase_edge, DeliveryMapping};
use super::state::{RunnerStateData, ScopedState, StateUpdate};
use crate::error::{ExecutorError, WorkflowError};
use crate::workflow::context::{DispatchEffects, WorkflowContext};
use crate::workflow::event::WorkflowEvent;
use crate::workflow::executor::{BoxedExecutor, ExecutorId};
use crate::workflow::graph::Workflow;
use crate::workflow::message::{EnvelopeId, Message, MessageEnvelope, MessageType};
use crate::workflow::port::{ExternalRequest, ExternalResponse};

/// What happened during one superstep
#[derive(Debug, Clone, Default)]
pub struct SuperstepReport {
    /// Index of the superstep that ran
    pub superstep: usize,
    /// Events in dispatch order
    pub events: Vec<WorkflowEvent>,
    /// Handler invocations performed
    pub dispatched: usize,
    /// Handler invocations that failed
    pub failures: usize,
    /// External requests raised
    pub requests_raised: usize,
    /// Envelopes queued for the next superstep
    pub messages_queued: usize,
    pub halt_requested: bool,
}

/// Result of one dispatch task: all messages for one executor
struct DispatchOutcome {
    events: Vec<WorkflowEvent>,
    effects: DispatchEffects,
    dispatched: usize,
    failures: usize,
}

/// Settings copied into every dispatch task
#[derive(Clone)]
struct DispatchSettings {
    executor_timeout: Duration,
    retry_policy: RetryPolicy,
    is_output: bool,
}

/// Live engine state of one run
pub struct RunnerContext {
    workflow: Workflow,
    run_id: String,
    config: RunnerConfig,
    executors: HashMap<ExecutorId, BoxedExecutor>,
    data: RunnerStateData,
}

impl RunnerContext {
    /// Instantiate every executor of the workflow for a new run
    ///
    /// Factory failures and id mismatches surface here, before any superstep.
    pub async fn new(
        workflow: Workflow,
        run_id: impl Into<String>,
        config: RunnerConfig,
    ) -> Result<Self, WorkflowError> {
        let run_id = run_id.into();
        let mut executors = HashMap::new();
        for registration in workflow.registrations() {
            let instance = registration.create_instance(&run_id).await?;
            executors.insert(registration.id().clone(), instance);
        }

        tracing::debug!(
            run_id = %run_id,
            workflow = %workflow.name(),
            executors = executors.len(),
            "Instantiated executors"
        );

        Ok(Self {
            workflow,
            run_id,
            config,
            executors,
            data: RunnerStateData::default(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Supersteps completed so far
    pub fn superstep(&self) -> usize {
        self.data.superstep
    }

    pub fn state(&self) -> &ScopedState {
        &self.data.state
    }

    pub fn has_queued_messages(&self) -> bool {
        !self.data.queued_messages.is_empty()
    }

    pub fn queued_message_count(&self) -> usize {
        self.data.queued_messages.len()
    }

    pub fn pending_requests(&self) -> impl Iterator<Item = &ExternalRequest> {
        self.data.pending_requests.values()
    }

    pub fn has_pending_requests(&self) -> bool {
        !self.data.pending_requests.is_empty()
    }

    pub fn halt_requested(&self) -> bool {
        self.data.halt_requested
    }

    fn executor(&self, id: &ExecutorId) -> Result<&BoxedExecutor, WorkflowError> {
        self.executors
            .get(id)
            .ok_or_else(|| WorkflowError::UnknownExecutor(id.clone()))
    }

    fn next_envelope(
        &mut self,
        message: Message,
        source: Option<ExecutorId>,
        target: Option<ExecutorId>,
    ) -> MessageEnvelope {
        let id = EnvelopeId(self.data.next_envelope_id);
        self.data.next_envelope_id += 1;
        MessageEnvelope::new(id, message, source, target)
    }

    // =========================================================================
    // External input
    // =========================================================================

    /// Queue a message from outside the workflow
    ///
    /// Without a target the message goes to the start executor. The target
    /// must accept the message type.
    pub fn enqueue_message(
        &mut self,
        message: Message,
        target: Option<ExecutorId>,
    ) -> Result<(), WorkflowError> {
        let target = target.unwrap_or_else(|| self.workflow.start_executor_id().clone());
        self.check_accepts(&target, message.message_type())?;

        let envelope = self.next_envelope(message, None, Some(target));
        self.data.queued_messages.push(envelope);
        Ok(())
    }

    fn check_accepts(&self, target: &ExecutorId, message_type: &MessageType) -> Result<(), WorkflowError> {
        if !self.executor(target)?.can_handle(message_type) {
            return Err(WorkflowError::InputTypeMismatch {
                executor_id: target.clone(),
                message_type: message_type.clone(),
            });
        }
        Ok(())
    }

    /// Check a response against the pending request it answers
    pub fn validate_response(&self, response: &ExternalResponse) -> Result<&ExternalRequest, WorkflowError> {
        let request = self
            .data
            .pending_requests
            .get(&response.request_id)
            .ok_or_else(|| WorkflowError::UnknownRequest(response.request_id.clone()))?;

        let expected = request.port.response_type();
        if response.data.message_type() != expected {
            return Err(WorkflowError::ResponseTypeMismatch {
                request_id: response.request_id.clone(),
                expected: expected.clone(),
                actual: response.data.message_type().clone(),
            });
        }
        // Right tag, wrong payload (e.g. built with `Message::from_parts`)
        if !response.data.payload_conforms() {
            return Err(WorkflowError::ResponseTypeMismatch {
                request_id: response.request_id.clone(),
                expected: expected.clone(),
                actual: MessageType::new(format!("malformed {}", response.data.message_type())),
            });
        }
        self.check_accepts(&request.source, &MessageType::of::<ExternalResponse>())?;
        Ok(request)
    }

    /// Queue a response for the executor that raised the request
    pub fn enqueue_response(&mut self, response: ExternalResponse) -> Result<(), WorkflowError> {
        let origin = self.validate_response(&response)?.source.clone();
        let message = Message::new(&response)?;

        self.data.pending_requests.remove(&response.request_id);
        let envelope = self.next_envelope(message, None, Some(origin));
        self.data.queued_messages.push(envelope);
        Ok(())
    }

    // =========================================================================
    // Superstep
    // =========================================================================

    /// Resolve queued envelopes into per-executor deliveries
    ///
    /// Targets keep first-appearance order, and an envelope reaching the same
    /// executor over several edges is delivered once.
    fn route(
        &mut self,
        queue: &[MessageEnvelope],
    ) -> Result<Vec<(ExecutorId, Vec<MessageEnvelope>)>, WorkflowError> {
        let mut deliveries: Vec<(ExecutorId, Vec<MessageEnvelope>)> = Vec::new();
        let mut slots: HashMap<ExecutorId, usize> = HashMap::new();
        let mut seen: HashSet<(EnvelopeId, ExecutorId)> = HashSet::new();

        for envelope in queue {
            let mappings: Vec<DeliveryMapping> = match (envelope.source(), envelope.target()) {
                (None, Some(target)) => vec![DeliveryMapping {
                    envelopes: vec![envelope.clone()],
                    targets: vec![target.clone()],
                }],
                (None, None) => {
                    vec![DeliveryMapping {
                        envelopes: vec![envelope.clone()],
                        targets: vec![self.workflow.start_executor_id().clone()],
                    }]
                }
                (Some(source), _) => {
                    let mut mappings = Vec::new();
                    for edge in self.workflow.outgoing_edges(source) {
                        let outcome = chase_edge(edge, envelope, &mut self.data.fan_in_states, &self.executors)?;
                        if let Some(mapping) = outcome.into_mapping() {
                            mappings.push(mapping);
                        }
                    }
                    mappings
                }
            };

            for mapping in mappings {
                for target in &mapping.targets {
                    for delivered in &mapping.envelopes {
                        if !seen.insert((delivered.id(), target.clone())) {
                            continue;
                        }
                        let slot = *slots.entry(target.clone()).or_insert_with(|| {
                            deliveries.push((target.clone(), Vec::new()));
                            deliveries.len() - 1
                        });
                        deliveries[slot].1.push(delivered.clone());
                    }
                }
            }
        }

        Ok(deliveries)
    }

    /// Run one superstep over the current queue
    #[tracing::instrument(skip(self, cancel), fields(run_id = %self.run_id, superstep = self.data.superstep))]
    pub async fn run_superstep(&mut self, cancel: &CancellationToken) -> Result<SuperstepReport, WorkflowError> {
        let superstep = self.data.superstep;
        let queue = std::mem::take(&mut self.data.queued_messages);
        let deliveries = match self.route(&queue) {
            Ok(deliveries) => deliveries,
            Err(err) => {
                self.data.queued_messages = queue;
                return Err(err);
            }
        };

        let snapshot = Arc::new(self.data.state.clone());
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism));
        let mut handles = Vec::with_capacity(deliveries.len());

        for (target, envelopes) in deliveries {
            let executor = Arc::clone(self.executor(&target)?);
            let ctx = WorkflowContext::for_dispatch(
                target.clone(),
                self.run_id.clone(),
                superstep,
                Arc::clone(&snapshot),
                cancel.clone(),
            );
            let settings = DispatchSettings {
                executor_timeout: self.config.executor_timeout,
                retry_policy: self.config.retry_policy.clone(),
                is_output: self.workflow.is_output_executor(&target),
            };
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();

            let handle = tokio::spawn(async move {
                // Acquire semaphore permit for parallelism control
                let _permit = semaphore.acquire_owned().await.ok();
                dispatch_messages(executor, ctx, envelopes, settings, cancel).await
            });
            handles.push((target, handle));
        }

        let mut report = SuperstepReport {
            superstep,
            ..Default::default()
        };
        let mut state_batches: Vec<(ExecutorId, Vec<StateUpdate>)> = Vec::new();

        for (target, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    tracing::warn!(executor_id = %target, error = %join_error, "Dispatch task aborted");
                    DispatchOutcome {
                        events: vec![WorkflowEvent::ExecutorFailed {
                            executor_id: target.clone(),
                            superstep,
                            error: Arc::new(ExecutorError::Panicked(join_error.to_string())),
                        }],
                        effects: DispatchEffects::default(),
                        dispatched: 0,
                        failures: 1,
                    }
                }
            };

            report.events.extend(outcome.events);
            report.dispatched += outcome.dispatched;
            report.failures += outcome.failures;

            let effects = outcome.effects;
            state_batches.push((target.clone(), effects.state_updates));
            for (message, explicit_target) in effects.outgoing {
                let envelope = self.next_envelope(message, Some(target.clone()), explicit_target);
                self.data.queued_messages.push(envelope);
            }
            for request in effects.requests {
                report.requests_raised += 1;
                if let Some(previous) = self
                    .data
                    .pending_requests
                    .insert(request.request_id.clone(), request)
                {
                    tracing::warn!(
                        request_id = %previous.request_id,
                        previous_source = %previous.source,
                        "External request id reused, earlier request replaced"
                    );
                }
            }
            report.halt_requested |= effects.halt_requested;
        }

        self.data.state = snapshot.apply_updates(&state_batches);
        self.data.superstep += 1;
        self.data.halt_requested |= report.halt_requested;
        report.messages_queued = self.data.queued_messages.len();

        tracing::debug!(
            dispatched = report.dispatched,
            failures = report.failures,
            queued = report.messages_queued,
            requests = report.requests_raised,
            "Superstep complete"
        );
        Ok(report)
    }

    // =========================================================================
    // State export / import
    // =========================================================================

    /// Capture the engine state, including executor instance state
    pub async fn export_state(&self) -> Result<RunnerStateData, WorkflowError> {
        let mut data = self.data.clone();
        data.executor_states.clear();

        for id in self.workflow.executor_ids() {
            let executor = self.executor(id)?;
            let snapshot = executor.snapshot().await.map_err(|e| {
                WorkflowError::checkpoint(format!("failed to snapshot executor {}: {}", id, e))
            })?;
            if let Some(value) = snapshot {
                data.executor_states.insert(id.clone(), value);
            }
        }
        Ok(data)
    }

    /// Replace the engine state with previously exported state
    pub async fn import_state(&mut self, data: RunnerStateData) -> Result<(), WorkflowError> {
        for (id, value) in &data.executor_states {
            let executor = self.executors.get(id).ok_or_else(|| {
                WorkflowError::checkpoint(format!("checkpoint holds state for unknown executor {}", id))
            })?;
            executor.restore(value.clone()).await.map_err(|e| {
                WorkflowError::checkpoint(format!("failed to restore executor {}: {}", id, e))
            })?;
        }
        self.data = data;
        Ok(())
    }
}

impl std::fmt::Debug for RunnerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerContext")
            .field("run_id", &self.run_id)
            .field("workflow", &self.workflow.name())
            .field("superstep", &self.data.superstep)
            .field("queued", &self.data.queued_messages.len())
            .field("pending_requests", &self.data.pending_requests.len())
            .finish()
    }
}

/// Handle every message delivered to one executor this superstep, in order
async fn dispatch_messages(
    executor: BoxedExecutor,
    mut ctx: WorkflowContext,
    envelopes: Vec<MessageEnvelope>,
    settings: DispatchSettings,
    cancel: CancellationToken,
) -> DispatchOutcome {
    let executor_id = ctx.executor_id().clone();
    let superstep = ctx.superstep();
    let mut events = Vec::new();
    let mut failures = 0;
    let dispatched = envelopes.len();

    for envelope in envelopes {
        events.push(WorkflowEvent::ExecutorInvoked {
            executor_id: executor_id.clone(),
            superstep,
        });

        let mark = ctx.mark();
        let mut attempt = 0;
        let result = loop {
            match invoke(&executor, envelope.message().clone(), &mut ctx, settings.executor_timeout, &cancel).await {
                Ok(output) => break Ok(output),
                Err(err) if err.is_retryable() && settings.retry_policy.should_retry(attempt) => {
                    ctx.rollback(mark);
                    let delay = settings.retry_policy.delay_for_attempt(attempt);
                    attempt += 1;
                    tracing::warn!(
                        executor_id = %executor_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying executor"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break Err(ExecutorError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => break Err(err),
            }
        };

        match result {
            Ok(output) => {
                if let Some(message) = output {
                    let options = executor.options();
                    if options.auto_send_result {
                        ctx.send(message.clone());
                    }
                    if options.auto_yield_output {
                        ctx.yield_output(message);
                    }
                }
                for event in ctx.take_events() {
                    if matches!(event, WorkflowEvent::WorkflowOutput { .. }) && !settings.is_output {
                        tracing::debug!(executor_id = %executor_id, "Ignoring output from non-output executor");
                        continue;
                    }
                    events.push(event);
                }
                events.push(WorkflowEvent::ExecutorCompleted {
                    executor_id: executor_id.clone(),
                    superstep,
                });
            }
            Err(error) => {
                ctx.rollback(mark);
                ctx.take_events();
                failures += 1;
                tracing::warn!(executor_id = %executor_id, superstep, error = %error, "Executor failed");
                events.push(WorkflowEvent::ExecutorFailed {
                    executor_id: executor_id.clone(),
                    superstep,
                    error: Arc::new(error),
                });
            }
        }
    }

    DispatchOutcome {
        events,
        effects: ctx.into_effects(),
        dispatched,
        failures,
    }
}

/// One handler call raced against cancellation and the executor timeout
async fn invoke(
    executor: &BoxedExecutor,
    message: Message,
    ctx: &mut WorkflowContext,
    executor_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Option<Message>, ExecutorError> {
    let handled = AssertUnwindSafe(executor.handle(message, ctx)).catch_unwind();

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
        result = tokio::time::timeout(executor_timeout, handled) => match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => Err(ExecutorError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(ExecutorError::Timeout(executor_timeout)),
        },
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
