//! Per-dispatch execution context
//!
//! A [`WorkflowContext`] is handed to an executor for every message it
//! handles during a superstep. It does not touch engine state directly: it
//! collects the executor's side effects, which the engine applies once the
//! whole superstep has been joined.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::event::WorkflowEvent;
use super::executor::ExecutorId;
use super::message::{Message, MessagePayload, MessageType};
use super::port::{ExternalRequest, InputPort};
use crate::error::ExecutorError;
use crate::execution::state::{ScopeId, ScopeKey, ScopedState, StateUpdate};

/// Side effects collected from one executor during one superstep
#[derive(Debug, Default)]
pub(crate) struct DispatchEffects {
    /// Messages to route next superstep, with optional explicit target
    pub outgoing: Vec<(Message, Option<ExecutorId>)>,
    /// Output, custom and request-info events in call order
    pub events: Vec<WorkflowEvent>,
    pub state_updates: Vec<StateUpdate>,
    pub requests: Vec<ExternalRequest>,
    pub halt_requested: bool,
}

/// Position in the effect buffers, used to discard a failed handler's effects
#[derive(Debug, Clone, Copy)]
pub(crate) struct EffectMark {
    outgoing: usize,
    events: usize,
    state_updates: usize,
    requests: usize,
    halt_requested: bool,
    request_counter: usize,
}

/// Context passed to [`Executor::handle`](super::executor::Executor::handle)
pub struct WorkflowContext {
    executor_id: ExecutorId,
    run_id: String,
    superstep: usize,
    state: Arc<ScopedState>,
    cancellation: CancellationToken,
    effects: DispatchEffects,
    request_counter: usize,
}

impl WorkflowContext {
    /// Create a standalone context, mainly for exercising executors in tests
    pub fn new(executor_id: impl Into<ExecutorId>, run_id: impl Into<String>, superstep: usize) -> Self {
        Self::for_dispatch(
            executor_id.into(),
            run_id.into(),
            superstep,
            Arc::new(ScopedState::default()),
            CancellationToken::new(),
        )
    }

    pub(crate) fn for_dispatch(
        executor_id: ExecutorId,
        run_id: String,
        superstep: usize,
        state: Arc<ScopedState>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            executor_id,
            run_id,
            superstep,
            state,
            cancellation,
            effects: DispatchEffects::default(),
            request_counter: 0,
        }
    }

    pub fn executor_id(&self) -> &ExecutorId {
        &self.executor_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn superstep(&self) -> usize {
        self.superstep
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Send a message along the executor's outgoing edges
    pub fn send(&mut self, message: Message) {
        self.effects.outgoing.push((message, None));
    }

    /// Send a message to one executor only
    ///
    /// The message still travels along outgoing edges; edges that do not
    /// lead to `target` drop it.
    pub fn send_to(&mut self, target: impl Into<ExecutorId>, message: Message) {
        self.effects.outgoing.push((message, Some(target.into())));
    }

    /// Encode and send a typed payload
    pub fn send_message<T: MessagePayload>(&mut self, value: &T) -> Result<(), ExecutorError> {
        self.send(Message::new(value)?);
        Ok(())
    }

    /// Yield a workflow output
    ///
    /// Only executors designated as outputs of the workflow produce output
    /// events; yields from other executors are ignored.
    pub fn yield_output(&mut self, message: Message) {
        self.effects.events.push(WorkflowEvent::WorkflowOutput {
            source: self.executor_id.clone(),
            data: message,
        });
    }

    /// Encode and yield a typed output
    pub fn yield_value<T: MessagePayload>(&mut self, value: &T) -> Result<(), ExecutorError> {
        self.yield_output(Message::new(value)?);
        Ok(())
    }

    /// Emit an application-defined event
    pub fn add_event(&mut self, name: impl Into<String>, data: impl Serialize) -> Result<(), ExecutorError> {
        let data = serde_json::to_value(data)?;
        self.effects.events.push(WorkflowEvent::Custom {
            executor_id: self.executor_id.clone(),
            name: name.into(),
            data,
        });
        Ok(())
    }

    /// Ask the engine to complete the run after this superstep
    pub fn request_halt(&mut self) {
        self.effects.halt_requested = true;
    }

    // =========================================================================
    // External requests
    // =========================================================================

    /// Raise an external request on `port`, returning its correlation id
    ///
    /// The run halts as `AwaitingExternalResponse` after this superstep. The
    /// answer arrives later as an
    /// [`ExternalResponse`](super::port::ExternalResponse) message addressed
    /// to this executor.
    pub fn request_info<T: MessagePayload>(
        &mut self,
        port: &InputPort,
        request: &T,
    ) -> Result<String, ExecutorError> {
        let request_id = format!("{}:{}:{}", self.executor_id, self.superstep, self.request_counter);
        self.request_info_with_id(port, request_id, request)
    }

    /// Raise an external request with a caller-chosen correlation id
    pub fn request_info_with_id<T: MessagePayload>(
        &mut self,
        port: &InputPort,
        request_id: impl Into<String>,
        request: &T,
    ) -> Result<String, ExecutorError> {
        let request_type = MessageType::of::<T>();
        if &request_type != port.request_type() {
            return Err(ExecutorError::InvalidRequest(format!(
                "port {} expects requests of type {}, got {}",
                port.id(),
                port.request_type(),
                request_type
            )));
        }

        let request_id = request_id.into();
        if self.effects.requests.iter().any(|r| r.request_id == request_id) {
            return Err(ExecutorError::InvalidRequest(format!(
                "duplicate request id {}",
                request_id
            )));
        }

        let request = ExternalRequest {
            request_id: request_id.clone(),
            port: port.clone(),
            source: self.executor_id.clone(),
            data: Message::new(request)?,
        };
        self.request_counter += 1;
        self.effects.events.push(WorkflowEvent::RequestInfo(request.clone()));
        self.effects.requests.push(request);
        Ok(request_id)
    }

    // =========================================================================
    // Scoped state
    // =========================================================================

    /// Read a key from this executor's own scope
    ///
    /// Updates queued earlier in this superstep by the same executor are
    /// visible; updates from other executors appear next superstep.
    pub fn read_state(&self, key: &str) -> Option<Value> {
        self.read_scoped(&ScopeId::Executor(self.executor_id.clone()), key)
    }

    /// Read and decode a key from this executor's own scope
    pub fn read_state_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ExecutorError> {
        self.read_state(key)
            .map(serde_json::from_value)
            .transpose()
            .map_err(ExecutorError::from)
    }

    /// Read a key from a named shared scope
    pub fn read_shared_state(&self, scope: &str, key: &str) -> Option<Value> {
        self.read_scoped(&ScopeId::Shared(scope.to_string()), key)
    }

    /// Queue a write to this executor's own scope
    pub fn queue_state_update(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<(), ExecutorError> {
        let scope = ScopeId::Executor(self.executor_id.clone());
        self.queue_set(scope, key.into(), value)
    }

    /// Queue a write to a named shared scope
    pub fn queue_shared_state_update(
        &mut self,
        scope: impl Into<String>,
        key: impl Into<String>,
        value: impl Serialize,
    ) -> Result<(), ExecutorError> {
        self.queue_set(ScopeId::Shared(scope.into()), key.into(), value)
    }

    /// Queue removal of a key from this executor's own scope
    pub fn remove_state(&mut self, key: impl Into<String>) {
        let scope = ScopeId::Executor(self.executor_id.clone());
        self.effects
            .state_updates
            .push(StateUpdate::Remove(ScopeKey::new(scope, key)));
    }

    /// Queue removal of every key in this executor's own scope
    pub fn clear_state_scope(&mut self) {
        let scope = ScopeId::Executor(self.executor_id.clone());
        self.effects.state_updates.push(StateUpdate::ClearScope(scope));
    }

    fn queue_set(&mut self, scope: ScopeId, key: String, value: impl Serialize) -> Result<(), ExecutorError> {
        let value = serde_json::to_value(value)?;
        self.effects.state_updates.push(StateUpdate::Set {
            key: ScopeKey::new(scope, key),
            value,
        });
        Ok(())
    }

    fn read_scoped(&self, scope: &ScopeId, key: &str) -> Option<Value> {
        for update in self.effects.state_updates.iter().rev() {
            match update {
                StateUpdate::Set { key: k, value } if &k.scope == scope && k.key == key => {
                    return Some(value.clone());
                }
                StateUpdate::Remove(k) if &k.scope == scope && k.key == key => return None,
                StateUpdate::ClearScope(s) if s == scope => return None,
                _ => {}
            }
        }
        self.state.get(scope, key).cloned()
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Token cancelled when the run is cancelled
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Messages sent so far through this context
    pub fn sent_messages(&self) -> impl Iterator<Item = &Message> {
        self.effects.outgoing.iter().map(|(message, _)| message)
    }

    /// Events emitted so far through this context
    pub fn emitted_events(&self) -> &[WorkflowEvent] {
        &self.effects.events
    }

    pub fn halt_requested(&self) -> bool {
        self.effects.halt_requested
    }

    pub(crate) fn mark(&self) -> EffectMark {
        EffectMark {
            outgoing: self.effects.outgoing.len(),
            events: self.effects.events.len(),
            state_updates: self.effects.state_updates.len(),
            requests: self.effects.requests.len(),
            halt_requested: self.effects.halt_requested,
            request_counter: self.request_counter,
        }
    }

    /// Discard effects recorded after `mark`
    pub(crate) fn rollback(&mut self, mark: EffectMark) {
        self.effects.outgoing.truncate(mark.outgoing);
        self.effects.events.truncate(mark.events);
        self.effects.state_updates.truncate(mark.state_updates);
        self.effects.requests.truncate(mark.requests);
        self.effects.halt_requested = mark.halt_requested;
        self.request_counter = mark.request_counter;
    }

    /// Move out the events recorded so far
    pub(crate) fn take_events(&mut self) -> Vec<WorkflowEvent> {
        std::mem::take(&mut self.effects.events)
    }

    pub(crate) fn into_effects(self) -> DispatchEffects {
        self.effects
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("executor_id", &self.executor_id)
            .field("run_id", &self.run_id)
            .field("superstep", &self.superstep)
            .field("pending_messages", &self.effects.outgoing.len())
            .finish()
    }
}
