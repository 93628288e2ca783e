//! Runtime state owned by a run's engine
//!
//! [`ScopedState`] holds the variables executors read and write through
//! their context, grouped into scopes. [`RunnerStateData`] is everything
//! needed to continue a run from a superstep boundary and is what a
//! checkpoint persists.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::edge_runner::FanInState;
use crate::workflow::edge::EdgeId;
use crate::workflow::executor::ExecutorId;
use crate::workflow::message::MessageEnvelope;
use crate::workflow::port::ExternalRequest;

/// Namespace of state variables
///
/// Every executor owns a private scope; shared scopes are named and visible
/// to all executors of the run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ScopeId {
    Executor(ExecutorId),
    Shared(String),
}

impl ScopeId {
    /// The conventional workflow-wide shared scope
    pub fn workflow() -> Self {
        ScopeId::Shared("workflow".to_string())
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeId::Executor(id) => write!(f, "executor:{}", id),
            ScopeId::Shared(name) => write!(f, "shared:{}", name),
        }
    }
}

impl From<ScopeId> for String {
    fn from(scope: ScopeId) -> Self {
        scope.to_string()
    }
}

impl TryFrom<String> for ScopeId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.split_once(':') {
            Some(("executor", id)) => Ok(ScopeId::Executor(ExecutorId::new(id))),
            Some(("shared", name)) => Ok(ScopeId::Shared(name.to_string())),
            _ => Err(format!("invalid scope id: {}", value)),
        }
    }
}

/// A variable within a scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub scope: ScopeId,
    pub key: String,
}

impl ScopeKey {
    pub fn new(scope: ScopeId, key: impl Into<String>) -> Self {
        Self {
            scope,
            key: key.into(),
        }
    }
}

/// A queued state mutation, applied at the end of a superstep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateUpdate {
    Set { key: ScopeKey, value: Value },
    Remove(ScopeKey),
    ClearScope(ScopeId),
}

/// Scoped variable store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopedState {
    scopes: BTreeMap<ScopeId, BTreeMap<String, Value>>,
}

impl ScopedState {
    pub fn get(&self, scope: &ScopeId, key: &str) -> Option<&Value> {
        self.scopes.get(scope).and_then(|vars| vars.get(key))
    }

    /// Variables of one scope
    pub fn scope(&self, scope: &ScopeId) -> Option<&BTreeMap<String, Value>> {
        self.scopes.get(scope)
    }

    pub fn keys(&self, scope: &ScopeId) -> Vec<&str> {
        self.scopes
            .get(scope)
            .map(|vars| vars.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Builder-style insert
    pub fn with_value(mut self, scope: ScopeId, key: impl Into<String>, value: Value) -> Self {
        self.scopes.entry(scope).or_default().insert(key.into(), value);
        self
    }

    /// Apply per-executor update batches in the given order (pure function)
    ///
    /// Batches are applied in order, so when two executors write the same key
    /// in one superstep the later batch wins. Such conflicts are logged.
    pub fn apply_updates(&self, batches: &[(ExecutorId, Vec<StateUpdate>)]) -> Self {
        let mut next = self.clone();
        let mut writers: HashMap<&ScopeKey, &ExecutorId> = HashMap::new();

        for (executor_id, updates) in batches {
            for update in updates {
                match update {
                    StateUpdate::Set { key, value } => {
                        note_writer(&mut writers, key, executor_id);
                        next.scopes
                            .entry(key.scope.clone())
                            .or_default()
                            .insert(key.key.clone(), value.clone());
                    }
                    StateUpdate::Remove(key) => {
                        note_writer(&mut writers, key, executor_id);
                        if let Some(vars) = next.scopes.get_mut(&key.scope) {
                            vars.remove(&key.key);
                        }
                    }
                    StateUpdate::ClearScope(scope) => {
                        next.scopes.remove(scope);
                    }
                }
            }
        }

        next.scopes.retain(|_, vars| !vars.is_empty());
        next
    }
}

fn note_writer<'a>(
    writers: &mut HashMap<&'a ScopeKey, &'a ExecutorId>,
    key: &'a ScopeKey,
    executor_id: &'a ExecutorId,
) {
    if let Some(previous) = writers.insert(key, executor_id) {
        if previous != executor_id {
            tracing::warn!(
                scope = %key.scope,
                key = %key.key,
                previous = %previous,
                winner = %executor_id,
                "Conflicting state writes in one superstep, last writer wins"
            );
        }
    }
}

/// Serializable engine state at a superstep boundary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerStateData {
    /// Supersteps completed so far
    pub superstep: usize,
    pub state: ScopedState,
    /// Envelopes waiting for the next superstep
    pub queued_messages: Vec<MessageEnvelope>,
    /// Envelopes held back by fan-in barriers
    pub fan_in_states: BTreeMap<EdgeId, FanInState>,
    /// External requests awaiting a response, keyed by request id
    pub pending_requests: BTreeMap<String, ExternalRequest>,
    /// Instance state captured from executors that expose it
    pub executor_states: BTreeMap<ExecutorId, Value>,
    pub next_envelope_id: u64,
    pub halt_requested: bool,
}
