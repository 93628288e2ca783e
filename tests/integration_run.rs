//! Integration tests for driving runs
//!
//! These tests exercise the public run surface end to end:
//! - Superstep ordering of events
//! - Fan-out partial delivery and fan-in barriers
//! - Direct edge target narrowing
//! - Failure isolation and failure surfacing
//! - External requests and resume
//! - Cancellation, superstep limits and shared executor leases

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use deepagents_workflow::execution::ScopeId;
use deepagents_workflow::{
    BoxedExecutor, Executor, ExecutorError, ExecutorId, ExecutorOptions, ExecutorRegistration,
    ExternalResponse, FunctionExecutor, InputPort, Message, MessageType, Run, RunOptions,
    RunStatus, RunnerConfig, Workflow, WorkflowBuilder, WorkflowContext, WorkflowError,
    WorkflowEvent,
};

// =============================================================================
// Helpers
// =============================================================================

fn passthrough(id: &str) -> FunctionExecutor {
    FunctionExecutor::new(id, |s: String| async move { Ok(s) })
}

fn sink(id: &str) -> FunctionExecutor {
    FunctionExecutor::consumer(id, |_: String| async move { Ok(()) })
}

/// Consumer that records every string it receives
fn recorder(id: &str, seen: Arc<Mutex<Vec<String>>>) -> FunctionExecutor {
    FunctionExecutor::consumer(id, move |s: String| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().unwrap().push(s);
            Ok(())
        }
    })
}

fn invoked(events: &[WorkflowEvent]) -> Vec<String> {
    events
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::ExecutorInvoked { .. }))
        .map(|e| e.executor_id().to_string())
        .collect()
}

fn superstep_of(event: &WorkflowEvent) -> Option<usize> {
    match event {
        WorkflowEvent::ExecutorInvoked { superstep, .. }
        | WorkflowEvent::ExecutorCompleted { superstep, .. }
        | WorkflowEvent::ExecutorFailed { superstep, .. } => Some(*superstep),
        _ => None,
    }
}

/// echo ──▶ upper ──┬──▶ logger
///                  └──▶ counter
fn shout_workflow() -> Workflow {
    WorkflowBuilder::new("echo")
        .add_executor(passthrough("echo"))
        .add_executor(FunctionExecutor::new("upper", |s: String| async move {
            Ok(s.to_uppercase())
        }))
        .add_executor(sink("logger"))
        .add_executor(sink("counter"))
        .add_edge("echo", "upper")
        .add_fan_out_edge("upper", ["logger", "counter"])
        .build()
        .unwrap()
}

/// Asks for confirmation over the `confirm` port and forwards the answer
struct Approver {
    id: ExecutorId,
    port: InputPort,
}

impl Approver {
    fn new() -> Self {
        Self {
            id: ExecutorId::new("approver"),
            port: InputPort::new::<bool, bool>("confirm"),
        }
    }
}

#[async_trait]
impl Executor for Approver {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn input_types(&self) -> Vec<MessageType> {
        vec![MessageType::of::<String>(), MessageType::of::<ExternalResponse>()]
    }

    async fn handle(&self, message: Message, ctx: &mut WorkflowContext) -> Result<Option<Message>, ExecutorError> {
        if message.is::<ExternalResponse>() {
            let response: ExternalResponse = message.decode()?;
            let approved: bool = response.decode()?;
            return Ok(Some(Message::new(&approved)?));
        }
        ctx.request_info_with_id(&self.port, "confirm", &true)?;
        Ok(None)
    }
}

fn approval_workflow() -> Workflow {
    WorkflowBuilder::new("approver")
        .add_executor(Approver::new())
        .with_output_from(["approver"])
        .build()
        .unwrap()
}

// =============================================================================
// Superstep Ordering
// =============================================================================

#[tokio::test]
async fn test_shout_scenario_event_order() {
    let run = Run::start(&shout_workflow(), &"hi".to_string(), RunOptions::new())
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::Idle);
    let events = run.outgoing_events();
    let rendered: Vec<String> = events.iter().map(|e| e.to_string()).collect();
    assert_eq!(
        &rendered[..4],
        &[
            "[0] invoked echo",
            "[0] completed echo",
            "[1] invoked upper",
            "[1] completed upper",
        ]
    );

    let mut last_step: Vec<String> = rendered[4..].to_vec();
    last_step.sort();
    assert_eq!(
        last_step,
        vec![
            "[2] completed counter",
            "[2] completed logger",
            "[2] invoked counter",
            "[2] invoked logger",
        ]
    );
    assert!(run.outcome().is_ok());
}

#[tokio::test]
async fn test_events_are_grouped_by_superstep() {
    let workflow = WorkflowBuilder::new("a")
        .add_executor(passthrough("a"))
        .add_executor(passthrough("b"))
        .add_executor(passthrough("c"))
        .add_executor(sink("d"))
        .add_fan_out_edge("a", ["b", "c"])
        .add_edge("b", "d")
        .add_edge("c", "d")
        .build()
        .unwrap();

    let run = Run::start(&workflow, &"x".to_string(), RunOptions::new()).await.unwrap();
    let steps: Vec<usize> = run.outgoing_events().iter().filter_map(superstep_of).collect();

    assert!(steps.windows(2).all(|w| w[0] <= w[1]), "out of order: {:?}", steps);
    // d receives one message from each branch in the same superstep
    assert_eq!(invoked(run.outgoing_events()), vec!["a", "b", "c", "d", "d"]);
}

// =============================================================================
// Edge Semantics
// =============================================================================

#[tokio::test]
async fn test_fan_out_partial_delivery() {
    let workflow = WorkflowBuilder::new("src")
        .add_executor(passthrough("src"))
        .add_executor(sink("text"))
        .add_executor(FunctionExecutor::consumer("flag", |_: bool| async move { Ok(()) }))
        .add_fan_out_edge("src", ["text", "flag"])
        .build()
        .unwrap();

    let run = Run::start(&workflow, &"x".to_string(), RunOptions::new()).await.unwrap();

    assert_eq!(invoked(run.outgoing_events()), vec!["src", "text"]);
    assert!(!run.outgoing_events().iter().any(WorkflowEvent::is_failure));
    assert_eq!(run.status(), RunStatus::Idle);
}

#[tokio::test]
async fn test_partitioned_fan_out() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let workflow = WorkflowBuilder::new("src")
        .add_executor(passthrough("src"))
        .add_executor(recorder("short", Arc::clone(&seen)))
        .add_executor(sink("long"))
        .add_partitioned_edge("src", ["short", "long"], |message: &Message, _count: usize| {
            let text: String = message.decode().unwrap_or_default();
            if text.len() < 4 {
                vec![0]
            } else {
                vec![1]
            }
        })
        .build()
        .unwrap();

    let mut run = Run::start(&workflow, &"abc".to_string(), RunOptions::new()).await.unwrap();
    run.send_message(&"abcdef".to_string()).await.unwrap();

    assert_eq!(invoked(run.outgoing_events()), vec!["src", "short", "src", "long"]);
    assert_eq!(*seen.lock().unwrap(), vec!["abc".to_string()]);
}

#[tokio::test]
async fn test_fan_in_barrier_waits_for_every_source() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let workflow = WorkflowBuilder::new("a")
        .add_executor(FunctionExecutor::new("a", |s: String| async move { Ok(format!("a:{}", s)) }))
        .add_executor(FunctionExecutor::new("b", |s: String| async move { Ok(format!("b:{}", s)) }))
        .add_executor(recorder("join", Arc::clone(&seen)))
        .add_fan_in_edge(["a", "b"], "join")
        .build()
        .unwrap();

    let mut run = Run::new(&workflow, RunOptions::new()).await.unwrap();

    run.send(Message::text("1"), Some(ExecutorId::new("a"))).await.unwrap();
    run.send(Message::text("2"), Some(ExecutorId::new("a"))).await.unwrap();
    assert_eq!(run.status(), RunStatus::Idle);
    assert!(!invoked(run.outgoing_events()).contains(&"join".to_string()));

    run.send(Message::text("3"), Some(ExecutorId::new("b"))).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["a:1".to_string(), "b:3".to_string()]);

    // The second message from a waits for the next contribution from b
    run.send(Message::text("4"), Some(ExecutorId::new("b"))).await.unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["a:1".to_string(), "b:3".to_string(), "a:2".to_string(), "b:4".to_string()]
    );
}

/// Sends its input explicitly to `y`
struct Router {
    id: ExecutorId,
}

#[async_trait]
impl Executor for Router {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn input_types(&self) -> Vec<MessageType> {
        vec![MessageType::of::<String>()]
    }

    fn options(&self) -> ExecutorOptions {
        ExecutorOptions::manual()
    }

    async fn handle(&self, message: Message, ctx: &mut WorkflowContext) -> Result<Option<Message>, ExecutorError> {
        ctx.send_to("y", message);
        Ok(None)
    }
}

#[tokio::test]
async fn test_direct_edge_target_narrowing() {
    let workflow = WorkflowBuilder::new("router")
        .add_executor(Router {
            id: ExecutorId::new("router"),
        })
        .add_executor(sink("x"))
        .add_executor(sink("y"))
        .add_edge("router", "x")
        .add_edge("router", "y")
        .build()
        .unwrap();

    let run = Run::start(&workflow, &"m".to_string(), RunOptions::new()).await.unwrap();

    assert_eq!(invoked(run.outgoing_events()), vec!["router", "y"]);
    assert!(run.outcome().is_ok());
}

#[tokio::test]
async fn test_conditional_edge() {
    let workflow = WorkflowBuilder::new("src")
        .add_executor(passthrough("src"))
        .add_executor(sink("loud"))
        .add_executor(sink("quiet"))
        .add_conditional_edge("src", "loud", "uppercase", |m: &Message| {
            m.decode::<String>().map(|s| s == s.to_uppercase()).unwrap_or(false)
        })
        .add_conditional_edge("src", "quiet", "lowercase", |m: &Message| {
            m.decode::<String>().map(|s| s == s.to_lowercase()).unwrap_or(false)
        })
        .build()
        .unwrap();

    let mut run = Run::start(&workflow, &"HEY".to_string(), RunOptions::new()).await.unwrap();
    run.send_message(&"hey".to_string()).await.unwrap();

    assert_eq!(invoked(run.outgoing_events()), vec!["src", "loud", "src", "quiet"]);
}

// =============================================================================
// Failures
// =============================================================================

fn failing(id: &str) -> FunctionExecutor {
    FunctionExecutor::new(id, |_: String| async move {
        Err::<String, _>(ExecutorError::msg("boom"))
    })
}

#[tokio::test]
async fn test_failure_isolation_keeps_sibling_messages() {
    let workflow = WorkflowBuilder::new("src")
        .add_executor(passthrough("src"))
        .add_executor(failing("bad"))
        .add_executor(passthrough("good"))
        .add_executor(sink("after"))
        .add_fan_out_edge("src", ["bad", "good"])
        .add_edge("good", "after")
        .add_edge("bad", "after")
        .build()
        .unwrap();
    let config = RunnerConfig::default().with_halt_on_executor_failure(false);

    let run = Run::start(&workflow, &"x".to_string(), RunOptions::new().with_config(config))
        .await
        .unwrap();

    let events = run.outgoing_events();
    assert!(events.iter().any(|e| e.is_failure() && e.executor_id().as_str() == "bad"));
    assert!(events.iter().any(|e| matches!(
        e,
        WorkflowEvent::ExecutorCompleted { executor_id, .. } if executor_id.as_str() == "good"
    )));
    // good's message reached the next superstep, bad's did not
    assert_eq!(invoked(events), vec!["src", "bad", "good", "after"]);
    assert_eq!(run.status(), RunStatus::Idle);

    let err = run.outcome().unwrap_err();
    assert!(matches!(err, WorkflowError::ExecutorFailed { ref executor_id, .. } if executor_id.as_str() == "bad"));
}

#[tokio::test]
async fn test_failure_faults_run_by_default() {
    let workflow = WorkflowBuilder::new("src")
        .add_executor(passthrough("src"))
        .add_executor(failing("bad1"))
        .add_executor(failing("bad2"))
        .add_fan_out_edge("src", ["bad1", "bad2"])
        .build()
        .unwrap();

    let mut run = Run::start(&workflow, &"x".to_string(), RunOptions::new()).await.unwrap();

    assert_eq!(run.status(), RunStatus::Faulted);
    match run.outcome() {
        Err(WorkflowError::Aggregate(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("expected aggregate failure, got {:?}", other),
    }

    let err = run.send_message(&"again".to_string()).await.unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidRunState(_)));
}

#[tokio::test]
async fn test_factory_id_mismatch_fails_fast() {
    let workflow = WorkflowBuilder::new("worker")
        .register(ExecutorRegistration::factory(
            "worker",
            vec![MessageType::of::<String>()],
            |_run_id: String| async move {
                Ok::<BoxedExecutor, ExecutorError>(Arc::new(passthrough("impostor")))
            },
        ))
        .build()
        .unwrap();

    let err = Run::start(&workflow, &"x".to_string(), RunOptions::new()).await.unwrap_err();
    assert!(err.is_configuration());
    assert!(matches!(err, WorkflowError::ExecutorIdMismatch { .. }));
}

// =============================================================================
// External Requests
// =============================================================================

#[tokio::test]
async fn test_request_and_resume() {
    let mut run = Run::start(&approval_workflow(), &"deploy?".to_string(), RunOptions::new())
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::AwaitingExternalResponse);
    let pending = run.pending_requests();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request_id, "confirm");
    assert_eq!(pending[0].port.id(), "confirm");
    assert!(run
        .outgoing_events()
        .iter()
        .any(|e| matches!(e, WorkflowEvent::RequestInfo(r) if r.request_id == "confirm")));

    let produced = run
        .resume(vec![ExternalResponse::from_value("confirm", &true).unwrap()])
        .await
        .unwrap();

    assert!(produced);
    assert!(matches!(run.status(), RunStatus::Idle | RunStatus::Completed));
    assert!(run.pending_requests().is_empty());
    assert_eq!(run.outputs(), vec![&Message::new(&true).unwrap()]);
}

#[tokio::test]
async fn test_resume_rejects_bad_responses() {
    let mut run = Run::start(&approval_workflow(), &"deploy?".to_string(), RunOptions::new())
        .await
        .unwrap();
    let events_before = run.outgoing_events().len();

    let err = run
        .resume(vec![ExternalResponse::from_value("nope", &true).unwrap()])
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::UnknownRequest(ref id) if id == "nope"));

    let err = run
        .resume(vec![ExternalResponse::new("confirm", Message::text("yes"))])
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::ResponseTypeMismatch { .. }));

    // Correct tag, payload of the wrong shape
    let err = run
        .resume(vec![ExternalResponse::new(
            "confirm",
            Message::from_parts("bool", serde_json::json!("yes")),
        )])
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::ResponseTypeMismatch { .. }));

    // A bad response poisons the whole batch
    let err = run
        .resume(vec![
            ExternalResponse::from_value("confirm", &true).unwrap(),
            ExternalResponse::from_value("confirm", &false).unwrap(),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::UnknownRequest(_)));

    assert_eq!(run.status(), RunStatus::AwaitingExternalResponse);
    assert_eq!(run.pending_requests().len(), 1);
    assert_eq!(run.outgoing_events().len(), events_before);
}

#[tokio::test]
async fn test_resume_with_typed_messages() {
    let mut run = Run::start(&approval_workflow(), &"deploy?".to_string(), RunOptions::new())
        .await
        .unwrap();

    let response = ExternalResponse::from_value("confirm", &false).unwrap();
    assert!(run.resume_with(vec![response]).await.unwrap());
    assert_eq!(run.outputs(), vec![&Message::new(&false).unwrap()]);

    // Other types go to the start executor, which asks again
    assert!(run.resume_with(vec!["again?".to_string()]).await.unwrap());
    assert_eq!(run.status(), RunStatus::AwaitingExternalResponse);
}

// =============================================================================
// Scoped State
// =============================================================================

/// Reads the shared total, adds its input and writes it back
struct Accumulator {
    id: ExecutorId,
}

#[async_trait]
impl Executor for Accumulator {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn input_types(&self) -> Vec<MessageType> {
        vec![MessageType::of::<i64>()]
    }

    fn options(&self) -> ExecutorOptions {
        ExecutorOptions::manual()
    }

    async fn handle(&self, message: Message, ctx: &mut WorkflowContext) -> Result<Option<Message>, ExecutorError> {
        let value: i64 = message.decode()?;
        let total = ctx.read_state_as::<i64>("total")?.unwrap_or(0) + value;
        ctx.queue_state_update("total", total)?;
        ctx.queue_shared_state_update("workflow", "last", value)?;
        ctx.add_event("accumulated", total)?;
        Ok(None)
    }
}

#[tokio::test]
async fn test_scoped_state_persists_across_supersteps() {
    let workflow = WorkflowBuilder::new("acc")
        .add_executor(Accumulator {
            id: ExecutorId::new("acc"),
        })
        .build()
        .unwrap();

    let mut run = Run::start(&workflow, &5i64, RunOptions::new()).await.unwrap();
    run.send_message(&7i64).await.unwrap();

    let state = run.snapshot().await.unwrap().state;
    assert_eq!(
        state.get(&ScopeId::Executor(ExecutorId::new("acc")), "total"),
        Some(&serde_json::json!(12))
    );
    assert_eq!(state.get(&ScopeId::workflow(), "last"), Some(&serde_json::json!(7)));

    let custom: Vec<_> = run
        .outgoing_events()
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::Custom { name, data, .. } if name == "accumulated" => Some(data.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(custom, vec![serde_json::json!(5), serde_json::json!(12)]);
}

// =============================================================================
// Limits and Cancellation
// =============================================================================

#[tokio::test]
async fn test_max_supersteps_faults_run() {
    let workflow = WorkflowBuilder::new("ping")
        .add_executor(passthrough("ping"))
        .add_edge("ping", "ping")
        .build()
        .unwrap();
    let config = RunnerConfig::default().with_max_supersteps(5);

    let run = Run::start(&workflow, &"x".to_string(), RunOptions::new().with_config(config))
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::Faulted);
    assert_eq!(run.superstep(), 5);
    assert!(matches!(run.outcome(), Err(WorkflowError::MaxSuperstepsExceeded(5))));
}

#[tokio::test]
async fn test_cancellation_faults_run() {
    let workflow = WorkflowBuilder::new("slow")
        .add_executor(FunctionExecutor::new("slow", |s: String| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(s)
        }))
        .build()
        .unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let run = Run::start(&workflow, &"x".to_string(), RunOptions::new().with_cancellation(token))
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::Faulted);
    assert!(matches!(run.outcome(), Err(WorkflowError::Cancelled)));
    assert!(run.outgoing_events().iter().any(|e| matches!(
        e,
        WorkflowEvent::ExecutorFailed { error, .. } if matches!(error.as_ref(), ExecutorError::Cancelled)
    )));
}

// =============================================================================
// Shared Executors
// =============================================================================

/// Counts messages across runs until reset
struct Tally {
    id: ExecutorId,
    count: AtomicUsize,
}

#[async_trait]
impl Executor for Tally {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn input_types(&self) -> Vec<MessageType> {
        vec![MessageType::of::<String>()]
    }

    async fn handle(&self, _message: Message, _ctx: &mut WorkflowContext) -> Result<Option<Message>, ExecutorError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    async fn reset(&self) -> Result<(), ExecutorError> {
        self.count.store(0, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_shared_executor_is_reset_and_serialized() {
    let tally = Arc::new(Tally {
        id: ExecutorId::new("tally"),
        count: AtomicUsize::new(0),
    });
    let workflow = WorkflowBuilder::new("tally")
        .register(ExecutorRegistration::shared(tally.clone()).resettable(true))
        .build()
        .unwrap();

    let mut first = Run::start(&workflow, &"a".to_string(), RunOptions::new()).await.unwrap();
    first.send_message(&"b".to_string()).await.unwrap();
    assert_eq!(tally.count.load(Ordering::SeqCst), 2);

    // A second run waits for the lease held by the first
    let blocked = tokio::time::timeout(Duration::from_millis(50), Run::new(&workflow, RunOptions::new())).await;
    assert!(blocked.is_err());

    first.dispose().await.unwrap();
    assert_eq!(tally.count.load(Ordering::SeqCst), 0);

    let second = Run::start(&workflow, &"c".to_string(), RunOptions::new()).await.unwrap();
    assert_eq!(second.status(), RunStatus::Idle);
    assert_eq!(tally.count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dropped_run_does_not_leak_executor_state() {
    let tally = Arc::new(Tally {
        id: ExecutorId::new("tally"),
        count: AtomicUsize::new(0),
    });
    let workflow = WorkflowBuilder::new("tally")
        .register(ExecutorRegistration::shared(tally.clone()).resettable(true))
        .build()
        .unwrap();

    let mut first = Run::start(&workflow, &"a".to_string(), RunOptions::new()).await.unwrap();
    first.send_message(&"b".to_string()).await.unwrap();
    assert_eq!(tally.count.load(Ordering::SeqCst), 2);
    drop(first);

    let second = Run::start(&workflow, &"c".to_string(), RunOptions::new()).await.unwrap();
    assert_eq!(second.status(), RunStatus::Idle);
    assert_eq!(tally.count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_function_executors_allow_parallel_runs() {
    let workflow = shout_workflow();

    let first = Run::start(&workflow, &"one".to_string(), RunOptions::new()).await.unwrap();
    let second = tokio::time::timeout(
        Duration::from_millis(500),
        Run::start(&workflow, &"two".to_string(), RunOptions::new()),
    )
    .await
    .expect("second run should not wait for the first")
    .unwrap();

    assert_eq!(first.status(), RunStatus::Idle);
    assert_eq!(second.status(), RunStatus::Idle);
    assert_ne!(first.run_id(), second.run_id());
    assert_eq!(invoked(first.outgoing_events()), invoked(second.outgoing_events()));
}

#[tokio::test]
async fn test_concurrent_shared_executor_allows_parallel_runs() {
    let tally = Arc::new(Tally {
        id: ExecutorId::new("tally"),
        count: AtomicUsize::new(0),
    });
    let workflow = WorkflowBuilder::new("tally")
        .register(ExecutorRegistration::shared(tally.clone()).concurrent(true))
        .build()
        .unwrap();

    let first = Run::start(&workflow, &"a".to_string(), RunOptions::new()).await.unwrap();
    let second = Run::start(&workflow, &"b".to_string(), RunOptions::new()).await.unwrap();

    assert_eq!(first.status(), RunStatus::Idle);
    assert_eq!(second.status(), RunStatus::Idle);
    assert_eq!(tally.count.load(Ordering::SeqCst), 2);
}
