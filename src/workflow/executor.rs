//! Executor abstractions
//!
//! An [`Executor`] is the unit of computation in a workflow: a named node that
//! declares which message types it accepts and handles one message at a time.
//! All side effects (sending messages, yielding outputs, state writes,
//! external requests) go through the [`WorkflowContext`] passed to `handle`.
//!
//! Workflows do not hold executors directly. They hold
//! [`ExecutorRegistration`]s, which either build a fresh instance per run
//! through an [`ExecutorFactory`] or hand out one shared instance.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use super::context::WorkflowContext;
use super::message::{Message, MessagePayload, MessageType};
use crate::error::{ExecutorError, WorkflowError};

/// Unique identifier for an executor in a workflow
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutorId(pub String);

impl ExecutorId {
    /// Create a new ExecutorId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExecutorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ExecutorId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&ExecutorId> for ExecutorId {
    fn from(id: &ExecutorId) -> Self {
        id.clone()
    }
}

impl std::fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the engine treats the value returned from `handle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorOptions {
    /// Forward the returned message along outgoing edges
    pub auto_send_result: bool,
    /// Yield the returned message as a workflow output
    pub auto_yield_output: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            auto_send_result: true,
            auto_yield_output: true,
        }
    }
}

impl ExecutorOptions {
    /// Options for handlers that route everything through the context
    pub fn manual() -> Self {
        Self {
            auto_send_result: false,
            auto_yield_output: false,
        }
    }
}

/// Core executor trait
///
/// `handle` takes `&self`: an executor that keeps state between messages
/// uses interior mutability. The engine never runs two `handle` calls on the
/// same instance concurrently within a run.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Get the executor's unique identifier
    fn id(&self) -> &ExecutorId;

    /// Message types this executor accepts
    fn input_types(&self) -> Vec<MessageType>;

    /// Message types this executor may send (informational)
    fn output_types(&self) -> Vec<MessageType> {
        Vec::new()
    }

    /// Check whether a message of this type can be handled
    fn can_handle(&self, message_type: &MessageType) -> bool {
        self.input_types().iter().any(|t| t == message_type)
    }

    fn options(&self) -> ExecutorOptions {
        ExecutorOptions::default()
    }

    /// Whether several runs may share this instance at the same time
    ///
    /// Executors keeping per-run state leave this false, so runs sharing
    /// the instance are serialized.
    fn supports_concurrent(&self) -> bool {
        false
    }

    /// Handle one message
    ///
    /// A returned message is forwarded and/or yielded according to
    /// [`options`](Self::options).
    async fn handle(
        &self,
        message: Message,
        ctx: &mut WorkflowContext,
    ) -> Result<Option<Message>, ExecutorError>;

    /// Clear per-run state of a shared instance between runs
    async fn reset(&self) -> Result<(), ExecutorError> {
        Ok(())
    }

    /// Capture instance state for a checkpoint
    ///
    /// Stateless executors return `None`.
    async fn snapshot(&self) -> Result<Option<Value>, ExecutorError> {
        Ok(None)
    }

    /// Restore instance state captured by [`snapshot`](Self::snapshot)
    async fn restore(&self, _state: Value) -> Result<(), ExecutorError> {
        Ok(())
    }
}

/// Type alias for a shared executor
pub type BoxedExecutor = Arc<dyn Executor>;

type HandlerFn =
    Arc<dyn Fn(Message) -> BoxFuture<'static, Result<Option<Message>, ExecutorError>> + Send + Sync>;

/// Executor built from an async closure over a single input type
pub struct FunctionExecutor {
    id: ExecutorId,
    input_type: MessageType,
    output_types: Vec<MessageType>,
    options: ExecutorOptions,
    handler: HandlerFn,
}

impl FunctionExecutor {
    /// Executor mapping each `In` to an `Out`
    pub fn new<In, Out, F, Fut>(id: impl Into<ExecutorId>, f: F) -> Self
    where
        In: MessagePayload,
        Out: MessagePayload,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, ExecutorError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: HandlerFn = Arc::new(move |message: Message| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                let input = message.decode::<In>()?;
                let output = f(input).await?;
                Ok(Some(Message::new(&output)?))
            })
        });

        Self {
            id: id.into(),
            input_type: MessageType::of::<In>(),
            output_types: vec![MessageType::of::<Out>()],
            options: ExecutorOptions::default(),
            handler,
        }
    }

    /// Executor consuming each `In` without producing a result
    pub fn consumer<In, F, Fut>(id: impl Into<ExecutorId>, f: F) -> Self
    where
        In: MessagePayload,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ExecutorError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: HandlerFn = Arc::new(move |message: Message| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                let input = message.decode::<In>()?;
                f(input).await?;
                Ok(None)
            })
        });

        Self {
            id: id.into(),
            input_type: MessageType::of::<In>(),
            output_types: Vec::new(),
            options: ExecutorOptions::default(),
            handler,
        }
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }
}

impl std::fmt::Debug for FunctionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionExecutor")
            .field("id", &self.id)
            .field("input_type", &self.input_type)
            .field("output_types", &self.output_types)
            .field("options", &self.options)
            .finish()
    }
}

#[async_trait]
impl Executor for FunctionExecutor {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn input_types(&self) -> Vec<MessageType> {
        vec![self.input_type.clone()]
    }

    fn output_types(&self) -> Vec<MessageType> {
        self.output_types.clone()
    }

    fn can_handle(&self, message_type: &MessageType) -> bool {
        &self.input_type == message_type
    }

    fn options(&self) -> ExecutorOptions {
        self.options
    }

    // Closures only see their input, so runs cannot observe each other
    fn supports_concurrent(&self) -> bool {
        true
    }

    async fn handle(
        &self,
        message: Message,
        _ctx: &mut WorkflowContext,
    ) -> Result<Option<Message>, ExecutorError> {
        (self.handler)(message).await
    }
}

/// Builds a fresh executor instance for a run
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    async fn create(&self, run_id: &str) -> Result<BoxedExecutor, ExecutorError>;
}

#[async_trait]
impl<F, Fut> ExecutorFactory for F
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<BoxedExecutor, ExecutorError>> + Send + 'static,
{
    async fn create(&self, run_id: &str) -> Result<BoxedExecutor, ExecutorError> {
        (self)(run_id.to_string()).await
    }
}

#[derive(Clone)]
enum ExecutorProvider {
    Factory(Arc<dyn ExecutorFactory>),
    Shared(SharedInstance),
}

#[derive(Clone)]
struct SharedInstance {
    instance: BoxedExecutor,
    supports_concurrent: bool,
    supports_resetting: bool,
    lease: Arc<Mutex<()>>,
}

/// How a workflow obtains an executor for each run
#[derive(Clone)]
pub struct ExecutorRegistration {
    id: ExecutorId,
    input_types: Vec<MessageType>,
    output_types: Vec<MessageType>,
    provider: ExecutorProvider,
}

impl ExecutorRegistration {
    /// Register a pre-built instance shared by every run of the workflow
    ///
    /// Concurrency starts from [`Executor::supports_concurrent`]. Instances
    /// are not resettable until marked otherwise.
    pub fn shared(executor: BoxedExecutor) -> Self {
        let supports_concurrent = executor.supports_concurrent();
        Self {
            id: executor.id().clone(),
            input_types: executor.input_types(),
            output_types: executor.output_types(),
            provider: ExecutorProvider::Shared(SharedInstance {
                instance: executor,
                supports_concurrent,
                supports_resetting: false,
                lease: Arc::new(Mutex::new(())),
            }),
        }
    }

    /// Register a factory producing one instance per run
    pub fn factory(
        id: impl Into<ExecutorId>,
        input_types: Vec<MessageType>,
        factory: impl ExecutorFactory + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            input_types,
            output_types: Vec::new(),
            provider: ExecutorProvider::Factory(Arc::new(factory)),
        }
    }

    pub fn with_output_types(mut self, output_types: Vec<MessageType>) -> Self {
        self.output_types = output_types;
        self
    }

    /// Allow several runs to use the shared instance at the same time
    pub fn concurrent(mut self, supports_concurrent: bool) -> Self {
        if let ExecutorProvider::Shared(shared) = &mut self.provider {
            shared.supports_concurrent = supports_concurrent;
        }
        self
    }

    /// Reset the shared instance between runs
    pub fn resettable(mut self, supports_resetting: bool) -> Self {
        if let ExecutorProvider::Shared(shared) = &mut self.provider {
            shared.supports_resetting = supports_resetting;
        }
        self
    }

    pub fn id(&self) -> &ExecutorId {
        &self.id
    }

    pub fn input_types(&self) -> &[MessageType] {
        &self.input_types
    }

    pub fn output_types(&self) -> &[MessageType] {
        &self.output_types
    }

    pub fn is_shared_instance(&self) -> bool {
        matches!(self.provider, ExecutorProvider::Shared(_))
    }

    /// Whether concurrent runs may use this registration
    ///
    /// Always true for factories since every run gets its own instance.
    pub fn supports_concurrent(&self) -> bool {
        match &self.provider {
            ExecutorProvider::Factory(_) => true,
            ExecutorProvider::Shared(shared) => shared.supports_concurrent,
        }
    }

    pub fn supports_resetting(&self) -> bool {
        match &self.provider {
            ExecutorProvider::Factory(_) => false,
            ExecutorProvider::Shared(shared) => shared.supports_resetting,
        }
    }

    /// Obtain the executor instance for a run
    ///
    /// Fails if the factory errors or returns an executor whose id differs
    /// from the registration's.
    pub async fn create_instance(&self, run_id: &str) -> Result<BoxedExecutor, WorkflowError> {
        let instance = match &self.provider {
            ExecutorProvider::Shared(shared) => Arc::clone(&shared.instance),
            ExecutorProvider::Factory(factory) => {
                factory
                    .create(run_id)
                    .await
                    .map_err(|source| WorkflowError::Instantiation {
                        executor_id: self.id.clone(),
                        source,
                    })?
            }
        };

        if instance.id() != &self.id {
            return Err(WorkflowError::ExecutorIdMismatch {
                expected: self.id.clone(),
                actual: instance.id().clone(),
            });
        }
        Ok(instance)
    }

    /// Lock serializing runs over a non-concurrent shared instance
    pub(crate) fn run_lease(&self) -> Option<Arc<Mutex<()>>> {
        match &self.provider {
            ExecutorProvider::Shared(shared) if !shared.supports_concurrent => {
                Some(Arc::clone(&shared.lease))
            }
            _ => None,
        }
    }

    /// Reset the shared instance if it supports resetting
    pub(crate) async fn reset_shared(&self) -> Result<(), ExecutorError> {
        match &self.provider {
            ExecutorProvider::Shared(shared) if shared.supports_resetting => {
                shared.instance.reset().await
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for ExecutorRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistration")
            .field("id", &self.id)
            .field("input_types", &self.input_types)
            .field("shared", &self.is_shared_instance())
            .field("supports_concurrent", &self.supports_concurrent())
            .field("supports_resetting", &self.supports_resetting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upper() -> FunctionExecutor {
        FunctionExecutor::new("upper", |text: String| async move { Ok(text.to_uppercase()) })
    }

    #[test]
    fn test_executor_id_display() {
        let id = ExecutorId::new("echo");
        assert_eq!(format!("{}", id), "echo");
        assert_eq!(id.as_str(), "echo");
    }

    #[test]
    fn test_function_executor_declares_types() {
        let exec = upper();
        assert_eq!(exec.input_types(), vec![MessageType::of::<String>()]);
        assert!(exec.can_handle(&MessageType::of::<String>()));
        assert!(!exec.can_handle(&MessageType::of::<bool>()));
        assert_eq!(exec.options(), ExecutorOptions::default());
    }

    #[tokio::test]
    async fn test_function_executor_handle() {
        let exec = upper();
        let mut ctx = WorkflowContext::new("upper", "run-1", 0);

        let result = exec.handle(Message::text("hi"), &mut ctx).await.unwrap();
        assert_eq!(result, Some(Message::text("HI")));
    }

    #[tokio::test]
    async fn test_function_executor_decode_failure() {
        let exec = upper();
        let mut ctx = WorkflowContext::new("upper", "run-1", 0);

        let err = exec
            .handle(Message::new(&true).unwrap(), &mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_factory_registration_creates_fresh_instances() {
        let registration = ExecutorRegistration::factory(
            "upper",
            vec![MessageType::of::<String>()],
            |_run_id: String| async move {
                Ok::<BoxedExecutor, ExecutorError>(Arc::new(upper()))
            },
        );

        let a = registration.create_instance("run-a").await.unwrap();
        let b = registration.create_instance("run-b").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(registration.supports_concurrent());
        assert!(!registration.is_shared_instance());
    }

    #[tokio::test]
    async fn test_factory_id_mismatch() {
        let registration = ExecutorRegistration::factory(
            "expected",
            vec![MessageType::of::<String>()],
            |_run_id: String| async move {
                Ok::<BoxedExecutor, ExecutorError>(Arc::new(upper()))
            },
        );

        let err = registration.create_instance("run").await.err().unwrap();
        assert!(matches!(
            err,
            WorkflowError::ExecutorIdMismatch { ref expected, ref actual }
                if expected.as_str() == "expected" && actual.as_str() == "upper"
        ));
    }

    #[tokio::test]
    async fn test_factory_failure() {
        let registration = ExecutorRegistration::factory(
            "broken",
            vec![],
            |_run_id: String| async move {
                Err::<BoxedExecutor, _>(ExecutorError::msg("no backend"))
            },
        );

        let err = registration.create_instance("run").await.err().unwrap();
        assert!(matches!(err, WorkflowError::Instantiation { .. }));
    }

    #[tokio::test]
    async fn test_shared_registration_flags() {
        let registration = ExecutorRegistration::shared(Arc::new(upper()));
        assert!(registration.is_shared_instance());
        // Function executors are stateless, so runs need no lease
        assert!(registration.supports_concurrent());
        assert!(!registration.supports_resetting());
        assert!(registration.run_lease().is_none());

        let registration = registration.concurrent(false).resettable(true);
        assert!(!registration.supports_concurrent());
        assert!(registration.supports_resetting());
        assert!(registration.run_lease().is_some());

        let a = registration.create_instance("run-a").await.unwrap();
        let b = registration.create_instance("run-b").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
