//! Handler trait and the registry keyed by task type

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Error type for task execution failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerError {
    /// Error message, stored as the task's `error_message`
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
        }
    }

    /// Payload did not have the shape the handler expects
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(message).with_type("INVALID_PAYLOAD")
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_payload(err.to_string())
    }
}

/// Read-only view of a task handed to its handler
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub task_id: Uuid,
    pub task_type: String,
    pub payload: Value,
    /// Current attempt number (1-based)
    pub attempt: u32,
}

/// Execution logic for one task type
///
/// Handlers receive the payload and return a result or an error. They never
/// touch the task store or the dispatch queue.
///
/// # Example
///
/// ```ignore
/// struct ResizeImage;
///
/// #[async_trait]
/// impl TaskHandler for ResizeImage {
///     async fn handle(&self, invocation: &TaskInvocation) -> Result<Value, HandlerError> {
///         let url = invocation.payload["url"]
///             .as_str()
///             .ok_or_else(|| HandlerError::invalid_payload("missing url"))?;
///         // Resize...
///         Ok(json!({"status": "resized", "url": url}))
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, invocation: &TaskInvocation) -> Result<Value, HandlerError>;
}

/// Result of running a handler
pub type HandlerResult = Result<Value, HandlerError>;

type BoxedHandlerFn =
    dyn Fn(TaskInvocation) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync;

/// Adapter turning an async closure into a [`TaskHandler`]
struct FnHandler {
    f: Box<BoxedHandlerFn>,
}

#[async_trait]
impl TaskHandler for FnHandler {
    async fn handle(&self, invocation: &TaskInvocation) -> HandlerResult {
        (self.f)(invocation.clone()).await
    }
}

/// Fallback for unregistered task types: echoes the payload
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, invocation: &TaskInvocation) -> HandlerResult {
        Ok(json!({"status": "completed", "data": invocation.payload}))
    }
}

/// Registry of task handlers
///
/// Maps task type strings to handlers. Unknown types fall back to the
/// default handler ([`EchoHandler`] unless replaced).
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    default: Arc<dyn TaskHandler>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// Create a registry with only the echo fallback
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            default: Arc::new(EchoHandler),
        }
    }

    /// Register a handler for a task type, replacing any previous one
    pub fn register(&mut self, task_type: impl Into<String>, handler: impl TaskHandler) {
        self.handlers.insert(task_type.into(), Arc::new(handler));
    }

    /// Register an async closure as the handler for a task type
    ///
    /// ```ignore
    /// registry.register_fn("ping", |_task| async move { Ok(json!("pong")) });
    /// ```
    pub fn register_fn<F, Fut>(&mut self, task_type: impl Into<String>, f: F)
    where
        F: Fn(TaskInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let boxed: Box<BoxedHandlerFn> = Box::new(move |invocation| {
            let fut: Pin<Box<dyn Future<Output = HandlerResult> + Send>> = Box::pin(f(invocation));
            fut
        });
        self.register(task_type, FnHandler { f: boxed });
    }

    /// Replace the fallback handler
    pub fn with_default(mut self, handler: impl TaskHandler) -> Self {
        self.default = Arc::new(handler);
        self
    }

    /// Check if a task type has a dedicated handler
    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task types
    pub fn task_types(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    /// Handler for a task type, or the fallback
    pub fn resolve(&self, task_type: &str) -> Arc<dyn TaskHandler> {
        self.handlers
            .get(task_type)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default))
    }

    /// Run the handler for an invocation
    pub async fn execute(&self, invocation: &TaskInvocation) -> HandlerResult {
        self.resolve(&invocation.task_type).handle(invocation).await
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}
