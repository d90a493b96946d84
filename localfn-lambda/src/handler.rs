//! In-process handlers
//!
//! Handlers run by the in-process and worker strategies are Rust values
//! registered by name. Each registration is a factory: a strategy asks it for
//! a handler instance once per execution unit, so state held by the instance
//! lives exactly as long as the unit does.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::sync::Arc;

use crate::context::ExecutionContext;

pub type HandlerResult = Result<Value, HandlerError>;

/// Stack information attached to a handler error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stack {
    /// Unparsed stack text, one frame per line
    Raw(String),
    /// Frames already split by the runtime that produced them
    Frames(Vec<String>),
}

/// Error thrown by a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub error_type: String,
    pub message: String,
    pub stack: Option<Stack>,
}

impl HandlerError {
    /// Create an error whose stack points at the caller
    #[track_caller]
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        let error_type = error_type.into();
        let message = message.into();
        let location = Location::caller();
        let stack = format!(
            "{}: {}\n    at {}:{}:{}",
            error_type,
            message,
            location.file(),
            location.line(),
            location.column()
        );

        Self {
            error_type,
            message,
            stack: Some(Stack::Raw(stack)),
        }
    }

    /// Create an error reported by an out-of-process runtime
    pub fn from_runtime(
        error_type: impl Into<String>,
        message: impl Into<String>,
        frames: Vec<String>,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            stack: Some(Stack::Frames(frames)),
        }
    }

    /// Create an error with no stack at all
    pub fn bare(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            stack: None,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl std::error::Error for HandlerError {}

/// A function body that can be invoked with an event and a context
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: Value, context: ExecutionContext) -> HandlerResult;
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, event: Value, context: ExecutionContext) -> HandlerResult {
        (self.f)(event, context).await
    }
}

/// Wrap an async closure as a [`Handler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    FnHandler { f }
}

/// Produces handler instances for execution units
pub trait HandlerFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Handler>;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Arc<dyn Handler> + Send + Sync,
{
    fn create(&self) -> Arc<dyn Handler> {
        self()
    }
}

/// Factory that hands out one shared instance
struct Shared(Arc<dyn Handler>);

impl HandlerFactory for Shared {
    fn create(&self) -> Arc<dyn Handler> {
        self.0.clone()
    }
}

/// Registered handlers by name
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    factories: Arc<DashMap<String, Arc<dyn HandlerFactory>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory; every execution unit gets its own instance
    pub fn register_factory(&self, name: impl Into<String>, factory: impl HandlerFactory + 'static) {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Register a single handler instance shared by every execution unit
    pub fn register(&self, name: impl Into<String>, handler: impl Handler + 'static) {
        self.factories
            .insert(name.into(), Arc::new(Shared(Arc::new(handler))));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn HandlerFactory>> {
        self.factories.get(name).map(|f| f.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}
