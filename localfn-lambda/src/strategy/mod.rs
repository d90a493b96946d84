//! Execution strategies
//!
//! A strategy runs one invocation to completion or failure. The dispatcher
//! keeps one strategy instance per function key, so anything a strategy
//! holds (a handler instance, a worker thread, a container) is warm state
//! shared by every invocation of that function.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use localfn_core::ErrorCode;

use crate::context::ExecutionContext;
use crate::handler::HandlerError;

pub mod container;
pub mod in_process;
pub mod subprocess;
pub mod worker;

pub use container::{ContainerHandle, ContainerRunner, ContainerState};
pub use in_process::InProcessStrategy;
pub use subprocess::SubprocessStrategy;
pub use worker::WorkerStrategy;

/// Why a strategy could not produce a handler result
#[derive(Debug, Error)]
pub enum RunError {
    /// The handler threw or rejected
    #[error("{0}")]
    Handler(HandlerError),

    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("Handler not registered: {0}")]
    HandlerNotFound(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl From<HandlerError> for RunError {
    fn from(error: HandlerError) -> Self {
        Self::Handler(error)
    }
}

impl RunError {
    /// Express the failure the way a thrown handler error is expressed, so
    /// the normalizer can build one envelope shape for every failure.
    pub fn into_handler_error(self) -> HandlerError {
        match self {
            Self::Handler(error) => error,
            Self::SandboxUnavailable(message) => {
                HandlerError::bare(ErrorCode::SandboxUnavailable.as_str(), message)
            }
            Self::HandlerNotFound(name) => HandlerError::bare(
                "Runtime.HandlerNotFound",
                format!("{} is not a registered handler", name),
            ),
            Self::Runtime(message) => HandlerError::bare("Runtime.ExitError", message),
        }
    }
}

/// Runs invocations of one function
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    /// Strategy name for logging
    fn name(&self) -> &'static str;

    async fn run(&self, event: Value, context: ExecutionContext) -> Result<Value, RunError>;

    /// Release held resources. Must be safe to call more than once.
    async fn cleanup(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_failure_maps_to_envelope_type() {
        let error = RunError::SandboxUnavailable("connection refused".into()).into_handler_error();
        assert_eq!(error.error_type, "SandboxUnavailableError");
        assert_eq!(error.message, "connection refused");
        assert!(error.stack.is_none());
    }

    #[test]
    fn test_handler_error_passes_through() {
        let original = HandlerError::new("TypeError", "bad");
        let error = RunError::from(original.clone()).into_handler_error();
        assert_eq!(error, original);
    }
}
