//! Per-invocation execution context
//!
//! Mirrors the context object handed to handlers by the emulated platform:
//! identity, deadline, and the `done`/`succeed`/`fail` completion callbacks.
//! Completion is a single-assignment slot. The first of {callback, returned
//! value} to write wins and every later write is a no-op.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use localfn_core::RequestId;

use crate::function::FunctionConfig;
use crate::handler::{HandlerError, HandlerResult};

struct CompletionSlot {
    tx: Mutex<Option<oneshot::Sender<HandlerResult>>>,
    rx: Mutex<Option<oneshot::Receiver<HandlerResult>>>,
}

impl CompletionSlot {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }
}

/// Receiving half of a context's completion slot
pub struct Completion {
    rx: oneshot::Receiver<HandlerResult>,
}

impl Completion {
    /// Wait for the first completion. `None` if every context clone was
    /// dropped without completing.
    pub async fn wait(self) -> Option<HandlerResult> {
        self.rx.await.ok()
    }
}

/// Context passed to the function
#[derive(Clone, Serialize)]
pub struct ExecutionContext {
    pub aws_request_id: String,
    pub invoked_function_arn: String,
    pub function_name: String,
    pub function_version: String,
    pub memory_limit_in_mb: i32,
    pub log_group_name: String,
    pub log_stream_name: String,
    /// Absolute deadline in epoch milliseconds
    pub deadline_ms: i64,
    #[serde(skip)]
    completion: Arc<CompletionSlot>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("aws_request_id", &self.aws_request_id)
            .field("function_name", &self.function_name)
            .field("deadline_ms", &self.deadline_ms)
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl ExecutionContext {
    pub fn new(function: &FunctionConfig, request_id: &RequestId, deadline_ms: i64) -> Self {
        Self {
            aws_request_id: request_id.to_string(),
            invoked_function_arn: function.arn(),
            function_name: function.function_name.clone(),
            function_version: "$LATEST".to_string(),
            memory_limit_in_mb: function.memory_size,
            log_group_name: format!("/aws/lambda/{}", function.function_name),
            log_stream_name: format!(
                "{}/[$LATEST]{}",
                chrono::Utc::now().format("%Y/%m/%d"),
                request_id.short()
            ),
            deadline_ms,
            completion: Arc::new(CompletionSlot::new()),
        }
    }

    /// Get remaining time in milliseconds
    pub fn get_remaining_time_in_millis(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        (self.deadline_ms - now).max(0)
    }

    pub fn remaining_time(&self) -> Duration {
        Duration::from_millis(self.get_remaining_time_in_millis() as u64)
    }

    /// Complete the invocation. Returns `false` if it was already completed.
    pub fn done(&self, result: HandlerResult) -> bool {
        let Some(tx) = self.completion.tx.lock().take() else {
            debug!(
                request_id = %self.aws_request_id,
                "Ignoring completion of an already completed invocation"
            );
            return false;
        };

        // The receiver may already be gone when nobody waits any more.
        let _ = tx.send(result);
        true
    }

    pub fn succeed(&self, result: Value) -> bool {
        self.done(Ok(result))
    }

    pub fn fail(&self, error: HandlerError) -> bool {
        self.done(Err(error))
    }

    pub fn is_settled(&self) -> bool {
        self.completion.tx.lock().is_none()
    }

    /// Take the receiving half of the completion slot. Only the first caller
    /// gets it.
    pub fn take_completion(&self) -> Option<Completion> {
        self.completion.rx.lock().take().map(|rx| Completion { rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(timeout_ms: i64) -> ExecutionContext {
        let config = FunctionConfig::new("hello", "app.handler");
        let request_id = RequestId::with_id("0123456789abcdef");
        ExecutionContext::new(
            &config,
            &request_id,
            chrono::Utc::now().timestamp_millis() + timeout_ms,
        )
    }

    #[test]
    fn test_context_identity() {
        let ctx = context(1000);
        assert_eq!(ctx.aws_request_id, "0123456789abcdef");
        assert_eq!(ctx.function_name, "hello");
        assert_eq!(ctx.log_group_name, "/aws/lambda/hello");
        assert!(ctx.log_stream_name.ends_with("[$LATEST]01234567"));
    }

    #[test]
    fn test_remaining_time_floors_at_zero() {
        let ctx = context(-5000);
        assert_eq!(ctx.get_remaining_time_in_millis(), 0);

        let ctx = context(60_000);
        let remaining = ctx.get_remaining_time_in_millis();
        assert!(remaining > 59_000 && remaining <= 60_000);
    }

    #[tokio::test]
    async fn test_first_completion_wins() {
        let ctx = context(1000);
        let completion = ctx.take_completion().unwrap();
        assert!(ctx.take_completion().is_none());

        assert!(ctx.succeed(json!("first")));
        assert!(!ctx.fail(HandlerError::new("Error", "second")));
        assert!(!ctx.clone().done(Ok(json!("third"))));
        assert!(ctx.is_settled());

        assert_eq!(completion.wait().await, Some(Ok(json!("first"))));
    }

    #[tokio::test]
    async fn test_dropped_context_yields_no_completion() {
        let ctx = context(1000);
        let completion = ctx.take_completion().unwrap();
        drop(ctx);
        assert_eq!(completion.wait().await, None);
    }

    #[test]
    fn test_context_serializes_without_slot() {
        let ctx = context(1000);
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value["function_name"], "hello");
        assert!(value.get("completion").is_none());
    }
}
