//! In-process execution

use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::handler::{Handler, HandlerError, HandlerFactory};

use super::{ExecutionStrategy, RunError};

/// Calls a registered handler on the caller's runtime.
///
/// One handler instance is created per strategy, so state held by the
/// handler survives across invocations of the function.
pub struct InProcessStrategy {
    handler: Arc<dyn Handler>,
}

impl InProcessStrategy {
    pub fn new(factory: &dyn HandlerFactory) -> Self {
        Self {
            handler: factory.create(),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for InProcessStrategy {
    fn name(&self) -> &'static str {
        "in-process"
    }

    async fn run(&self, event: Value, context: ExecutionContext) -> Result<Value, RunError> {
        execute(self.handler.clone(), event, context).await
    }
}

/// Run a handler against a context until the first completion.
///
/// The handler may complete through the context callbacks or by returning;
/// whichever happens first is the result. Runs on whatever tokio runtime the
/// caller is on.
pub(crate) async fn execute(
    handler: Arc<dyn Handler>,
    event: Value,
    context: ExecutionContext,
) -> Result<Value, RunError> {
    let completion = context
        .take_completion()
        .ok_or_else(|| RunError::Runtime("execution context was already used".to_string()))?;

    let ctx = context.clone();
    let mut task = tokio::spawn(async move {
        let result = handler.handle(event, ctx.clone()).await;
        if !ctx.done(result) {
            debug!(
                request_id = %ctx.aws_request_id,
                "Handler returned after completing through the context; return value ignored"
            );
        }
    });

    let completion = completion.wait();
    tokio::pin!(completion);

    let outcome = tokio::select! {
        biased;
        result = &mut completion => result,
        joined = &mut task => {
            if let Err(e) = joined {
                let error = if e.is_panic() {
                    HandlerError::bare("Runtime.Panic", panic_message(e.into_panic()))
                } else {
                    HandlerError::bare("Runtime.Cancelled", "handler task was cancelled")
                };
                // No-op when a callback already completed the invocation.
                context.fail(error);
            }
            // The slot is settled by now: by the returned value, a callback,
            // or the failure above.
            completion.await
        }
    };

    match outcome {
        Some(result) => result.map_err(RunError::Handler),
        None => Err(RunError::Runtime(
            "handler finished without completing".to_string(),
        )),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::FunctionConfig;
    use crate::handler::handler_fn;
    use localfn_core::RequestId;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn context() -> ExecutionContext {
        let config = FunctionConfig::new("hello", "hello");
        ExecutionContext::new(
            &config,
            &RequestId::new(),
            chrono::Utc::now().timestamp_millis() + 1000,
        )
    }

    #[tokio::test]
    async fn test_returned_value() {
        let handler: Arc<dyn Handler> =
            Arc::new(handler_fn(|event, _| async move { Ok(json!({"echo": event})) }));

        let result = execute(handler, json!(1), context()).await.unwrap();
        assert_eq!(result, json!({"echo": 1}));
    }

    #[tokio::test]
    async fn test_callback_wins_over_later_return() {
        let handler: Arc<dyn Handler> = Arc::new(handler_fn(|_, ctx: ExecutionContext| async move {
            ctx.succeed(json!("from-callback"));
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(json!("from-return"))
        }));

        let result = execute(handler, json!(null), context()).await.unwrap();
        assert_eq!(result, json!("from-callback"));
    }

    #[tokio::test]
    async fn test_callback_does_not_wait_for_return() {
        let handler: Arc<dyn Handler> = Arc::new(handler_fn(|_, ctx: ExecutionContext| async move {
            ctx.fail(HandlerError::new("Error", "early"));
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!("late"))
        }));

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            execute(handler, json!(null), context()),
        )
        .await
        .expect("callback completion should not wait for the return");

        match result {
            Err(RunError::Handler(error)) => assert_eq!(error.message, "early"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_handler_error() {
        let handler: Arc<dyn Handler> = Arc::new(handler_fn(|event: Value, _| async move {
            if event.is_null() {
                panic!("kaboom");
            }
            Ok(event)
        }));

        match execute(handler, json!(null), context()).await {
            Err(RunError::Handler(error)) => {
                assert_eq!(error.error_type, "Runtime.Panic");
                assert_eq!(error.message, "kaboom");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_strategy_keeps_one_instance() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let factory = move || -> Arc<dyn Handler> {
            let counter = counter.clone();
            Arc::new(handler_fn(move |_, _| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(json!(n)) }
            }))
        };

        let strategy = InProcessStrategy::new(&factory);
        assert_eq!(strategy.run(json!(null), context()).await.unwrap(), json!(1));
        assert_eq!(strategy.run(json!(null), context()).await.unwrap(), json!(2));
    }
}
