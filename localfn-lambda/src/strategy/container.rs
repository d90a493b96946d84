//! Container execution
//!
//! A [`ContainerRunner`] owns one [`ContainerHandle`] for its function. The
//! handle starts its sandbox lazily on the first invocation and reuses it
//! afterwards. Its state lives behind an async mutex held for the whole
//! Stopped -> Starting -> Running transition, so callers that arrive while a
//! start is in flight queue on the lock and then find the sandbox running.
//! Requests are sent one at a time per sandbox.

use async_trait::async_trait;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::context::ExecutionContext;
use crate::docker::{ContainerError, Sandbox, SandboxEngine, SandboxSpec};
use crate::function::{FunctionConfig, Runtime};
use crate::handler::HandlerError;
use crate::reply::ErrorEnvelope;

use super::{ExecutionStrategy, RunError};

/// How long a started sandbox gets to accept connections
const READY_TIMEOUT: Duration = Duration::from_secs(10);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lifecycle state of a container handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Stopped,
    Starting,
    Running,
}

struct HandleState {
    state: ContainerState,
    sandbox: Option<Sandbox>,
}

/// One sandbox process for one function
pub struct ContainerHandle {
    pub image: String,
    pub function_key: String,
    pub runtime: Runtime,
    pub artifact_path: Option<PathBuf>,
    spec: SandboxSpec,
    engine: Arc<dyn SandboxEngine>,
    inner: Arc<Mutex<HandleState>>,
    /// Serializes requests onto the sandbox endpoint
    request_lock: Mutex<()>,
    starts: AtomicUsize,
}

impl ContainerHandle {
    pub fn new(config: &FunctionConfig, engine: Arc<dyn SandboxEngine>) -> Self {
        let image = config.runtime.docker_image().to_string();

        let mut environment = config.environment.clone();
        environment.insert(
            "AWS_LAMBDA_FUNCTION_NAME".to_string(),
            config.function_name.clone(),
        );
        environment.insert(
            "AWS_LAMBDA_FUNCTION_TIMEOUT".to_string(),
            config.timeout_secs().to_string(),
        );
        environment.insert(
            "AWS_LAMBDA_FUNCTION_MEMORY_SIZE".to_string(),
            config.memory_size.to_string(),
        );
        environment
            .entry("AWS_REGION".to_string())
            .or_insert_with(|| "us-east-1".to_string());

        let spec = SandboxSpec {
            function_key: config.function_key.clone(),
            image: image.clone(),
            handler: config.handler.clone(),
            artifact_path: config.artifact_path.clone(),
            environment,
        };

        Self {
            image,
            function_key: config.function_key.clone(),
            runtime: config.runtime,
            artifact_path: config.artifact_path.clone(),
            spec,
            engine,
            inner: Arc::new(Mutex::new(HandleState {
                state: ContainerState::Stopped,
                sandbox: None,
            })),
            request_lock: Mutex::new(()),
            starts: AtomicUsize::new(0),
        }
    }

    /// Current state. Waits for an in-flight start to finish.
    pub async fn state(&self) -> ContainerState {
        self.inner.lock().await.state
    }

    /// Number of Stopped -> Starting transitions so far
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Return the running sandbox, starting it first if needed
    pub async fn ensure_running(&self) -> Result<Sandbox, ContainerError> {
        let mut inner = self.inner.lock().await;

        if inner.state == ContainerState::Running {
            if let Some(sandbox) = &inner.sandbox {
                return Ok(sandbox.clone());
            }
        }

        inner.state = ContainerState::Starting;
        self.starts.fetch_add(1, Ordering::SeqCst);
        debug!(function = %self.function_key, image = %self.image, "Starting sandbox");

        match self.start_sandbox().await {
            Ok(sandbox) => {
                inner.state = ContainerState::Running;
                inner.sandbox = Some(sandbox.clone());
                self.watch_exit(sandbox.id.clone());
                Ok(sandbox)
            }
            Err(e) => {
                inner.state = ContainerState::Stopped;
                inner.sandbox = None;
                Err(e)
            }
        }
    }

    async fn start_sandbox(&self) -> Result<Sandbox, ContainerError> {
        self.engine.ensure_image(&self.image).await?;
        let sandbox = self.engine.start(&self.spec).await?;

        if let Err(e) = wait_ready(sandbox.addr).await {
            let _ = self.engine.stop(&sandbox.id).await;
            return Err(e);
        }

        Ok(sandbox)
    }

    /// Revert to Stopped when the sandbox exits on its own
    fn watch_exit(&self, id: String) {
        let engine = self.engine.clone();
        let inner = self.inner.clone();
        let function_key = self.function_key.clone();

        tokio::spawn(async move {
            let code = match engine.wait(&id).await {
                Ok(code) => code,
                Err(e) => {
                    warn!(function = %function_key, container_id = %id, error = %e, "Lost track of sandbox");
                    -1
                }
            };

            let mut inner = inner.lock().await;
            if inner.sandbox.as_ref().map(|s| s.id.as_str()) == Some(id.as_str()) {
                info!(function = %function_key, container_id = %id, exit_code = code, "Sandbox exited");
                inner.state = ContainerState::Stopped;
                inner.sandbox = None;
            }
        });
    }

    /// Stop the sandbox if it is running
    pub async fn stop(&self) -> Result<(), ContainerError> {
        let mut inner = self.inner.lock().await;
        let sandbox = inner.sandbox.take();
        inner.state = ContainerState::Stopped;

        if let Some(sandbox) = sandbox {
            info!(function = %self.function_key, container_id = %sandbox.id, "Stopping sandbox");
            self.engine.stop(&sandbox.id).await?;
        }

        Ok(())
    }
}

async fn wait_ready(addr: SocketAddr) -> Result<(), ContainerError> {
    let deadline = tokio::time::Instant::now() + READY_TIMEOUT;

    loop {
        match tokio::net::TcpStream::connect(addr).await {
            Ok(_) => return Ok(()),
            Err(e) if tokio::time::Instant::now() >= deadline => {
                return Err(ContainerError::NotReady(format!("{}: {}", addr, e)));
            }
            Err(_) => tokio::time::sleep(READY_POLL_INTERVAL).await,
        }
    }
}

/// Decode a sandbox response: an error envelope, or the handler result itself
pub fn decode_response(body: &[u8]) -> Result<Value, HandlerError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }

    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => return Ok(Value::String(String::from_utf8_lossy(body).into_owned())),
    };

    let is_envelope = value
        .as_object()
        .map(|o| o.contains_key("errorMessage") && o.contains_key("errorType"))
        .unwrap_or(false);

    if is_envelope {
        if let Ok(envelope) = serde_json::from_value::<ErrorEnvelope>(value.clone()) {
            return Err(HandlerError::from_runtime(
                envelope.error_type,
                envelope.error_message,
                envelope.stack_trace,
            ));
        }
    }

    Ok(value)
}

/// Runs a function inside a reused sandbox
pub struct ContainerRunner {
    handle: ContainerHandle,
    client: reqwest::Client,
}

impl ContainerRunner {
    pub fn new(config: &FunctionConfig, engine: Arc<dyn SandboxEngine>, client: reqwest::Client) -> Self {
        Self {
            handle: ContainerHandle::new(config, engine),
            client,
        }
    }

    pub fn handle(&self) -> &ContainerHandle {
        &self.handle
    }
}

#[async_trait]
impl ExecutionStrategy for ContainerRunner {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn run(&self, event: Value, context: ExecutionContext) -> Result<Value, RunError> {
        let sandbox = self
            .handle
            .ensure_running()
            .await
            .map_err(|e| RunError::SandboxUnavailable(e.to_string()))?;

        let _in_flight = self.handle.request_lock.lock().await;

        let remaining = context.remaining_time();
        if remaining.is_zero() {
            return Err(RunError::SandboxUnavailable(
                "deadline passed before the request was sent".to_string(),
            ));
        }

        debug!(
            function = %self.handle.function_key,
            container_id = %sandbox.id,
            request_id = %context.aws_request_id,
            "Invoking function in container"
        );

        let response = self
            .client
            .post(sandbox.invoke_url())
            .timeout(remaining)
            .header("Lambda-Runtime-Aws-Request-Id", &context.aws_request_id)
            .header("Lambda-Runtime-Deadline-Ms", context.deadline_ms.to_string())
            .json(&event)
            .send()
            .await
            .map_err(|e| RunError::SandboxUnavailable(format!("{}: {}", sandbox.addr, e)))?;

        let body = response
            .bytes()
            .await
            .map_err(|e| RunError::SandboxUnavailable(format!("{}: {}", sandbox.addr, e)))?;

        decode_response(&body).map_err(RunError::Handler)
    }

    async fn cleanup(&self) {
        if let Err(e) = self.handle.stop().await {
            warn!(function = %self.handle.function_key, error = %e, "Failed to stop sandbox");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_result() {
        assert_eq!(decode_response(br#"{"statusCode":200}"#), Ok(json!({"statusCode": 200})));
        assert_eq!(decode_response(b"  \n"), Ok(Value::Null));
        assert_eq!(decode_response(b"not json"), Ok(json!("not json")));
    }

    #[test]
    fn test_decode_error_envelope() {
        let body = br#"{"errorMessage":"boom","errorType":"Error","stackTrace":["at handler (/var/task/index.js:2:9)"]}"#;
        let error = decode_response(body).unwrap_err();
        assert_eq!(error.error_type, "Error");
        assert_eq!(error.message, "boom");

        let envelope = ErrorEnvelope::from(&error);
        assert_eq!(envelope.stack_trace, vec!["at handler (/var/task/index.js:2:9)"]);
    }

    #[test]
    fn test_handle_environment() {
        struct NoEngine;

        #[async_trait]
        impl SandboxEngine for NoEngine {
            async fn ensure_image(&self, _: &str) -> Result<(), ContainerError> {
                Ok(())
            }
            async fn start(&self, _: &SandboxSpec) -> Result<Sandbox, ContainerError> {
                Err(ContainerError::StartFailed("unused".into()))
            }
            async fn wait(&self, _: &str) -> Result<i64, ContainerError> {
                Ok(0)
            }
            async fn stop(&self, _: &str) -> Result<(), ContainerError> {
                Ok(())
            }
        }

        let config = FunctionConfig::new("hello", "app.handler")
            .with_timeout(Duration::from_millis(2500));
        let handle = ContainerHandle::new(&config, Arc::new(NoEngine));

        assert_eq!(handle.image, "public.ecr.aws/lambda/python:3.12");
        assert_eq!(handle.spec.environment["AWS_LAMBDA_FUNCTION_TIMEOUT"], "3");
        assert_eq!(handle.spec.environment["AWS_LAMBDA_FUNCTION_NAME"], "hello");
    }
}
