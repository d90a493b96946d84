//! Subprocess execution
//!
//! Spawns the runtime interpreter once per invocation with a small bootstrap
//! that imports the handler, feeds it the event from stdin and prints the
//! result as the last stdout line. Failures are printed to stderr as an
//! error envelope and signalled with a non-zero exit.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::function::{FunctionConfig, RuntimeFamily};
use crate::handler::HandlerError;
use crate::reply::ErrorEnvelope;

use super::{ExecutionStrategy, RunError};

const PYTHON_BOOTSTRAP: &str = r#"
import importlib, json, os, sys, time, traceback

class Context:
    def __init__(self):
        self.aws_request_id = os.environ["AWS_LAMBDA_REQUEST_ID"]
        self.function_name = os.environ["AWS_LAMBDA_FUNCTION_NAME"]
        self.function_version = os.environ["AWS_LAMBDA_FUNCTION_VERSION"]
        self.invoked_function_arn = os.environ["AWS_LAMBDA_FUNCTION_ARN"]
        self.memory_limit_in_mb = int(os.environ["AWS_LAMBDA_FUNCTION_MEMORY_SIZE"])
        self.log_group_name = os.environ["AWS_LAMBDA_LOG_GROUP_NAME"]
        self.log_stream_name = os.environ["AWS_LAMBDA_LOG_STREAM_NAME"]
        self._deadline_ms = int(os.environ["LOCALFN_DEADLINE_MS"])

    def get_remaining_time_in_millis(self):
        return max(0, self._deadline_ms - int(time.time() * 1000))

sys.path.insert(0, os.getcwd())
module_path, _, handler_name = os.environ["_HANDLER"].rpartition(".")
try:
    handler = getattr(importlib.import_module(module_path.replace("/", ".")), handler_name)
    result = handler(json.loads(sys.stdin.read() or "null"), Context())
    sys.stdout.write("\n" + json.dumps(result) + "\n")
except Exception as e:
    sys.stderr.write("\n" + json.dumps({
        "errorMessage": str(e),
        "errorType": type(e).__name__,
        "stackTrace": [line.strip() for frame in traceback.format_tb(e.__traceback__) for line in frame.splitlines()[:1]],
    }) + "\n")
    sys.exit(1)
"#;

const NODE_BOOTSTRAP: &str = r#"
const path = require('path');
const spec = process.env._HANDLER;
const dot = spec.lastIndexOf('.');
const deadline = Number(process.env.LOCALFN_DEADLINE_MS);
let settled = false;
const finish = (err, res) => {
  if (settled) return;
  settled = true;
  if (err) {
    const error = err instanceof Error ? err : new Error(String(err));
    process.stderr.write('\n' + JSON.stringify({
      errorMessage: error.message,
      errorType: error.name,
      stackTrace: String(error.stack || '').split('\n').slice(1).map((l) => l.trim()),
    }) + '\n', () => process.exit(1));
    return;
  }
  process.stdout.write('\n' + JSON.stringify(res === undefined ? null : res) + '\n', () => process.exit(0));
};
const context = {
  awsRequestId: process.env.AWS_LAMBDA_REQUEST_ID,
  functionName: process.env.AWS_LAMBDA_FUNCTION_NAME,
  functionVersion: process.env.AWS_LAMBDA_FUNCTION_VERSION,
  invokedFunctionArn: process.env.AWS_LAMBDA_FUNCTION_ARN,
  memoryLimitInMB: process.env.AWS_LAMBDA_FUNCTION_MEMORY_SIZE,
  logGroupName: process.env.AWS_LAMBDA_LOG_GROUP_NAME,
  logStreamName: process.env.AWS_LAMBDA_LOG_STREAM_NAME,
  getRemainingTimeInMillis: () => Math.max(0, deadline - Date.now()),
  done: finish,
  succeed: (res) => finish(null, res),
  fail: (err) => finish(err),
};
let input = '';
process.stdin.on('data', (chunk) => { input += chunk; });
process.stdin.on('end', () => {
  try {
    const mod = require(path.resolve(process.cwd(), spec.slice(0, dot)));
    const out = mod[spec.slice(dot + 1)](JSON.parse(input || 'null'), context, finish);
    if (out && typeof out.then === 'function') out.then((res) => finish(null, res), finish);
  } catch (err) {
    finish(err);
  }
});
"#;

/// Runs an interpreted handler in a fresh process per invocation
pub struct SubprocessStrategy {
    config: FunctionConfig,
    /// Extra environment applied over the function's own
    overrides: HashMap<String, String>,
}

impl SubprocessStrategy {
    pub fn new(config: FunctionConfig, overrides: HashMap<String, String>) -> Result<Self, RunError> {
        if config.runtime.family() == RuntimeFamily::Provided {
            return Err(RunError::Runtime(format!(
                "runtime {} cannot run as a subprocess",
                config.runtime
            )));
        }

        Ok(Self { config, overrides })
    }

    fn command(&self, context: &ExecutionContext) -> Command {
        let (program, flag, script) = match self.config.runtime.family() {
            RuntimeFamily::Node => ("node", "-e", NODE_BOOTSTRAP),
            _ => ("python3", "-c", PYTHON_BOOTSTRAP),
        };

        let mut command = Command::new(program);
        command
            .arg(flag)
            .arg(script)
            .envs(&self.config.environment)
            .envs(&self.overrides)
            .env("_HANDLER", &self.config.handler)
            .env("AWS_LAMBDA_REQUEST_ID", &context.aws_request_id)
            .env("AWS_LAMBDA_FUNCTION_NAME", &context.function_name)
            .env("AWS_LAMBDA_FUNCTION_VERSION", &context.function_version)
            .env("AWS_LAMBDA_FUNCTION_ARN", &context.invoked_function_arn)
            .env(
                "AWS_LAMBDA_FUNCTION_MEMORY_SIZE",
                context.memory_limit_in_mb.to_string(),
            )
            .env("AWS_LAMBDA_LOG_GROUP_NAME", &context.log_group_name)
            .env("AWS_LAMBDA_LOG_STREAM_NAME", &context.log_stream_name)
            .env("LOCALFN_DEADLINE_MS", context.deadline_ms.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = self.working_dir() {
            command.current_dir(dir);
        }

        command
    }

    fn working_dir(&self) -> Option<PathBuf> {
        self.config.artifact_path.clone()
    }
}

#[async_trait]
impl ExecutionStrategy for SubprocessStrategy {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn run(&self, event: Value, context: ExecutionContext) -> Result<Value, RunError> {
        let payload = serde_json::to_vec(&event)
            .map_err(|e| RunError::Runtime(format!("event is not serializable: {}", e)))?;

        let mut child = self
            .command(&context)
            .spawn()
            .map_err(|e| RunError::Runtime(format!("failed to spawn runtime: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&payload).await {
                Ok(()) => {}
                // Exited before reading the event; its stderr says why.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(function = %self.config.function_key, "Runtime closed stdin early");
                }
                Err(e) => return Err(RunError::Runtime(format!("failed to write event: {}", e))),
            }
            // Dropping stdin closes it so the bootstrap sees end of input.
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RunError::Runtime(format!("runtime did not exit cleanly: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stderr.trim().is_empty() {
            debug!(
                function = %self.config.function_key,
                request_id = %context.aws_request_id,
                stderr = %stderr.trim(),
                "Subprocess stderr"
            );
        }

        if output.status.success() {
            Ok(parse_result_line(&stdout))
        } else {
            Err(RunError::Handler(parse_failure(&stderr, output.status.code())))
        }
    }
}

/// Last non-empty stdout line as JSON, or as a string if it is not JSON
fn parse_result_line(stdout: &str) -> Value {
    match stdout.lines().rev().find(|line| !line.trim().is_empty()) {
        Some(line) => {
            serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string()))
        }
        None => Value::Null,
    }
}

fn parse_failure(stderr: &str, code: Option<i32>) -> HandlerError {
    let envelope = stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| serde_json::from_str::<ErrorEnvelope>(line).ok());

    match envelope {
        Some(envelope) => HandlerError::from_runtime(
            envelope.error_type,
            envelope.error_message,
            envelope.stack_trace,
        ),
        None => {
            let message = if stderr.trim().is_empty() {
                match code {
                    Some(code) => format!("Process exited with status {}", code),
                    None => "Process terminated by signal".to_string(),
                }
            } else {
                stderr.trim().to_string()
            };
            HandlerError::bare("Runtime.UnhandledError", message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Runtime;
    use localfn_core::RequestId;
    use serde_json::json;

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn context(config: &FunctionConfig) -> ExecutionContext {
        ExecutionContext::new(
            config,
            &RequestId::new(),
            chrono::Utc::now().timestamp_millis() + 5000,
        )
    }

    #[test]
    fn test_parse_result_line() {
        assert_eq!(parse_result_line("log line\n{\"ok\":true}\n\n"), json!({"ok": true}));
        assert_eq!(parse_result_line("plain text"), json!("plain text"));
        assert_eq!(parse_result_line(""), Value::Null);
    }

    #[test]
    fn test_parse_failure_envelope() {
        let stderr = "warning\n{\"errorMessage\":\"boom\",\"errorType\":\"ValueError\",\"stackTrace\":[\"File \\\"/x/app.py\\\", line 2\"]}\n";
        let error = parse_failure(stderr, Some(1));
        assert_eq!(error.error_type, "ValueError");
        assert_eq!(error.message, "boom");
    }

    #[test]
    fn test_parse_failure_fallback() {
        let error = parse_failure("", Some(3));
        assert_eq!(error.error_type, "Runtime.UnhandledError");
        assert_eq!(error.message, "Process exited with status 3");
    }

    #[test]
    fn test_provided_runtime_is_rejected() {
        let config = FunctionConfig::new("hello", "bootstrap").with_runtime(Runtime::ProvidedAl2023);
        assert!(SubprocessStrategy::new(config, HashMap::new()).is_err());
    }

    #[tokio::test]
    async fn test_python_handler_round_trip() {
        if !python_available() {
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("app.py"),
            "def handler(event, context):\n    return {'name': context.function_name, 'event': event, 'left': context.get_remaining_time_in_millis() > 0}\n\ndef broken(event, context):\n    raise ValueError('bad input')\n",
        )
        .unwrap();

        let config = FunctionConfig::new("hello", "app.handler")
            .with_runtime(Runtime::Python312)
            .with_artifact(dir.path());
        let strategy = SubprocessStrategy::new(config.clone(), HashMap::new()).unwrap();
        let result = strategy.run(json!({"a": 1}), context(&config)).await.unwrap();
        assert_eq!(result, json!({"name": "hello", "event": {"a": 1}, "left": true}));

        let config = FunctionConfig {
            handler: "app.broken".to_string(),
            ..config
        };
        let strategy = SubprocessStrategy::new(config.clone(), HashMap::new()).unwrap();
        match strategy.run(json!(null), context(&config)).await {
            Err(RunError::Handler(error)) => {
                assert_eq!(error.error_type, "ValueError");
                assert_eq!(error.message, "bad input");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_import_error_with_large_event_keeps_envelope() {
        if !python_available() {
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let config = FunctionConfig::new("missing", "nowhere.handler")
            .with_runtime(Runtime::Python312)
            .with_artifact(dir.path());
        let strategy = SubprocessStrategy::new(config.clone(), HashMap::new()).unwrap();

        let event = json!({"blob": "x".repeat(4 * 1024 * 1024)});
        match strategy.run(event, context(&config)).await {
            Err(RunError::Handler(error)) => {
                assert_eq!(error.error_type, "ModuleNotFoundError");
                assert!(error.message.contains("nowhere"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
