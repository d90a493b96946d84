//! Function models

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Supported runtimes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Runtime {
    #[serde(rename = "python3.9")]
    Python39,
    #[serde(rename = "python3.10")]
    Python310,
    #[serde(rename = "python3.11")]
    Python311,
    #[serde(rename = "python3.12")]
    Python312,
    #[serde(rename = "python3.13")]
    Python313,
    #[serde(rename = "nodejs18.x")]
    Nodejs18,
    #[serde(rename = "nodejs20.x")]
    Nodejs20,
    #[serde(rename = "nodejs22.x")]
    Nodejs22,
    #[serde(rename = "provided.al2")]
    ProvidedAl2,
    #[serde(rename = "provided.al2023")]
    ProvidedAl2023,
}

/// Language family of a runtime, used to pick a subprocess bootstrap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFamily {
    Python,
    Node,
    Provided,
}

impl Runtime {
    /// Get the Docker image for this runtime
    pub fn docker_image(&self) -> &'static str {
        match self {
            Self::Python39 => "public.ecr.aws/lambda/python:3.9",
            Self::Python310 => "public.ecr.aws/lambda/python:3.10",
            Self::Python311 => "public.ecr.aws/lambda/python:3.11",
            Self::Python312 => "public.ecr.aws/lambda/python:3.12",
            Self::Python313 => "public.ecr.aws/lambda/python:3.13",
            Self::Nodejs18 => "public.ecr.aws/lambda/nodejs:18",
            Self::Nodejs20 => "public.ecr.aws/lambda/nodejs:20",
            Self::Nodejs22 => "public.ecr.aws/lambda/nodejs:22",
            Self::ProvidedAl2 => "public.ecr.aws/lambda/provided:al2",
            Self::ProvidedAl2023 => "public.ecr.aws/lambda/provided:al2023",
        }
    }

    pub fn family(&self) -> RuntimeFamily {
        match self {
            Self::Python39 | Self::Python310 | Self::Python311 | Self::Python312
            | Self::Python313 => RuntimeFamily::Python,
            Self::Nodejs18 | Self::Nodejs20 | Self::Nodejs22 => RuntimeFamily::Node,
            Self::ProvidedAl2 | Self::ProvidedAl2023 => RuntimeFamily::Provided,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python39 => "python3.9",
            Self::Python310 => "python3.10",
            Self::Python311 => "python3.11",
            Self::Python312 => "python3.12",
            Self::Python313 => "python3.13",
            Self::Nodejs18 => "nodejs18.x",
            Self::Nodejs20 => "nodejs20.x",
            Self::Nodejs22 => "nodejs22.x",
            Self::ProvidedAl2 => "provided.al2",
            Self::ProvidedAl2023 => "provided.al2023",
        }
    }
}

impl FromStr for Runtime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python3.9" => Ok(Self::Python39),
            "python3.10" => Ok(Self::Python310),
            "python3.11" => Ok(Self::Python311),
            "python3.12" => Ok(Self::Python312),
            "python3.13" => Ok(Self::Python313),
            "nodejs18.x" => Ok(Self::Nodejs18),
            "nodejs20.x" => Ok(Self::Nodejs20),
            "nodejs22.x" => Ok(Self::Nodejs22),
            "provided.al2" => Ok(Self::ProvidedAl2),
            "provided.al2023" => Ok(Self::ProvidedAl2023),
            other => Err(format!("unsupported runtime: {}", other)),
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a function's handler is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorMode {
    /// Call a registered handler on the dispatcher's runtime (fast, no isolation)
    #[default]
    InProcess,
    /// Call a registered handler on a dedicated worker thread
    Worker,
    /// Spawn the runtime interpreter once per invocation
    Subprocess,
    /// Run inside a reused Docker container (isolated, slower cold start)
    Docker,
}

impl ExecutorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProcess => "in-process",
            Self::Worker => "worker",
            Self::Subprocess => "subprocess",
            Self::Docker => "docker",
        }
    }
}

impl FromStr for ExecutorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in-process" | "inprocess" | "native" => Ok(Self::InProcess),
            "worker" | "worker-thread" | "thread" => Ok(Self::Worker),
            "subprocess" | "process" => Ok(Self::Subprocess),
            "docker" | "container" => Ok(Self::Docker),
            other => Err(format!("unknown executor mode: {}", other)),
        }
    }
}

/// Reuse policy for worker execution units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerReuse {
    /// One long-lived unit per function; handler state survives between invocations
    #[default]
    Warm,
    /// A fresh unit for every invocation
    PerInvocation,
}

/// Function configuration
#[derive(Debug, Clone)]
pub struct FunctionConfig {
    /// Key the function is registered and invoked under
    pub function_key: String,
    /// Deployed name, reported to the handler
    pub function_name: String,
    pub runtime: Runtime,
    /// `module.export` for interpreted runtimes, or the registered handler
    /// name for in-process and worker execution
    pub handler: String,
    pub memory_size: i32,
    pub timeout: Duration,
    pub environment: HashMap<String, String>,
    pub executor: ExecutorMode,
    pub worker_reuse: WorkerReuse,
    /// Directory holding the handler code for subprocess and Docker execution
    pub artifact_path: Option<PathBuf>,
    pub description: Option<String>,
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self {
            function_key: String::new(),
            function_name: String::new(),
            runtime: Runtime::Python312,
            handler: "lambda_function.lambda_handler".to_string(),
            memory_size: 128,
            timeout: Duration::from_secs(3),
            environment: HashMap::new(),
            executor: ExecutorMode::default(),
            worker_reuse: WorkerReuse::default(),
            artifact_path: None,
            description: None,
        }
    }
}

impl FunctionConfig {
    /// Config for `key` with the deployed name defaulted to the key
    pub fn new(key: impl Into<String>, handler: impl Into<String>) -> Self {
        let function_key = key.into();
        Self {
            function_name: function_key.clone(),
            function_key,
            handler: handler.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorMode) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_runtime(mut self, runtime: Runtime) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact_path = Some(path.into());
        self
    }

    pub fn with_worker_reuse(mut self, reuse: WorkerReuse) -> Self {
        self.worker_reuse = reuse;
        self
    }

    /// Get function ARN
    pub fn arn(&self) -> String {
        format!(
            "arn:aws:lambda:us-east-1:000000000000:function:{}",
            self.function_name
        )
    }

    /// Timeout in whole seconds, rounded up, as reported to sandboxes
    pub fn timeout_secs(&self) -> u64 {
        let millis = self.timeout.as_millis() as u64;
        millis.div_ceil(1000).max(1)
    }
}
