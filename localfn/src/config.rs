//! Configuration management

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use localfn_lambda::{ExecutorMode, FunctionConfig, Runtime, ScheduleEventDefinition, WorkerReuse};

/// Service definition file
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub websocket: Option<WebSocketConfig>,

    #[serde(default)]
    pub functions: Vec<FunctionDefinition>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerConfig {
    pub port: Option<u16>,
    pub host: Option<String>,
}

/// Function receiving WebSocket messages
#[derive(Debug, Deserialize, Clone)]
pub struct WebSocketConfig {
    pub function: String,

    #[serde(default = "default_route_key")]
    pub route_key: String,
}

#[derive(Debug, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub handler: String,

    #[serde(default)]
    pub runtime: Option<Runtime>,

    /// Seconds
    #[serde(default)]
    pub timeout: Option<f64>,

    #[serde(default)]
    pub memory_size: Option<i32>,

    #[serde(default)]
    pub executor: Option<String>,

    #[serde(default)]
    pub worker_reuse: Option<WorkerReuse>,

    /// Directory holding the handler code, relative to the definition file
    #[serde(default)]
    pub artifact: Option<PathBuf>,

    #[serde(default)]
    pub environment: HashMap<String, String>,

    #[serde(default)]
    pub events: Vec<ScheduleEventDefinition>,

    #[serde(default)]
    pub description: Option<String>,
}

fn default_route_key() -> String {
    "$default".to_string()
}

impl FunctionDefinition {
    /// Build the engine's function configuration.
    ///
    /// `base_dir` resolves relative artifact paths; `default_executor` applies
    /// when the definition names none.
    pub fn to_function_config(
        &self,
        base_dir: &Path,
        default_executor: ExecutorMode,
    ) -> anyhow::Result<FunctionConfig> {
        let mut config = FunctionConfig::new(&self.name, &self.handler);

        if let Some(runtime) = self.runtime {
            config.runtime = runtime;
        }

        if let Some(timeout) = self.timeout {
            anyhow::ensure!(
                timeout.is_finite() && timeout > 0.0,
                "function {}: timeout must be a positive number of seconds",
                self.name
            );
            config.timeout = Duration::try_from_secs_f64(timeout)
                .with_context(|| format!("function {}: timeout {} is out of range", self.name, timeout))?;
        }

        if let Some(memory_size) = self.memory_size {
            config.memory_size = memory_size;
        }

        config.executor = match &self.executor {
            Some(executor) => executor
                .parse()
                .map_err(|e: String| anyhow::anyhow!("function {}: {}", self.name, e))?,
            None => default_executor,
        };

        if let Some(reuse) = self.worker_reuse {
            config.worker_reuse = reuse;
        }

        config.artifact_path = self.artifact.as_ref().map(|path| base_dir.join(path));
        config.environment = self.environment.clone();
        config.description = self.description.clone();

        Ok(config)
    }
}

impl Config {
    /// Load the definition file and `LOCALFN__`-prefixed environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();

        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("localfn").required(false)),
        };

        let config = builder
            .add_source(config::Environment::with_prefix("LOCALFN").prefix_separator("__").separator("__"))
            .build()
            .context("failed to read service definition")?;

        config
            .try_deserialize::<Config>()
            .context("invalid service definition")
    }
}
