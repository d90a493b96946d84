//! localfn - local function invocation emulator
//!
//! Serves function invocations over HTTP and WebSocket and fires scheduled
//! triggers, running handlers as subprocesses, in Docker sandboxes or on
//! built-in in-process handlers.

mod config;
mod router;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use localfn_lambda::{
    handler_fn, overrides, schedule, ConnectionRegistry, Dispatcher, DockerCli, DockerConfig,
    ExecutionContext, ExecutorMode,
};

#[derive(Parser, Debug)]
#[command(name = "localfn")]
#[command(about = "Local function invocation emulator", long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "LOCALFN_PORT")]
    port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "LOCALFN_HOST")]
    host: Option<String>,

    /// Service definition file (defaults to ./localfn.toml when present)
    #[arg(short, long, env = "LOCALFN_CONFIG")]
    config: Option<PathBuf>,

    /// Default executor: in-process, worker, subprocess or docker
    #[arg(long, default_value = "subprocess", env = "LOCALFN_EXECUTOR")]
    executor: String,

    /// Docker network mode (bridge or host)
    #[arg(long, default_value = "bridge", env = "LOCALFN_DOCKER_NETWORK")]
    docker_network: String,

    /// JSON object merged into every function's environment
    #[arg(long, env = "LOCALFN_ENV_OVERRIDES")]
    env_overrides: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOCALFN_LOG_LEVEL")]
    log_level: String,
}

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_HOST: &str = "127.0.0.1";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "localfn={level},localfn_lambda={level},tower_http=debug",
                    level = args.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let executor = args.executor.parse::<ExecutorMode>().unwrap_or_else(|e| {
        warn!("{}, defaulting to subprocess", e);
        ExecutorMode::Subprocess
    });

    let config = config::Config::load(args.config.as_deref())?;
    let base_dir = args
        .config
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let env_overrides = args
        .env_overrides
        .as_deref()
        .and_then(overrides::parse_env_overrides)
        .unwrap_or_default();

    let engine = Arc::new(DockerCli::new(DockerConfig {
        network_mode: args.docker_network.clone(),
        ..Default::default()
    }));

    let dispatcher = Dispatcher::with_overrides(engine, env_overrides);
    register_builtin_handlers(&dispatcher);

    let mut needs_docker = false;
    let mut schedules = Vec::new();
    for definition in &config.functions {
        let function = definition.to_function_config(&base_dir, executor)?;
        needs_docker |= function.executor == ExecutorMode::Docker;

        let key = function.function_key.clone();
        dispatcher
            .register_function(function)
            .with_context(|| format!("cannot register function {}", key))?;

        for event in &definition.events {
            if let Some(task) = schedule::spawn_scheduler(dispatcher.clone(), &key, event.clone()) {
                schedules.push(task);
            }
        }
    }

    if needs_docker && !DockerCli::is_available().await {
        warn!("Docker is not available; docker functions will fail to start");
    }

    info!(
        functions = dispatcher.list_functions().len(),
        schedules = schedules.len(),
        executor = executor.as_str(),
        "Starting localfn"
    );

    let state = router::AppState {
        dispatcher: dispatcher.clone(),
        connections: Arc::new(ConnectionRegistry::new()),
        websocket: config.websocket.clone(),
    };
    let app = router::create_router(state);

    let host = args
        .host
        .or(config.server.host)
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = args.port.or(config.server.port).unwrap_or(DEFAULT_PORT);
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    for task in schedules {
        task.abort();
    }
    dispatcher.cleanup().await;

    Ok(())
}

/// Handlers usable with the in-process and worker executors
fn register_builtin_handlers(dispatcher: &Dispatcher) {
    let handlers = dispatcher.handlers();

    handlers.register(
        "localfn.echo",
        handler_fn(|event: Value, _ctx: ExecutionContext| async move { Ok(event) }),
    );
    handlers.register(
        "localfn.context",
        handler_fn(|_event: Value, ctx: ExecutionContext| async move {
            serde_json::to_value(&ctx).map_err(|e| {
                localfn_lambda::HandlerError::new("SerializationError", e.to_string())
            })
        }),
    );
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
