//! Invocation dispatcher
//!
//! Picks the execution strategy for a function, races it against the
//! function's timeout and turns the winner into a [`Reply`].

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use localfn_core::{EmulatorError, ErrorCode};

use crate::context::ExecutionContext;
use crate::docker::SandboxEngine;
use crate::function::{ExecutorMode, FunctionConfig};
use crate::handler::{HandlerError, HandlerRegistry};
use crate::invocation::{Invocation, InvocationType};
use crate::reply::{self, Reply};
use crate::strategy::{
    ContainerRunner, ExecutionStrategy, InProcessStrategy, RunError, SubprocessStrategy,
    WorkerStrategy,
};

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("Function already exists: {0}")]
    FunctionExists(String),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),
}

struct Inner {
    functions: DashMap<String, Arc<FunctionConfig>>,
    strategies: DashMap<String, Arc<dyn ExecutionStrategy>>,
    handlers: HandlerRegistry,
    engine: Arc<dyn SandboxEngine>,
    client: reqwest::Client,
    /// Environment applied over every function's own
    env_overrides: HashMap<String, String>,
}

/// Dispatches invocations to functions. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn SandboxEngine>) -> Self {
        Self::with_overrides(engine, HashMap::new())
    }

    pub fn with_overrides(
        engine: Arc<dyn SandboxEngine>,
        env_overrides: HashMap<String, String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                functions: DashMap::new(),
                strategies: DashMap::new(),
                handlers: HandlerRegistry::new(),
                engine,
                client: reqwest::Client::new(),
                env_overrides,
            }),
        }
    }

    /// Registry the in-process and worker strategies resolve handlers from
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.inner.handlers
    }

    /// Register a function
    pub fn register_function(&self, config: FunctionConfig) -> Result<(), DispatcherError> {
        let key = config.function_key.clone();
        if self.inner.functions.contains_key(&key) {
            return Err(DispatcherError::FunctionExists(key));
        }

        info!(
            function = %key,
            executor = %config.executor.as_str(),
            runtime = %config.runtime,
            timeout_ms = config.timeout.as_millis() as u64,
            "Registered function"
        );

        self.inner.functions.insert(key, Arc::new(config));
        Ok(())
    }

    /// Get a function by key
    pub fn get_function(&self, key: &str) -> Option<Arc<FunctionConfig>> {
        self.inner.functions.get(key).map(|f| f.value().clone())
    }

    /// List all functions
    pub fn list_functions(&self) -> Vec<Arc<FunctionConfig>> {
        self.inner
            .functions
            .iter()
            .map(|r| r.value().clone())
            .collect()
    }

    /// Remove a function and release its strategy
    pub async fn remove_function(&self, key: &str) -> Result<(), DispatcherError> {
        if self.inner.functions.remove(key).is_none() {
            return Err(DispatcherError::FunctionNotFound(key.to_string()));
        }

        if let Some((_, strategy)) = self.inner.strategies.remove(key) {
            strategy.cleanup().await;
        }

        info!(function = %key, "Removed function");
        Ok(())
    }

    /// Strategy instance for a function, created on first use
    fn strategy_for(&self, config: &FunctionConfig) -> Result<Arc<dyn ExecutionStrategy>, RunError> {
        if let Some(strategy) = self.inner.strategies.get(&config.function_key) {
            return Ok(strategy.value().clone());
        }

        let strategy = self
            .inner
            .strategies
            .entry(config.function_key.clone())
            .or_try_insert_with(|| self.build_strategy(config))?;

        Ok(strategy.value().clone())
    }

    fn build_strategy(&self, config: &FunctionConfig) -> Result<Arc<dyn ExecutionStrategy>, RunError> {
        let strategy: Arc<dyn ExecutionStrategy> = match config.executor {
            ExecutorMode::InProcess => {
                let factory = self.registered_handler(&config.handler)?;
                Arc::new(InProcessStrategy::new(factory.as_ref()))
            }
            ExecutorMode::Worker => {
                let factory = self.registered_handler(&config.handler)?;
                Arc::new(WorkerStrategy::new(
                    config.function_key.clone(),
                    factory,
                    config.worker_reuse,
                ))
            }
            ExecutorMode::Subprocess => Arc::new(SubprocessStrategy::new(
                config.clone(),
                self.inner.env_overrides.clone(),
            )?),
            ExecutorMode::Docker => {
                let mut config = config.clone();
                config.environment.extend(self.inner.env_overrides.clone());
                Arc::new(ContainerRunner::new(
                    &config,
                    self.inner.engine.clone(),
                    self.inner.client.clone(),
                ))
            }
        };

        debug!(function = %config.function_key, strategy = strategy.name(), "Created execution strategy");
        Ok(strategy)
    }

    fn registered_handler(
        &self,
        name: &str,
    ) -> Result<Arc<dyn crate::handler::HandlerFactory>, RunError> {
        self.inner
            .handlers
            .get(name)
            .ok_or_else(|| RunError::HandlerNotFound(name.to_string()))
    }

    /// Invoke a function and wait for its reply
    pub async fn invoke(&self, function_key: &str, event: Value) -> Reply {
        let Some(config) = self.get_function(function_key) else {
            warn!(function = %function_key, "Invocation of unknown function");
            let error = EmulatorError::new(
                ErrorCode::FunctionNotFound,
                format!("Function not found: {}", function_key),
            );
            return Reply::from_error(&error);
        };

        let strategy = match self.strategy_for(&config) {
            Ok(strategy) => strategy,
            Err(e) => {
                warn!(function = %function_key, error = %e, "No execution strategy");
                return reply::normalize(Err(e.into_handler_error()));
            }
        };

        let invocation = Arc::new(Invocation::new(function_key, config.timeout));
        let context = ExecutionContext::new(&config, &invocation.request_id, invocation.deadline_ms);

        info!(
            function = %function_key,
            request_id = %invocation.request_id,
            executor = strategy.name(),
            "Invoking function"
        );

        let (tx, mut rx) = oneshot::channel();
        let arm = invocation.clone();
        tokio::spawn(async move {
            let outcome = strategy.run(event, context).await;
            if arm.settle() {
                let _ = tx.send(outcome);
            } else {
                debug!(
                    function = %arm.function_key,
                    request_id = %arm.request_id,
                    succeeded = outcome.is_ok(),
                    "Discarding result that arrived after the timeout"
                );
            }
        });

        let reply = tokio::select! {
            outcome = &mut rx => finish(&invocation, outcome),
            () = tokio::time::sleep_until(invocation.deadline) => {
                if invocation.settle() {
                    warn!(
                        function = %function_key,
                        request_id = %invocation.request_id,
                        timeout_ms = config.timeout.as_millis() as u64,
                        "Function timed out"
                    );
                    reply::timeout_reply(function_key, config.timeout)
                } else {
                    // The execution arm claimed the settlement as the timer fired.
                    finish(&invocation, rx.await)
                }
            }
        };

        info!(
            function = %function_key,
            request_id = %invocation.request_id,
            status = reply.status_code,
            "Invocation finished"
        );

        reply
    }

    /// Invoke with an explicit invocation type
    pub async fn invoke_with_type(
        &self,
        function_key: &str,
        event: Value,
        invocation_type: InvocationType,
    ) -> Reply {
        match invocation_type {
            InvocationType::RequestResponse => self.invoke(function_key, event).await,
            InvocationType::Event => {
                if self.get_function(function_key).is_none() {
                    return self.invoke(function_key, event).await;
                }

                let dispatcher = self.clone();
                let key = function_key.to_string();
                tokio::spawn(async move {
                    dispatcher.invoke(&key, event).await;
                });
                Reply::empty(202)
            }
            InvocationType::DryRun => {
                let Some(config) = self.get_function(function_key) else {
                    return self.invoke(function_key, event).await;
                };
                match self.strategy_for(&config) {
                    Ok(_) => Reply::empty(204),
                    Err(e) => reply::normalize(Err(e.into_handler_error())),
                }
            }
        }
    }

    /// Release every strategy's resources: stop containers, retire workers.
    /// In-flight invocations are not waited for.
    pub async fn cleanup(&self) {
        let keys: Vec<String> = self
            .inner
            .strategies
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for key in keys {
            if let Some((_, strategy)) = self.inner.strategies.remove(&key) {
                debug!(function = %key, strategy = strategy.name(), "Cleaning up strategy");
                strategy.cleanup().await;
            }
        }
    }
}

fn finish(
    invocation: &Invocation,
    outcome: Result<Result<Value, RunError>, oneshot::error::RecvError>,
) -> Reply {
    match outcome {
        Ok(Ok(value)) => reply::normalize(Ok(value)),
        Ok(Err(e)) => {
            debug!(
                function = %invocation.function_key,
                request_id = %invocation.request_id,
                error = %e,
                "Function failed"
            );
            reply::normalize(Err(e.into_handler_error()))
        }
        Err(_) => {
            // The execution task died without reporting.
            invocation.settle();
            reply::normalize(Err(HandlerError::bare(
                "Runtime.ExitError",
                "execution ended without a result",
            )))
        }
    }
}
