//! Worker thread execution
//!
//! Each execution unit is a dedicated OS thread driving its own
//! current-thread tokio runtime and owning one handler instance. Jobs are
//! handed over a channel and run as tasks on that runtime.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::context::ExecutionContext;
use crate::function::WorkerReuse;
use crate::handler::HandlerFactory;

use super::in_process::execute;
use super::{ExecutionStrategy, RunError};

struct Job {
    event: Value,
    context: ExecutionContext,
    reply: oneshot::Sender<Result<Value, RunError>>,
}

/// One execution unit
struct Worker {
    id: usize,
    tx: mpsc::UnboundedSender<Job>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn spawn(name: &str, id: usize, factory: Arc<dyn HandlerFactory>) -> Result<Self, RunError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let thread_name = format!("localfn-worker-{}-{}", name, id);

        let thread = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(worker = %thread_name, error = %e, "Failed to build worker runtime");
                        return;
                    }
                };

                let handler = factory.create();
                runtime.block_on(async move {
                    // Jobs run as tasks on this thread so a handler that never
                    // settles does not hold up the ones queued behind it.
                    let mut running = JoinSet::new();
                    loop {
                        tokio::select! {
                            job = rx.recv() => {
                                let Some(job) = job else { break };
                                let handler = handler.clone();
                                running.spawn(async move {
                                    let result = execute(handler, job.event, job.context).await;
                                    // The dispatcher may have stopped waiting.
                                    let _ = job.reply.send(result);
                                });
                            }
                            Some(_) = running.join_next(), if !running.is_empty() => {}
                        }
                    }
                    while running.join_next().await.is_some() {}
                });

                debug!(worker = %thread_name, "Worker stopped");
            })
            .map_err(|e| RunError::Runtime(format!("failed to spawn worker thread: {}", e)))?;

        Ok(Self {
            id,
            tx,
            thread: Some(thread),
        })
    }

    /// Hand a job to the unit. Gives the job back if the unit is gone.
    fn submit(&self, job: Job) -> Result<(), Job> {
        self.tx.send(job).map_err(|e| e.0)
    }

    /// Close the job channel. The thread exits once its running jobs are done;
    /// a handler that never finishes keeps its thread, since threads cannot
    /// be interrupted.
    fn retire(mut self) {
        drop(self.tx);
        if let Some(thread) = self.thread.take() {
            if thread.is_finished() {
                let _ = thread.join();
            }
        }
    }
}

/// Runs a registered handler on worker threads
pub struct WorkerStrategy {
    function_key: String,
    factory: Arc<dyn HandlerFactory>,
    reuse: WorkerReuse,
    warm: Mutex<Option<Worker>>,
    spawned: AtomicUsize,
}

impl WorkerStrategy {
    pub fn new(
        function_key: impl Into<String>,
        factory: Arc<dyn HandlerFactory>,
        reuse: WorkerReuse,
    ) -> Self {
        Self {
            function_key: function_key.into(),
            factory,
            reuse,
            warm: Mutex::new(None),
            spawned: AtomicUsize::new(0),
        }
    }

    /// Number of execution units started so far
    pub fn units_started(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    fn spawn_worker(&self) -> Result<Worker, RunError> {
        let id = self.spawned.fetch_add(1, Ordering::SeqCst) + 1;
        let worker = Worker::spawn(&self.function_key, id, self.factory.clone())?;
        info!(function = %self.function_key, worker = id, "Started worker");
        Ok(worker)
    }

    async fn submit_warm(&self, job: Job) -> Result<(), RunError> {
        let mut warm = self.warm.lock().await;

        let job = match warm.as_ref() {
            Some(worker) => match worker.submit(job) {
                Ok(()) => return Ok(()),
                Err(job) => {
                    warn!(function = %self.function_key, worker = worker.id, "Worker is gone, replacing it");
                    job
                }
            },
            None => job,
        };

        let worker = self.spawn_worker()?;
        let result = worker
            .submit(job)
            .map_err(|_| RunError::Runtime("worker exited before accepting the job".to_string()));
        if let Some(previous) = warm.replace(worker) {
            previous.retire();
        }
        result
    }
}

#[async_trait]
impl ExecutionStrategy for WorkerStrategy {
    fn name(&self) -> &'static str {
        "worker"
    }

    async fn run(&self, event: Value, context: ExecutionContext) -> Result<Value, RunError> {
        let (reply, rx) = oneshot::channel();
        let job = Job {
            event,
            context,
            reply,
        };

        match self.reuse {
            WorkerReuse::Warm => self.submit_warm(job).await?,
            WorkerReuse::PerInvocation => {
                let worker = self.spawn_worker()?;
                worker
                    .submit(job)
                    .map_err(|_| RunError::Runtime("worker exited before accepting the job".to_string()))?;
                // The closed channel ends the thread after this one job.
                worker.retire();
            }
        }

        rx.await
            .unwrap_or_else(|_| Err(RunError::Runtime("worker exited without replying".to_string())))
    }

    async fn cleanup(&self) {
        if let Some(worker) = self.warm.lock().await.take() {
            debug!(function = %self.function_key, worker = worker.id, "Retiring worker");
            worker.retire();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::FunctionConfig;
    use crate::handler::{handler_fn, Handler};
    use localfn_core::RequestId;
    use serde_json::json;

    fn context() -> ExecutionContext {
        let config = FunctionConfig::new("counter", "counter");
        ExecutionContext::new(
            &config,
            &RequestId::new(),
            chrono::Utc::now().timestamp_millis() + 1000,
        )
    }

    /// Each instance counts its own invocations and reports its thread
    fn counter_factory() -> Arc<dyn HandlerFactory> {
        Arc::new(|| -> Arc<dyn Handler> {
            let count = Arc::new(AtomicUsize::new(0));
            Arc::new(handler_fn(move |_, _| {
                let n = count.fetch_add(1, Ordering::SeqCst) + 1;
                let thread = thread::current().name().unwrap_or_default().to_string();
                async move { Ok(json!({"count": n, "thread": thread})) }
            }))
        })
    }

    #[tokio::test]
    async fn test_warm_worker_keeps_state() {
        let strategy = WorkerStrategy::new("counter", counter_factory(), WorkerReuse::Warm);

        let first = strategy.run(json!(null), context()).await.unwrap();
        let second = strategy.run(json!(null), context()).await.unwrap();

        assert_eq!(first["count"], 1);
        assert_eq!(second["count"], 2);
        assert_eq!(first["thread"], "localfn-worker-counter-1");
        assert_eq!(strategy.units_started(), 1);

        strategy.cleanup().await;
        strategy.cleanup().await;
    }

    #[tokio::test]
    async fn test_per_invocation_workers_start_fresh() {
        let strategy = WorkerStrategy::new("counter", counter_factory(), WorkerReuse::PerInvocation);

        let first = strategy.run(json!(null), context()).await.unwrap();
        let second = strategy.run(json!(null), context()).await.unwrap();

        assert_eq!(first["count"], 1);
        assert_eq!(second["count"], 1);
        assert_eq!(second["thread"], "localfn-worker-counter-2");
        assert_eq!(strategy.units_started(), 2);
    }

    #[tokio::test]
    async fn test_warm_worker_restarts_after_cleanup() {
        let strategy = WorkerStrategy::new("counter", counter_factory(), WorkerReuse::Warm);

        strategy.run(json!(null), context()).await.unwrap();
        strategy.cleanup().await;
        let after = strategy.run(json!(null), context()).await.unwrap();

        assert_eq!(after["count"], 1);
        assert_eq!(strategy.units_started(), 2);
    }

    #[tokio::test]
    async fn test_stuck_job_does_not_block_warm_worker() {
        let factory: Arc<dyn HandlerFactory> = Arc::new(|| -> Arc<dyn Handler> {
            let calls = Arc::new(AtomicUsize::new(0));
            Arc::new(handler_fn(move |_, _| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        std::future::pending::<()>().await;
                    }
                    Ok(json!({"call": n}))
                }
            }))
        });
        let strategy = Arc::new(WorkerStrategy::new("stuck", factory, WorkerReuse::Warm));

        let stuck = {
            let strategy = strategy.clone();
            tokio::spawn(async move { strategy.run(json!(null), context()).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let second = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            strategy.run(json!(null), context()),
        )
        .await
        .expect("second invocation was blocked")
        .unwrap();

        assert_eq!(second["call"], 2);
        assert_eq!(strategy.units_started(), 1);
        stuck.abort();
    }
}
