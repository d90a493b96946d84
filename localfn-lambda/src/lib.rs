//! Handler invocation engine for localfn
//!
//! Runs function handlers in-process, on worker threads, as subprocesses or
//! inside Docker sandboxes, enforcing timeouts and normalizing replies. Also
//! hosts the connection registry for WebSocket-style channels and schedule
//! triggers.

pub mod connections;
pub mod context;
pub mod dispatcher;
pub mod docker;
pub mod function;
pub mod handler;
pub mod invocation;
pub mod overrides;
pub mod reply;
pub mod schedule;
pub mod strategy;

pub use connections::{Channel, ChannelError, ChannelItem, ConnectionRegistry, QueueChannel};
pub use context::ExecutionContext;
pub use dispatcher::{Dispatcher, DispatcherError};
pub use docker::{ContainerError, DockerCli, DockerConfig, Sandbox, SandboxEngine, SandboxSpec};
pub use function::{ExecutorMode, FunctionConfig, Runtime, WorkerReuse};
pub use handler::{handler_fn, Handler, HandlerError, HandlerRegistry, HandlerResult};
pub use invocation::InvocationType;
pub use reply::Reply;
pub use schedule::{ScheduleError, ScheduleEventDefinition};
