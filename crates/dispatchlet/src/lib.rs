//! dispatchlet: a multi-process RPC dispatcher.
//!
//! A parent process owns a fixed pool of worker child processes; calls to
//! named methods on named services are executed inside some worker and the
//! result comes back as if the call had been local. Parent and workers speak
//! a framed JSON protocol over the workers' stdin/stdout.
//!
//! The parent side is [`Dispatcher`]; the worker side is
//! [`worker::run_worker`], fed by a [`ServiceInitializer`] that registers the
//! services a worker can execute. A single binary can play both roles by
//! branching on [`WorkerArgs::from_env`].

mod correlation;
mod pending;
mod worker_log;

pub mod bridge;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod options;
pub mod provider;
pub mod proxy;
pub mod worker;

pub use dispatcher::{DispatchTask, Dispatcher, ServiceDescriptor};
pub use endpoint::{CurrentExeSpawner, SpawnContext, SpawnedWorker, WorkerSpawner};
pub use error::DispatcherError;
pub use options::{DispatcherOptions, WorkerArgs, WorkerArgsError};
pub use provider::{
    FnInitializer, InitializerError, InvokeError, Service, ServiceInitializer, ServiceProvider,
};
pub use proxy::ServiceProxy;
pub use worker::run_worker;
