//! Client contracts for the four execution backends a chunk can dispatch
//! to. The reactor only ever talks to these traits; the bundled
//! implementations in [bus] publish command events onto the event bus, and
//! deployments fronting a different execution fabric provide their own.

pub mod bus;

use crate::reactor::Kwargs;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    /// A client asked for the process to exit. The reactor never honors
    /// this: it is downgraded to a logged warning at the dispatch boundary.
    #[error("Client requested a process exit: {0}")]
    ExitRequested(String),

    #[error("Failed to construct client: {0}")]
    Construction(String),

    #[error("Call failed: {0}")]
    CallFailed(String),
}

/// Targets execution modules at remote minions. Submission is asynchronous
/// fire-and-forget: the call returns once the command is published, not once
/// the remote action completes.
#[async_trait]
pub trait LocalClient: Send + Sync {
    async fn cmd_async(
        &self,
        target: &str,
        fun: &str,
        args: &[Value],
        kwargs: &Kwargs,
    ) -> Result<(), ClientError>;
}

/// Executes runner modules. Invoked from the worker pool.
#[async_trait]
pub trait RunnerClient: Send + Sync {
    async fn low(&self, fun: &str, kwargs: Kwargs) -> Result<(), ClientError>;
}

/// Executes wheel modules. Invoked from the worker pool.
#[async_trait]
pub trait WheelClient: Send + Sync {
    async fn low(&self, fun: &str, kwargs: Kwargs) -> Result<(), ClientError>;
}

/// Executes a function synchronously in the local calling context.
pub trait CallerClient: Send + Sync {
    fn call(&self, fun: &str, args: &[Value]) -> Result<(), ClientError>;
}

/// Constructs backend clients on demand. The dispatch layer caches what the
/// factory returns and rebuilds each client when its cache entry expires, so
/// construction may be arbitrarily expensive.
pub trait ClientFactory: Send + Sync {
    fn local(&self) -> Result<Arc<dyn LocalClient>, ClientError>;
    fn runner(&self) -> Result<Arc<dyn RunnerClient>, ClientError>;
    fn wheel(&self) -> Result<Arc<dyn WheelClient>, ClientError>;
    fn caller(&self) -> Result<Arc<dyn CallerClient>, ClientError>;
}
