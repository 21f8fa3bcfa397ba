//! Dispatches compiled chunks to their execution backends. Local and caller
//! calls are issued directly from the event loop (their clients are
//! fire-and-forget), runner and wheel calls are submitted to the bounded
//! worker pool. Every failure is contained here: a bad chunk is logged and
//! dropped without affecting its siblings, and a client that asks for a
//! process exit is ignored with a warning.

use crate::clients::{
    CallerClient, ClientError, ClientFactory, LocalClient, RunnerClient, WheelClient,
};
use crate::reactor::worker_pool::{start_worker_pool, WorkerPool};
use crate::reactor::{Backend, Chunk, REACTOR_EVENT_USER};
use futures::FutureExt;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

/// Sizing and cache policy for a dispatcher, normally taken from the daemon
/// config.
pub struct DispatchOptions {
    pub worker_threads: usize,
    pub worker_hwm: usize,
    pub client_refresh_interval: Duration,
}

/// What became of one chunk's dispatch. Failures have already been logged by
/// the time a caller sees the outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The call was issued or queued.
    Dispatched,

    /// The call could not be issued; siblings are unaffected.
    Failed,

    /// The client asked for a process exit and was ignored.
    ExitSuppressed,
}

pub struct ReactionDispatcher {
    clients: ClientCache,
    pool: WorkerPool,
}

impl ReactionDispatcher {
    pub fn new(factory: Arc<dyn ClientFactory>, options: &DispatchOptions) -> Self {
        ReactionDispatcher {
            clients: ClientCache::new(factory, options.client_refresh_interval),
            pool: start_worker_pool(options.worker_threads, options.worker_hwm),
        }
    }

    pub async fn run(&self, chunk: &Chunk) -> DispatchOutcome {
        match chunk.backend {
            Backend::Local => self.run_local(chunk).await,
            Backend::Runner | Backend::Wheel => self.run_pooled(chunk),
            Backend::Caller => self.run_caller(chunk),
        }
    }

    async fn run_local(&self, chunk: &Chunk) -> DispatchOutcome {
        let client = match self.clients.local() {
            Ok(client) => client,
            Err(error) => return construction_failed(chunk, &error),
        };

        let target = chunk.target.as_deref().unwrap_or("*");
        let result = client
            .cmd_async(target, &chunk.fun, &chunk.args, &chunk.kwargs)
            .await;

        call_outcome(chunk, result)
    }

    fn run_pooled(&self, chunk: &Chunk) -> DispatchOutcome {
        // Stamp the call with the reactor's identity so the events it causes
        // can be told apart from user activity and do not re-trigger us.
        let mut kwargs = chunk.kwargs.clone();
        kwargs.insert(
            "__user__".to_string(),
            Value::String(REACTOR_EVENT_USER.to_string()),
        );

        let fun = chunk.fun.clone();
        let name = chunk.name.clone();
        let backend = chunk.backend;

        let task = match backend {
            Backend::Runner => {
                let client = match self.clients.runner() {
                    Ok(client) => client,
                    Err(error) => return construction_failed(chunk, &error),
                };

                async move {
                    let result = client.low(&fun, kwargs).await;
                    log_pooled_result(backend, &name, result);
                }
                .boxed()
            }

            Backend::Wheel => {
                let client = match self.clients.wheel() {
                    Ok(client) => client,
                    Err(error) => return construction_failed(chunk, &error),
                };

                async move {
                    let result = client.low(&fun, kwargs).await;
                    log_pooled_result(backend, &name, result);
                }
                .boxed()
            }

            _ => return DispatchOutcome::Failed,
        };

        match self.pool.try_submit(task) {
            Ok(()) => DispatchOutcome::Dispatched,
            Err(error) => {
                warn!(
                    backend = backend.as_str(),
                    chunk = %chunk.name,
                    "Could not queue {} call for '{}': {}", backend.as_str(), chunk.name, error,
                );

                DispatchOutcome::Failed
            }
        }
    }

    fn run_caller(&self, chunk: &Chunk) -> DispatchOutcome {
        let client = match self.clients.caller() {
            Ok(client) => client,
            Err(error) => return construction_failed(chunk, &error),
        };

        // Caller functions take their positional arguments from a dedicated
        // `args` kwarg.
        let args = match chunk.kwargs.get("args") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };

        call_outcome(chunk, client.call(&chunk.fun, &args))
    }
}

fn construction_failed(chunk: &Chunk, error: &ClientError) -> DispatchOutcome {
    warn!(
        backend = chunk.backend.as_str(),
        chunk = %chunk.name,
        "Failed to construct {} client for '{}': {}", chunk.backend.as_str(), chunk.name, error,
    );

    DispatchOutcome::Failed
}

fn call_outcome(chunk: &Chunk, result: Result<(), ClientError>) -> DispatchOutcome {
    match result {
        Ok(()) => DispatchOutcome::Dispatched,
        Err(ClientError::ExitRequested(reason)) => {
            warn!(
                backend = chunk.backend.as_str(),
                chunk = %chunk.name,
                "Attempt to exit reactor from '{}'. Ignored: {}", chunk.name, reason,
            );

            DispatchOutcome::ExitSuppressed
        }

        Err(error) => {
            warn!(
                backend = chunk.backend.as_str(),
                chunk = %chunk.name,
                "Exception caught by reactor running '{}': {}", chunk.name, error,
            );

            DispatchOutcome::Failed
        }
    }
}

fn log_pooled_result(backend: Backend, name: &str, result: Result<(), ClientError>) {
    match result {
        Ok(()) => (),
        Err(ClientError::ExitRequested(reason)) => {
            warn!(
                backend = backend.as_str(),
                chunk = %name,
                "Attempt to exit reactor by {}. Ignored: {}", backend.as_str(), reason,
            );
        }

        Err(error) => {
            warn!(
                backend = backend.as_str(),
                chunk = %name,
                "Exception caught by reactor running '{}': {}", name, error,
            );
        }
    }
}

/// One lazily-constructed client per backend, rebuilt once its entry is
/// older than the refresh interval. First construction may race between the
/// event loop and pool workers, so every slot is mutex-guarded.
struct ClientCache {
    factory: Arc<dyn ClientFactory>,
    refresh_interval: Duration,
    local: CachedSlot<dyn LocalClient>,
    runner: CachedSlot<dyn RunnerClient>,
    wheel: CachedSlot<dyn WheelClient>,
    caller: CachedSlot<dyn CallerClient>,
}

impl ClientCache {
    fn new(factory: Arc<dyn ClientFactory>, refresh_interval: Duration) -> Self {
        ClientCache {
            factory,
            refresh_interval,
            local: CachedSlot::new(),
            runner: CachedSlot::new(),
            wheel: CachedSlot::new(),
            caller: CachedSlot::new(),
        }
    }

    fn local(&self) -> Result<Arc<dyn LocalClient>, ClientError> {
        self.local
            .get_or_create(self.refresh_interval, || self.factory.local())
    }

    fn runner(&self) -> Result<Arc<dyn RunnerClient>, ClientError> {
        self.runner
            .get_or_create(self.refresh_interval, || self.factory.runner())
    }

    fn wheel(&self) -> Result<Arc<dyn WheelClient>, ClientError> {
        self.wheel
            .get_or_create(self.refresh_interval, || self.factory.wheel())
    }

    fn caller(&self) -> Result<Arc<dyn CallerClient>, ClientError> {
        self.caller
            .get_or_create(self.refresh_interval, || self.factory.caller())
    }
}

struct CachedSlot<T: ?Sized> {
    slot: Mutex<Option<(Arc<T>, Instant)>>,
}

impl<T: ?Sized> CachedSlot<T> {
    fn new() -> Self {
        CachedSlot {
            slot: Mutex::new(None),
        }
    }

    fn get_or_create(
        &self,
        refresh_interval: Duration,
        create: impl FnOnce() -> Result<Arc<T>, ClientError>,
    ) -> Result<Arc<T>, ClientError> {
        let mut guard = match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some((client, created)) = guard.as_ref() {
            if created.elapsed() < refresh_interval {
                return Ok(client.clone());
            }
        }

        let client = create()?;
        *guard = Some((client.clone(), Instant::now()));
        Ok(client)
    }
}
