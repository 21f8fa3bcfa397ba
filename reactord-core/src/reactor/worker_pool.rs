//! A fixed-size pool of worker tasks pulling from a bounded queue. Runner
//! and wheel dispatches are submitted here so slow backend calls never stall
//! the reactor's event loop. Submission is non-blocking: when the queue is
//! at its high-water mark the task is rejected and the caller decides what
//! to log. There is no drain protocol; tasks still queued when the process
//! exits are abandoned.

use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tracing::{info, instrument};

pub type PoolTask = BoxFuture<'static, ()>;

pub struct WorkerPool {
    sender: mpsc::Sender<PoolTask>,
}

#[derive(Error, Debug)]
pub enum PoolSubmitError {
    #[error("The worker queue is at its high-water mark")]
    QueueFull,

    #[error("The worker pool is no longer running")]
    PoolClosed,
}

/// Starts `workers` worker tasks sharing one queue bounded at `queue_hwm`
/// entries. Both values are clamped to at least one.
pub fn start_worker_pool(workers: usize, queue_hwm: usize) -> WorkerPool {
    let (sender, receiver) = mpsc::channel(queue_hwm.max(1));
    let receiver = Arc::new(Mutex::new(receiver));

    for worker in 0..workers.max(1) {
        tokio::spawn(run_worker(worker, receiver.clone()));
    }

    WorkerPool { sender }
}

impl WorkerPool {
    pub fn try_submit(&self, task: PoolTask) -> Result<(), PoolSubmitError> {
        self.sender.try_send(task).map_err(|error| match error {
            TrySendError::Full(_) => PoolSubmitError::QueueFull,
            TrySendError::Closed(_) => PoolSubmitError::PoolClosed,
        })
    }
}

#[instrument(name = "Pool Worker Execution", skip(receiver))]
async fn run_worker(worker: usize, receiver: Arc<Mutex<mpsc::Receiver<PoolTask>>>) {
    info!("Starting pool worker");

    loop {
        // The lock is only held while pulling the next task, never while
        // running it, so other workers keep draining the queue.
        let task = receiver.lock().await.recv().await;
        match task {
            Some(task) => task.await,
            None => break,
        }
    }

    info!("Pool worker closing");
}
