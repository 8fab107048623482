use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::debug;
use velorpc_common::{Result, RpcError, WorkerPoolConfig};

/// Bounded pool that runs call pipelines off the caller's task.
///
/// Up to `max_workers` jobs run at once and up to `backlog` more wait for a
/// worker. When both are exhausted the job runs on the caller instead of
/// being rejected.
///
/// The timeout passed to [`WorkerPool::run`] bounds the caller's wait only:
/// a job already handed to a worker keeps running after the caller gives up,
/// and its result is discarded.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Arc<Semaphore>,
    backlog: Arc<Semaphore>,
    caller_runs: AtomicU64,
}

impl WorkerPool {
    pub fn new(config: &WorkerPoolConfig) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
            backlog: Arc::new(Semaphore::new(config.backlog)),
            caller_runs: AtomicU64::new(0),
        }
    }

    /// Runs `job` and waits at most `timeout` for its output.
    ///
    /// # Errors
    ///
    /// - `Timeout` if the output is not ready in time
    /// - `Transport` if the worker task panicked
    pub async fn run<F>(&self, timeout: Duration, job: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let timeout_ms = timeout.as_millis() as u64;

        let handle = if let Ok(worker) = self.workers.clone().try_acquire_owned() {
            tokio::spawn(async move {
                let _worker = worker;
                job.await
            })
        } else if let Ok(slot) = self.backlog.clone().try_acquire_owned() {
            let workers = self.workers.clone();
            tokio::spawn(async move {
                // The pool never closes its semaphores
                let _worker = workers.acquire_owned().await.ok();
                drop(slot);
                job.await
            })
        } else {
            let runs = self.caller_runs.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("Worker pool saturated, running on caller ({} so far)", runs);
            return tokio::time::timeout(timeout, job)
                .await
                .map_err(|_| RpcError::Timeout(timeout_ms));
        };

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(RpcError::Transport(format!("worker task failed: {}", e))),
            Err(_) => Err(RpcError::Timeout(timeout_ms)),
        }
    }

    /// How many jobs ran on their caller because the pool was saturated.
    pub fn caller_runs(&self) -> u64 {
        self.caller_runs.load(Ordering::Relaxed)
    }

    /// Workers currently free.
    pub fn idle_workers(&self) -> usize {
        self.workers.available_permits()
    }
}
