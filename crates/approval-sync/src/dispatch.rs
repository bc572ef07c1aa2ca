//! At-least-once job queue.
//!
//! [`QueueDispatcher`] feeds a tokio channel drained by a [`WorkerPool`].
//! A job whose idempotency key is already waiting in the queue is dropped;
//! once a worker picks it up, the key is released so a fresh copy can be
//! queued while it runs. Failed jobs are retried in place with capped
//! exponential backoff.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{DispatcherConfig, RetryPolicy};
use crate::error::{Result, SyncError};
use crate::jobs::{JobHandler, SyncJob};
use crate::metrics::METRICS;
use crate::obs;

/// Schedules jobs for asynchronous execution.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, job: SyncJob) -> Result<()>;
}

/// Sending half of the queue.
#[derive(Clone)]
pub struct QueueDispatcher {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<SyncJob>>>>,
    queued: Arc<Mutex<HashSet<String>>>,
}

/// Workers draining the queue.
pub struct WorkerPool {
    workers: Vec<JoinHandle<WorkerStats>>,
}

/// Totals across all workers once the queue is drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub succeeded: u64,
    pub failed: u64,
    pub retries: u64,
}

impl QueueDispatcher {
    /// Start `config.workers` workers running jobs through `handler`.
    pub fn start(handler: Arc<dyn JobHandler>, config: DispatcherConfig) -> (Self, WorkerPool) {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        let queued = Arc::new(Mutex::new(HashSet::new()));

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    rx.clone(),
                    queued.clone(),
                    handler.clone(),
                    config.retry,
                ))
            })
            .collect();
        info!(workers = config.workers.max(1), "job queue started");

        let dispatcher = Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            queued,
        };
        (dispatcher, WorkerPool { workers })
    }

    /// Stop accepting jobs. Queued jobs still run.
    pub async fn close(&self) {
        self.tx.lock().await.take();
    }
}

#[async_trait]
impl JobDispatcher for QueueDispatcher {
    async fn dispatch(&self, job: SyncJob) -> Result<()> {
        let tx = self.tx.lock().await;
        let Some(tx) = tx.as_ref() else {
            return Err(SyncError::Dispatch(format!("queue closed, dropping {job}")));
        };

        let key = job.idempotency_key();
        if !self.queued.lock().await.insert(key.clone()) {
            debug!(%job, "job already queued");
            return Ok(());
        }
        if tx.send(job).is_err() {
            self.queued.lock().await.remove(&key);
            return Err(SyncError::Dispatch(format!("no workers left for {job}")));
        }
        METRICS.inc_jobs_dispatched();
        Ok(())
    }
}

impl WorkerPool {
    /// Wait for every worker to finish. Returns once the dispatcher has been
    /// closed and the queue is empty.
    /// A worker that panicked is logged and left out of the totals.
    pub async fn join(self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for (worker, res) in join_all(self.workers).await.into_iter().enumerate() {
            match res {
                Ok(stats) => {
                    total.succeeded += stats.succeeded;
                    total.failed += stats.failed;
                    total.retries += stats.retries;
                }
                Err(e) => obs::emit_worker_lost(worker, &e),
            }
        }
        total
    }
}

async fn run_worker(
    worker: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<SyncJob>>>,
    queued: Arc<Mutex<HashSet<String>>>,
    handler: Arc<dyn JobHandler>,
    retry: RetryPolicy,
) -> WorkerStats {
    let mut stats = WorkerStats::default();
    loop {
        let next = rx.lock().await.recv().await;
        let Some(job) = next else {
            debug!(worker, "queue drained");
            return stats;
        };
        let key = job.idempotency_key();
        queued.lock().await.remove(&key);

        let mut attempt = 1;
        loop {
            match handler.handle(job).await {
                Ok(()) => {
                    stats.succeeded += 1;
                    break;
                }
                Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                    obs::emit_job_retry(&key, attempt, &e);
                    METRICS.inc_jobs_retried();
                    stats.retries += 1;
                    tokio::time::sleep(retry.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    obs::emit_job_exhausted(&key, attempt, &e);
                    METRICS.inc_jobs_exhausted();
                    stats.failed += 1;
                    break;
                }
            }
        }
    }
}
