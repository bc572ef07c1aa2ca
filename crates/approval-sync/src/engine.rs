//! Fully wired engine: event router, job runner and worker pool.

use std::sync::Arc;

use approval_state::ApprovalStore;

use crate::config::{DispatcherConfig, ReconciliationConfig};
use crate::dispatch::{JobDispatcher, QueueDispatcher, WorkerPool, WorkerStats};
use crate::error::Result;
use crate::events::{EventRouter, PolicyEvent};
use crate::fanout::FindingsFanout;
use crate::jobs::{EvidenceSources, JobRunner, SyncJob};
use crate::metrics::METRICS;
use crate::notify::{ApprovalSignal, CommentNotifier};
use crate::reconcile::Reconciler;

/// Collaborators the engine writes to.
#[derive(Clone)]
pub struct Outputs {
    pub store: Arc<dyn ApprovalStore>,
    pub notifier: Arc<dyn CommentNotifier>,
    pub signal: Arc<dyn ApprovalSignal>,
}

pub struct Engine {
    router: EventRouter,
    dispatcher: QueueDispatcher,
    pool: WorkerPool,
}

impl Engine {
    /// Wire everything together and start the worker pool.
    pub fn start(
        sources: EvidenceSources,
        outputs: Outputs,
        config: ReconciliationConfig,
        dispatcher_config: DispatcherConfig,
    ) -> Self {
        let reconciler = Reconciler::new(outputs.store, outputs.notifier, outputs.signal);
        let runner = Arc::new(JobRunner::new(sources.clone(), reconciler, config));
        let (dispatcher, pool) = QueueDispatcher::start(runner, dispatcher_config);

        let shared: Arc<dyn JobDispatcher> = Arc::new(dispatcher.clone());
        let fanout = FindingsFanout::new(sources, shared.clone(), config);
        Self {
            router: EventRouter::new(fanout, shared),
            dispatcher,
            pool,
        }
    }

    pub async fn submit(&self, event: PolicyEvent) -> Result<Vec<SyncJob>> {
        self.router.route(event).await
    }

    /// Stop intake, drain the queue and flush metrics.
    pub async fn shutdown(self) -> WorkerStats {
        self.dispatcher.close().await;
        let stats = self.pool.join().await;
        METRICS.flush();
        stats
    }
}
