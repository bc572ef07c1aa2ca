//! Findings fan-out: turns a finished pipeline into findings jobs.
//!
//! The expensive per-rule evaluation is deferred to the dispatched jobs.
//! Besides the merge requests whose head is the pipeline, the fan-out also
//! re-queues merge requests *targeting* the pipeline's ref when it is the
//! latest on that ref: a target-branch pipeline that finishes after the
//! source-branch one changes the baseline those merge requests compare to.

use std::collections::BTreeSet;
use std::sync::Arc;

use approval_state::{Pipeline, PipelineId, StorageError};
use serde::Serialize;
use tracing::debug;

use crate::config::ReconciliationConfig;
use crate::dispatch::JobDispatcher;
use crate::error::{Result, SyncError};
use crate::jobs::{EvidenceSources, SyncJob};
use crate::obs;
use crate::sync::SkipReason;

/// Parent links followed before giving up on finding a root.
const MAX_PIPELINE_DEPTH: usize = 32;

/// What the fan-out dispatched for one pipeline event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FanoutReport {
    /// The pipeline evaluated (the root ancestor when aggregating)
    pub pipeline_id: PipelineId,
    pub skipped: Option<SkipReason>,
    pub head_jobs: Vec<SyncJob>,
    pub target_jobs: Vec<SyncJob>,
}

impl FanoutReport {
    fn skipped(pipeline_id: PipelineId, reason: SkipReason) -> Self {
        Self {
            pipeline_id,
            skipped: Some(reason),
            head_jobs: Vec::new(),
            target_jobs: Vec::new(),
        }
    }

    pub fn jobs(&self) -> impl Iterator<Item = &SyncJob> {
        self.head_jobs.iter().chain(self.target_jobs.iter())
    }
}

pub struct FindingsFanout {
    sources: EvidenceSources,
    dispatcher: Arc<dyn JobDispatcher>,
    config: ReconciliationConfig,
}

impl FindingsFanout {
    pub fn new(
        sources: EvidenceSources,
        dispatcher: Arc<dyn JobDispatcher>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            sources,
            dispatcher,
            config,
        }
    }

    /// Handle `PipelineCompleted` / `PipelineHasFindings`.
    pub async fn on_pipeline_finished(&self, pipeline_id: PipelineId) -> Result<FanoutReport> {
        let mut pipeline = self.load(pipeline_id).await?;
        if self.config.aggregate_child_pipelines {
            pipeline = self.root_ancestor(pipeline).await?;
        }

        if !pipeline.source.is_ci_or_security_orchestration() {
            obs::emit_sync_skipped_pipeline(pipeline.id, SkipReason::IgnoredSource.as_str());
            return Ok(FanoutReport::skipped(pipeline.id, SkipReason::IgnoredSource));
        }

        let ready = pipeline.status.is_complete(self.config.manual_is_terminal)
            || self
                .sources
                .evidence
                .has_security_findings(pipeline.id, self.config.aggregate_child_pipelines)
                .await?;
        if !ready {
            obs::emit_sync_skipped_pipeline(pipeline.id, SkipReason::PipelineNotReady.as_str());
            return Ok(FanoutReport::skipped(pipeline.id, SkipReason::PipelineNotReady));
        }

        let mut head_jobs = Vec::new();
        for mr in self
            .sources
            .merge_requests
            .opened_by_head_pipeline(pipeline.id)
            .await?
        {
            let job = SyncJob::Findings {
                pipeline_id: pipeline.id,
                merge_request_id: mr.id,
            };
            self.dispatcher.dispatch(job).await?;
            head_jobs.push(job);
        }

        let mut target_jobs = Vec::new();
        let latest = self
            .sources
            .pipelines
            .latest_for_ref(pipeline.project_id, &pipeline.ref_name)
            .await?;
        if latest.as_ref().map(|p| p.id) == Some(pipeline.id) {
            for mr in self
                .sources
                .merge_requests
                .opened_by_target_branch(pipeline.project_id, &pipeline.ref_name)
                .await?
            {
                let Some(head_pipeline_id) = mr.head_pipeline_id else {
                    continue;
                };
                let job = SyncJob::Findings {
                    pipeline_id: head_pipeline_id,
                    merge_request_id: mr.id,
                };
                self.dispatcher.dispatch(job).await?;
                target_jobs.push(job);
            }
        }

        obs::emit_fanout_dispatched(pipeline.id, head_jobs.len(), target_jobs.len());
        Ok(FanoutReport {
            pipeline_id: pipeline.id,
            skipped: None,
            head_jobs,
            target_jobs,
        })
    }

    async fn load(&self, id: PipelineId) -> Result<Pipeline> {
        match self.sources.pipelines.pipeline(id).await {
            Ok(pipeline) => Ok(pipeline),
            Err(StorageError::NotFound { .. }) => Err(SyncError::PipelineNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Follow parent links to the top-level pipeline. Stops at a missing
    /// parent, a cycle, or after `MAX_PIPELINE_DEPTH` hops.
    async fn root_ancestor(&self, pipeline: Pipeline) -> Result<Pipeline> {
        let mut seen = BTreeSet::from([pipeline.id]);
        let mut current = pipeline;
        while let Some(parent_id) = current.parent_id {
            if seen.len() > MAX_PIPELINE_DEPTH || !seen.insert(parent_id) {
                debug!(pipeline_id = %current.id, "pipeline ancestry too deep or cyclic");
                break;
            }
            match self.sources.pipelines.pipeline(parent_id).await {
                Ok(parent) => current = parent,
                Err(StorageError::NotFound { .. }) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(current)
    }
}
