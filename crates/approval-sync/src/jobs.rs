//! Reconciliation jobs and the runner that executes them.
//!
//! Jobs are delivered at least once, so every job must be safe to run
//! again: each one recomputes its verdicts from evidence instead of applying
//! deltas.

use std::fmt;
use std::sync::Arc;

use approval_state::{EvidenceQuery, MergeRequestId, MergeRequestReader, PipelineId, PipelineReader};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ReconciliationConfig;
use crate::error::Result;
use crate::reconcile::Reconciler;
use crate::sync::{
    CommitSignatureEvaluator, PipelineFindingsEvaluator, PreexistingStateEvaluator,
    RuleSynchronizer, SyncOutcome, SyncTarget,
};

/// One unit of reconciliation work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum SyncJob {
    /// Evaluate findings and license rules of a merge request against a pipeline
    Findings {
        pipeline_id: PipelineId,
        merge_request_id: MergeRequestId,
    },
    /// Re-check commit signatures for `any_merge_request` rules
    AnyMergeRequest { merge_request_id: MergeRequestId },
    /// Re-count pre-existing vulnerabilities for `scan_finding` rules
    PreexistingStates { merge_request_id: MergeRequestId },
}

impl SyncJob {
    pub fn merge_request_id(&self) -> MergeRequestId {
        match self {
            SyncJob::Findings {
                merge_request_id, ..
            }
            | SyncJob::AnyMergeRequest { merge_request_id }
            | SyncJob::PreexistingStates { merge_request_id } => *merge_request_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SyncJob::Findings { .. } => "findings",
            SyncJob::AnyMergeRequest { .. } => "any_merge_request",
            SyncJob::PreexistingStates { .. } => "pre_existing_states",
        }
    }

    /// Stable key: two jobs with the same key do the same work.
    pub fn idempotency_key(&self) -> String {
        let canonical = match self {
            SyncJob::Findings {
                pipeline_id,
                merge_request_id,
            } => format!("{}:{}:{}", self.name(), pipeline_id, merge_request_id),
            SyncJob::AnyMergeRequest { merge_request_id }
            | SyncJob::PreexistingStates { merge_request_id } => {
                format!("{}:-:{}", self.name(), merge_request_id)
            }
        };
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }
}

impl fmt::Display for SyncJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncJob::Findings {
                pipeline_id,
                merge_request_id,
            } => write!(f, "findings(pipeline={pipeline_id}, mr={merge_request_id})"),
            other => write!(f, "{}(mr={})", other.name(), other.merge_request_id()),
        }
    }
}

/// Executes jobs pulled off a queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: SyncJob) -> Result<()>;
}

/// Read-side collaborators every synchronizer draws evidence from.
#[derive(Clone)]
pub struct EvidenceSources {
    pub merge_requests: Arc<dyn MergeRequestReader>,
    pub pipelines: Arc<dyn PipelineReader>,
    pub evidence: Arc<dyn EvidenceQuery>,
}

/// Routes each job to its synchronizer.
pub struct JobRunner {
    any_merge_request: RuleSynchronizer<CommitSignatureEvaluator>,
    pre_existing: RuleSynchronizer<PreexistingStateEvaluator>,
    findings: RuleSynchronizer<PipelineFindingsEvaluator>,
}

impl JobRunner {
    pub fn new(sources: EvidenceSources, reconciler: Reconciler, config: ReconciliationConfig) -> Self {
        Self {
            any_merge_request: RuleSynchronizer::new(
                CommitSignatureEvaluator::new(sources.merge_requests.clone()),
                sources.merge_requests.clone(),
                reconciler.clone(),
            ),
            pre_existing: RuleSynchronizer::new(
                PreexistingStateEvaluator::new(sources.evidence.clone()),
                sources.merge_requests.clone(),
                reconciler.clone(),
            ),
            findings: RuleSynchronizer::new(
                PipelineFindingsEvaluator::new(sources.pipelines, sources.evidence, config),
                sources.merge_requests,
                reconciler,
            ),
        }
    }

    pub async fn run(&self, job: SyncJob) -> Result<SyncOutcome> {
        match job {
            SyncJob::Findings {
                pipeline_id,
                merge_request_id,
            } => {
                self.findings
                    .sync(SyncTarget::pipeline(pipeline_id, merge_request_id))
                    .await
            }
            SyncJob::AnyMergeRequest { merge_request_id } => {
                self.any_merge_request
                    .sync(SyncTarget::merge_request(merge_request_id))
                    .await
            }
            SyncJob::PreexistingStates { merge_request_id } => {
                self.pre_existing
                    .sync(SyncTarget::merge_request(merge_request_id))
                    .await
            }
        }
    }
}

#[async_trait]
impl JobHandler for JobRunner {
    async fn handle(&self, job: SyncJob) -> Result<()> {
        self.run(job).await.map(|_| ())
    }
}
