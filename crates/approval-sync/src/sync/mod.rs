//! Rule synchronizers.
//!
//! Every synchronizer has the same shape: load the merge request, bail out
//! unless it is open, collect the policy-backed rules it owns, evaluate them
//! against evidence, and hand the verdicts to the shared [`Reconciler`].
//! Only the evaluation step differs, so it sits behind [`RuleEvaluator`] and
//! [`RuleSynchronizer`] is generic over it:
//!
//! - [`CommitSignatureEvaluator`]: `any_merge_request` rules vs. commit signatures
//! - [`PreexistingStateEvaluator`]: `scan_finding` rules on pre-existing vulnerabilities only
//! - [`PipelineFindingsEvaluator`]: `scan_finding` rules with newly detected
//!   states and `license_finding` rules vs. one pipeline's findings

pub mod any_merge_request;
pub mod findings;
pub mod pre_existing;

pub use any_merge_request::CommitSignatureEvaluator;
pub use findings::PipelineFindingsEvaluator;
pub use pre_existing::PreexistingStateEvaluator;

use std::fmt;
use std::sync::Arc;

use approval_state::{
    ApprovalRule, MergeRequest, MergeRequestId, MergeRequestReader, PipelineId, RuleKind,
    StorageError,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::error::{Result, SyncError};
use crate::obs;
use crate::reconcile::{Reconciler, RuleVerdict, SyncReport};

/// Why a synchronizer or the fan-out did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Merged, closed or locked by the time the job ran
    MergeRequestNotOpen,
    /// No policy-backed rules of the synchronizer's kinds
    NoRules,
    /// Findings job without a pipeline
    NoPipeline,
    /// The merge request has a newer head pipeline
    StalePipeline,
    /// Still running and no findings yet
    PipelineNotReady,
    /// Pipeline source the policy engine does not evaluate
    IgnoredSource,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MergeRequestNotOpen => "merge_request_not_open",
            SkipReason::NoRules => "no_rules",
            SkipReason::NoPipeline => "no_pipeline",
            SkipReason::StalePipeline => "stale_pipeline",
            SkipReason::PipelineNotReady => "pipeline_not_ready",
            SkipReason::IgnoredSource => "ignored_source",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an evaluator run.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Skip(SkipReason),
    Verdicts(Vec<RuleVerdict>),
}

/// Result of a synchronizer run.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    Reconciled(SyncReport),
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Reconciled(report) => Some(report),
            SyncOutcome::Skipped(_) => None,
        }
    }
}

/// What to synchronize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTarget {
    pub merge_request_id: MergeRequestId,
    /// Set for findings jobs
    pub pipeline_id: Option<PipelineId>,
}

impl SyncTarget {
    pub fn merge_request(merge_request_id: MergeRequestId) -> Self {
        Self {
            merge_request_id,
            pipeline_id: None,
        }
    }

    pub fn pipeline(pipeline_id: PipelineId, merge_request_id: MergeRequestId) -> Self {
        Self {
            merge_request_id,
            pipeline_id: Some(pipeline_id),
        }
    }
}

/// Decides which of a merge request's rules are violated.
#[async_trait]
pub trait RuleEvaluator: Send + Sync {
    /// Short name used in spans and logs.
    fn name(&self) -> &'static str;

    /// Rule kinds this evaluator owns, in notification order.
    fn kinds(&self) -> &'static [RuleKind];

    /// Narrow the owned rules further (e.g. by criteria flags).
    fn in_scope(&self, _rule: &ApprovalRule) -> bool {
        true
    }

    /// Evaluate `rules`, all of which carry criteria and are in scope.
    async fn evaluate(
        &self,
        merge_request: &MergeRequest,
        pipeline_id: Option<PipelineId>,
        rules: Vec<ApprovalRule>,
    ) -> Result<Evaluation>;
}

/// Runs one evaluator through the shared reconciliation sequence.
pub struct RuleSynchronizer<E> {
    evaluator: E,
    merge_requests: Arc<dyn MergeRequestReader>,
    reconciler: Reconciler,
}

impl<E: RuleEvaluator> RuleSynchronizer<E> {
    pub fn new(
        evaluator: E,
        merge_requests: Arc<dyn MergeRequestReader>,
        reconciler: Reconciler,
    ) -> Self {
        Self {
            evaluator,
            merge_requests,
            reconciler,
        }
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    pub async fn sync(&self, target: SyncTarget) -> Result<SyncOutcome> {
        let span = obs::sync_span(target.merge_request_id, self.evaluator.name());
        self.run(target).instrument(span).await
    }

    async fn run(&self, target: SyncTarget) -> Result<SyncOutcome> {
        let merge_request = match self.merge_requests.merge_request(target.merge_request_id).await
        {
            Ok(mr) => mr,
            Err(StorageError::NotFound { .. }) => {
                return Err(SyncError::MergeRequestNotFound(target.merge_request_id))
            }
            Err(e) => return Err(e.into()),
        };
        if !merge_request.is_open() {
            return Ok(skipped(merge_request.id, SkipReason::MergeRequestNotOpen));
        }

        let mut rules = Vec::new();
        for kind in self.evaluator.kinds() {
            let owned = self
                .reconciler
                .store()
                .rules_for(merge_request.id, *kind)
                .await?;
            rules.extend(
                owned
                    .into_iter()
                    .filter(|r| r.criteria.is_some() && self.evaluator.in_scope(r)),
            );
        }
        if rules.is_empty() {
            return Ok(skipped(merge_request.id, SkipReason::NoRules));
        }

        match self
            .evaluator
            .evaluate(&merge_request, target.pipeline_id, rules)
            .await?
        {
            Evaluation::Skip(reason) => Ok(skipped(merge_request.id, reason)),
            Evaluation::Verdicts(verdicts) => {
                let report = self
                    .reconciler
                    .reconcile(merge_request.id, self.evaluator.kinds(), verdicts)
                    .await?;
                Ok(SyncOutcome::Reconciled(report))
            }
        }
    }
}

fn skipped(merge_request_id: MergeRequestId, reason: SkipReason) -> SyncOutcome {
    obs::emit_sync_skipped(merge_request_id, reason.as_str());
    SyncOutcome::Skipped(reason)
}
