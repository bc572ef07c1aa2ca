//! `any_merge_request` rules: approval required for every merge request, or
//! only for merge requests carrying unsigned commits.

use std::sync::Arc;

use approval_state::{
    ApprovalRule, CommitScope, MergeRequest, MergeRequestReader, PipelineId, RuleKind,
};
use async_trait::async_trait;

use super::{Evaluation, RuleEvaluator};
use crate::error::Result;
use crate::reconcile::RuleVerdict;

pub struct CommitSignatureEvaluator {
    merge_requests: Arc<dyn MergeRequestReader>,
}

impl CommitSignatureEvaluator {
    pub fn new(merge_requests: Arc<dyn MergeRequestReader>) -> Self {
        Self { merge_requests }
    }
}

#[async_trait]
impl RuleEvaluator for CommitSignatureEvaluator {
    fn name(&self) -> &'static str {
        "any_merge_request"
    }

    fn kinds(&self) -> &'static [RuleKind] {
        &[RuleKind::AnyMergeRequest]
    }

    async fn evaluate(
        &self,
        merge_request: &MergeRequest,
        _pipeline_id: Option<PipelineId>,
        rules: Vec<ApprovalRule>,
    ) -> Result<Evaluation> {
        // Read fresh every run; a push may have added commits since the last one.
        let commits = self.merge_requests.commits(merge_request.id).await?;
        let has_unsigned_commits = commits.iter().any(|c| !c.has_signature);

        let verdicts = rules
            .into_iter()
            .map(|rule| {
                let scope = rule.criteria.as_ref().and_then(|c| c.commits);
                match scope {
                    Some(CommitScope::Any) => {
                        RuleVerdict::violated(rule, "policy requires approval for any merge request")
                    }
                    Some(CommitScope::Unsigned) if has_unsigned_commits => {
                        RuleVerdict::violated(rule, "merge request contains unsigned commits")
                    }
                    _ => RuleVerdict::satisfied(rule),
                }
            })
            .collect();
        Ok(Evaluation::Verdicts(verdicts))
    }
}
