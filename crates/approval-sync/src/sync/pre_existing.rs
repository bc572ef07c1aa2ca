//! `scan_finding` rules whose criteria only cover vulnerabilities already on
//! the default branch. Rules that also watch newly detected findings belong
//! to [`super::PipelineFindingsEvaluator`].

use std::sync::Arc;

use approval_state::{
    ApprovalRule, EvidenceQuery, MergeRequest, PipelineId, PolicyCriteria, ProjectId, RuleKind,
    VulnerabilityQuery,
};
use async_trait::async_trait;

use super::{Evaluation, RuleEvaluator};
use crate::error::Result;
use crate::reconcile::RuleVerdict;

pub struct PreexistingStateEvaluator {
    evidence: Arc<dyn EvidenceQuery>,
}

impl PreexistingStateEvaluator {
    pub fn new(evidence: Arc<dyn EvidenceQuery>) -> Self {
        Self { evidence }
    }
}

/// Count query for the pre-existing states of `criteria`, capped one past
/// the allowed threshold.
pub(crate) fn pre_existing_query(criteria: &PolicyCriteria, project_id: ProjectId) -> VulnerabilityQuery {
    VulnerabilityQuery {
        project_id,
        states: criteria.pre_existing_states(),
        severities: criteria.severity_levels.clone(),
        scanners: criteria.scanners.clone(),
        fix_available: criteria.vulnerability_attributes.fix_available,
        false_positive: criteria.vulnerability_attributes.false_positive,
        age: criteria.vulnerability_age,
        limit: u64::from(criteria.vulnerabilities_allowed) + 1,
    }
}

/// `Some(reason)` when the pre-existing count exceeds the allowed threshold.
pub(crate) async fn pre_existing_violation(
    evidence: &dyn EvidenceQuery,
    criteria: &PolicyCriteria,
    project_id: ProjectId,
) -> Result<Option<String>> {
    let query = pre_existing_query(criteria, project_id);
    let allowed = u64::from(criteria.vulnerabilities_allowed);
    let count = evidence.count_vulnerabilities(&query).await?;
    Ok((count > allowed).then(|| {
        format!("more than {allowed} pre-existing vulnerabilities match the policy")
    }))
}

#[async_trait]
impl RuleEvaluator for PreexistingStateEvaluator {
    fn name(&self) -> &'static str {
        "pre_existing_states"
    }

    fn kinds(&self) -> &'static [RuleKind] {
        &[RuleKind::ScanFinding]
    }

    fn in_scope(&self, rule: &ApprovalRule) -> bool {
        rule.criteria
            .as_ref()
            .is_some_and(|c| !c.includes_newly_detected())
    }

    async fn evaluate(
        &self,
        merge_request: &MergeRequest,
        _pipeline_id: Option<PipelineId>,
        rules: Vec<ApprovalRule>,
    ) -> Result<Evaluation> {
        let mut verdicts = Vec::with_capacity(rules.len());
        for rule in rules {
            let violation = match rule.criteria.as_ref() {
                Some(criteria) => {
                    pre_existing_violation(self.evidence.as_ref(), criteria, merge_request.project_id)
                        .await?
                }
                None => None,
            };
            verdicts.push(match violation {
                Some(reason) => RuleVerdict::violated(rule, reason),
                None => RuleVerdict::satisfied(rule),
            });
        }
        Ok(Evaluation::Verdicts(verdicts))
    }
}
