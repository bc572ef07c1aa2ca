//! Per-pipeline evaluation of `scan_finding` and `license_finding` rules.
//!
//! Runs as the job dispatched by the findings fan-out for one
//! `(pipeline, merge request)` pair. The head pipeline's findings are
//! compared with the latest complete pipeline on the target branch:
//!
//! - a scanner that ran on the target but not on the head violates the rule
//! - new findings (UUID absent from the target) matching the rule's filters
//!   violate it once they exceed `vulnerabilities_allowed`
//! - pre-existing states in the same criteria are counted as in
//!   [`super::PreexistingStateEvaluator`]
//! - licenses are checked against the rule's allow- or denylist

use std::collections::BTreeSet;
use std::sync::Arc;

use approval_state::{
    ApprovalRule, EvidenceQuery, LicenseCriteria, LicenseFinding, LicenseState, MergeRequest,
    Pipeline, PipelineId, PipelineReader, PolicyCriteria, RuleKind, ScannerKind, SecurityFinding,
    StorageError, VulnerabilityState,
};
use async_trait::async_trait;
use tracing::debug;

use super::pre_existing::pre_existing_violation;
use super::{Evaluation, RuleEvaluator, SkipReason};
use crate::config::ReconciliationConfig;
use crate::error::{Result, SyncError};
use crate::reconcile::RuleVerdict;

pub struct PipelineFindingsEvaluator {
    pipelines: Arc<dyn PipelineReader>,
    evidence: Arc<dyn EvidenceQuery>,
    config: ReconciliationConfig,
}

/// Findings and scans of one pipeline (plus descendants when aggregating).
#[derive(Debug, Default)]
struct ScanEvidence {
    findings: Vec<SecurityFinding>,
    scanners: Vec<ScannerKind>,
}

impl PipelineFindingsEvaluator {
    pub fn new(
        pipelines: Arc<dyn PipelineReader>,
        evidence: Arc<dyn EvidenceQuery>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            pipelines,
            evidence,
            config,
        }
    }

    async fn load_pipeline(&self, id: PipelineId) -> Result<Pipeline> {
        match self.pipelines.pipeline(id).await {
            Ok(pipeline) => Ok(pipeline),
            Err(StorageError::NotFound { .. }) => Err(SyncError::PipelineNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn scan_evidence(&self, pipeline_id: PipelineId) -> Result<ScanEvidence> {
        let include = self.config.aggregate_child_pipelines;
        Ok(ScanEvidence {
            findings: self.evidence.pipeline_findings(pipeline_id, include).await?,
            scanners: self.evidence.pipeline_scanners(pipeline_id, include).await?,
        })
    }

    async fn scan_violation(
        &self,
        merge_request: &MergeRequest,
        criteria: &PolicyCriteria,
        head: &ScanEvidence,
        target: &ScanEvidence,
    ) -> Result<Option<String>> {
        let removed: Vec<&str> = target
            .scanners
            .iter()
            .filter(|s| criteria.matches_scanner(**s) && !head.scanners.contains(*s))
            .map(|s| s.as_str())
            .collect();
        if !removed.is_empty() {
            return Ok(Some(format!("scan removed: {}", removed.join(", "))));
        }

        let allowed = u64::from(criteria.vulnerabilities_allowed);
        let new_findings = count_new_findings(criteria, &head.findings, &target.findings);
        if new_findings > allowed {
            return Ok(Some(format!(
                "{new_findings} new findings exceed {allowed} allowed"
            )));
        }

        if criteria.pre_existing_states().is_empty() {
            return Ok(None);
        }
        pre_existing_violation(self.evidence.as_ref(), criteria, merge_request.project_id).await
    }
}

/// Distinct head findings absent from the target that match `criteria`.
fn count_new_findings(
    criteria: &PolicyCriteria,
    head: &[SecurityFinding],
    target: &[SecurityFinding],
) -> u64 {
    let states = criteria.newly_detected_states();
    let baseline: BTreeSet<&str> = target.iter().map(|f| f.uuid.as_str()).collect();
    let matched: BTreeSet<&str> = head
        .iter()
        .filter(|f| !baseline.contains(f.uuid.as_str()))
        .filter(|f| {
            let state = if f.dismissed {
                VulnerabilityState::NewDismissed
            } else {
                VulnerabilityState::NewNeedsTriage
            };
            states.contains(&state)
        })
        .filter(|f| criteria.matches_severity(f.severity) && criteria.matches_scanner(f.scanner))
        .filter(|f| {
            criteria
                .vulnerability_attributes
                .matches(f.fix_available, f.false_positive)
        })
        .map(|f| f.uuid.as_str())
        .collect();
    matched.len() as u64
}

/// `Some(reason)` naming the offending licenses.
fn license_violation(
    license: &LicenseCriteria,
    head: &[LicenseFinding],
    target: &[LicenseFinding],
) -> Option<String> {
    let baseline: BTreeSet<String> = target.iter().map(|l| l.license.to_lowercase()).collect();
    let denied: BTreeSet<&str> = head
        .iter()
        .filter(|l| {
            let state = if baseline.contains(&l.license.to_lowercase()) {
                LicenseState::Detected
            } else {
                LicenseState::NewlyDetected
            };
            license.license_states.is_empty() || license.license_states.contains(&state)
        })
        .filter(|l| license.denies(&l.license))
        .map(|l| l.license.as_str())
        .collect();
    if denied.is_empty() {
        return None;
    }
    let names: Vec<&str> = denied.into_iter().collect();
    Some(format!("license not allowed: {}", names.join(", ")))
}

#[async_trait]
impl RuleEvaluator for PipelineFindingsEvaluator {
    fn name(&self) -> &'static str {
        "pipeline_findings"
    }

    fn kinds(&self) -> &'static [RuleKind] {
        &[RuleKind::ScanFinding, RuleKind::LicenseFinding]
    }

    fn in_scope(&self, rule: &ApprovalRule) -> bool {
        match rule.kind {
            RuleKind::ScanFinding => rule
                .criteria
                .as_ref()
                .is_some_and(|c| c.includes_newly_detected()),
            RuleKind::LicenseFinding => true,
            RuleKind::AnyMergeRequest => false,
        }
    }

    async fn evaluate(
        &self,
        merge_request: &MergeRequest,
        pipeline_id: Option<PipelineId>,
        rules: Vec<ApprovalRule>,
    ) -> Result<Evaluation> {
        let Some(pipeline_id) = pipeline_id else {
            return Ok(Evaluation::Skip(SkipReason::NoPipeline));
        };
        if self.config.skip_stale_pipelines && merge_request.head_pipeline_id != Some(pipeline_id)
        {
            return Ok(Evaluation::Skip(SkipReason::StalePipeline));
        }

        let pipeline = self.load_pipeline(pipeline_id).await?;
        let ready = pipeline.status.is_complete(self.config.manual_is_terminal)
            || self
                .evidence
                .has_security_findings(pipeline.id, self.config.aggregate_child_pipelines)
                .await?;
        if !ready {
            return Ok(Evaluation::Skip(SkipReason::PipelineNotReady));
        }

        let target_pipeline = self
            .pipelines
            .latest_complete_for_ref(
                merge_request.project_id,
                &merge_request.target_branch,
                self.config.manual_is_terminal,
            )
            .await?;
        debug!(
            pipeline_id = %pipeline.id,
            target_pipeline_id = ?target_pipeline.as_ref().map(|p| p.id),
            "comparing head findings with target branch"
        );

        let has_scan_rules = rules.iter().any(|r| r.kind == RuleKind::ScanFinding);
        let has_license_rules = rules.iter().any(|r| r.kind == RuleKind::LicenseFinding);

        let (head_scans, target_scans) = if has_scan_rules {
            let head = self.scan_evidence(pipeline.id).await?;
            let target = match &target_pipeline {
                Some(t) => self.scan_evidence(t.id).await?,
                None => ScanEvidence::default(),
            };
            (head, target)
        } else {
            (ScanEvidence::default(), ScanEvidence::default())
        };

        let (head_licenses, target_licenses) = if has_license_rules {
            let head = self.evidence.pipeline_licenses(pipeline.id).await?;
            let target = match &target_pipeline {
                Some(t) => self.evidence.pipeline_licenses(t.id).await?,
                None => Vec::new(),
            };
            (head, target)
        } else {
            (Vec::new(), Vec::new())
        };

        let mut verdicts = Vec::with_capacity(rules.len());
        for rule in rules {
            let violation = match (rule.kind, rule.criteria.as_ref()) {
                (RuleKind::ScanFinding, Some(criteria)) => {
                    self.scan_violation(merge_request, criteria, &head_scans, &target_scans)
                        .await?
                }
                (RuleKind::LicenseFinding, Some(criteria)) => criteria
                    .license
                    .as_ref()
                    .and_then(|l| license_violation(l, &head_licenses, &target_licenses)),
                _ => None,
            };
            verdicts.push(match violation {
                Some(reason) => RuleVerdict::violated(rule, reason),
                None => RuleVerdict::satisfied(rule),
            });
        }
        Ok(Evaluation::Verdicts(verdicts))
    }
}
