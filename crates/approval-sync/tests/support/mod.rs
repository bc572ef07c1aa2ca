//! Shared fixtures for approval-sync behavior tests.
#![allow(dead_code)]

use std::sync::Arc;

use approval_state::fakes::MemoryStore;
use approval_state::*;
use approval_sync::fakes::{RecordingNotifier, RecordingSignal};
use approval_sync::{EvidenceSources, JobRunner, Outputs, ReconciliationConfig, Reconciler};

pub const PROJECT: ProjectId = ProjectId(1);

/// One in-memory world plus recording collaborators.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub signal: Arc<RecordingSignal>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            notifier: Arc::new(RecordingNotifier::new()),
            signal: Arc::new(RecordingSignal::new()),
        }
    }

    pub fn sources(&self) -> EvidenceSources {
        EvidenceSources {
            merge_requests: self.store.clone(),
            pipelines: self.store.clone(),
            evidence: self.store.clone(),
        }
    }

    pub fn outputs(&self) -> Outputs {
        Outputs {
            store: self.store.clone(),
            notifier: self.notifier.clone(),
            signal: self.signal.clone(),
        }
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.store.clone(), self.notifier.clone(), self.signal.clone())
    }

    pub fn runner(&self, config: ReconciliationConfig) -> JobRunner {
        JobRunner::new(self.sources(), self.reconciler(), config)
    }

    pub fn approvals_required(&self, rule: u64) -> u32 {
        self.store
            .rule(RuleId(rule))
            .map(|r| r.approvals_required)
            .unwrap_or_default()
    }

    pub fn violated_policies(&self, mr: u64) -> Vec<PolicyId> {
        self.store
            .all_violations()
            .into_iter()
            .filter(|v| v.merge_request_id == MergeRequestId(mr))
            .map(|v| v.policy_id)
            .collect()
    }
}

pub fn merge_request(id: u64, target: &str, head: Option<u64>) -> MergeRequest {
    MergeRequest {
        id: MergeRequestId(id),
        project_id: PROJECT,
        title: format!("MR {id}"),
        state: MergeRequestState::Opened,
        source_branch: format!("feature-{id}"),
        target_branch: target.to_string(),
        head_pipeline_id: head.map(PipelineId),
    }
}

/// A rule whose current `approvals_required` starts at its baseline.
pub fn rule(id: u64, mr: u64, kind: RuleKind, baseline: u32, criteria: PolicyCriteria) -> ApprovalRule {
    ApprovalRule {
        id: RuleId(id),
        merge_request_id: MergeRequestId(mr),
        name: format!("{kind} rule {id}"),
        kind,
        approvals_required: baseline,
        baseline_approvals_required: baseline,
        criteria: Some(criteria),
    }
}

pub fn criteria(policy: u64) -> PolicyCriteria {
    PolicyCriteria::new(PolicyId(policy), PROJECT)
}

pub fn pipeline(id: u64, ref_name: &str, status: PipelineStatus) -> Pipeline {
    Pipeline {
        id: PipelineId(id),
        project_id: PROJECT,
        ref_name: ref_name.to_string(),
        source: PipelineSource::Push,
        status,
        parent_id: None,
    }
}

pub fn finding(uuid: &str, pipeline: u64, scanner: ScannerKind, severity: Severity) -> SecurityFinding {
    SecurityFinding {
        uuid: uuid.to_string(),
        pipeline_id: PipelineId(pipeline),
        scanner,
        severity,
        dismissed: false,
        fix_available: false,
        false_positive: false,
    }
}

pub fn license(pipeline: u64, name: &str) -> LicenseFinding {
    LicenseFinding {
        pipeline_id: PipelineId(pipeline),
        license: name.to_string(),
        dependency: format!("{}-dep", name.to_lowercase()),
    }
}

pub fn vulnerability(id: u64, state: VulnerabilityState, severity: Severity) -> VulnerabilityRecord {
    VulnerabilityRecord {
        id,
        project_id: PROJECT,
        state,
        severity,
        scanner: ScannerKind::Sast,
        fix_available: false,
        false_positive: false,
        detected_at: chrono::Utc::now(),
    }
}
