//! Row types for merge requests, pipelines, approval rules and evidence.
//!
//! These are the plain values the storage traits hand out. The core never
//! creates or destroys merge requests, pipelines or rules; it only moves
//! `approvals_required` and the violation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::criteria::PolicyCriteria;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Project identifier
    ProjectId
);
id_type!(
    /// Merge request identifier
    MergeRequestId
);
id_type!(
    /// CI pipeline identifier
    PipelineId
);
id_type!(
    /// Approval rule identifier
    RuleId
);
id_type!(
    /// Security policy identifier (one materialized policy read)
    PolicyId
);

// ---------------------------------------------------------------------------
// Merge requests
// ---------------------------------------------------------------------------

/// Lifecycle state of a merge request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRequestState {
    Opened,
    Closed,
    Locked,
    Merged,
}

/// A merge request as seen by the policy engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: MergeRequestId,
    pub project_id: ProjectId,
    #[serde(default)]
    pub title: String,
    pub state: MergeRequestState,
    pub source_branch: String,
    pub target_branch: String,
    /// Pipeline currently attached to the merge request head
    #[serde(default)]
    pub head_pipeline_id: Option<PipelineId>,
}

impl MergeRequest {
    pub fn is_open(&self) -> bool {
        self.state == MergeRequestState::Opened
    }

    pub fn is_merged(&self) -> bool {
        self.state == MergeRequestState::Merged
    }
}

/// A commit on the merge request diff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    /// Whether the commit carries a valid signature
    pub has_signature: bool,
}

impl Commit {
    pub fn signed(sha: impl Into<String>) -> Self {
        Self {
            sha: sha.into(),
            has_signature: true,
        }
    }

    pub fn unsigned(sha: impl Into<String>) -> Self {
        Self {
            sha: sha.into(),
            has_signature: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Approval rules and violations
// ---------------------------------------------------------------------------

/// What a policy-backed approval rule protects against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    ScanFinding,
    LicenseFinding,
    AnyMergeRequest,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::ScanFinding => "scan_finding",
            RuleKind::LicenseFinding => "license_finding",
            RuleKind::AnyMergeRequest => "any_merge_request",
        }
    }
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A merge-request approval rule created from a security policy.
///
/// `approvals_required == 0` means satisfied; `approvals_required ==
/// baseline_approvals_required` means violated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: RuleId,
    pub merge_request_id: MergeRequestId,
    pub name: String,
    pub kind: RuleKind,
    pub approvals_required: u32,
    /// Value restored when the rule is violated
    pub baseline_approvals_required: u32,
    #[serde(default)]
    pub criteria: Option<PolicyCriteria>,
}

impl ApprovalRule {
    pub fn policy_id(&self) -> Option<PolicyId> {
        self.criteria.as_ref().map(|c| c.policy_id)
    }

    pub fn is_satisfied(&self) -> bool {
        self.approvals_required == 0
    }
}

/// Durable record that a policy is currently violated on a merge request.
///
/// Unique per `(merge_request_id, policy_id)`. The record exists exactly
/// while `violating_rules` is non-empty; rules written before per-rule
/// tracking carry an empty list until their policy is next evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub merge_request_id: MergeRequestId,
    pub policy_id: PolicyId,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    /// Rules whose own evidence violates the policy
    #[serde(default)]
    pub violating_rules: Vec<RuleId>,
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

/// What started a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineSource {
    Push,
    Web,
    Trigger,
    Schedule,
    Api,
    External,
    Pipeline,
    Chat,
    MergeRequestEvent,
    ExternalPullRequestEvent,
    ParentPipeline,
    SecurityOrchestrationPolicy,
    Webide,
    OndemandDastScan,
    OndemandDastValidation,
    ContainerRegistryPush,
}

impl PipelineSource {
    /// Sources whose results the policy engine evaluates.
    pub fn is_ci_or_security_orchestration(&self) -> bool {
        !matches!(
            self,
            PipelineSource::Webide
                | PipelineSource::OndemandDastScan
                | PipelineSource::OndemandDastValidation
                | PipelineSource::ContainerRegistryPush
        )
    }
}

/// Pipeline status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Created,
    WaitingForResource,
    Preparing,
    Pending,
    Running,
    Manual,
    Scheduled,
    Success,
    Failed,
    Canceled,
    Skipped,
}

impl PipelineStatus {
    /// Terminal states; `manual` counts only when `manual_is_terminal`.
    pub fn is_complete(&self, manual_is_terminal: bool) -> bool {
        match self {
            PipelineStatus::Success
            | PipelineStatus::Failed
            | PipelineStatus::Canceled
            | PipelineStatus::Skipped => true,
            PipelineStatus::Manual => manual_is_terminal,
            _ => false,
        }
    }
}

/// A CI pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub project_id: ProjectId,
    /// Branch the pipeline ran for
    pub ref_name: String,
    pub source: PipelineSource,
    pub status: PipelineStatus,
    /// Set for child pipelines triggered by a parent
    #[serde(default)]
    pub parent_id: Option<PipelineId>,
}

// ---------------------------------------------------------------------------
// Evidence
// ---------------------------------------------------------------------------

/// Vulnerability severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

/// Security scanner that produced a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerKind {
    Sast,
    SecretDetection,
    DependencyScanning,
    ContainerScanning,
    Dast,
    CoverageFuzzing,
    ApiFuzzing,
    ClusterImageScanning,
}

impl ScannerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScannerKind::Sast => "sast",
            ScannerKind::SecretDetection => "secret_detection",
            ScannerKind::DependencyScanning => "dependency_scanning",
            ScannerKind::ContainerScanning => "container_scanning",
            ScannerKind::Dast => "dast",
            ScannerKind::CoverageFuzzing => "coverage_fuzzing",
            ScannerKind::ApiFuzzing => "api_fuzzing",
            ScannerKind::ClusterImageScanning => "cluster_image_scanning",
        }
    }
}

/// A security finding reported by a pipeline scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityFinding {
    /// Stable identity across pipelines (same issue, same uuid)
    pub uuid: String,
    pub pipeline_id: PipelineId,
    pub scanner: ScannerKind,
    pub severity: Severity,
    #[serde(default)]
    pub dismissed: bool,
    #[serde(default)]
    pub fix_available: bool,
    #[serde(default)]
    pub false_positive: bool,
}

/// A vulnerability already recorded on the project's default branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityRecord {
    pub id: u64,
    pub project_id: ProjectId,
    pub state: crate::criteria::VulnerabilityState,
    pub severity: Severity,
    pub scanner: ScannerKind,
    #[serde(default)]
    pub fix_available: bool,
    #[serde(default)]
    pub false_positive: bool,
    pub detected_at: DateTime<Utc>,
}

/// A license detected by dependency scanning in a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseFinding {
    pub pipeline_id: PipelineId,
    /// SPDX identifier or license name
    pub license: String,
    pub dependency: String,
}
