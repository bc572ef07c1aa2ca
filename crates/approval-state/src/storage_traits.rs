//! Storage trait definitions for policy reconciliation
//!
//! These traits define the storage seams the engine talks through:
//! - `MergeRequestReader`: merge requests and their commits (read-only)
//! - `PipelineReader`: pipelines and ref lookups (read-only)
//! - `EvidenceQuery`: security findings, licenses and project vulnerabilities
//! - `ApprovalStore`: approval rules and violation records (the only writes)
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::criteria::{AgeWindow, VulnerabilityState};
use crate::error::StorageError;
use crate::model::{
    ApprovalRule, Commit, LicenseFinding, MergeRequest, MergeRequestId, Pipeline, PipelineId,
    PolicyId, ProjectId, RuleId, RuleKind, ScannerKind, SecurityFinding, Severity,
    ViolationRecord,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Read side
// ---------------------------------------------------------------------------

/// Merge request lookups.
#[async_trait]
pub trait MergeRequestReader: Send + Sync {
    /// Fetch a merge request. Returns `StorageError::NotFound` if absent.
    async fn merge_request(&self, id: MergeRequestId) -> StorageResult<MergeRequest>;

    /// Commits on the merge request, oldest first. Never cached.
    async fn commits(&self, id: MergeRequestId) -> StorageResult<Vec<Commit>>;

    /// Open merge requests whose head pipeline is `pipeline_id`.
    async fn opened_by_head_pipeline(
        &self,
        pipeline_id: PipelineId,
    ) -> StorageResult<Vec<MergeRequest>>;

    /// Open merge requests in `project_id` targeting `target_branch`.
    async fn opened_by_target_branch(
        &self,
        project_id: ProjectId,
        target_branch: &str,
    ) -> StorageResult<Vec<MergeRequest>>;
}

/// Pipeline lookups.
#[async_trait]
pub trait PipelineReader: Send + Sync {
    /// Fetch a pipeline. Returns `StorageError::NotFound` if absent.
    async fn pipeline(&self, id: PipelineId) -> StorageResult<Pipeline>;

    /// The most recent pipeline for `(project, ref)`, any status.
    async fn latest_for_ref(
        &self,
        project_id: ProjectId,
        ref_name: &str,
    ) -> StorageResult<Option<Pipeline>>;

    /// The most recent pipeline for `(project, ref)` that reached a terminal
    /// state. A pipeline waiting on a manual job counts when
    /// `manual_is_terminal` is set.
    async fn latest_complete_for_ref(
        &self,
        project_id: ProjectId,
        ref_name: &str,
        manual_is_terminal: bool,
    ) -> StorageResult<Option<Pipeline>>;
}

/// Filter for the vulnerability evidence count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityQuery {
    pub project_id: ProjectId,
    /// Pre-existing states to count; empty counts nothing
    pub states: Vec<VulnerabilityState>,
    /// Empty means every severity
    pub severities: Vec<Severity>,
    /// Empty means every scanner
    pub scanners: Vec<ScannerKind>,
    pub fix_available: Option<bool>,
    pub false_positive: Option<bool>,
    pub age: Option<AgeWindow>,
    /// Stop counting at this many matches
    pub limit: u64,
}

/// Security evidence produced by pipelines and the vulnerability store.
#[async_trait]
pub trait EvidenceQuery: Send + Sync {
    /// Count project vulnerabilities matching `query`, capped at `query.limit`.
    async fn count_vulnerabilities(&self, query: &VulnerabilityQuery) -> StorageResult<u64>;

    /// Security findings of a pipeline, optionally including child pipelines.
    async fn pipeline_findings(
        &self,
        pipeline_id: PipelineId,
        include_descendants: bool,
    ) -> StorageResult<Vec<SecurityFinding>>;

    /// Scanners that ran in a pipeline (a scan with zero findings still counts).
    async fn pipeline_scanners(
        &self,
        pipeline_id: PipelineId,
        include_descendants: bool,
    ) -> StorageResult<Vec<ScannerKind>>;

    /// Whether the pipeline already exposes security findings.
    async fn has_security_findings(
        &self,
        pipeline_id: PipelineId,
        include_descendants: bool,
    ) -> StorageResult<bool>;

    /// Licenses reported by dependency scanning in a pipeline.
    async fn pipeline_licenses(&self, pipeline_id: PipelineId)
        -> StorageResult<Vec<LicenseFinding>>;
}

// ---------------------------------------------------------------------------
// Write side
// ---------------------------------------------------------------------------

/// The evaluation of one policy's rules on a merge request.
///
/// The store resolves the policy's record from this atomically:
/// `violating_rules := (existing - evaluated) + violating`. A non-empty
/// result keeps (or inserts) the record and resets every rule of the
/// policy on the merge request to its baseline; an empty result deletes
/// the record and zeroes every rule of the policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyUpdate {
    pub policy_id: PolicyId,
    /// Rules of the policy this run evaluated
    pub evaluated: Vec<RuleId>,
    /// Subset of `evaluated` whose own evidence violates the policy
    pub violating: Vec<RuleId>,
    /// Kept from the first writer when the record already exists
    pub reason: String,
}

impl PolicyUpdate {
    pub fn new(policy_id: PolicyId) -> Self {
        Self {
            policy_id,
            evaluated: Vec::new(),
            violating: Vec::new(),
            reason: String::new(),
        }
    }
}

/// Every write a single reconciliation makes, committed all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalChangeSet {
    pub merge_request_id: MergeRequestId,
    pub policies: Vec<PolicyUpdate>,
}

impl ApprovalChangeSet {
    pub fn new(merge_request_id: MergeRequestId) -> Self {
        Self {
            merge_request_id,
            policies: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// What an applied change set actually changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub rules_changed: usize,
    pub violations_added: usize,
    pub violations_removed: usize,
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool {
        self.rules_changed > 0 || self.violations_added > 0 || self.violations_removed > 0
    }
}

/// Approval rules and violation records.
///
/// Guarantees:
/// - `apply` is atomic: either every write in the change set lands or none.
/// - `apply` is idempotent: re-applying the same set reports no changes.
/// - At most one violation record exists per `(merge_request, policy)`;
///   a duplicate insert keeps the existing record.
/// - Each [`PolicyUpdate`] is resolved against the record as it stands
///   inside the same atomic write, so a rule of a violated policy never
///   reads `approvals_required == 0` while the record exists.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Rules of `kind` attached to a merge request, ordered by id.
    async fn rules_for(
        &self,
        merge_request_id: MergeRequestId,
        kind: RuleKind,
    ) -> StorageResult<Vec<ApprovalRule>>;

    /// Current violation records for a merge request, ordered by policy id.
    async fn violations_for(
        &self,
        merge_request_id: MergeRequestId,
    ) -> StorageResult<Vec<ViolationRecord>>;

    /// Commit a change set.
    async fn apply(&self, changes: &ApprovalChangeSet) -> StorageResult<ApplyOutcome>;
}
