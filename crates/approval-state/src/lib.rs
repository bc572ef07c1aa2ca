//! Approval-State: persistence layer for policy reconciliation
//!
//! This crate owns the data the reconciliation engine reads and writes:
//! merge requests, pipelines, security evidence, policy-backed approval
//! rules, and the violation records that audit them.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: atomic change sets, uniqueness of violation records, and
//! backend-agnostic traits.
//!
//! ## Key Components
//!
//! - `storage_traits`: `MergeRequestReader`, `PipelineReader`, `EvidenceQuery`, `ApprovalStore`
//! - `fakes::MemoryStore`: one in-memory world implementing every trait
//! - `SurrealApprovalStore`: SurrealDB-backed `ApprovalStore`

pub mod criteria;
mod error;
pub mod fakes;
pub mod migrations;
pub mod model;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use criteria::{
    AgeInterval, AgeOperator, AgeWindow, ApprovalSettings, CommitScope, LicenseCriteria,
    LicenseState, PolicyCriteria, VulnerabilityAttributes, VulnerabilityState,
};
pub use error::StorageError;
pub use model::{
    ApprovalRule, Commit, LicenseFinding, MergeRequest, MergeRequestId, MergeRequestState,
    Pipeline, PipelineId, PipelineSource, PipelineStatus, PolicyId, ProjectId, RuleId, RuleKind,
    ScannerKind, SecurityFinding, Severity, ViolationRecord, VulnerabilityRecord,
};
pub use storage_traits::{
    ApplyOutcome, ApprovalChangeSet, ApprovalStore, EvidenceQuery, MergeRequestReader,
    PipelineReader, PolicyUpdate, StorageResult, VulnerabilityQuery,
};
pub use surreal_store::SurrealApprovalStore;
