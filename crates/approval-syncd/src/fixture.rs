//! World fixtures: the state the daemon reconciles against, plus the
//! events to replay.

use std::path::Path;

use anyhow::{Context, Result};
use approval_state::fakes::MemoryStore;
use approval_state::{
    ApprovalRule, Commit, LicenseFinding, MergeRequest, Pipeline, PipelineId, ScannerKind,
    SecurityFinding, SurrealApprovalStore, ViolationRecord, VulnerabilityRecord,
};
use approval_sync::PolicyEvent;
use serde::{Deserialize, Serialize};

/// A merge request with its commits, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequestFixture {
    #[serde(flatten)]
    pub merge_request: MergeRequest,
    #[serde(default)]
    pub commits: Vec<Commit>,
}

/// Scanners that ran in a pipeline, whether or not they found anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanFixture {
    pub pipeline_id: PipelineId,
    pub scanners: Vec<ScannerKind>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub merge_requests: Vec<MergeRequestFixture>,
    #[serde(default)]
    pub pipelines: Vec<Pipeline>,
    #[serde(default)]
    pub rules: Vec<ApprovalRule>,
    #[serde(default)]
    pub violations: Vec<ViolationRecord>,
    #[serde(default)]
    pub scans: Vec<ScanFixture>,
    #[serde(default)]
    pub findings: Vec<SecurityFinding>,
    #[serde(default)]
    pub licenses: Vec<LicenseFinding>,
    #[serde(default)]
    pub vulnerabilities: Vec<VulnerabilityRecord>,
    #[serde(default)]
    pub events: Vec<PolicyEvent>,
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse fixture {}", path.display()))
    }

    /// Load everything except the events into `store`.
    pub fn seed(&self, store: &MemoryStore) {
        for mr in &self.merge_requests {
            store.insert_merge_request(mr.merge_request.clone());
            for commit in &mr.commits {
                store.push_commit(mr.merge_request.id, commit.clone());
            }
        }
        for pipeline in &self.pipelines {
            store.insert_pipeline(pipeline.clone());
        }
        for rule in &self.rules {
            store.insert_rule(rule.clone());
        }
        for violation in &self.violations {
            store.insert_violation(violation.clone());
        }
        for scan in &self.scans {
            for scanner in &scan.scanners {
                store.record_scan(scan.pipeline_id, *scanner);
            }
        }
        for finding in &self.findings {
            store.add_finding(finding.clone());
        }
        for license in &self.licenses {
            store.add_license(license.clone());
        }
        for vulnerability in &self.vulnerabilities {
            store.insert_vulnerability(vulnerability.clone());
        }
    }

    /// Load the fixture's approval rules and violation records into a
    /// SurrealDB store.
    pub async fn seed_approvals(&self, store: &SurrealApprovalStore) -> Result<()> {
        for rule in &self.rules {
            store
                .upsert_rule(rule)
                .await
                .with_context(|| format!("Failed to store rule {}", rule.id))?;
        }
        for violation in &self.violations {
            store.insert_violation(violation).await.with_context(|| {
                format!(
                    "Failed to store violation of policy {} on merge request {}",
                    violation.policy_id, violation.merge_request_id
                )
            })?;
        }
        Ok(())
    }
}
