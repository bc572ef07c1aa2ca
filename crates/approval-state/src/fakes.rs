//! In-memory fakes for storage traits (testing only)
//!
//! `MemoryStore` implements every storage trait over one mutex-guarded world,
//! so a single `Arc<MemoryStore>` can back a whole engine in tests. Seeding
//! helpers mutate the world directly; failure injection simulates evidence
//! timeouts and backend errors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::criteria::VulnerabilityState;
use crate::error::StorageError;
use crate::model::*;
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct World {
    merge_requests: BTreeMap<MergeRequestId, MergeRequest>,
    commits: BTreeMap<MergeRequestId, Vec<Commit>>,
    pipelines: BTreeMap<PipelineId, Pipeline>,
    rules: BTreeMap<RuleId, ApprovalRule>,
    violations: BTreeMap<(MergeRequestId, PolicyId), ViolationRecord>,
    vulnerabilities: Vec<VulnerabilityRecord>,
    findings: Vec<SecurityFinding>,
    scans: BTreeMap<PipelineId, BTreeSet<ScannerKind>>,
    licenses: Vec<LicenseFinding>,
    evidence_failures: u32,
    apply_failures: u32,
    apply_calls: u64,
}

impl World {
    /// `root` plus every pipeline whose parent chain leads to it.
    fn family(&self, root: PipelineId, include_descendants: bool) -> BTreeSet<PipelineId> {
        let mut family = BTreeSet::from([root]);
        if !include_descendants {
            return family;
        }
        loop {
            let before = family.len();
            for pipeline in self.pipelines.values() {
                if let Some(parent) = pipeline.parent_id {
                    if family.contains(&parent) {
                        family.insert(pipeline.id);
                    }
                }
            }
            if family.len() == before {
                return family;
            }
        }
    }

    fn take_evidence_failure(&mut self) -> StorageResult<()> {
        if self.evidence_failures > 0 {
            self.evidence_failures -= 1;
            return Err(StorageError::EvidenceUnavailable(
                "injected evidence timeout".to_string(),
            ));
        }
        Ok(())
    }
}

/// In-memory store backing every storage trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    world: Mutex<World>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- seeding -------------------------------------------------------------

    pub fn insert_merge_request(&self, merge_request: MergeRequest) {
        let mut world = self.world.lock().unwrap();
        world
            .merge_requests
            .insert(merge_request.id, merge_request);
    }

    pub fn set_merge_request_state(&self, id: MergeRequestId, state: MergeRequestState) {
        let mut world = self.world.lock().unwrap();
        if let Some(mr) = world.merge_requests.get_mut(&id) {
            mr.state = state;
        }
    }

    pub fn set_head_pipeline(&self, id: MergeRequestId, pipeline_id: Option<PipelineId>) {
        let mut world = self.world.lock().unwrap();
        if let Some(mr) = world.merge_requests.get_mut(&id) {
            mr.head_pipeline_id = pipeline_id;
        }
    }

    pub fn push_commit(&self, id: MergeRequestId, commit: Commit) {
        let mut world = self.world.lock().unwrap();
        world.commits.entry(id).or_default().push(commit);
    }

    pub fn insert_pipeline(&self, pipeline: Pipeline) {
        let mut world = self.world.lock().unwrap();
        world.pipelines.insert(pipeline.id, pipeline);
    }

    pub fn set_pipeline_status(&self, id: PipelineId, status: PipelineStatus) {
        let mut world = self.world.lock().unwrap();
        if let Some(pipeline) = world.pipelines.get_mut(&id) {
            pipeline.status = status;
        }
    }

    pub fn insert_rule(&self, rule: ApprovalRule) {
        let mut world = self.world.lock().unwrap();
        world.rules.insert(rule.id, rule);
    }

    pub fn insert_violation(&self, record: ViolationRecord) {
        let mut world = self.world.lock().unwrap();
        world
            .violations
            .insert((record.merge_request_id, record.policy_id), record);
    }

    pub fn insert_vulnerability(&self, vulnerability: VulnerabilityRecord) {
        let mut world = self.world.lock().unwrap();
        world.vulnerabilities.push(vulnerability);
    }

    pub fn set_vulnerability_state(&self, id: u64, state: VulnerabilityState) {
        let mut world = self.world.lock().unwrap();
        for vulnerability in world.vulnerabilities.iter_mut().filter(|v| v.id == id) {
            vulnerability.state = state;
        }
    }

    /// Record a finding; the finding's scanner counts as having run.
    pub fn add_finding(&self, finding: SecurityFinding) {
        let mut world = self.world.lock().unwrap();
        world
            .scans
            .entry(finding.pipeline_id)
            .or_default()
            .insert(finding.scanner);
        world.findings.push(finding);
    }

    /// Record that a scanner ran in a pipeline, findings or not.
    pub fn record_scan(&self, pipeline_id: PipelineId, scanner: ScannerKind) {
        let mut world = self.world.lock().unwrap();
        world.scans.entry(pipeline_id).or_default().insert(scanner);
    }

    pub fn add_license(&self, license: LicenseFinding) {
        let mut world = self.world.lock().unwrap();
        world.licenses.push(license);
    }

    // -- failure injection ---------------------------------------------------

    /// Make the next `times` evidence reads fail with `EvidenceUnavailable`.
    pub fn fail_evidence(&self, times: u32) {
        self.world.lock().unwrap().evidence_failures = times;
    }

    /// Make the next `times` calls to `apply` fail without writing anything.
    pub fn fail_applies(&self, times: u32) {
        self.world.lock().unwrap().apply_failures = times;
    }

    // -- inspection ----------------------------------------------------------

    pub fn rule(&self, id: RuleId) -> Option<ApprovalRule> {
        self.world.lock().unwrap().rules.get(&id).cloned()
    }

    pub fn all_rules(&self) -> Vec<ApprovalRule> {
        self.world.lock().unwrap().rules.values().cloned().collect()
    }

    pub fn all_violations(&self) -> Vec<ViolationRecord> {
        self.world
            .lock()
            .unwrap()
            .violations
            .values()
            .cloned()
            .collect()
    }

    /// Number of `apply` calls that reached the store.
    pub fn apply_calls(&self) -> u64 {
        self.world.lock().unwrap().apply_calls
    }
}

#[async_trait]
impl MergeRequestReader for MemoryStore {
    async fn merge_request(&self, id: MergeRequestId) -> StorageResult<MergeRequest> {
        let world = self.world.lock().unwrap();
        world
            .merge_requests
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("merge request", id))
    }

    async fn commits(&self, id: MergeRequestId) -> StorageResult<Vec<Commit>> {
        let world = self.world.lock().unwrap();
        Ok(world.commits.get(&id).cloned().unwrap_or_default())
    }

    async fn opened_by_head_pipeline(
        &self,
        pipeline_id: PipelineId,
    ) -> StorageResult<Vec<MergeRequest>> {
        let world = self.world.lock().unwrap();
        Ok(world
            .merge_requests
            .values()
            .filter(|mr| mr.is_open() && mr.head_pipeline_id == Some(pipeline_id))
            .cloned()
            .collect())
    }

    async fn opened_by_target_branch(
        &self,
        project_id: ProjectId,
        target_branch: &str,
    ) -> StorageResult<Vec<MergeRequest>> {
        let world = self.world.lock().unwrap();
        Ok(world
            .merge_requests
            .values()
            .filter(|mr| {
                mr.is_open() && mr.project_id == project_id && mr.target_branch == target_branch
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PipelineReader for MemoryStore {
    async fn pipeline(&self, id: PipelineId) -> StorageResult<Pipeline> {
        let world = self.world.lock().unwrap();
        world
            .pipelines
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("pipeline", id))
    }

    async fn latest_for_ref(
        &self,
        project_id: ProjectId,
        ref_name: &str,
    ) -> StorageResult<Option<Pipeline>> {
        let world = self.world.lock().unwrap();
        Ok(world
            .pipelines
            .values()
            .filter(|p| p.project_id == project_id && p.ref_name == ref_name)
            .max_by_key(|p| p.id)
            .cloned())
    }

    async fn latest_complete_for_ref(
        &self,
        project_id: ProjectId,
        ref_name: &str,
        manual_is_terminal: bool,
    ) -> StorageResult<Option<Pipeline>> {
        let world = self.world.lock().unwrap();
        Ok(world
            .pipelines
            .values()
            .filter(|p| {
                p.project_id == project_id
                    && p.ref_name == ref_name
                    && p.status.is_complete(manual_is_terminal)
            })
            .max_by_key(|p| p.id)
            .cloned())
    }
}

#[async_trait]
impl EvidenceQuery for MemoryStore {
    async fn count_vulnerabilities(&self, query: &VulnerabilityQuery) -> StorageResult<u64> {
        let mut world = self.world.lock().unwrap();
        world.take_evidence_failure()?;

        let now = Utc::now();
        let count = world
            .vulnerabilities
            .iter()
            .filter(|v| v.project_id == query.project_id)
            .filter(|v| query.states.contains(&v.state))
            .filter(|v| query.severities.is_empty() || query.severities.contains(&v.severity))
            .filter(|v| query.scanners.is_empty() || query.scanners.contains(&v.scanner))
            .filter(|v| query.fix_available.map_or(true, |f| f == v.fix_available))
            .filter(|v| query.false_positive.map_or(true, |f| f == v.false_positive))
            .filter(|v| {
                query
                    .age
                    .map_or(true, |age| age.matches((now - v.detected_at).num_days()))
            })
            .take(query.limit as usize)
            .count();
        Ok(count as u64)
    }

    async fn pipeline_findings(
        &self,
        pipeline_id: PipelineId,
        include_descendants: bool,
    ) -> StorageResult<Vec<SecurityFinding>> {
        let mut world = self.world.lock().unwrap();
        world.take_evidence_failure()?;
        let family = world.family(pipeline_id, include_descendants);
        Ok(world
            .findings
            .iter()
            .filter(|f| family.contains(&f.pipeline_id))
            .cloned()
            .collect())
    }

    async fn pipeline_scanners(
        &self,
        pipeline_id: PipelineId,
        include_descendants: bool,
    ) -> StorageResult<Vec<ScannerKind>> {
        let mut world = self.world.lock().unwrap();
        world.take_evidence_failure()?;
        let family = world.family(pipeline_id, include_descendants);
        let scanners: BTreeSet<ScannerKind> = family
            .iter()
            .filter_map(|id| world.scans.get(id))
            .flatten()
            .copied()
            .collect();
        Ok(scanners.into_iter().collect())
    }

    async fn has_security_findings(
        &self,
        pipeline_id: PipelineId,
        include_descendants: bool,
    ) -> StorageResult<bool> {
        let world = self.world.lock().unwrap();
        let family = world.family(pipeline_id, include_descendants);
        Ok(world
            .findings
            .iter()
            .any(|f| family.contains(&f.pipeline_id)))
    }

    async fn pipeline_licenses(
        &self,
        pipeline_id: PipelineId,
    ) -> StorageResult<Vec<LicenseFinding>> {
        let mut world = self.world.lock().unwrap();
        world.take_evidence_failure()?;
        Ok(world
            .licenses
            .iter()
            .filter(|l| l.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ApprovalStore for MemoryStore {
    async fn rules_for(
        &self,
        merge_request_id: MergeRequestId,
        kind: RuleKind,
    ) -> StorageResult<Vec<ApprovalRule>> {
        let world = self.world.lock().unwrap();
        Ok(world
            .rules
            .values()
            .filter(|r| r.merge_request_id == merge_request_id && r.kind == kind)
            .cloned()
            .collect())
    }

    async fn violations_for(
        &self,
        merge_request_id: MergeRequestId,
    ) -> StorageResult<Vec<ViolationRecord>> {
        let world = self.world.lock().unwrap();
        Ok(world
            .violations
            .values()
            .filter(|v| v.merge_request_id == merge_request_id)
            .cloned()
            .collect())
    }

    async fn apply(&self, changes: &ApprovalChangeSet) -> StorageResult<ApplyOutcome> {
        let mut world = self.world.lock().unwrap();
        world.apply_calls += 1;
        if world.apply_failures > 0 {
            world.apply_failures -= 1;
            return Err(StorageError::Backend("injected write failure".to_string()));
        }

        let world = &mut *world;
        let mr = changes.merge_request_id;
        let mut outcome = ApplyOutcome::default();
        let now = Utc::now();

        for update in &changes.policies {
            let key = (mr, update.policy_id);
            let violating: BTreeSet<RuleId> = world
                .violations
                .get(&key)
                .map(|record| record.violating_rules.clone())
                .unwrap_or_default()
                .into_iter()
                .filter(|rule| !update.evaluated.contains(rule))
                .chain(update.violating.iter().copied())
                .collect();
            let violated = !violating.is_empty();

            for rule in world
                .rules
                .values_mut()
                .filter(|r| r.merge_request_id == mr && r.policy_id() == Some(update.policy_id))
            {
                let target = if violated {
                    rule.baseline_approvals_required
                } else {
                    0
                };
                if rule.approvals_required != target {
                    rule.approvals_required = target;
                    outcome.rules_changed += 1;
                }
            }

            if !violated {
                if world.violations.remove(&key).is_some() {
                    outcome.violations_removed += 1;
                }
                continue;
            }
            let violating_rules: Vec<RuleId> = violating.into_iter().collect();
            match world.violations.get_mut(&key) {
                Some(record) => record.violating_rules = violating_rules,
                None => {
                    world.violations.insert(
                        key,
                        ViolationRecord {
                            merge_request_id: mr,
                            policy_id: update.policy_id,
                            reason: update.reason.clone(),
                            created_at: now,
                            violating_rules,
                        },
                    );
                    outcome.violations_added += 1;
                }
            }
        }

        Ok(outcome)
    }
}
