//! Trait contract tests for ApprovalStore and the read-side traits.
//!
//! The approval-store contracts run against both `MemoryStore` and
//! `SurrealApprovalStore` (in-memory engine). Any conforming implementation
//! must pass them.

use approval_state::fakes::MemoryStore;
use approval_state::*;

fn criteria(policy: u64) -> PolicyCriteria {
    PolicyCriteria::new(PolicyId(policy), ProjectId(1))
}

fn rule(id: u64, mr: u64, policy: u64, kind: RuleKind, baseline: u32, current: u32) -> ApprovalRule {
    ApprovalRule {
        id: RuleId(id),
        merge_request_id: MergeRequestId(mr),
        name: format!("rule-{id}"),
        kind,
        approvals_required: current,
        baseline_approvals_required: baseline,
        criteria: Some(criteria(policy)),
    }
}

fn seed_rules() -> Vec<ApprovalRule> {
    vec![
        rule(10, 1, 100, RuleKind::ScanFinding, 2, 2),
        rule(11, 1, 101, RuleKind::AnyMergeRequest, 1, 0),
        rule(12, 1, 102, RuleKind::ScanFinding, 3, 0),
        rule(13, 1, 102, RuleKind::AnyMergeRequest, 1, 0),
        rule(20, 2, 100, RuleKind::ScanFinding, 3, 3),
    ]
}

fn update(policy: u64, evaluated: &[u64], violating: &[u64], reason: &str) -> PolicyUpdate {
    PolicyUpdate {
        policy_id: PolicyId(policy),
        evaluated: evaluated.iter().copied().map(RuleId).collect(),
        violating: violating.iter().copied().map(RuleId).collect(),
        reason: reason.to_string(),
    }
}

fn change_set(mr: u64, policies: Vec<PolicyUpdate>) -> ApprovalChangeSet {
    ApprovalChangeSet {
        merge_request_id: MergeRequestId(mr),
        policies,
    }
}

async fn approvals(store: &dyn ApprovalStore, mr: u64) -> Vec<(RuleId, u32)> {
    let mut all = Vec::new();
    for kind in [
        RuleKind::ScanFinding,
        RuleKind::LicenseFinding,
        RuleKind::AnyMergeRequest,
    ] {
        for r in store.rules_for(MergeRequestId(mr), kind).await.unwrap() {
            all.push((r.id, r.approvals_required));
        }
    }
    all.sort();
    all
}

// ===========================================================================
// ApprovalStore contracts (shared)
// ===========================================================================

async fn contract_rules_filtered_by_kind(store: &dyn ApprovalStore) {
    let scan = store
        .rules_for(MergeRequestId(1), RuleKind::ScanFinding)
        .await
        .unwrap();
    let ids: Vec<RuleId> = scan.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![RuleId(10), RuleId(12)]);

    let any = store
        .rules_for(MergeRequestId(1), RuleKind::AnyMergeRequest)
        .await
        .unwrap();
    let policies: Vec<Option<PolicyId>> = any.iter().map(|r| r.policy_id()).collect();
    assert_eq!(policies, vec![Some(PolicyId(101)), Some(PolicyId(102))]);
}

async fn contract_apply_is_bulk_and_idempotent(store: &dyn ApprovalStore) {
    let changes = change_set(
        1,
        vec![
            update(102, &[12], &[12], "critical finding"),
            update(100, &[10], &[], ""),
        ],
    );

    let first = store.apply(&changes).await.unwrap();
    // Rules 12 and 13 share policy 102 and both go back to baseline.
    assert_eq!(first.rules_changed, 3);
    assert_eq!(first.violations_added, 1);
    assert_eq!(first.violations_removed, 0);

    assert_eq!(
        approvals(store, 1).await,
        vec![(RuleId(10), 0), (RuleId(11), 0), (RuleId(12), 3), (RuleId(13), 1)]
    );

    let second = store.apply(&changes).await.unwrap();
    assert!(!second.changed(), "replay must not change anything: {second:?}");

    let violations = store.violations_for(MergeRequestId(1)).await.unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].policy_id, PolicyId(102));
    assert_eq!(violations[0].reason, "critical finding");
    assert_eq!(violations[0].violating_rules, vec![RuleId(12)]);
}

async fn contract_duplicate_violation_keeps_first(store: &dyn ApprovalStore) {
    store
        .apply(&change_set(1, vec![update(100, &[10], &[10], "first")]))
        .await
        .unwrap();

    let outcome = store
        .apply(&change_set(1, vec![update(100, &[10], &[10], "second")]))
        .await
        .unwrap();
    assert_eq!(outcome.violations_added, 0);

    let violations = store.violations_for(MergeRequestId(1)).await.unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].reason, "first");
}

async fn contract_changes_scoped_to_merge_request(store: &dyn ApprovalStore) {
    // Rule 20 shares policy 100 but belongs to MR 2.
    store
        .apply(&change_set(1, vec![update(100, &[10], &[], "")]))
        .await
        .unwrap();
    assert_eq!(approvals(store, 2).await, vec![(RuleId(20), 3)]);

    store
        .apply(&change_set(1, vec![update(100, &[10], &[10], "mr one")]))
        .await
        .unwrap();
    assert!(store
        .violations_for(MergeRequestId(2))
        .await
        .unwrap()
        .is_empty());
}

async fn contract_remove_violation(store: &dyn ApprovalStore) {
    store
        .apply(&change_set(
            1,
            vec![update(100, &[10], &[10], "x"), update(101, &[11], &[11], "y")],
        ))
        .await
        .unwrap();

    let outcome = store
        .apply(&change_set(
            1,
            vec![update(100, &[10], &[], ""), update(999, &[], &[], "")],
        ))
        .await
        .unwrap();
    assert_eq!(outcome.violations_removed, 1);

    let left: Vec<PolicyId> = store
        .violations_for(MergeRequestId(1))
        .await
        .unwrap()
        .into_iter()
        .map(|v| v.policy_id)
        .collect();
    assert_eq!(left, vec![PolicyId(101)]);
}

async fn contract_policy_shared_between_rules(store: &dyn ApprovalStore) {
    // Policy 102 backs rule 12 (scan) and rule 13 (any merge request),
    // each evaluated by a different job.
    store
        .apply(&change_set(1, vec![update(102, &[12], &[12], "scan")]))
        .await
        .unwrap();

    let satisfied_elsewhere = store
        .apply(&change_set(1, vec![update(102, &[13], &[], "")]))
        .await
        .unwrap();
    assert!(
        !satisfied_elsewhere.changed(),
        "a satisfied sibling must not clear the record: {satisfied_elsewhere:?}"
    );
    let violations = store.violations_for(MergeRequestId(1)).await.unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].violating_rules, vec![RuleId(12)]);
    assert_eq!(approvals(store, 1).await[2..], [(RuleId(12), 3), (RuleId(13), 1)]);

    let both = store
        .apply(&change_set(1, vec![update(102, &[13], &[13], "any")]))
        .await
        .unwrap();
    assert!(!both.changed());
    let violations = store.violations_for(MergeRequestId(1)).await.unwrap();
    assert_eq!(violations[0].reason, "scan");
    assert_eq!(violations[0].violating_rules, vec![RuleId(12), RuleId(13)]);

    store
        .apply(&change_set(1, vec![update(102, &[12], &[], "")]))
        .await
        .unwrap();
    assert_eq!(
        store.violations_for(MergeRequestId(1)).await.unwrap()[0].violating_rules,
        vec![RuleId(13)]
    );

    let cleared = store
        .apply(&change_set(1, vec![update(102, &[13], &[], "")]))
        .await
        .unwrap();
    assert_eq!(cleared.violations_removed, 1);
    assert_eq!(cleared.rules_changed, 2);
    assert!(store
        .violations_for(MergeRequestId(1))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(approvals(store, 1).await[2..], [(RuleId(12), 0), (RuleId(13), 0)]);
}

// ===========================================================================
// MemoryStore
// ===========================================================================

mod memory_store_tests {
    use super::*;

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        for r in seed_rules() {
            store.insert_rule(r);
        }
        store
    }

    #[tokio::test]
    async fn rules_filtered_by_kind() {
        contract_rules_filtered_by_kind(&store()).await;
    }

    #[tokio::test]
    async fn apply_is_bulk_and_idempotent() {
        contract_apply_is_bulk_and_idempotent(&store()).await;
    }

    #[tokio::test]
    async fn duplicate_violation_keeps_first() {
        contract_duplicate_violation_keeps_first(&store()).await;
    }

    #[tokio::test]
    async fn changes_scoped_to_merge_request() {
        contract_changes_scoped_to_merge_request(&store()).await;
    }

    #[tokio::test]
    async fn remove_violation() {
        contract_remove_violation(&store()).await;
    }

    #[tokio::test]
    async fn injected_apply_failure_writes_nothing() {
        let store = store();
        store.fail_applies(1);

        let changes = change_set(
            1,
            vec![update(100, &[10], &[], ""), update(102, &[12], &[12], "x")],
        );

        let err = store.apply(&changes).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        assert_eq!(store.rule(RuleId(10)).unwrap().approvals_required, 2);
        assert_eq!(store.rule(RuleId(12)).unwrap().approvals_required, 0);
        assert!(store.all_violations().is_empty());

        store.apply(&changes).await.unwrap();
        assert_eq!(store.rule(RuleId(10)).unwrap().approvals_required, 0);
        assert_eq!(store.rule(RuleId(12)).unwrap().approvals_required, 3);
    }

    #[tokio::test]
    async fn policy_shared_between_rules() {
        contract_policy_shared_between_rules(&store()).await;
    }

    #[tokio::test]
    async fn untracked_record_cleared_when_evaluated_satisfied() {
        let store = store();
        store.insert_violation(ViolationRecord {
            merge_request_id: MergeRequestId(1),
            policy_id: PolicyId(100),
            reason: "loaded".to_string(),
            created_at: chrono::Utc::now(),
            violating_rules: Vec::new(),
        });

        let outcome = store
            .apply(&change_set(1, vec![update(100, &[10], &[], "")]))
            .await
            .unwrap();
        assert_eq!(outcome.violations_removed, 1);
        assert_eq!(store.rule(RuleId(10)).unwrap().approvals_required, 0);
    }
}

// ===========================================================================
// SurrealApprovalStore (mirrors MemoryStore tests above)
// ===========================================================================

mod surreal_store_tests {
    use super::*;

    async fn store() -> SurrealApprovalStore {
        let store = SurrealApprovalStore::in_memory()
            .await
            .expect("in_memory() failed");
        for r in seed_rules() {
            store.upsert_rule(&r).await.expect("seed rule");
        }
        store
    }

    #[tokio::test]
    async fn rules_filtered_by_kind() {
        contract_rules_filtered_by_kind(&store().await).await;
    }

    #[tokio::test]
    async fn apply_is_bulk_and_idempotent() {
        contract_apply_is_bulk_and_idempotent(&store().await).await;
    }

    #[tokio::test]
    async fn duplicate_violation_keeps_first() {
        contract_duplicate_violation_keeps_first(&store().await).await;
    }

    #[tokio::test]
    async fn changes_scoped_to_merge_request() {
        contract_changes_scoped_to_merge_request(&store().await).await;
    }

    #[tokio::test]
    async fn remove_violation() {
        contract_remove_violation(&store().await).await;
    }

    #[tokio::test]
    async fn policy_shared_between_rules() {
        contract_policy_shared_between_rules(&store().await).await;
    }

    #[tokio::test]
    async fn inserted_violation_is_kept_once_and_cleared_when_satisfied() {
        let store = store().await;
        let record = ViolationRecord {
            merge_request_id: MergeRequestId(1),
            policy_id: PolicyId(100),
            reason: "loaded".to_string(),
            created_at: chrono::Utc::now(),
            violating_rules: Vec::new(),
        };
        store.insert_violation(&record).await.unwrap();
        store
            .insert_violation(&ViolationRecord {
                reason: "again".to_string(),
                ..record.clone()
            })
            .await
            .unwrap();

        let loaded = store.violations_for(MergeRequestId(1)).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].reason, "loaded");

        let outcome = store
            .apply(&change_set(1, vec![update(100, &[10], &[], "")]))
            .await
            .unwrap();
        assert_eq!(outcome.violations_removed, 1);
        assert_eq!(outcome.rules_changed, 1);
        assert!(store
            .violations_for(MergeRequestId(1))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn criteria_survive_round_trip() {
        let store = store().await;
        let mut r = rule(30, 3, 300, RuleKind::LicenseFinding, 1, 1);
        r.criteria = Some(criteria(300).with_license(LicenseCriteria {
            match_on_inclusion_license: true,
            license_types: vec!["AGPL-3.0".to_string()],
            license_states: vec![LicenseState::NewlyDetected],
        }));
        store.upsert_rule(&r).await.unwrap();

        let loaded = store
            .rules_for(MergeRequestId(3), RuleKind::LicenseFinding)
            .await
            .unwrap();
        assert_eq!(loaded, vec![r]);
    }

    #[tokio::test]
    async fn upsert_replaces_existing_rule() {
        let store = store().await;
        store
            .upsert_rule(&rule(10, 1, 100, RuleKind::ScanFinding, 5, 5))
            .await
            .unwrap();

        let rules = store
            .rules_for(MergeRequestId(1), RuleKind::ScanFinding)
            .await
            .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].baseline_approvals_required, 5);
    }
}

// ===========================================================================
// Read-side fakes
// ===========================================================================

fn pipeline(id: u64, ref_name: &str, status: PipelineStatus, parent: Option<u64>) -> Pipeline {
    Pipeline {
        id: PipelineId(id),
        project_id: ProjectId(1),
        ref_name: ref_name.to_string(),
        source: PipelineSource::Push,
        status,
        parent_id: parent.map(PipelineId),
    }
}

fn finding(uuid: &str, pipeline: u64, scanner: ScannerKind) -> SecurityFinding {
    SecurityFinding {
        uuid: uuid.to_string(),
        pipeline_id: PipelineId(pipeline),
        scanner,
        severity: Severity::High,
        dismissed: false,
        fix_available: false,
        false_positive: false,
    }
}

#[tokio::test]
async fn latest_pipeline_for_ref() {
    let store = MemoryStore::new();
    store.insert_pipeline(pipeline(1, "main", PipelineStatus::Success, None));
    store.insert_pipeline(pipeline(2, "main", PipelineStatus::Running, None));
    store.insert_pipeline(pipeline(3, "feature", PipelineStatus::Success, None));

    let latest = store.latest_for_ref(ProjectId(1), "main").await.unwrap();
    assert_eq!(latest.map(|p| p.id), Some(PipelineId(2)));

    let complete = store
        .latest_complete_for_ref(ProjectId(1), "main", false)
        .await
        .unwrap();
    assert_eq!(complete.map(|p| p.id), Some(PipelineId(1)));
}

#[tokio::test]
async fn manual_pipeline_complete_only_when_terminal() {
    let store = MemoryStore::new();
    store.insert_pipeline(pipeline(1, "main", PipelineStatus::Success, None));
    store.insert_pipeline(pipeline(2, "main", PipelineStatus::Manual, None));

    let strict = store
        .latest_complete_for_ref(ProjectId(1), "main", false)
        .await
        .unwrap();
    assert_eq!(strict.map(|p| p.id), Some(PipelineId(1)));

    let lenient = store
        .latest_complete_for_ref(ProjectId(1), "main", true)
        .await
        .unwrap();
    assert_eq!(lenient.map(|p| p.id), Some(PipelineId(2)));
}

#[tokio::test]
async fn findings_include_descendants_on_request() {
    let store = MemoryStore::new();
    store.insert_pipeline(pipeline(1, "main", PipelineStatus::Success, None));
    store.insert_pipeline(pipeline(2, "main", PipelineStatus::Success, Some(1)));
    store.insert_pipeline(pipeline(3, "main", PipelineStatus::Success, Some(2)));
    store.add_finding(finding("a", 1, ScannerKind::Sast));
    store.add_finding(finding("b", 3, ScannerKind::Dast));

    let own = store.pipeline_findings(PipelineId(1), false).await.unwrap();
    assert_eq!(own.len(), 1);

    let all = store.pipeline_findings(PipelineId(1), true).await.unwrap();
    assert_eq!(all.len(), 2);

    let scanners = store.pipeline_scanners(PipelineId(1), true).await.unwrap();
    assert_eq!(scanners, vec![ScannerKind::Sast, ScannerKind::Dast]);

    assert!(!store.has_security_findings(PipelineId(2), false).await.unwrap());
    assert!(store.has_security_findings(PipelineId(2), true).await.unwrap());
}

#[tokio::test]
async fn vulnerability_count_is_capped() {
    let store = MemoryStore::new();
    for id in 0..5 {
        store.insert_vulnerability(VulnerabilityRecord {
            id,
            project_id: ProjectId(1),
            state: VulnerabilityState::Detected,
            severity: Severity::Critical,
            scanner: ScannerKind::Sast,
            fix_available: false,
            false_positive: false,
            detected_at: chrono::Utc::now(),
        });
    }

    let query = VulnerabilityQuery {
        project_id: ProjectId(1),
        states: vec![VulnerabilityState::Detected],
        severities: vec![Severity::Critical],
        scanners: vec![],
        fix_available: None,
        false_positive: None,
        age: None,
        limit: 3,
    };
    assert_eq!(store.count_vulnerabilities(&query).await.unwrap(), 3);

    let confirmed_only = VulnerabilityQuery {
        states: vec![VulnerabilityState::Confirmed],
        ..query
    };
    assert_eq!(store.count_vulnerabilities(&confirmed_only).await.unwrap(), 0);
}

#[tokio::test]
async fn evidence_failures_are_transient() {
    let store = MemoryStore::new();
    store.fail_evidence(1);

    let err = store
        .pipeline_findings(PipelineId(1), false)
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert!(store.pipeline_findings(PipelineId(1), false).await.is_ok());
}

#[tokio::test]
async fn open_merge_requests_by_branch_and_head() {
    let store = MemoryStore::new();
    let mr = |id: u64, target: &str, state: MergeRequestState, head: Option<u64>| MergeRequest {
        id: MergeRequestId(id),
        project_id: ProjectId(1),
        title: String::new(),
        state,
        source_branch: format!("feature-{id}"),
        target_branch: target.to_string(),
        head_pipeline_id: head.map(PipelineId),
    };
    store.insert_merge_request(mr(1, "main", MergeRequestState::Opened, Some(7)));
    store.insert_merge_request(mr(2, "main", MergeRequestState::Merged, Some(7)));
    store.insert_merge_request(mr(3, "stable", MergeRequestState::Opened, None));

    let by_head = store.opened_by_head_pipeline(PipelineId(7)).await.unwrap();
    assert_eq!(by_head.len(), 1);
    assert_eq!(by_head[0].id, MergeRequestId(1));

    let by_target = store
        .opened_by_target_branch(ProjectId(1), "main")
        .await
        .unwrap();
    assert_eq!(by_target.len(), 1);
}
