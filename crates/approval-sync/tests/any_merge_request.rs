//! Commit-signature reconciliation of `any_merge_request` rules.

mod support;

use approval_state::*;
use approval_sync::{ReconciliationConfig, SkipReason, SyncJob, SyncOutcome};
use support::*;

fn unsigned_rule(id: u64, mr: u64, policy: u64, baseline: u32) -> ApprovalRule {
    rule(
        id,
        mr,
        RuleKind::AnyMergeRequest,
        baseline,
        criteria(policy).with_commits(CommitScope::Unsigned),
    )
}

fn job(mr: u64) -> SyncJob {
    SyncJob::AnyMergeRequest {
        merge_request_id: MergeRequestId(mr),
    }
}

#[tokio::test]
async fn unsigned_commit_violates_unsigned_scope() {
    let h = Harness::new();
    h.store.insert_merge_request(merge_request(1, "main", None));
    h.store.push_commit(MergeRequestId(1), Commit::signed("a1"));
    h.store.push_commit(MergeRequestId(1), Commit::unsigned("b2"));
    h.store.insert_rule(unsigned_rule(10, 1, 100, 2));

    let outcome = h.runner(ReconciliationConfig::default()).run(job(1)).await.unwrap();

    let report = outcome.report().expect("reconciled");
    assert_eq!(report.violated, vec![RuleId(10)]);
    assert_eq!(h.approvals_required(10), 2);
    assert_eq!(h.violated_policies(1), vec![PolicyId(100)]);
}

#[tokio::test]
async fn all_signed_commits_satisfy_unsigned_scope() {
    let h = Harness::new();
    h.store.insert_merge_request(merge_request(1, "main", None));
    h.store.push_commit(MergeRequestId(1), Commit::signed("a1"));
    h.store.push_commit(MergeRequestId(1), Commit::signed("b2"));
    h.store.insert_rule(unsigned_rule(10, 1, 100, 2));

    h.runner(ReconciliationConfig::default()).run(job(1)).await.unwrap();

    assert_eq!(h.approvals_required(10), 0);
    assert!(h.violated_policies(1).is_empty());
}

#[tokio::test]
async fn any_scope_is_always_violated() {
    let h = Harness::new();
    h.store.insert_merge_request(merge_request(1, "main", None));
    h.store.push_commit(MergeRequestId(1), Commit::signed("a1"));
    h.store.insert_rule(rule(
        10,
        1,
        RuleKind::AnyMergeRequest,
        1,
        criteria(100).with_commits(CommitScope::Any),
    ));

    h.runner(ReconciliationConfig::default()).run(job(1)).await.unwrap();

    assert_eq!(h.approvals_required(10), 1);
    assert_eq!(h.violated_policies(1), vec![PolicyId(100)]);
}

#[tokio::test]
async fn end_to_end_signed_then_unsigned_push() {
    let h = Harness::new();
    let runner = h.runner(ReconciliationConfig::default());
    h.store.insert_merge_request(merge_request(1, "main", None));
    h.store.push_commit(MergeRequestId(1), Commit::signed("a1"));
    h.store.insert_rule(unsigned_rule(10, 1, 100, 2));
    // A violation left over from an earlier evaluation.
    h.store.insert_violation(ViolationRecord {
        merge_request_id: MergeRequestId(1),
        policy_id: PolicyId(100),
        reason: "stale".into(),
        created_at: chrono::Utc::now(),
        violating_rules: Vec::new(),
    });

    runner.run(job(1)).await.unwrap();
    assert_eq!(h.approvals_required(10), 0);
    assert!(h.violated_policies(1).is_empty());

    h.store.push_commit(MergeRequestId(1), Commit::unsigned("c3"));
    runner.run(job(1)).await.unwrap();
    assert_eq!(h.approvals_required(10), 2);
    assert_eq!(h.violated_policies(1), vec![PolicyId(100)]);

    let calls = h.notifier.calls();
    let last = calls.last().expect("notifier called");
    assert_eq!(last.kind, RuleKind::AnyMergeRequest);
    assert_eq!(last.rules.len(), 1);
    assert_eq!(last.rules[0].id, RuleId(10));
    assert_eq!(last.rules[0].approvals_required, 2);
    let with_violations = calls.iter().filter(|c| !c.rules.is_empty()).count();
    assert_eq!(with_violations, 1);
}

#[tokio::test]
async fn rerun_with_same_evidence_changes_nothing() {
    let h = Harness::new();
    let runner = h.runner(ReconciliationConfig::default());
    h.store.insert_merge_request(merge_request(1, "main", None));
    h.store.push_commit(MergeRequestId(1), Commit::unsigned("a1"));
    h.store.insert_rule(unsigned_rule(10, 1, 100, 2));
    h.store.insert_rule(unsigned_rule(11, 1, 101, 0));

    let first = runner.run(job(1)).await.unwrap();
    let second = runner.run(job(1)).await.unwrap();

    assert!(first.report().unwrap().outcome.changed());
    assert!(!second.report().unwrap().outcome.changed());
    assert_eq!(h.store.all_violations().len(), 2);
    assert_eq!(h.signal.changed(), vec![MergeRequestId(1)]);
}

#[tokio::test]
async fn merged_merge_request_is_untouched() {
    let h = Harness::new();
    let mut mr = merge_request(1, "main", None);
    mr.state = MergeRequestState::Merged;
    h.store.insert_merge_request(mr);
    h.store.push_commit(MergeRequestId(1), Commit::unsigned("a1"));
    h.store.insert_rule(unsigned_rule(10, 1, 100, 2));

    let outcome = h.runner(ReconciliationConfig::default()).run(job(1)).await.unwrap();

    assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::MergeRequestNotOpen));
    assert_eq!(h.store.apply_calls(), 0);
    assert!(h.notifier.calls().is_empty());
    assert!(h.signal.changed().is_empty());
}

#[tokio::test]
async fn rules_without_criteria_are_ignored() {
    let h = Harness::new();
    h.store.insert_merge_request(merge_request(1, "main", None));
    h.store.push_commit(MergeRequestId(1), Commit::unsigned("a1"));
    let mut bare = unsigned_rule(10, 1, 100, 2);
    bare.criteria = None;
    h.store.insert_rule(bare);

    let outcome = h.runner(ReconciliationConfig::default()).run(job(1)).await.unwrap();

    assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::NoRules));
    assert_eq!(h.store.apply_calls(), 0);
    assert_eq!(h.approvals_required(10), 2);
}

#[tokio::test]
async fn notifier_failure_keeps_state_change() {
    let h = Harness::new();
    h.notifier.set_failing(true);
    h.store.insert_merge_request(merge_request(1, "main", None));
    h.store.push_commit(MergeRequestId(1), Commit::unsigned("a1"));
    h.store.insert_rule(unsigned_rule(10, 1, 100, 2));
    // Rule 11 starts satisfied so the run changes it.
    h.store.insert_rule(ApprovalRule {
        approvals_required: 0,
        ..unsigned_rule(11, 1, 101, 2)
    });

    let outcome = h.runner(ReconciliationConfig::default()).run(job(1)).await.unwrap();

    let report = outcome.report().unwrap();
    assert_eq!(report.notifier_errors.len(), 1);
    assert_eq!(h.approvals_required(11), 2);
    assert_eq!(h.violated_policies(1), vec![PolicyId(100), PolicyId(101)]);
    assert_eq!(h.signal.changed(), vec![MergeRequestId(1)]);
}

#[tokio::test]
async fn missing_merge_request_is_an_error() {
    let h = Harness::new();
    let err = h
        .runner(ReconciliationConfig::default())
        .run(job(99))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        approval_sync::SyncError::MergeRequestNotFound(MergeRequestId(99))
    ));
}

#[tokio::test]
async fn rules_of_a_violated_policy_all_require_approval() {
    let h = Harness::new();
    h.store.insert_merge_request(merge_request(1, "main", None));
    h.store.push_commit(MergeRequestId(1), Commit::signed("a1"));
    let mut any = rule(
        10,
        1,
        RuleKind::AnyMergeRequest,
        1,
        criteria(100).with_commits(CommitScope::Any),
    );
    any.approvals_required = 0;
    let mut unsigned = unsigned_rule(11, 1, 100, 2);
    unsigned.approvals_required = 0;
    h.store.insert_rule(any);
    h.store.insert_rule(unsigned);

    let outcome = h.runner(ReconciliationConfig::default()).run(job(1)).await.unwrap();

    let report = outcome.report().expect("reconciled");
    assert_eq!(report.violated, vec![RuleId(10), RuleId(11)]);
    assert!(report.satisfied.is_empty());
    assert_eq!(h.approvals_required(10), 1);
    assert_eq!(h.approvals_required(11), 2);
    assert_eq!(h.violated_policies(1), vec![PolicyId(100)]);
}
