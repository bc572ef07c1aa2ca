//! The update sequence shared by every synchronizer.
//!
//! Given per-rule verdicts, a reconciliation:
//! 1. records each rule's verdict under its policy in the ledger,
//! 2. commits one atomic change set; the store keeps a policy violated while
//!    any rule (from this run or another) still violates it, resetting every
//!    rule of a violated policy to its baseline and zeroing the rest,
//! 3. reads the records back to classify each rule by its policy,
//! 4. logs each violated rule and calls the comment notifier per rule kind,
//! 5. fires the live-update signal when something actually changed.
//!
//! Verdicts are recomputed from evidence on every run, so re-running a
//! reconciliation with the same evidence converges to the same state.

use std::collections::BTreeMap;
use std::sync::Arc;

use approval_state::{
    ApplyOutcome, ApprovalRule, ApprovalStore, MergeRequestId, PolicyId, RuleId, RuleKind,
};
use serde::Serialize;

use crate::error::Result;
use crate::ledger::ViolationLedger;
use crate::metrics::METRICS;
use crate::notify::{ApprovalSignal, CommentNotifier};
use crate::obs;

/// The decision for a single rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleVerdict {
    pub rule: ApprovalRule,
    /// `Some(reason)` when violated
    pub violation: Option<String>,
}

impl RuleVerdict {
    pub fn violated(rule: ApprovalRule, reason: impl Into<String>) -> Self {
        Self {
            rule,
            violation: Some(reason.into()),
        }
    }

    pub fn satisfied(rule: ApprovalRule) -> Self {
        Self {
            rule,
            violation: None,
        }
    }

    pub fn is_violated(&self) -> bool {
        self.violation.is_some()
    }
}

/// What one reconciliation decided and wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub merge_request_id: MergeRequestId,
    pub violated: Vec<RuleId>,
    pub satisfied: Vec<RuleId>,
    pub outcome: ApplyOutcome,
    /// Notifier failures; the state change above still stands
    pub notifier_errors: Vec<String>,
}

/// Applies verdicts to the approval store and informs collaborators.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn ApprovalStore>,
    notifier: Arc<dyn CommentNotifier>,
    signal: Arc<dyn ApprovalSignal>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        notifier: Arc<dyn CommentNotifier>,
        signal: Arc<dyn ApprovalSignal>,
    ) -> Self {
        Self {
            store,
            notifier,
            signal,
        }
    }

    pub fn store(&self) -> &dyn ApprovalStore {
        self.store.as_ref()
    }

    /// Reconcile `verdicts` for one merge request.
    ///
    /// `kinds` lists the rule kinds the caller owns; the notifier is called
    /// once for each of them that has at least one verdict. Rules without
    /// policy criteria are ignored.
    pub async fn reconcile(
        &self,
        merge_request_id: MergeRequestId,
        kinds: &[RuleKind],
        verdicts: Vec<RuleVerdict>,
    ) -> Result<SyncReport> {
        let mut verdicts: Vec<RuleVerdict> = verdicts
            .into_iter()
            .filter(|v| v.rule.merge_request_id == merge_request_id && v.rule.policy_id().is_some())
            .collect();

        let mut ledger = ViolationLedger::new(merge_request_id);
        for verdict in &verdicts {
            let Some(policy_id) = verdict.rule.policy_id() else {
                continue;
            };
            match &verdict.violation {
                Some(reason) => ledger.add(policy_id, verdict.rule.id, reason.clone()),
                None => ledger.remove(policy_id, verdict.rule.id),
            }
        }

        let outcome = ledger.commit(self.store.as_ref()).await?;

        // A policy is violated as a whole: every rule it backs requires
        // approval while its record exists, whoever wrote it.
        let records: BTreeMap<PolicyId, String> = self
            .store
            .violations_for(merge_request_id)
            .await?
            .into_iter()
            .map(|v| (v.policy_id, v.reason))
            .collect();
        for verdict in verdicts.iter_mut() {
            let record = verdict.rule.policy_id().and_then(|p| records.get(&p));
            verdict.violation = match record {
                Some(reason) => verdict.violation.take().or_else(|| Some(reason.clone())),
                None => None,
            };
        }

        let (violated, satisfied): (Vec<&RuleVerdict>, Vec<&RuleVerdict>) =
            verdicts.iter().partition(|v| v.is_violated());
        for verdict in &violated {
            if let Some(reason) = &verdict.violation {
                obs::emit_update_approvals(&verdict.rule, reason);
            }
        }
        if !satisfied.is_empty() {
            obs::emit_approvals_satisfied(merge_request_id, satisfied.len());
        }
        METRICS.add_rules_violated(violated.len() as u64);
        METRICS.add_rules_satisfied(satisfied.len() as u64);

        let mut notifier_errors = Vec::new();
        for kind in kinds {
            if !verdicts.iter().any(|v| v.rule.kind == *kind) {
                continue;
            }
            let rules: Vec<ApprovalRule> = violated
                .iter()
                .filter(|v| v.rule.kind == *kind)
                .map(|v| ApprovalRule {
                    approvals_required: v.rule.baseline_approvals_required,
                    ..v.rule.clone()
                })
                .collect();
            if let Err(e) = self
                .notifier
                .notify_violations(merge_request_id, &rules, *kind)
                .await
            {
                obs::emit_notifier_failed(merge_request_id, *kind, &e);
                METRICS.inc_notifier_failures();
                notifier_errors.push(e.to_string());
            }
        }

        if outcome.changed() {
            self.signal.approval_state_changed(merge_request_id);
        }

        Ok(SyncReport {
            merge_request_id,
            violated: violated.iter().map(|v| v.rule.id).collect(),
            satisfied: satisfied.iter().map(|v| v.rule.id).collect(),
            outcome,
            notifier_errors,
        })
    }
}
