//! Violation ledger: what one reconciliation saw for each policy.
//!
//! Every evaluated rule is recorded under its policy as violating or not,
//! then the ledger commits once. The store decides whether the policy stays
//! violated by combining this run's rules with the rules other runs left in
//! the record, so a job never clears a violation it did not evaluate.

use std::collections::BTreeMap;

use approval_state::{
    ApplyOutcome, ApprovalChangeSet, ApprovalStore, MergeRequestId, PolicyId, PolicyUpdate,
    RuleId, StorageError,
};
use tracing::debug;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationLedger {
    merge_request_id: MergeRequestId,
    policies: BTreeMap<PolicyId, PolicyUpdate>,
}

impl ViolationLedger {
    pub fn new(merge_request_id: MergeRequestId) -> Self {
        Self {
            merge_request_id,
            policies: BTreeMap::new(),
        }
    }

    pub fn merge_request_id(&self) -> MergeRequestId {
        self.merge_request_id
    }

    fn entry(&mut self, policy_id: PolicyId, rule_id: RuleId) -> &mut PolicyUpdate {
        let update = self
            .policies
            .entry(policy_id)
            .or_insert_with(|| PolicyUpdate::new(policy_id));
        if !update.evaluated.contains(&rule_id) {
            update.evaluated.push(rule_id);
        }
        update
    }

    /// Record `rule_id` as violating `policy_id`. The first reason is kept.
    pub fn add(&mut self, policy_id: PolicyId, rule_id: RuleId, reason: impl Into<String>) {
        let update = self.entry(policy_id, rule_id);
        if update.violating.is_empty() {
            update.reason = reason.into();
        }
        if !update.violating.contains(&rule_id) {
            update.violating.push(rule_id);
        }
    }

    /// Record `rule_id` as satisfying `policy_id`.
    pub fn remove(&mut self, policy_id: PolicyId, rule_id: RuleId) {
        self.entry(policy_id, rule_id);
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Policies this run found violated by at least one of its own rules.
    pub fn violated(&self) -> impl Iterator<Item = PolicyId> + '_ {
        self.policies
            .values()
            .filter(|u| !u.violating.is_empty())
            .map(|u| u.policy_id)
    }

    /// Copy the ledger's policy updates into `changes`.
    pub fn stage(&self, changes: &mut ApprovalChangeSet) {
        changes.policies.extend(self.policies.values().cloned());
    }

    /// Apply every policy update in one store call.
    ///
    /// A `Conflict` means a concurrent job inserted one of our records
    /// first. The set is applied once more and resolves against that record.
    pub async fn commit(self, store: &dyn ApprovalStore) -> Result<ApplyOutcome> {
        let mut changes = ApprovalChangeSet::new(self.merge_request_id);
        self.stage(&mut changes);
        if changes.is_empty() {
            return Ok(ApplyOutcome::default());
        }

        match store.apply(&changes).await {
            Ok(outcome) => Ok(outcome),
            Err(StorageError::Conflict(message)) => {
                debug!(
                    merge_request_id = %self.merge_request_id,
                    conflict = %message,
                    "violation recorded concurrently; reapplying"
                );
                Ok(store.apply(&changes).await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}
