//! SurrealDB-backed ApprovalStore implementation
//!
//! Uses `schema::ApprovalRuleRow` and `schema::ViolationRow` for persistence,
//! converting to/from model types at the boundary. Each change set is written
//! in a single `BEGIN/COMMIT` transaction that resolves every policy against
//! its current record and reports what changed from snapshots taken inside
//! the same transaction.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::migrations;
use crate::model::{ApprovalRule, MergeRequestId, RuleKind, ViolationRecord};
use crate::schema::{ApprovalRuleRow, ViolationRow};
use crate::storage_traits::{ApplyOutcome, ApprovalChangeSet, ApprovalStore, StorageResult};
use crate::StorageError;

/// SurrealDB-backed implementation of [`ApprovalStore`].
#[derive(Clone)]
pub struct SurrealApprovalStore {
    db: Surreal<Any>,
}

impl SurrealApprovalStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `approvals/main`, and runs `init_schema`.
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect("mem://").await
    }

    /// Connect to any `surrealdb::engine::any` endpoint
    /// (`mem://`, `surrealkv://path`, `ws://host:port`).
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns("approvals")
            .use_db("main")
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        migrations::init_schema(&db).await?;

        info!("SurrealApprovalStore connected ({})", url);
        Ok(Self { db })
    }

    /// Insert or replace an approval rule (rules are created upstream; this
    /// is how fixtures and propagation jobs load them).
    pub async fn upsert_rule(&self, rule: &ApprovalRule) -> StorageResult<()> {
        let row = ApprovalRuleRow::from(rule);
        let rule_id = rule.id.0;
        self.db
            .query("DELETE approval_rules WHERE rule_id = $rid; CREATE approval_rules CONTENT $row;")
            .bind(("rid", rule_id))
            .bind(("row", row))
            .await?
            .check()?;
        Ok(())
    }

    /// Insert a violation record unless one exists for its
    /// `(merge_request, policy)`. Used to load records written elsewhere.
    pub async fn insert_violation(&self, record: &ViolationRecord) -> StorageResult<()> {
        self.db
            .query(
                "IF array::len((SELECT id FROM policy_violations \
                 WHERE merge_request_id = $mr AND policy_id = $policy)) = 0 \
                 { CREATE policy_violations CONTENT $row; };",
            )
            .bind(("mr", record.merge_request_id.0))
            .bind(("policy", record.policy_id.0))
            .bind(("row", ViolationRow::from(record)))
            .await?
            .check()?;
        Ok(())
    }
}

/// Bound once per [`PolicyUpdate`](crate::storage_traits::PolicyUpdate).
#[derive(Debug, Serialize)]
struct PolicyUpdateRow {
    policy_id: u64,
    evaluated: Vec<u64>,
    violating: Vec<u64>,
    /// Inserted when the policy has no record yet
    record: ViolationRow,
}

#[derive(Debug, Deserialize)]
struct RuleApprovals {
    rule_id: u64,
    approvals_required: u32,
}

/// Rule and violation state read before and after the writes.
#[derive(Debug, Deserialize)]
struct ApplySnapshot {
    rules_before: Vec<RuleApprovals>,
    rules_after: Vec<RuleApprovals>,
    violations_before: Vec<u64>,
    violations_after: Vec<u64>,
}

impl ApplySnapshot {
    fn outcome(&self) -> ApplyOutcome {
        let before: BTreeMap<u64, u32> = self
            .rules_before
            .iter()
            .map(|r| (r.rule_id, r.approvals_required))
            .collect();
        let rules_changed = self
            .rules_after
            .iter()
            .filter(|r| before.get(&r.rule_id) != Some(&r.approvals_required))
            .count();

        let before: BTreeSet<u64> = self.violations_before.iter().copied().collect();
        let after: BTreeSet<u64> = self.violations_after.iter().copied().collect();
        ApplyOutcome {
            rules_changed,
            violations_added: after.difference(&before).count(),
            violations_removed: before.difference(&after).count(),
        }
    }
}

const APPLY_SQL: &str = r#"
BEGIN TRANSACTION;
LET $rules_before = (SELECT rule_id, approvals_required FROM approval_rules WHERE merge_request_id = $mr);
LET $violations_before = (SELECT VALUE policy_id FROM policy_violations WHERE merge_request_id = $mr);
FOR $update IN $updates {
    LET $existing = array::first((SELECT VALUE violating_rules FROM policy_violations
        WHERE merge_request_id = $mr AND policy_id = $update.policy_id)) ?? [];
    LET $violating = array::union(array::complement($existing, $update.evaluated), $update.violating);
    IF array::len($violating) > 0 {
        IF array::len((SELECT id FROM policy_violations
            WHERE merge_request_id = $mr AND policy_id = $update.policy_id)) = 0 {
            CREATE policy_violations CONTENT $update.record;
        };
        UPDATE policy_violations SET violating_rules = $violating
            WHERE merge_request_id = $mr AND policy_id = $update.policy_id;
        UPDATE approval_rules SET approvals_required = baseline_approvals_required
            WHERE merge_request_id = $mr AND criteria.policy_id = $update.policy_id
            AND approvals_required != baseline_approvals_required;
    } ELSE {
        DELETE policy_violations WHERE merge_request_id = $mr AND policy_id = $update.policy_id;
        UPDATE approval_rules SET approvals_required = 0
            WHERE merge_request_id = $mr AND criteria.policy_id = $update.policy_id
            AND approvals_required != 0;
    };
};
LET $rules_after = (SELECT rule_id, approvals_required FROM approval_rules WHERE merge_request_id = $mr);
LET $violations_after = (SELECT VALUE policy_id FROM policy_violations WHERE merge_request_id = $mr);
SELECT * FROM [{
    rules_before: $rules_before,
    rules_after: $rules_after,
    violations_before: $violations_before,
    violations_after: $violations_after
}];
COMMIT TRANSACTION;
"#;

#[async_trait]
impl ApprovalStore for SurrealApprovalStore {
    async fn rules_for(
        &self,
        merge_request_id: MergeRequestId,
        kind: RuleKind,
    ) -> StorageResult<Vec<ApprovalRule>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM approval_rules WHERE merge_request_id = $mr AND kind = $kind \
                 ORDER BY rule_id ASC",
            )
            .bind(("mr", merge_request_id.0))
            .bind(("kind", kind.as_str()))
            .await?;
        let rows: Vec<ApprovalRuleRow> = res.take(0)?;
        Ok(rows.into_iter().map(ApprovalRule::from).collect())
    }

    async fn violations_for(
        &self,
        merge_request_id: MergeRequestId,
    ) -> StorageResult<Vec<ViolationRecord>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM policy_violations WHERE merge_request_id = $mr \
                 ORDER BY policy_id ASC",
            )
            .bind(("mr", merge_request_id.0))
            .await?;
        let rows: Vec<ViolationRow> = res.take(0)?;
        Ok(rows.into_iter().map(ViolationRecord::from).collect())
    }

    async fn apply(&self, changes: &ApprovalChangeSet) -> StorageResult<ApplyOutcome> {
        if changes.is_empty() {
            return Ok(ApplyOutcome::default());
        }

        let mr = changes.merge_request_id;
        let updates: Vec<PolicyUpdateRow> = changes
            .policies
            .iter()
            .map(|update| PolicyUpdateRow {
                policy_id: update.policy_id.0,
                evaluated: update.evaluated.iter().map(|r| r.0).collect(),
                violating: update.violating.iter().map(|r| r.0).collect(),
                record: ViolationRow::new(
                    mr,
                    update.policy_id,
                    update.reason.clone(),
                    &update.violating,
                ),
            })
            .collect();

        let mut res = self
            .db
            .query(APPLY_SQL)
            .bind(("mr", mr.0))
            .bind(("updates", updates))
            .await?
            .check()?;

        // The snapshot is the last statement that yields a row; transaction
        // control statements may or may not occupy result slots.
        let mut snapshot = None;
        for idx in (0..res.num_statements()).rev() {
            let rows: Vec<ApplySnapshot> = res.take(idx).unwrap_or_default();
            if let Some(row) = rows.into_iter().next() {
                snapshot = Some(row);
                break;
            }
        }
        let outcome = snapshot
            .ok_or_else(|| StorageError::Backend("apply returned no snapshot".to_string()))?
            .outcome();

        debug!(
            merge_request_id = %mr,
            rules_changed = outcome.rules_changed,
            violations_added = outcome.violations_added,
            violations_removed = outcome.violations_removed,
            "approval change set committed"
        );
        Ok(outcome)
    }
}
