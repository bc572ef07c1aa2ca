//! Row shapes for the SurrealDB approval tables
//!
//! Tables:
//! - approval_rules: policy-backed approval rules per merge request
//! - policy_violations: currently violated policies per merge request

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::criteria::PolicyCriteria;
use crate::model::{ApprovalRule, MergeRequestId, PolicyId, RuleId, RuleKind, ViolationRecord};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// `approval_rules` row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRuleRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub rule_id: u64,
    pub merge_request_id: u64,
    pub name: String,
    pub kind: RuleKind,
    pub approvals_required: u32,
    pub baseline_approvals_required: u32,
    #[serde(default)]
    pub criteria: Option<PolicyCriteria>,
}

impl From<&ApprovalRule> for ApprovalRuleRow {
    fn from(rule: &ApprovalRule) -> Self {
        Self {
            id: None,
            rule_id: rule.id.0,
            merge_request_id: rule.merge_request_id.0,
            name: rule.name.clone(),
            kind: rule.kind,
            approvals_required: rule.approvals_required,
            baseline_approvals_required: rule.baseline_approvals_required,
            criteria: rule.criteria.clone(),
        }
    }
}

impl From<ApprovalRuleRow> for ApprovalRule {
    fn from(row: ApprovalRuleRow) -> Self {
        Self {
            id: RuleId(row.rule_id),
            merge_request_id: MergeRequestId(row.merge_request_id),
            name: row.name,
            kind: row.kind,
            approvals_required: row.approvals_required,
            baseline_approvals_required: row.baseline_approvals_required,
            criteria: row.criteria,
        }
    }
}

/// `policy_violations` row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub merge_request_id: u64,
    pub policy_id: u64,
    pub reason: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub violating_rules: Vec<u64>,
}

impl ViolationRow {
    pub fn new(
        merge_request_id: MergeRequestId,
        policy_id: PolicyId,
        reason: String,
        violating_rules: &[RuleId],
    ) -> Self {
        Self {
            id: None,
            merge_request_id: merge_request_id.0,
            policy_id: policy_id.0,
            reason,
            created_at: Utc::now(),
            violating_rules: violating_rules.iter().map(|r| r.0).collect(),
        }
    }
}

impl From<&ViolationRecord> for ViolationRow {
    fn from(record: &ViolationRecord) -> Self {
        Self {
            id: None,
            merge_request_id: record.merge_request_id.0,
            policy_id: record.policy_id.0,
            reason: record.reason.clone(),
            created_at: record.created_at,
            violating_rules: record.violating_rules.iter().map(|r| r.0).collect(),
        }
    }
}

impl From<ViolationRow> for ViolationRecord {
    fn from(row: ViolationRow) -> Self {
        Self {
            merge_request_id: MergeRequestId(row.merge_request_id),
            policy_id: PolicyId(row.policy_id),
            reason: row.reason,
            created_at: row.created_at,
            violating_rules: row.violating_rules.into_iter().map(RuleId).collect(),
        }
    }
}
