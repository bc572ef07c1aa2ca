//! SurrealDB schema migrations and initialization
//!
//! Sets up the approval tables with the constraints the reconciliation
//! engine relies on.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::storage_traits::StorageResult;

/// Initialize all approval tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing approval-sync SurrealDB schema");

    init_approval_rules_table(db).await?;
    init_policy_violations_table(db).await?;

    info!("approval-sync schema initialization complete");
    Ok(())
}

/// Initialize `approval_rules` table
///
/// Schema:
/// ```text
/// TABLE approval_rules {
///   rule_id:                      INT (unique)
///   merge_request_id:             INT (indexed)
///   name:                         STRING
///   kind:                         STRING (scan_finding | license_finding | any_merge_request)
///   approvals_required:           INT (0 = satisfied)
///   baseline_approvals_required:  INT (restored when violated)
///   criteria:                     OBJECT?
/// }
/// ```
async fn init_approval_rules_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing approval_rules table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS approval_rules SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_rule_id ON TABLE approval_rules COLUMNS rule_id UNIQUE;

        -- Rules are always read per merge request and kind
        DEFINE INDEX IF NOT EXISTS idx_mr_kind ON TABLE approval_rules COLUMNS merge_request_id, kind;
    "#;

    db.query(sql).await?.check()?;
    info!("approval_rules table initialized");
    Ok(())
}

/// Initialize `policy_violations` table
///
/// Schema:
/// ```text
/// TABLE policy_violations {
///   merge_request_id:  INT
///   policy_id:         INT
///   reason:            STRING
///   created_at:        DATETIME
///   violating_rules:   ARRAY<INT>
/// }
/// ```
///
/// Constraints:
/// - `(merge_request_id, policy_id)` is unique; concurrent writers racing
///   to record the same violation get a conflict and the first row wins.
async fn init_policy_violations_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing policy_violations table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS policy_violations SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_mr_policy ON TABLE policy_violations COLUMNS merge_request_id, policy_id UNIQUE;
    "#;

    db.query(sql).await?.check()?;
    info!("policy_violations table initialized");
    Ok(())
}
