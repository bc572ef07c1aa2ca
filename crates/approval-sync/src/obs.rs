//! Structured observability hooks for reconciliation.
//!
//! This module provides:
//! - Merge-request-scoped tracing spans via [`sync_span`]
//! - Emission functions for the engine's key events: rule updates, skips,
//!   notifier failures, fan-out and job retries
//!
//! Events are emitted at `info!` level unless noted (filter with `RUST_LOG`).

use approval_state::{ApprovalRule, MergeRequestId, PipelineId, RuleKind};
use tracing::{error, info, warn};

/// Span tagged with the merge request and the synchronizer running against it.
///
/// Attach it with `tracing::Instrument` so it follows the future across
/// `.await` points.
///
/// # Example
///
/// ```ignore
/// sync(target).instrument(sync_span(MergeRequestId(42), "any_merge_request")).await
/// // every event inside is associated with merge_request_id = 42
/// ```
pub fn sync_span(merge_request_id: MergeRequestId, synchronizer: &str) -> tracing::Span {
    tracing::info_span!(
        "approval_sync.sync",
        merge_request_id = %merge_request_id,
        synchronizer = %synchronizer,
    )
}

/// Emit event: a rule was found violated and will require approval.
///
/// # Example
///
/// ```ignore
/// emit_update_approvals(&rule, "unsigned commits present");
/// // logs: event=update_approvals rule_id=7 rule_name=.. merge_request_id=42 reason=..
/// ```
pub fn emit_update_approvals(rule: &ApprovalRule, reason: &str) {
    info!(
        event = "update_approvals",
        rule_id = %rule.id,
        rule_name = %rule.name,
        merge_request_id = %rule.merge_request_id,
        reason = %reason,
    );
}

/// Emit event: rules of a merge request were reconciled as satisfied.
pub fn emit_approvals_satisfied(merge_request_id: MergeRequestId, rule_count: usize) {
    info!(
        event = "approvals.satisfied",
        merge_request_id = %merge_request_id,
        rules = rule_count,
    );
}

/// Emit event: a synchronizer did nothing for a merge request.
pub fn emit_sync_skipped(merge_request_id: MergeRequestId, reason: &str) {
    info!(
        event = "sync.skipped",
        merge_request_id = %merge_request_id,
        reason = %reason,
    );
}

/// Emit event: the fan-out ignored a pipeline.
pub fn emit_sync_skipped_pipeline(pipeline_id: PipelineId, reason: &str) {
    info!(
        event = "sync.skipped",
        pipeline_id = %pipeline_id,
        reason = %reason,
    );
}

/// Emit event: the comment notifier failed (warning level).
pub fn emit_notifier_failed(
    merge_request_id: MergeRequestId,
    kind: RuleKind,
    error: &dyn std::fmt::Display,
) {
    warn!(
        event = "notifier.failed",
        merge_request_id = %merge_request_id,
        kind = %kind,
        error = %error,
    );
}

/// Emit event: findings jobs dispatched for a finished pipeline.
pub fn emit_fanout_dispatched(pipeline_id: PipelineId, head_jobs: usize, target_jobs: usize) {
    info!(
        event = "fanout.dispatched",
        pipeline_id = %pipeline_id,
        head_jobs = head_jobs,
        target_jobs = target_jobs,
    );
}

/// Emit event: a job failed and will run again (warning level).
pub fn emit_job_retry(job_key: &str, attempt: u32, error: &dyn std::fmt::Display) {
    warn!(
        event = "job.retry",
        job_key = %job_key,
        attempt = attempt,
        error = %error,
    );
}

/// Emit event: a job gave up (error level).
pub fn emit_job_exhausted(job_key: &str, attempts: u32, error: &dyn std::fmt::Display) {
    error!(
        event = "job.exhausted",
        job_key = %job_key,
        attempts = attempts,
        error = %error,
    );
}

/// Emit event: a worker task ended abnormally and its totals are lost
/// (error level).
pub fn emit_worker_lost(worker: usize, error: &dyn std::fmt::Display) {
    error!(
        event = "worker.lost",
        worker = worker,
        error = %error,
    );
}
