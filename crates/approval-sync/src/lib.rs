//! Approval-Sync: security policy reconciliation for merge request approvals
//!
//! Keeps policy-backed approval rules in step with the evidence they guard:
//! commit signatures, pipeline security findings, detected licenses and
//! pre-existing vulnerabilities.
//!
//! ## Layer 1 - Reconciliation
//!
//! - `sync`: evaluators and the generic `RuleSynchronizer`
//! - `reconcile` + `ledger`: the shared, atomic update sequence
//! - `fanout` + `events` + `jobs`: from pipeline/merge request events to jobs
//! - `dispatch`: the at-least-once worker queue
//! - `notify`: comment notifier and live-update signal collaborators

pub mod config;
pub mod dispatch;
pub mod engine;
mod error;
pub mod events;
pub mod fakes;
pub mod fanout;
pub mod jobs;
pub mod ledger;
pub mod metrics;
pub mod notify;
pub mod obs;
pub mod reconcile;
pub mod sync;
pub mod telemetry;

pub use config::{DispatcherConfig, ReconciliationConfig, RetryPolicy};
pub use dispatch::{JobDispatcher, QueueDispatcher, WorkerPool, WorkerStats};
pub use engine::{Engine, Outputs};
pub use error::{Result, SyncError};
pub use events::{EventRouter, PolicyEvent};
pub use fanout::{FanoutReport, FindingsFanout};
pub use jobs::{EvidenceSources, JobHandler, JobRunner, SyncJob};
pub use ledger::ViolationLedger;
pub use metrics::METRICS;
pub use notify::{ApprovalSignal, BroadcastSignal, CommentNotifier, LogCommentNotifier};
pub use obs::{
    emit_approvals_satisfied, emit_fanout_dispatched, emit_job_exhausted, emit_job_retry,
    emit_notifier_failed, emit_sync_skipped, emit_update_approvals, sync_span,
};
pub use reconcile::{Reconciler, RuleVerdict, SyncReport};
pub use sync::{
    CommitSignatureEvaluator, Evaluation, PipelineFindingsEvaluator, PreexistingStateEvaluator,
    RuleEvaluator, RuleSynchronizer, SkipReason, SyncOutcome, SyncTarget,
};
pub use telemetry::init_tracing;
