//! Recording collaborators for tests.

use std::sync::Mutex;

use approval_state::{ApprovalRule, MergeRequestId, RuleKind};
use async_trait::async_trait;

use crate::dispatch::JobDispatcher;
use crate::error::{Result, SyncError};
use crate::jobs::SyncJob;
use crate::notify::{ApprovalSignal, CommentNotifier};

/// One `notify_violations` call.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifierCall {
    pub merge_request_id: MergeRequestId,
    pub kind: RuleKind,
    pub rules: Vec<ApprovalRule>,
}

/// Notifier that records every call and can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<NotifierCall>>,
    failing: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent calls fail (after recording them).
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn calls(&self) -> Vec<NotifierCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommentNotifier for RecordingNotifier {
    async fn notify_violations(
        &self,
        merge_request_id: MergeRequestId,
        rules: &[ApprovalRule],
        kind: RuleKind,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(NotifierCall {
            merge_request_id,
            kind,
            rules: rules.to_vec(),
        });
        if *self.failing.lock().unwrap() {
            return Err(SyncError::Notifier("comment service unavailable".into()));
        }
        Ok(())
    }
}

/// Signal that records which merge requests changed.
#[derive(Debug, Default)]
pub struct RecordingSignal {
    changed: Mutex<Vec<MergeRequestId>>,
}

impl RecordingSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn changed(&self) -> Vec<MergeRequestId> {
        self.changed.lock().unwrap().clone()
    }
}

impl ApprovalSignal for RecordingSignal {
    fn approval_state_changed(&self, merge_request_id: MergeRequestId) {
        self.changed.lock().unwrap().push(merge_request_id);
    }
}

/// Dispatcher that records jobs instead of running them.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    jobs: Mutex<Vec<SyncJob>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<SyncJob> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobDispatcher for RecordingDispatcher {
    async fn dispatch(&self, job: SyncJob) -> Result<()> {
        self.jobs.lock().unwrap().push(job);
        Ok(())
    }
}
