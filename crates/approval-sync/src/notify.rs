//! Outbound collaborators: the bot comment and the live-update signal.

use approval_state::{ApprovalRule, MergeRequestId, RuleKind};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::info;

use crate::error::Result;

/// Posts or updates the single bot comment on a merge request.
///
/// Called once per rule kind after every reconciliation; an empty `rules`
/// list means nothing of that kind is violated any more.
#[async_trait]
pub trait CommentNotifier: Send + Sync {
    async fn notify_violations(
        &self,
        merge_request_id: MergeRequestId,
        rules: &[ApprovalRule],
        kind: RuleKind,
    ) -> Result<()>;
}

/// Tells subscribers (UI, websockets) that approval state changed.
pub trait ApprovalSignal: Send + Sync {
    fn approval_state_changed(&self, merge_request_id: MergeRequestId);
}

/// Notifier that writes the would-be comment to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCommentNotifier;

#[async_trait]
impl CommentNotifier for LogCommentNotifier {
    async fn notify_violations(
        &self,
        merge_request_id: MergeRequestId,
        rules: &[ApprovalRule],
        kind: RuleKind,
    ) -> Result<()> {
        let names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        info!(
            event = "comment.updated",
            merge_request_id = %merge_request_id,
            kind = %kind,
            violated = ?names,
        );
        Ok(())
    }
}

/// Signal backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastSignal {
    tx: broadcast::Sender<MergeRequestId>,
}

impl BroadcastSignal {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MergeRequestId> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSignal {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ApprovalSignal for BroadcastSignal {
    fn approval_state_changed(&self, merge_request_id: MergeRequestId) {
        // No subscribers is fine.
        let _ = self.tx.send(merge_request_id);
    }
}
