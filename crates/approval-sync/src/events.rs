//! Inbound policy events and their routing to jobs.

use std::sync::Arc;

use approval_state::{MergeRequestId, PipelineId};
use serde::{Deserialize, Serialize};

use crate::dispatch::JobDispatcher;
use crate::error::Result;
use crate::fanout::FindingsFanout;
use crate::jobs::SyncJob;

/// Something happened that may change which rules are violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PolicyEvent {
    PipelineCompleted { pipeline_id: PipelineId },
    PipelineHasFindings { pipeline_id: PipelineId },
    /// New commits, approval reset, reopened, retargeted
    MergeRequestMutated { merge_request_id: MergeRequestId },
}

/// Turns events into dispatched jobs.
pub struct EventRouter {
    fanout: FindingsFanout,
    dispatcher: Arc<dyn JobDispatcher>,
}

impl EventRouter {
    pub fn new(fanout: FindingsFanout, dispatcher: Arc<dyn JobDispatcher>) -> Self {
        Self { fanout, dispatcher }
    }

    /// Route one event; returns the jobs handed to the dispatcher.
    pub async fn route(&self, event: PolicyEvent) -> Result<Vec<SyncJob>> {
        match event {
            PolicyEvent::PipelineCompleted { pipeline_id }
            | PolicyEvent::PipelineHasFindings { pipeline_id } => {
                let report = self.fanout.on_pipeline_finished(pipeline_id).await?;
                Ok(report.jobs().copied().collect())
            }
            PolicyEvent::MergeRequestMutated { merge_request_id } => {
                let jobs = [
                    SyncJob::AnyMergeRequest { merge_request_id },
                    SyncJob::PreexistingStates { merge_request_id },
                ];
                for job in jobs {
                    self.dispatcher.dispatch(job).await?;
                }
                Ok(jobs.to_vec())
            }
        }
    }
}
