//! The pluggable runner seam.
//!
//! A runner knows how to start one task and how to stop a whole named
//! group of tasks. Implementations live in `runway-runners`; the engine
//! depends only on this trait. Status changes are pushed over a channel
//! so the owner can forward them to the status collaborator while the
//! group is still in flight.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::RunContext;
use crate::error::RunwayResult;
use crate::types::{RunnerKind, TaskStatus};

/// One task wrapped with its backend bookkeeping.
#[derive(Debug)]
pub struct Job {
    pub context: RunContext,
    /// Opaque backend handle (execution id, LSF job id, build URL).
    pub external_id: Option<String>,
    /// Collaborator record id, used during reconciliation.
    pub record_id: Option<String>,
}

impl Job {
    pub fn new(context: RunContext) -> Self {
        Self {
            context,
            external_id: None,
            record_id: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.context.status() == TaskStatus::Failed
    }
}

/// Status change pushed from a runner while a group is in flight.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub job_index: usize,
    pub status: TaskStatus,
    pub error: Option<String>,
}

pub type StatusSender = mpsc::UnboundedSender<StatusUpdate>;

#[async_trait]
pub trait Runner: Send + Sync {
    fn kind(&self) -> RunnerKind;

    /// Submits one job, returning the opaque backend handle. A rejection
    /// is fatal for this job only; siblings continue.
    async fn start(&self, job: &mut Job, group_token: &str) -> RunwayResult<String>;

    /// Dispatches all jobs, in order, then waits for completion when
    /// `wait` is set. Terminal statuses are written back into `jobs`;
    /// in-flight transitions are additionally pushed on `events`.
    /// Cancellation is best effort: work already past its point of no
    /// return is not rolled back.
    async fn start_group(
        &self,
        jobs: &mut [Job],
        group_token: &str,
        wait: bool,
        events: StatusSender,
        cancel: &CancellationToken,
    ) -> RunwayResult<()>;

    /// Stops every task submitted under `group_token`.
    async fn stop_group(&self, group_token: &str) -> RunwayResult<()>;
}
