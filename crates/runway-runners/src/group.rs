//! Job group lifecycle: dispatch once, forward status changes to the
//! collaborator while in flight, then reconcile whatever the backend
//! left unresolved.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use runway_core::api::{NotifyClient, ObjectType, OutputNotification};
use runway_core::context::RunContext;
use runway_core::error::{RunwayError, RunwayResult};
use runway_core::runner::{Job, Runner, StatusUpdate};
use runway_core::types::TaskStatus;

/// Terminal counts for one dispatched group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub pending: usize,
}

impl GroupSummary {
    /// A group fails if any of its jobs failed.
    pub fn is_failed(&self) -> bool {
        self.failed > 0
    }
}

impl std::fmt::Display for GroupSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} jobs: {} succeeded, {} failed, {} pending",
            self.total, self.succeeded, self.failed, self.pending
        )
    }
}

/// A set of jobs dispatched together under one group token.
///
/// The token names the group on the backend (LSF job-name prefix, gateway
/// group id) so a later `stop` can address everything at once.
pub struct JobGroup {
    jobs: Vec<Job>,
    command_id: String,
    runner: Arc<dyn Runner>,
    notifier: Option<Arc<NotifyClient>>,
    commit_sha: String,
    dispatched: bool,
}

impl JobGroup {
    pub fn new(contexts: Vec<RunContext>, runner: Arc<dyn Runner>) -> Self {
        Self {
            jobs: contexts.into_iter().map(Job::new).collect(),
            command_id: Uuid::new_v4().to_string(),
            runner,
            notifier: None,
            commit_sha: String::new(),
            dispatched: false,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<NotifyClient>, commit_sha: &str) -> Self {
        self.notifier = Some(notifier);
        self.commit_sha = commit_sha.to_string();
        self
    }

    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Dispatches the group. A group can be started at most once.
    ///
    /// When `wait` is set, the call returns only once every job reached a
    /// terminal status; any job the backend left pending or running is
    /// then force-failed during reconciliation. Without `wait`, jobs stay
    /// pending and reconciliation is deferred to the backend.
    pub async fn start(&mut self, wait: bool, cancel: &CancellationToken) -> RunwayResult<GroupSummary> {
        if self.dispatched {
            return Err(RunwayError::Config(
                "job group was already dispatched".to_string(),
            ));
        }
        self.dispatched = true;
        if self.jobs.is_empty() {
            warn!(group = %self.command_id, "empty job group, nothing to dispatch");
            return Ok(self.summary());
        }
        info!(
            group = %self.command_id,
            runner = self.runner.kind().as_str(),
            jobs = self.jobs.len(),
            "dispatching job group"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let forwarder = self.spawn_forwarder(events_rx);

        let result = self
            .runner
            .start_group(&mut self.jobs, &self.command_id, wait, events_tx, cancel)
            .await;

        // The sender side was dropped by start_group returning; drain the
        // forwarder and record any collaborator ids it collected.
        if let Some(forwarder) = forwarder {
            if let Ok(record_ids) = forwarder.await {
                for (idx, record_id) in record_ids {
                    if let Some(job) = self.jobs.get_mut(idx) {
                        job.record_id.get_or_insert(record_id);
                    }
                }
            }
        }

        match result {
            Ok(()) => {}
            Err(RunwayError::Cancelled) => {
                self.reconcile(wait).await;
                return Err(RunwayError::Cancelled);
            }
            Err(e) => return Err(e),
        }

        self.reconcile(wait).await;
        Ok(self.summary())
    }

    /// Consumes in-flight status updates and POSTs one notification per
    /// transition. Runs on a snapshot of the contexts so the runner keeps
    /// exclusive access to the jobs themselves.
    fn spawn_forwarder(
        &self,
        mut events: mpsc::UnboundedReceiver<StatusUpdate>,
    ) -> Option<tokio::task::JoinHandle<Vec<(usize, String)>>> {
        let notifier = self.notifier.clone()?;
        let mut snapshots: Vec<RunContext> =
            self.jobs.iter().map(|job| job.context.clone()).collect();
        // A run tied to a commit is a CI run; everything else is local.
        let job_type = if self.commit_sha.is_empty() { "local" } else { "ci" };
        let commit_sha = self.commit_sha.clone();

        Some(tokio::spawn(async move {
            let mut record_ids = Vec::new();
            while let Some(update) = events.recv().await {
                let Some(snapshot) = snapshots.get_mut(update.job_index) else {
                    continue;
                };
                snapshot.set_status(update.status);
                let payload = OutputNotification::for_context(snapshot, job_type, &commit_sha);
                if let Some(id) = notifier.notify(ObjectType::Output, &payload).await {
                    record_ids.push((update.job_index, id));
                }
            }
            record_ids
        }))
    }

    /// Post-wait cleanup: a job that is still pending or running after a
    /// blocking dispatch is lost and gets force-failed. When a collaborator
    /// record exists it is consulted first, in case the backend finished
    /// the job but the local signal was missed.
    async fn reconcile(&mut self, waited: bool) {
        if !waited {
            return;
        }
        for job in &mut self.jobs {
            if job.context.status().is_terminal() {
                continue;
            }
            if let (Some(notifier), Some(record_id)) = (&self.notifier, &job.record_id) {
                match notifier.fetch(ObjectType::Output, record_id).await {
                    Ok(record) if !record.is_pending && !record.is_running => {
                        let status = if record.is_failed {
                            TaskStatus::Failed
                        } else {
                            TaskStatus::Succeeded
                        };
                        info!(
                            job = %job.context.label(),
                            status = status.as_str(),
                            "reconciled from collaborator record"
                        );
                        if status == TaskStatus::Succeeded {
                            // Success is only reachable through Running.
                            job.context.set_status(TaskStatus::Pending);
                            job.context.set_status(TaskStatus::Running);
                        }
                        job.context.set_status(status);
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(job = %job.context.label(), "reconciliation fetch failed: {e}");
                    }
                }
            }
            warn!(
                job = %job.context.label(),
                status = job.context.status().as_str(),
                "job did not reach a terminal status, marking failed"
            );
            job.context.set_status(TaskStatus::Failed);
        }
    }

    /// Stops every task of the group on its backend. Before dispatch this
    /// is a no-op: there is nothing to address yet.
    pub async fn stop(&self) -> RunwayResult<()> {
        if !self.dispatched {
            return Ok(());
        }
        self.runner.stop_group(&self.command_id).await
    }

    pub fn summary(&self) -> GroupSummary {
        let mut summary = GroupSummary {
            total: self.jobs.len(),
            ..Default::default()
        };
        for job in &self.jobs {
            match job.context.status() {
                TaskStatus::Succeeded => summary.succeeded += 1,
                TaskStatus::Failed => summary.failed += 1,
                _ => summary.pending += 1,
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use runway_core::context::RunContextBuilder;
    use runway_core::runner::StatusSender;
    use runway_core::types::RunnerKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Applies a fixed status per job and records stop calls.
    struct ScriptedRunner {
        statuses: Vec<Option<TaskStatus>>,
        stops: AtomicUsize,
    }

    impl ScriptedRunner {
        fn new(statuses: Vec<Option<TaskStatus>>) -> Self {
            Self {
                statuses,
                stops: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Runner for ScriptedRunner {
        fn kind(&self) -> RunnerKind {
            RunnerKind::Local
        }

        async fn start(&self, _job: &mut Job, _group_token: &str) -> RunwayResult<String> {
            Ok("scripted".to_string())
        }

        async fn start_group(
            &self,
            jobs: &mut [Job],
            _group_token: &str,
            _wait: bool,
            events: StatusSender,
            _cancel: &CancellationToken,
        ) -> RunwayResult<()> {
            for (idx, job) in jobs.iter_mut().enumerate() {
                job.context.set_status(TaskStatus::Pending);
                let _ = events.send(StatusUpdate {
                    job_index: idx,
                    status: TaskStatus::Pending,
                    error: None,
                });
                if let Some(Some(status)) = self.statuses.get(idx) {
                    job.context.set_status(TaskStatus::Running);
                    job.context.set_status(*status);
                }
            }
            Ok(())
        }

        async fn stop_group(&self, _group_token: &str) -> RunwayResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn contexts(n: usize) -> Vec<RunContext> {
        (0..n)
            .map(|i| {
                RunContextBuilder::new("batch", "linux")
                    .database("/db")
                    .input(format!("/db/in-{i}.raw"))
                    .output_root("/out")
                    .build()
                    .unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_group_failure_is_any_job_failure() {
        let runner = Arc::new(ScriptedRunner::new(vec![
            Some(TaskStatus::Succeeded),
            Some(TaskStatus::Failed),
            Some(TaskStatus::Succeeded),
        ]));
        let mut group = JobGroup::new(contexts(3), runner);
        let summary = group
            .start(true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert!(summary.is_failed());
    }

    #[tokio::test]
    async fn test_reconciliation_fails_jobs_left_pending() {
        // The second job never reaches a terminal status.
        let runner = Arc::new(ScriptedRunner::new(vec![Some(TaskStatus::Succeeded), None]));
        let mut group = JobGroup::new(contexts(2), runner);
        let summary = group
            .start(true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 0);
        assert_eq!(group.jobs()[1].context.status(), TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_no_wait_leaves_pending_jobs_alone() {
        let runner = Arc::new(ScriptedRunner::new(vec![None]));
        let mut group = JobGroup::new(contexts(1), runner);
        let summary = group
            .start(false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.failed, 0);
        assert!(!summary.is_failed());
    }

    #[tokio::test]
    async fn test_group_dispatches_at_most_once() {
        let runner = Arc::new(ScriptedRunner::new(vec![Some(TaskStatus::Succeeded)]));
        let mut group = JobGroup::new(contexts(1), runner);
        group.start(true, &CancellationToken::new()).await.unwrap();
        let err = group
            .start(true, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunwayError::Config(_)));
    }

    #[tokio::test]
    async fn test_stop_before_dispatch_is_noop() {
        let runner = Arc::new(ScriptedRunner::new(vec![None]));
        let mut group = JobGroup::new(contexts(1), runner.clone());
        group.stop().await.unwrap();
        assert_eq!(runner.stops.load(Ordering::SeqCst), 0);
        group.start(false, &CancellationToken::new()).await.unwrap();
        group.stop().await.unwrap();
        assert_eq!(runner.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_group_is_clean() {
        let runner = Arc::new(ScriptedRunner::new(Vec::new()));
        let mut group = JobGroup::new(Vec::new(), runner);
        let summary = group
            .start(true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary, GroupSummary::default());
        assert!(!summary.is_failed());
    }
}
