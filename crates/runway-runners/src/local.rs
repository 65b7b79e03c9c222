//! Local runner: executes commands as child processes under a bounded
//! worker pool. Blocking is the only mode; a non-blocking request is
//! honored as blocking with a warning.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use runway_core::error::{RunwayError, RunwayResult};
use runway_core::manifest::{OutputManifest, MANIFEST_NAME};
use runway_core::runner::{Job, Runner, StatusSender, StatusUpdate};
use runway_core::types::{RunnerKind, TaskStatus};

/// Marker written at dispatch and removed on completion; its presence is
/// the local "still pending" signal when the collaborator is unreachable.
pub const PENDING_MARKER: &str = ".pending";
const LOG_NAME: &str = "log.txt";

pub struct LocalRunner {
    concurrency: i64,
}

impl LocalRunner {
    /// `concurrency <= 0` means "CPU count - 1" (at least 1).
    pub fn new(concurrency: i64) -> Self {
        Self { concurrency }
    }

    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency > 0 {
            return self.concurrency as usize;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        cpus.saturating_sub(1).max(1)
    }
}

/// Runs one command with its working directory and log inside
/// `output_dir`, writes the output manifest, and clears the pending
/// marker. Cancellation kills the child.
async fn run_local_job(
    command: String,
    output_dir: PathBuf,
    cancel: CancellationToken,
) -> (TaskStatus, Option<String>) {
    if let Err(e) = tokio::fs::create_dir_all(&output_dir).await {
        return (TaskStatus::Failed, Some(e.to_string()));
    }
    let _ = tokio::fs::write(output_dir.join(PENDING_MARKER), b"").await;

    let log_path = output_dir.join(LOG_NAME);
    let mut log = match tokio::fs::File::create(&log_path).await {
        Ok(log) => log,
        Err(e) => return (TaskStatus::Failed, Some(e.to_string())),
    };

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&command)
        .current_dir(&output_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = tokio::fs::remove_file(output_dir.join(PENDING_MARKER)).await;
            return (TaskStatus::Failed, Some(format!("failed to spawn: {e}")));
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let status = tokio::select! {
        result = child.wait() => match result {
            Ok(exit) if exit.success() => TaskStatus::Succeeded,
            Ok(exit) => {
                warn!(command, %exit, "local job failed");
                TaskStatus::Failed
            }
            Err(e) => {
                warn!(command, "failed to wait on local job: {e}");
                TaskStatus::Failed
            }
        },
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            warn!(command, "local job cancelled");
            TaskStatus::Failed
        }
    };

    // Drain captured output into the job log.
    if let Some(mut stdout) = stdout {
        let _ = tokio::io::copy(&mut stdout, &mut log).await;
    }
    if let Some(mut stderr) = stderr {
        let _ = tokio::io::copy(&mut stderr, &mut log).await;
    }
    let _ = log.flush().await;

    if status == TaskStatus::Succeeded {
        if let Err(e) = write_manifest(&output_dir) {
            let _ = tokio::fs::remove_file(output_dir.join(PENDING_MARKER)).await;
            return (TaskStatus::Failed, Some(e.to_string()));
        }
    }
    let _ = tokio::fs::remove_file(output_dir.join(PENDING_MARKER)).await;

    let error = match status {
        TaskStatus::Failed => Some(format!("command `{command}` failed")),
        _ => None,
    };
    (status, error)
}

fn write_manifest(output_dir: &Path) -> RunwayResult<()> {
    OutputManifest::from_dir(output_dir)?.write_atomic(&output_dir.join(MANIFEST_NAME))
}

#[async_trait]
impl Runner for LocalRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Local
    }

    async fn start(&self, job: &mut Job, _group_token: &str) -> RunwayResult<String> {
        job.context.set_status(TaskStatus::Pending);
        job.context.set_status(TaskStatus::Running);
        let (status, error) = run_local_job(
            job.context.command.clone(),
            job.context.output_dir.clone(),
            CancellationToken::new(),
        )
        .await;
        job.context.set_status(status);
        match error {
            Some(reason) if status == TaskStatus::Failed => Err(RunwayError::Submission {
                runner: "local",
                job: job.context.label(),
                reason,
            }),
            _ => Ok(format!("local:{}", std::process::id())),
        }
    }

    async fn start_group(
        &self,
        jobs: &mut [Job],
        group_token: &str,
        wait: bool,
        events: StatusSender,
        cancel: &CancellationToken,
    ) -> RunwayResult<()> {
        if !wait {
            warn!("local runner supports no asynchronous mode; waiting anyway");
        }
        let limit = self.effective_concurrency();
        info!(group = group_token, jobs = jobs.len(), limit, "dispatching local group");

        let semaphore = Arc::new(Semaphore::new(limit));
        let mut running = FuturesUnordered::new();

        for (idx, job) in jobs.iter_mut().enumerate() {
            job.context.set_status(TaskStatus::Pending);
            let _ = events.send(StatusUpdate {
                job_index: idx,
                status: TaskStatus::Pending,
                error: None,
            });

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore closed");
            let command = job.context.command.clone();
            let output_dir = job.context.output_dir.clone();
            let cancel = cancel.clone();
            let events = events.clone();

            running.push(tokio::spawn(async move {
                let _ = events.send(StatusUpdate {
                    job_index: idx,
                    status: TaskStatus::Running,
                    error: None,
                });
                let (status, error) = run_local_job(command, output_dir, cancel).await;
                drop(permit);
                let _ = events.send(StatusUpdate {
                    job_index: idx,
                    status,
                    error: error.clone(),
                });
                (idx, status)
            }));
        }

        while let Some(joined) = running.next().await {
            match joined {
                Ok((idx, status)) => {
                    jobs[idx].context.set_status(TaskStatus::Running);
                    jobs[idx].context.set_status(status);
                }
                Err(join_err) => {
                    warn!("local worker panicked: {join_err}");
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(RunwayError::Cancelled);
        }
        Ok(())
    }

    async fn stop_group(&self, group_token: &str) -> RunwayResult<()> {
        // Children are owned by this process and killed through the
        // cancellation token; nothing survives the group to stop.
        info!(group = group_token, "local group stop requested");
        Ok(())
    }
}
