//! Windows runner: drops a batch script into each output directory and
//! triggers a parameterized Jenkins build per job. The Windows agents
//! share the output filesystem, so a finished script leaves the same
//! exit-marker files the other remote runners use; build health is
//! tracked through the Jenkins queue and build status endpoints so an
//! aborted or failed build is not mistaken for a running one.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use runway_core::error::{RunwayError, RunwayResult};
use runway_core::runner::{Job, Runner, StatusSender, StatusUpdate};
use runway_core::types::{RunnerKind, TaskStatus};

use crate::local::PENDING_MARKER;
use crate::lsf::{probe_output, EXIT_MARKER};

const SCRIPT_NAME: &str = "run.cmd";
/// Grace before the first poll, so a just-triggered build can leave the
/// Jenkins queue.
const QUIET_PERIOD: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

pub struct WindowsRunner {
    client: reqwest::Client,
    base_url: String,
    job_name: String,
    quiet_period: Duration,
    poll_interval: Duration,
    wait_timeout: Duration,
}

/// Where a triggered build currently lives on the Jenkins side.
enum BuildHandle {
    /// Queue-item URL from the trigger response's Location header.
    Queued(String),
    /// Build URL, once the queue item got an executor.
    Started(String),
    /// Trigger gave no Location header; only the exit marker can tell.
    Untracked,
}

#[derive(Debug, Deserialize)]
struct QueueItem {
    #[serde(default)]
    cancelled: bool,
    #[serde(default)]
    executable: Option<Executable>,
}

#[derive(Debug, Deserialize)]
struct Executable {
    url: String,
}

#[derive(Debug, Deserialize)]
struct BuildState {
    #[serde(default)]
    building: bool,
    #[serde(default)]
    result: Option<String>,
}

/// Maps a Jenkins build result onto a terminal status. A build that is
/// still running, or queued without a result yet, maps to `None`.
fn terminal_status(state: &BuildState) -> Option<TaskStatus> {
    if state.building {
        return None;
    }
    match state.result.as_deref() {
        Some("SUCCESS") => Some(TaskStatus::Succeeded),
        Some("FAILURE" | "ABORTED" | "UNSTABLE" | "NOT_BUILT") => Some(TaskStatus::Failed),
        _ => None,
    }
}

impl WindowsRunner {
    pub fn new(base_url: impl Into<String>, job_name: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            job_name: job_name.into(),
            quiet_period: QUIET_PERIOD,
            poll_interval: POLL_INTERVAL,
            wait_timeout: WAIT_TIMEOUT,
        }
    }

    /// Overrides the default poll cadence and wait deadline.
    pub fn with_timing(
        mut self,
        quiet_period: Duration,
        poll_interval: Duration,
        wait_timeout: Duration,
    ) -> Self {
        self.quiet_period = quiet_period;
        self.poll_interval = poll_interval;
        self.wait_timeout = wait_timeout;
        self
    }

    /// Jenkins reports queue items and builds with absolute URLs but the
    /// Location header may be relative when behind a proxy.
    fn absolute(&self, url: &str) -> String {
        let trimmed = url.trim_end_matches('/');
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("{}/{}", self.base_url, trimmed.trim_start_matches('/'))
        }
    }

    /// Triggers one parameterized build. Returns the queue-item URL when
    /// Jenkins reports one back.
    async fn trigger_build(&self, job: &Job, group_token: &str) -> RunwayResult<Option<String>> {
        let url = format!("{}/job/{}/buildWithParameters", self.base_url, self.job_name);
        let response = self
            .client
            .post(&url)
            .query(&[
                ("GROUP_ID", group_token),
                (
                    "OUTPUT_DIR",
                    &job.context.output_dir.to_string_lossy().to_string(),
                ),
                ("SCRIPT", SCRIPT_NAME),
            ])
            .send()
            .await
            .map_err(|e| RunwayError::Submission {
                runner: "windows",
                job: job.context.label(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(RunwayError::Submission {
                runner: "windows",
                job: job.context.label(),
                reason: format!("jenkins returned {}", response.status()),
            });
        }
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| self.absolute(value));
        Ok(location)
    }

    async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> RunwayResult<T> {
        let response = self
            .client
            .get(format!("{url}/api/json"))
            .send()
            .await
            .map_err(|e| RunwayError::Api(format!("GET {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(RunwayError::Api(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| RunwayError::Api(format!("GET {url}: {e}")))
    }

    /// One poll step for a single job. Advances the queue item to its
    /// build once scheduled, adopts a terminal build result, and falls
    /// back to the exit marker for builds Jenkins still calls green.
    /// Returns the settled status, or `None` while the build is live.
    async fn poll_build(&self, job: &Job, handle: &mut BuildHandle) -> Option<TaskStatus> {
        if let BuildHandle::Queued(url) = handle {
            match self.fetch_json::<QueueItem>(url).await {
                Ok(item) if item.cancelled => return Some(TaskStatus::Failed),
                Ok(item) => {
                    if let Some(executable) = item.executable {
                        *handle = BuildHandle::Started(self.absolute(&executable.url));
                    }
                }
                Err(e) => warn!(job = %job.context.label(), "queue poll failed: {e}"),
            }
        }
        match handle {
            BuildHandle::Started(url) => match self.fetch_json::<BuildState>(url).await {
                Ok(state) => match terminal_status(&state) {
                    Some(TaskStatus::Succeeded) => {
                        // The build went green; the script's exit code is
                        // still authoritative when the marker is present.
                        match probe_output(&job.context.output_dir) {
                            Ok(Some(status)) => Some(status),
                            Ok(None) => Some(TaskStatus::Succeeded),
                            Err(e) => {
                                warn!(job = %job.context.label(), "output probe failed: {e}");
                                Some(TaskStatus::Failed)
                            }
                        }
                    }
                    other => other,
                },
                Err(e) => {
                    warn!(job = %job.context.label(), "build poll failed: {e}");
                    None
                }
            },
            BuildHandle::Queued(_) => None,
            BuildHandle::Untracked => match probe_output(&job.context.output_dir) {
                Ok(settled) => settled,
                Err(e) => {
                    warn!(job = %job.context.label(), "output probe failed: {e}");
                    Some(TaskStatus::Failed)
                }
            },
        }
    }
}

/// The batch script the Jenkins agent executes from the output directory.
fn windows_script(command: &str) -> String {
    format!(
        "@echo off\r\n\
         cd /d \"%~dp0\"\r\n\
         echo.> {PENDING_MARKER}\r\n\
         cmd /c \"{command}\" > log.txt 2>&1\r\n\
         echo %ERRORLEVEL% > {EXIT_MARKER}\r\n\
         del {PENDING_MARKER}\r\n"
    )
}

fn write_script(output_dir: &Path, command: &str) -> RunwayResult<()> {
    std::fs::create_dir_all(output_dir).map_err(|source| RunwayError::WriteFile {
        path: output_dir.to_path_buf(),
        source,
    })?;
    let path = output_dir.join(SCRIPT_NAME);
    std::fs::write(&path, windows_script(command)).map_err(|source| RunwayError::WriteFile {
        path,
        source,
    })
}

#[async_trait]
impl Runner for WindowsRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Windows
    }

    async fn start(&self, job: &mut Job, group_token: &str) -> RunwayResult<String> {
        write_script(&job.context.output_dir, &job.context.command)?;
        let location = self.trigger_build(job, group_token).await?;
        job.context.set_status(TaskStatus::Pending);
        let id = location.unwrap_or_else(|| format!("{}/{}", self.job_name, job.context.label()));
        job.external_id = Some(id.clone());
        Ok(id)
    }

    async fn start_group(
        &self,
        jobs: &mut [Job],
        group_token: &str,
        wait: bool,
        events: StatusSender,
        cancel: &CancellationToken,
    ) -> RunwayResult<()> {
        let mut handles = Vec::with_capacity(jobs.len());
        for (idx, job) in jobs.iter_mut().enumerate() {
            match self.start(job, group_token).await {
                Ok(id) => {
                    info!(job = %job.context.label(), build = %id, "jenkins build triggered");
                    let _ = events.send(StatusUpdate {
                        job_index: idx,
                        status: TaskStatus::Pending,
                        error: None,
                    });
                    handles.push(if id.starts_with("http") {
                        BuildHandle::Queued(id)
                    } else {
                        BuildHandle::Untracked
                    });
                }
                Err(e) => {
                    warn!(job = %job.context.label(), "jenkins trigger failed: {e}");
                    job.context.set_status(TaskStatus::Failed);
                    let _ = events.send(StatusUpdate {
                        job_index: idx,
                        status: TaskStatus::Failed,
                        error: Some(e.to_string()),
                    });
                    handles.push(BuildHandle::Untracked);
                }
            }
        }

        if !wait {
            return Ok(());
        }

        tokio::time::sleep(self.quiet_period).await;
        let deadline = tokio::time::Instant::now() + self.wait_timeout;

        loop {
            let mut outstanding = 0;
            for (idx, job) in jobs.iter_mut().enumerate() {
                if job.context.status().is_terminal() {
                    continue;
                }
                match self.poll_build(job, &mut handles[idx]).await {
                    Some(status) => {
                        job.context.set_status(TaskStatus::Running);
                        job.context.set_status(status);
                        let _ = events.send(StatusUpdate {
                            job_index: idx,
                            status,
                            error: None,
                        });
                    }
                    None => outstanding += 1,
                }
            }
            if outstanding == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                for (idx, job) in jobs.iter_mut().enumerate() {
                    if job.context.status().is_terminal() {
                        continue;
                    }
                    job.context.set_status(TaskStatus::Failed);
                    let _ = events.send(StatusUpdate {
                        job_index: idx,
                        status: TaskStatus::Failed,
                        error: Some("timed out waiting for jenkins build".to_string()),
                    });
                }
                return Err(RunwayError::Api(format!(
                    "group {group_token}: {outstanding} jenkins build(s) still outstanding after {}s",
                    self.wait_timeout.as_secs()
                )));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => {
                    warn!(group = group_token, "cancelled while waiting on jenkins builds");
                    return Err(RunwayError::Cancelled);
                }
            }
        }
    }

    async fn stop_group(&self, group_token: &str) -> RunwayResult<()> {
        // Jenkins offers no group-wide abort through the trigger API; the
        // builds run to completion and their outputs are reconciled away.
        warn!(group = group_token, "windows runner cannot abort triggered builds");
        Ok(())
    }
}
