//! LSF runner: submits each job with `bsub` under a shared job-name
//! prefix, then blocks on a sentinel interactive job that waits for the
//! whole prefix to end. Assumes the cluster shares the output filesystem
//! with the submitting host.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use runway_core::error::{RunwayError, RunwayResult};
use runway_core::manifest::{OutputManifest, MANIFEST_NAME};
use runway_core::runner::{Job, Runner, StatusSender, StatusUpdate};
use runway_core::types::{RunnerKind, TaskStatus};

use crate::local::PENDING_MARKER;

/// Exit-code file written by the job wrapper, read back after the wait.
pub(crate) const EXIT_MARKER: &str = ".exit";

pub struct LsfRunner;

impl LsfRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LsfRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// `bsub` arguments for one job: name under the group prefix, optional
/// queue/memory/priority from the runner options, log to the output dir.
fn bsub_args(job: &Job, group_token: &str) -> Vec<String> {
    let mut args = vec![
        "-J".to_string(),
        format!("{}/{}", group_token, job.context.label()),
        "-o".to_string(),
        job.context
            .output_dir
            .join("lsf.%J.txt")
            .to_string_lossy()
            .to_string(),
    ];
    let options = runner_section(&job.context.runner_options, "lsf");
    push_option(&mut args, &options, "queue", "-q");
    push_option(&mut args, &options, "memory", "-M");
    push_option(&mut args, &options, "priority", "-sp");
    args
}

/// Resolved runner options carry a `type` tag with per-runner settings
/// nested under the runner's own key (`runner: {type: lsf, lsf: {queue:
/// short}}`). Bare top-level scalars are still honored for hand-written
/// batch files; the nested section wins on conflicts.
fn runner_section(options: &Map<String, Value>, key: &str) -> Map<String, Value> {
    let mut section: Map<String, Value> = options
        .iter()
        .filter(|(name, value)| name.as_str() != "type" && !value.is_object())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    if let Some(Value::Object(nested)) = options.get(key) {
        for (name, value) in nested {
            section.insert(name.clone(), value.clone());
        }
    }
    section
}

fn push_option(args: &mut Vec<String>, options: &Map<String, Value>, key: &str, flag: &str) {
    let Some(value) = options.get(key) else {
        return;
    };
    let rendered = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return,
    };
    args.push(flag.to_string());
    args.push(rendered);
}

/// Shell wrapper around the user command: creates the output directory,
/// maintains the pending marker, captures the log and records the exit
/// code for the post-wait probe.
fn wrapper_script(command: &str, output_dir: &Path) -> String {
    let dir = output_dir.to_string_lossy();
    format!(
        "mkdir -p '{dir}' && cd '{dir}' && touch {PENDING_MARKER} && \
         ( {command} ) > log.txt 2>&1; echo $? > {EXIT_MARKER}; rm -f {PENDING_MARKER}"
    )
}

/// Extracts the numeric id from bsub's `Job <123> is submitted ...` line.
fn parse_job_id(stdout: &str) -> Option<String> {
    let start = stdout.find('<')? + 1;
    let end = stdout[start..].find('>')? + start;
    let id = &stdout[start..end];
    id.chars().all(|c| c.is_ascii_digit()).then(|| id.to_string())
}

/// Reads the wrapper's exit marker: `Some(status)` once the job ran to
/// completion on the cluster, `None` while it is still outstanding. A
/// successful job gets its output manifest written here, on the
/// submitting host.
pub(crate) fn probe_output(output_dir: &Path) -> RunwayResult<Option<TaskStatus>> {
    let exit_path = output_dir.join(EXIT_MARKER);
    let Ok(raw) = std::fs::read_to_string(&exit_path) else {
        return Ok(None);
    };
    if raw.trim() == "0" {
        OutputManifest::from_dir(output_dir)?.write_atomic(&output_dir.join(MANIFEST_NAME))?;
        Ok(Some(TaskStatus::Succeeded))
    } else {
        Ok(Some(TaskStatus::Failed))
    }
}

async fn bkill_group(group_token: &str) -> RunwayResult<()> {
    let output = Command::new("bkill")
        .arg("-J")
        .arg(format!("{group_token}/*"))
        .output()
        .await
        .map_err(|e| RunwayError::Submission {
            runner: "lsf",
            job: group_token.to_string(),
            reason: format!("failed to run bkill: {e}"),
        })?;
    if !output.status.success() {
        warn!(
            group = group_token,
            "bkill returned {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

#[async_trait]
impl Runner for LsfRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Lsf
    }

    async fn start(&self, job: &mut Job, group_token: &str) -> RunwayResult<String> {
        let script = wrapper_script(&job.context.command, &job.context.output_dir);
        let output = Command::new("bsub")
            .args(bsub_args(job, group_token))
            .arg(script)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RunwayError::Submission {
                runner: "lsf",
                job: job.context.label(),
                reason: format!("failed to run bsub: {e}"),
            })?;
        if !output.status.success() {
            return Err(RunwayError::Submission {
                runner: "lsf",
                job: job.context.label(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = parse_job_id(&stdout).ok_or_else(|| RunwayError::Submission {
            runner: "lsf",
            job: job.context.label(),
            reason: format!("could not parse bsub output: {}", stdout.trim()),
        })?;
        job.context.set_status(TaskStatus::Pending);
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
        // Submit everything first. A rejected submission fails that job
        // only, the rest of the group still goes out.
        for (idx, job) in jobs.iter_mut().enumerate() {
            match self.start(job, group_token).await {
                Ok(id) => {
                    info!(job = %job.context.label(), lsf_id = %id, "submitted to LSF");
                    let _ = events.send(StatusUpdate {
                        job_index: idx,
                        status: TaskStatus::Pending,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(job = %job.context.label(), "LSF submission rejected: {e}");
                    job.context.set_status(TaskStatus::Failed);
                    let _ = events.send(StatusUpdate {
                        job_index: idx,
                        status: TaskStatus::Failed,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if !wait {
            return Ok(());
        }

        // Sentinel: an interactive job dependent on the whole prefix
        // having ended. It only runs, and returns, once the group is done.
        let mut sentinel = Command::new("bsub")
            .arg("-I")
            .arg("-J")
            .arg(format!("{group_token}/wait"))
            .arg("-w")
            .arg(format!("ended('{group_token}/*')"))
            .arg("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunwayError::Submission {
                runner: "lsf",
                job: group_token.to_string(),
                reason: format!("failed to start wait sentinel: {e}"),
            })?;

        let cancelled = tokio::select! {
            result = sentinel.wait() => {
                if let Err(e) = result {
                    warn!(group = group_token, "wait sentinel failed: {e}");
                }
                false
            }
            _ = cancel.cancelled() => {
                let _ = sentinel.kill().await;
                bkill_group(group_token).await?;
                true
            }
        };

        // The cluster shares our filesystem; read each wrapper's exit
        // marker back and settle statuses.
        for (idx, job) in jobs.iter_mut().enumerate() {
            if job.context.status().is_terminal() {
                continue;
            }
            match probe_output(&job.context.output_dir) {
                Ok(Some(status)) => {
                    job.context.set_status(TaskStatus::Running);
                    job.context.set_status(status);
                    let _ = events.send(StatusUpdate {
                        job_index: idx,
                        status,
                        error: None,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(job = %job.context.label(), "output probe failed: {e}");
                    job.context.set_status(TaskStatus::Failed);
                }
            }
        }

        if cancelled {
            return Err(RunwayError::Cancelled);
        }
        Ok(())
    }

    async fn stop_group(&self, group_token: &str) -> RunwayResult<()> {
        bkill_group(group_token).await
    }
}
