//! Celery runner: hands the group to an HTTP gateway in front of the
//! task queue and polls it until the group is ready. Revocation goes
//! through the same gateway, addressed by the group token.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use runway_core::error::{RunwayError, RunwayResult};
use runway_core::runner::{Job, Runner, StatusSender, StatusUpdate};
use runway_core::types::{RunnerKind, TaskStatus};

const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct TaskSubmission {
    command: String,
    output_directory: String,
    runner_options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct GroupSubmission {
    group_id: String,
    tasks: Vec<TaskSubmission>,
}

#[derive(Debug, Deserialize)]
struct GroupState {
    ready: bool,
    #[serde(default)]
    tasks: Vec<TaskState>,
}

#[derive(Debug, Deserialize)]
struct TaskState {
    #[serde(default)]
    id: Option<String>,
    state: String,
}

impl TaskState {
    /// Celery state names mapped onto ours; unknown states stay pending.
    fn status(&self) -> Option<TaskStatus> {
        match self.state.as_str() {
            "PENDING" | "RECEIVED" | "RETRY" => Some(TaskStatus::Pending),
            "STARTED" => Some(TaskStatus::Running),
            "SUCCESS" => Some(TaskStatus::Succeeded),
            "FAILURE" | "REVOKED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

pub struct CeleryRunner {
    client: reqwest::Client,
    base_url: String,
}

impl CeleryRunner {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn submit_group(&self, jobs: &[Job], group_token: &str) -> RunwayResult<GroupState> {
        let payload = GroupSubmission {
            group_id: group_token.to_string(),
            tasks: jobs
                .iter()
                .map(|job| TaskSubmission {
                    command: job.context.command.clone(),
                    output_directory: job.context.output_dir.to_string_lossy().to_string(),
                    runner_options: job.context.runner_options.clone(),
                })
                .collect(),
        };
        let url = format!("{}/group/", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| RunwayError::Submission {
                runner: "celery",
                job: group_token.to_string(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(RunwayError::Submission {
                runner: "celery",
                job: group_token.to_string(),
                reason: format!("gateway returned {}", response.status()),
            });
        }
        response
            .json::<GroupState>()
            .await
            .map_err(|e| RunwayError::Submission {
                runner: "celery",
                job: group_token.to_string(),
                reason: format!("unreadable gateway response: {e}"),
            })
    }

    async fn poll_group(&self, group_token: &str) -> RunwayResult<GroupState> {
        let url = format!("{}/group/{}/", self.base_url, group_token);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RunwayError::Api(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RunwayError::Api(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }
        response
            .json::<GroupState>()
            .await
            .map_err(|e| RunwayError::Api(e.to_string()))
    }

    async fn revoke_group(&self, group_token: &str) -> RunwayResult<()> {
        let url = format!("{}/group/{}/revoke/", self.base_url, group_token);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| RunwayError::Api(e.to_string()))?;
        if !response.status().is_success() {
            warn!(url, status = %response.status(), "group revocation rejected");
        }
        Ok(())
    }

    /// Writes the gateway's view of the group back into the jobs, pushing
    /// an event for every status that changed.
    fn apply_states(jobs: &mut [Job], state: &GroupState, events: &StatusSender) {
        for (idx, task) in state.tasks.iter().enumerate() {
            let Some(job) = jobs.get_mut(idx) else {
                continue;
            };
            if let Some(id) = &task.id {
                job.external_id.get_or_insert(id.clone());
            }
            let Some(status) = task.status() else {
                continue;
            };
            if job.context.status() == status || job.context.status().is_terminal() {
                continue;
            }
            if status.is_terminal() {
                job.context.set_status(TaskStatus::Running);
            }
            job.context.set_status(status);
            let _ = events.send(StatusUpdate {
                job_index: idx,
                status,
                error: None,
            });
        }
    }
}

#[async_trait]
impl Runner for CeleryRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Celery
    }

    async fn start(&self, job: &mut Job, group_token: &str) -> RunwayResult<String> {
        let state = self
            .submit_group(std::slice::from_ref(job), group_token)
            .await?;
        job.context.set_status(TaskStatus::Pending);
        let id = state
            .tasks
            .first()
            .and_then(|t| t.id.clone())
            .unwrap_or_else(|| group_token.to_string());
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
        let state = self.submit_group(jobs, group_token).await?;
        info!(group = group_token, jobs = jobs.len(), "group accepted by gateway");
        for (idx, job) in jobs.iter_mut().enumerate() {
            job.context.set_status(TaskStatus::Pending);
            let _ = events.send(StatusUpdate {
                job_index: idx,
                status: TaskStatus::Pending,
                error: None,
            });
        }
        Self::apply_states(jobs, &state, &events);

        if !wait {
            return Ok(());
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel.cancelled() => {
                    self.revoke_group(group_token).await?;
                    for job in jobs.iter_mut() {
                        if !job.context.status().is_terminal() {
                            job.context.set_status(TaskStatus::Failed);
                        }
                    }
                    return Err(RunwayError::Cancelled);
                }
            }
            match self.poll_group(group_token).await {
                Ok(state) => {
                    Self::apply_states(jobs, &state, &events);
                    if state.ready {
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(group = group_token, "group poll failed, retrying: {e}");
                }
            }
        }
    }

    async fn stop_group(&self, group_token: &str) -> RunwayResult<()> {
        self.revoke_group(group_token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_core::context::RunContextBuilder;
    use tokio::sync::mpsc;

    fn jobs(n: usize) -> Vec<Job> {
        (0..n)
            .map(|i| {
                Job::new(
                    RunContextBuilder::new("batch", "linux")
                        .database("/db")
                        .input(format!("/db/in-{i}.raw"))
                        .output_root("/out")
                        .build()
                        .unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_celery_state_mapping() {
        let state = |s: &str| TaskState {
            id: None,
            state: s.to_string(),
        };
        assert_eq!(state("SUCCESS").status(), Some(TaskStatus::Succeeded));
        assert_eq!(state("FAILURE").status(), Some(TaskStatus::Failed));
        assert_eq!(state("REVOKED").status(), Some(TaskStatus::Failed));
        assert_eq!(state("STARTED").status(), Some(TaskStatus::Running));
        assert_eq!(state("PENDING").status(), Some(TaskStatus::Pending));
        assert_eq!(state("SOMETHING_NEW").status(), None);
    }

    #[test]
    fn test_apply_states_settles_jobs_and_pushes_events() {
        let mut jobs = jobs(2);
        for job in &mut jobs {
            job.context.set_status(TaskStatus::Pending);
        }
        let state = GroupState {
            ready: true,
            tasks: vec![
                TaskState {
                    id: Some("t-1".into()),
                    state: "SUCCESS".into(),
                },
                TaskState {
                    id: Some("t-2".into()),
                    state: "FAILURE".into(),
                },
            ],
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        CeleryRunner::apply_states(&mut jobs, &state, &tx);
        assert_eq!(jobs[0].context.status(), TaskStatus::Succeeded);
        assert_eq!(jobs[1].context.status(), TaskStatus::Failed);
        assert_eq!(jobs[0].external_id.as_deref(), Some("t-1"));

        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update.status);
        }
        assert_eq!(updates, vec![TaskStatus::Succeeded, TaskStatus::Failed]);

        // A second application is a no-op: terminal statuses are sticky.
        let (tx, mut rx) = mpsc::unbounded_channel();
        CeleryRunner::apply_states(&mut jobs, &state, &tx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_group_payload_shape() {
        let jobs = jobs(1);
        let submission = GroupSubmission {
            group_id: "grp".into(),
            tasks: vec![TaskSubmission {
                command: jobs[0].context.command.clone(),
                output_directory: jobs[0].context.output_dir.to_string_lossy().to_string(),
                runner_options: jobs[0].context.runner_options.clone(),
            }],
        };
        let json = serde_json::to_value(&submission).unwrap();
        assert_eq!(json["group_id"], "grp");
        assert!(json["tasks"][0].get("output_directory").is_some());
    }
}
