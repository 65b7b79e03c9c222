use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use runway_core::api::{NotifyClient, ObjectType, OutputNotification};
use runway_core::batches::{load_batch_files, BatchDefaults};
use runway_core::context::RunContext;
use runway_core::hooks::{NoMetadata, ShellCommandBuilder};
use runway_core::manifest::MANIFEST_NAME;
use runway_core::plan::{expand, PlanRequest};
use runway_core::types::{ConfigLayer, ExistingPolicy, PendingPolicy, RunnerKind, TaskStatus};
use runway_core::RunwayError;
use runway_runners::local::PENDING_MARKER;
use runway_runners::{make_runner, JobGroup, RunnerSettings};

const PENDING_POLL: Duration = Duration::from_secs(5);

#[derive(Args)]
pub struct Batch {
    /// Batch or alias names to run (repeatable)
    #[arg(long = "batch", value_name = "NAME", required = true)]
    pub batches: Vec<String>,

    /// Batch definition files, deep-merged in order (repeatable)
    #[arg(long = "batches-file", value_name = "FILE")]
    pub batches_files: Vec<PathBuf>,

    /// Command template; {input}, {output_dir}, {database} and {platform}
    /// are substituted per task
    #[arg(long)]
    pub command: String,

    /// Execution backend
    #[arg(long, value_enum, default_value = "local")]
    pub runner: RunnerKind,

    /// Return right after submission instead of waiting for completion
    #[arg(long)]
    pub no_wait: bool,

    /// What to do with outputs that already finished
    #[arg(long, value_enum, default_value = "run")]
    pub action_on_existing: ExistingPolicy,

    /// What to do with outputs another run still owns
    #[arg(long, value_enum, default_value = "wait")]
    pub action_on_pending: PendingPolicy,

    /// Configuration layers, repeatable; the legacy colon-joined form is
    /// accepted too
    #[arg(long = "configuration", value_name = "LAYERS")]
    pub configurations: Vec<String>,

    /// Database root for groups that do not set one
    #[arg(long)]
    pub database: Option<PathBuf>,

    /// Platform for groups that do not set one
    #[arg(long)]
    pub platform: Option<String>,

    /// Label grouping every task of this invocation
    #[arg(long, default_value = "local")]
    pub label: String,

    #[arg(long, default_value = "output")]
    pub output_root: PathBuf,

    /// Inline tuning search (YAML/JSON)
    #[arg(long, conflicts_with = "tuning_search_file")]
    pub tuning_search: Option<String>,

    /// Tuning search read from a file
    #[arg(long)]
    pub tuning_search_file: Option<PathBuf>,

    /// Base URL of the status collaborator; without it the run relies on
    /// filesystem signals only
    #[arg(long)]
    pub api_url: Option<String>,

    #[arg(long, default_value = "")]
    pub commit_sha: String,

    /// Local pool size; 0 means one less than the CPU count
    #[arg(long, default_value_t = 0)]
    pub local_concurrency: i64,

    #[arg(long)]
    pub celery_gateway: Option<String>,

    #[arg(long)]
    pub jenkins_url: Option<String>,

    #[arg(long)]
    pub jenkins_job: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputState {
    Fresh,
    Pending,
    Existing,
}

fn output_state(dir: &Path) -> OutputState {
    if dir.join(PENDING_MARKER).exists() {
        OutputState::Pending
    } else if dir.join(MANIFEST_NAME).is_file() {
        OutputState::Existing
    } else {
        OutputState::Fresh
    }
}

impl Batch {
    pub async fn execute(self, cancel: &CancellationToken) -> Result<bool> {
        let kind = self.runner;
        let on_existing = self.action_on_existing;
        let on_pending = self.action_on_pending;

        let file = load_batch_files(&self.batches_files)?;
        let mut configurations = Vec::new();
        for joined in &self.configurations {
            configurations.extend(ConfigLayer::parse_legacy(joined));
        }
        let defaults = BatchDefaults {
            database: self.database.clone(),
            platform: self.platform.clone(),
            configurations,
            runner_options: Map::new(),
        };
        let tuning = self.load_tuning()?;
        let builder = ShellCommandBuilder::new(&self.command);

        let request = PlanRequest {
            batch_names: &self.batches,
            file: &file,
            defaults: &defaults,
            batch_label: self.label.clone(),
            output_root: self.output_root.clone(),
            tuning_search: tuning.as_ref(),
            command_builder: &builder,
            metadata: &NoMetadata,
            input_iterator: None,
        };
        let contexts = expand(&request)?;
        info!(tasks = contexts.len(), runner = kind.as_str(), "expanded batches");

        let notifier = self
            .api_url
            .as_ref()
            .map(|url| Arc::new(NotifyClient::new(url.clone())));

        let contexts = apply_policies(
            contexts,
            on_existing,
            on_pending,
            notifier.as_deref(),
            &self.commit_sha,
            cancel,
        )
        .await?;
        if contexts.is_empty() {
            println!("nothing to run");
            return Ok(true);
        }

        let settings = RunnerSettings {
            concurrency: self.local_concurrency,
            celery_gateway: self.celery_gateway.clone(),
            jenkins_url: self.jenkins_url.clone(),
            jenkins_job: self.jenkins_job.clone(),
        };
        let runner = make_runner(kind, &settings)?;
        let mut group = JobGroup::new(contexts, runner);
        if let Some(notifier) = &notifier {
            group = group.with_notifier(notifier.clone(), &self.commit_sha);
        }

        match group.start(!self.no_wait, cancel).await {
            Ok(summary) => {
                println!("{summary}");
                Ok(!summary.is_failed())
            }
            Err(RunwayError::Cancelled) => {
                let summary = group.summary();
                println!("cancelled: {summary}");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn load_tuning(&self) -> Result<Option<Value>> {
        if let Some(inline) = &self.tuning_search {
            return Ok(Some(serde_yaml::from_str(inline)?));
        }
        if let Some(path) = &self.tuning_search_file {
            let raw = std::fs::read_to_string(path)?;
            return Ok(Some(serde_yaml::from_str(&raw)?));
        }
        Ok(None)
    }
}

/// Filters the expanded tasks by the existing/pending policies, emitting
/// sync notifications for tasks that stay out of the dispatch.
async fn apply_policies(
    contexts: Vec<RunContext>,
    on_existing: ExistingPolicy,
    on_pending: PendingPolicy,
    notifier: Option<&NotifyClient>,
    commit_sha: &str,
    cancel: &CancellationToken,
) -> Result<Vec<RunContext>> {
    let mut kept = Vec::new();
    for mut context in contexts {
        let mut state = output_state(&context.output_dir);

        if state == OutputState::Pending {
            match on_pending {
                PendingPolicy::Run => {
                    warn!(task = %context.label(), "output is pending elsewhere, running anyway");
                    state = OutputState::Fresh;
                }
                PendingPolicy::Skip => {
                    info!(task = %context.label(), "skipping pending output");
                    continue;
                }
                PendingPolicy::Sync => {
                    context.set_status(TaskStatus::Pending);
                    notify_sync(notifier, &context, commit_sha).await;
                    continue;
                }
                PendingPolicy::Wait => {
                    wait_for_pending(&context, cancel).await?;
                    state = output_state(&context.output_dir);
                }
            }
        }

        if state == OutputState::Existing {
            match on_existing {
                ExistingPolicy::Run => {}
                ExistingPolicy::Skip => {
                    info!(task = %context.label(), "skipping existing output");
                    continue;
                }
                ExistingPolicy::Sync => {
                    context.set_status(TaskStatus::Pending);
                    context.set_status(TaskStatus::Running);
                    context.set_status(TaskStatus::Succeeded);
                    notify_sync(notifier, &context, commit_sha).await;
                    continue;
                }
            }
        }

        kept.push(context);
    }
    Ok(kept)
}

async fn notify_sync(notifier: Option<&NotifyClient>, context: &RunContext, commit_sha: &str) {
    let Some(notifier) = notifier else {
        warn!(task = %context.label(), "sync requested without --api-url, output stays local");
        return;
    };
    let job_type = if commit_sha.is_empty() { "local" } else { "ci" };
    let payload = OutputNotification::for_context(context, job_type, commit_sha);
    notifier.notify(ObjectType::Output, &payload).await;
}

/// Blocks until the pending marker disappears or the run is cancelled.
async fn wait_for_pending(context: &RunContext, cancel: &CancellationToken) -> Result<()> {
    let marker = context.output_dir.join(PENDING_MARKER);
    while marker.exists() {
        info!(task = %context.label(), "waiting on output pending elsewhere");
        tokio::select! {
            _ = tokio::time::sleep(PENDING_POLL) => {}
            _ = cancel.cancelled() => {
                return Err(RunwayError::Cancelled.into());
            }
        }
    }
    Ok(())
}
