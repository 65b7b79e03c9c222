//! Runner backends and group lifecycle.
//!
//! The engine talks to the [`runway_core::runner::Runner`] trait; this
//! crate provides the four backends and the [`JobGroup`] that owns a
//! dispatched set of jobs.

pub mod celery;
pub mod group;
pub mod jenkins;
pub mod local;
pub mod lsf;

use std::sync::Arc;

use runway_core::error::{RunwayError, RunwayResult};
use runway_core::types::RunnerKind;
use runway_core::Runner;

pub use group::{GroupSummary, JobGroup};
pub use local::LocalRunner;

/// Endpoints and limits the backends need beyond the per-job options.
#[derive(Debug, Clone, Default)]
pub struct RunnerSettings {
    /// Local pool size; `<= 0` means one less than the CPU count.
    pub concurrency: i64,
    /// Base URL of the task-queue gateway, required for `celery`.
    pub celery_gateway: Option<String>,
    /// Jenkins base URL and project name, required for `windows`.
    pub jenkins_url: Option<String>,
    pub jenkins_job: Option<String>,
}

/// Builds the backend for a runner kind. The set of kinds is closed;
/// a kind whose endpoints are not configured is a configuration error.
pub fn make_runner(kind: RunnerKind, settings: &RunnerSettings) -> RunwayResult<Arc<dyn Runner>> {
    match kind {
        RunnerKind::Local => Ok(Arc::new(local::LocalRunner::new(settings.concurrency))),
        RunnerKind::Lsf => Ok(Arc::new(lsf::LsfRunner::new())),
        RunnerKind::Celery => {
            let gateway = settings.celery_gateway.as_deref().ok_or_else(|| {
                RunwayError::Config(
                    "celery runner requires a gateway URL (--celery-gateway)".to_string(),
                )
            })?;
            Ok(Arc::new(celery::CeleryRunner::new(gateway)))
        }
        RunnerKind::Windows => {
            let (url, job) = settings
                .jenkins_url
                .as_deref()
                .zip(settings.jenkins_job.as_deref())
                .ok_or_else(|| {
                    RunwayError::Config(
                        "windows runner requires --jenkins-url and --jenkins-job".to_string(),
                    )
                })?;
            Ok(Arc::new(jenkins::WindowsRunner::new(url, job)))
        }
    }
}
