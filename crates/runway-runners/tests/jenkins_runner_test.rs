//! Windows runner against a stub Jenkins master: a build the master
//! reports as failed or aborted settles the job immediately, and a wait
//! that outlives its deadline is an error, not a quiet success.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use runway_core::context::RunContextBuilder;
use runway_core::error::RunwayError;
use runway_core::runner::{Job, Runner};
use runway_core::types::TaskStatus;
use runway_runners::jenkins::WindowsRunner;

fn job(output_root: &std::path::Path) -> Job {
    let mut context = RunContextBuilder::new("nightly", "windows")
        .database("/db")
        .input("/db/scenes/a.raw")
        .output_root(output_root)
        .build()
        .unwrap();
    context.command = "process.exe a.raw".to_string();
    Job::new(context)
}

fn stub_master(build_body: &'static str) -> Arc<common::Responder> {
    Arc::new(move |method: &str, path: &str| match method {
        "POST" if path.starts_with("/job/proj/buildWithParameters") => (
            201,
            vec![("Location".to_string(), "/queue/item/1/".to_string())],
            "{}".to_string(),
        ),
        "GET" if path == "/queue/item/1/api/json" => (
            200,
            Vec::new(),
            r#"{"cancelled":false,"executable":{"url":"/job/proj/1/"}}"#.to_string(),
        ),
        "GET" if path == "/job/proj/1/api/json" => (200, Vec::new(), build_body.to_string()),
        _ => (404, Vec::new(), "{}".to_string()),
    })
}

#[tokio::test]
async fn test_aborted_build_fails_the_job() {
    let base = common::spawn_stub(stub_master(r#"{"building":false,"result":"ABORTED"}"#)).await;
    let out = tempfile::tempdir().unwrap();
    let runner = WindowsRunner::new(&base, "proj").with_timing(
        Duration::from_millis(10),
        Duration::from_millis(20),
        Duration::from_secs(10),
    );

    let mut jobs = vec![job(out.path())];
    let (events, _updates) = mpsc::unbounded_channel();
    runner
        .start_group(&mut jobs, "grp-jenkins", true, events, &CancellationToken::new())
        .await
        .unwrap();

    // No exit marker ever appears; only the master's verdict settles it.
    assert_eq!(jobs[0].context.status(), TaskStatus::Failed);
}

#[tokio::test]
async fn test_wait_deadline_is_an_error() {
    let base = common::spawn_stub(stub_master(r#"{"building":true}"#)).await;
    let out = tempfile::tempdir().unwrap();
    let runner = WindowsRunner::new(&base, "proj").with_timing(
        Duration::from_millis(5),
        Duration::from_millis(25),
        Duration::from_millis(150),
    );

    let mut jobs = vec![job(out.path())];
    let (events, _updates) = mpsc::unbounded_channel();
    let err = runner
        .start_group(&mut jobs, "grp-jenkins", true, events, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RunwayError::Api(_)));
    assert_eq!(jobs[0].context.status(), TaskStatus::Failed);
}
