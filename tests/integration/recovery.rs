//! Per-task failures, restart policies, and held dependents.

use std::time::Duration;

use crate::fixtures::{spawn_loop, stop_loop, wait_for, TestProject};

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_job_holds_dependent_without_killing_loop() {
    let project = TestProject::new(
        r#"
[tasks.build]
command = ["sh", "-c", "exit 1"]

[tasks.serve]
command = ["sh", "-c", "echo serve >> runs.txt"]
depends_on = ["build"]

[tasks.other]
command = ["sh", "-c", "echo other >> runs.txt"]
"#,
    );

    let (token, handle) = spawn_loop(&project);

    // The independent task still runs; the dependent never does.
    wait_for(
        || project.lines("runs.txt") == vec!["other"],
        Duration::from_secs(10),
        "the independent task to run",
    )
    .await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(project.lines("runs.txt"), vec!["other"]);

    // The loop itself must still shut down cleanly.
    stop_loop(token, handle).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_on_failure_retry_releases_dependent() {
    // build fails on its first run (no flag file yet), then succeeds.
    // With restart = "on-failure" the retry must run and release serve.
    let project = TestProject::new(
        r#"
[tasks.build]
command = ["sh", "-c", "echo attempt >> attempts.txt; test -f flag || { touch flag; exit 1; }"]
restart = "on-failure"

[tasks.serve]
command = ["sh", "-c", "echo serve >> runs.txt"]
depends_on = ["build"]
"#,
    );

    let (token, handle) = spawn_loop(&project);
    wait_for(
        || project.lines("runs.txt") == vec!["serve"],
        Duration::from_secs(15),
        "serve to run after the retried build",
    )
    .await;
    stop_loop(token, handle).await;

    assert_eq!(project.lines("attempts.txt").len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_always_reruns_finished_task() {
    let project = TestProject::new(
        r#"
[tasks.ticker]
command = ["sh", "-c", "echo tick >> runs.txt"]
restart = "always"
"#,
    );

    let (token, handle) = spawn_loop(&project);
    wait_for(
        || project.lines("runs.txt").len() >= 3,
        Duration::from_secs(15),
        "the ticker to rerun a few times",
    )
    .await;
    stop_loop(token, handle).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_crashing_service_is_restarted() {
    let project = TestProject::new(
        r#"
[tasks.svc]
command = ["sh", "-c", "echo up >> runs.txt; sleep 0.2; exit 1"]
service = true
restart = "on-failure"
"#,
    );

    let (token, handle) = spawn_loop(&project);
    wait_for(
        || project.lines("runs.txt").len() >= 2,
        Duration::from_secs(15),
        "the service to come back after crashing",
    )
    .await;
    stop_loop(token, handle).await;
}
