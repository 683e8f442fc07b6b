//! Watch-triggered restarts of the downstream closure.

use std::fs;
use std::time::Duration;

use crate::fixtures::{spawn_loop, stop_loop, wait_for, TestProject};

#[tokio::test(flavor = "multi_thread")]
async fn test_change_restarts_watching_task() {
    let project = TestProject::new(
        r#"
debounce_ms = 100

[tasks.build]
command = ["sh", "-c", "echo build >> runs.txt"]
watch = ["src"]
"#,
    );
    let src = project.mkdir("src");

    let (token, handle) = spawn_loop(&project);
    wait_for(
        || project.lines("runs.txt").len() == 1,
        Duration::from_secs(10),
        "initial build",
    )
    .await;

    // Let the watcher attach before touching the tree.
    tokio::time::sleep(Duration::from_millis(500)).await;
    fs::write(src.join("main.go"), "package main").unwrap();

    wait_for(
        || project.lines("runs.txt").len() >= 2,
        Duration::from_secs(10),
        "build to rerun after the change",
    )
    .await;
    stop_loop(token, handle).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_change_restarts_dependents_too() {
    // build watches src; serve depends on build. Touching src must rerun
    // build first and then restart serve.
    let project = TestProject::new(
        r#"
debounce_ms = 100

[tasks.build]
command = ["sh", "-c", "echo build >> runs.txt"]
watch = ["src"]

[tasks.serve]
command = ["sh", "-c", "echo serve >> runs.txt; sleep 30"]
depends_on = ["build"]
service = true
"#,
    );
    let src = project.mkdir("src");

    let (token, handle) = spawn_loop(&project);
    wait_for(
        || project.lines("runs.txt") == vec!["build", "serve"],
        Duration::from_secs(10),
        "initial build and serve",
    )
    .await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    fs::write(src.join("main.go"), "package main").unwrap();

    wait_for(
        || project.lines("runs.txt").len() >= 4,
        Duration::from_secs(15),
        "build and serve to rerun after the change",
    )
    .await;
    stop_loop(token, handle).await;

    let runs = project.lines("runs.txt");
    assert_eq!(runs[0], "build");
    assert_eq!(runs[1], "serve");
    // Second round keeps the same relative order.
    assert_eq!(runs[2], "build");
    assert_eq!(runs[3], "serve");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_change_supersedes_stuck_readiness_wait() {
    // svc never answers its probe port, so client's readiness wait would
    // otherwise never end. Changes to the watched tree must supersede the
    // wait and restart svc instead of queueing behind it.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let project = TestProject::new(&format!(
        r#"
debounce_ms = 100

[tasks.svc]
command = ["sh", "-c", "echo svc >> runs.txt; sleep 30"]
service = true
watch = ["src"]
probe = {{ port = {port} }}

[tasks.client]
command = ["sh", "-c", "echo client >> runs.txt"]
depends_on = ["svc"]
"#
    ));
    let src = project.mkdir("src");

    let (token, handle) = spawn_loop(&project);
    wait_for(
        || project.lines("runs.txt") == vec!["svc"],
        Duration::from_secs(10),
        "initial svc start",
    )
    .await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    fs::write(src.join("main.go"), "package main").unwrap();
    wait_for(
        || project.lines("runs.txt").len() >= 2,
        Duration::from_secs(10),
        "svc to restart while its port is unanswered",
    )
    .await;

    // A second change lands while the re-plan is again stuck on the probe;
    // it must win rather than get lost.
    fs::write(src.join("lib.go"), "package main").unwrap();
    wait_for(
        || project.lines("runs.txt").len() >= 3,
        Duration::from_secs(10),
        "svc to restart after the second change",
    )
    .await;

    stop_loop(token, handle).await;
    // The client never ran: its dependency never became ready.
    assert!(project.lines("runs.txt").iter().all(|l| l == "svc"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_change_outside_watch_roots_is_ignored() {
    let project = TestProject::new(
        r#"
debounce_ms = 100

[tasks.build]
command = ["sh", "-c", "echo build >> runs.txt"]
watch = ["src"]
"#,
    );
    project.mkdir("src");
    let docs = project.mkdir("docs");

    let (token, handle) = spawn_loop(&project);
    wait_for(
        || project.lines("runs.txt").len() == 1,
        Duration::from_secs(10),
        "initial build",
    )
    .await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    fs::write(docs.join("notes.md"), "unrelated").unwrap();

    // Give the debouncer time to fire if it (wrongly) were going to.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(project.lines("runs.txt").len(), 1);

    stop_loop(token, handle).await;
}
