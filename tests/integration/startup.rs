//! Dependency-ordered startup and readiness gating.

use std::time::Duration;

use crate::fixtures::{spawn_loop, stop_loop, wait_for, TestProject};

#[tokio::test(flavor = "multi_thread")]
async fn test_chain_runs_in_dependency_order() {
    let project = TestProject::new(
        r#"
[tasks.one]
command = ["sh", "-c", "echo one >> order.txt"]

[tasks.two]
command = ["sh", "-c", "echo two >> order.txt"]
depends_on = ["one"]

[tasks.three]
command = ["sh", "-c", "echo three >> order.txt"]
depends_on = ["two"]
"#,
    );

    let (token, handle) = spawn_loop(&project);
    wait_for(
        || project.lines("order.txt").len() == 3,
        Duration::from_secs(10),
        "all three jobs to run",
    )
    .await;
    stop_loop(token, handle).await;

    assert_eq!(project.lines("order.txt"), vec!["one", "two", "three"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_diamond_respects_both_branches() {
    let project = TestProject::new(
        r#"
[tasks.base]
command = ["sh", "-c", "echo base >> order.txt"]

[tasks.left]
command = ["sh", "-c", "echo left >> order.txt"]
depends_on = ["base"]

[tasks.right]
command = ["sh", "-c", "echo right >> order.txt"]
depends_on = ["base"]

[tasks.top]
command = ["sh", "-c", "echo top >> order.txt"]
depends_on = ["left", "right"]
"#,
    );

    let (token, handle) = spawn_loop(&project);
    wait_for(
        || project.lines("order.txt").len() == 4,
        Duration::from_secs(10),
        "all four jobs to run",
    )
    .await;
    stop_loop(token, handle).await;

    let order = project.lines("order.txt");
    let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
    assert_eq!(pos("base"), 0);
    assert_eq!(pos("top"), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_service_unblocks_dependent_while_running() {
    // A service never exits; its dependent must start anyway.
    let project = TestProject::new(
        r#"
[tasks.svc]
command = ["sh", "-c", "echo svc >> order.txt; sleep 30"]
service = true

[tasks.client]
command = ["sh", "-c", "echo client >> order.txt"]
depends_on = ["svc"]
"#,
    );

    let (token, handle) = spawn_loop(&project);
    wait_for(
        || project.lines("order.txt") == vec!["svc", "client"],
        Duration::from_secs(10),
        "client to run behind the service",
    )
    .await;
    stop_loop(token, handle).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_probe_holds_dependent_until_port_answers() {
    // Reserve a free port, then release it for the test to re-bind later.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let project = TestProject::new(&format!(
        r#"
[tasks.svc]
command = ["sh", "-c", "sleep 30"]
service = true
probe = {{ port = {port} }}

[tasks.client]
command = ["sh", "-c", "echo client >> order.txt"]
depends_on = ["svc"]
"#
    ));

    let (token, handle) = spawn_loop(&project);

    // The service process never listens; the probe must hold the client.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(project.lines("order.txt").is_empty());

    // Answer the probe ourselves and the client gets released.
    let _listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap();
    wait_for(
        || project.lines("order.txt") == vec!["client"],
        Duration::from_secs(10),
        "client to run once the port answers",
    )
    .await;

    stop_loop(token, handle).await;
}
