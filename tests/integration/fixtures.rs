//! Test fixtures for integration tests.
//!
//! A `TestProject` is a temporary directory with a `kit.toml` inside.
//! Tasks are shell one-liners appending to marker files, so tests can
//! observe what ran and in which order by reading the markers back.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use kit::config::Config;
use kit::orchestrator::Orchestrator;

pub struct TestProject {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestProject {
    /// Create a project directory with the given task file content.
    pub fn new(task_file: &str) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        fs::write(path.join("kit.toml"), task_file).expect("failed to write kit.toml");
        Self { temp_dir, path }
    }

    pub fn config(&self) -> Config {
        Config::load(&self.path.join("kit.toml")).expect("failed to load config")
    }

    /// Path of a marker file inside the project.
    pub fn marker(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Lines of a marker file; empty if it does not exist yet.
    pub fn lines(&self, name: &str) -> Vec<String> {
        fs::read_to_string(self.marker(name))
            .map(|s| s.lines().map(|l| l.to_string()).collect())
            .unwrap_or_default()
    }

    /// Create a subdirectory (e.g. a watch root).
    pub fn mkdir(&self, name: &str) -> PathBuf {
        let dir = self.path.join(name);
        fs::create_dir_all(&dir).expect("failed to create directory");
        dir
    }
}

/// Run the orchestrator in the background; the returned token stops it.
pub fn spawn_loop(
    project: &TestProject,
) -> (
    CancellationToken,
    tokio::task::JoinHandle<kit::Result<()>>,
) {
    let mut orchestrator =
        Orchestrator::new(project.config()).expect("failed to build orchestrator");
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { orchestrator.run(shutdown).await });
    (token, handle)
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration, what: &str) {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Stop the loop and wait for a clean exit.
pub async fn stop_loop(
    token: CancellationToken,
    handle: tokio::task::JoinHandle<kit::Result<()>>,
) {
    token.cancel();
    tokio::time::timeout(Duration::from_secs(15), handle)
        .await
        .expect("orchestrator did not shut down")
        .expect("orchestrator task panicked")
        .expect("orchestrator returned an error");
}
