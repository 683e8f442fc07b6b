//! Process supervisor.
//!
//! Starts task commands as child processes, captures their output to
//! per-task log files, and tracks exit status through a `watch` channel of
//! `RunState`. Stopping is graceful: SIGTERM to the process group, then
//! SIGKILL once the grace period elapses.
//!
//! The supervisor never fails because a child failed; a non-zero exit is
//! reported as `RunState::Failed` on the handle's state channel.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

use crate::config::Config;
use crate::core::task::{RunState, Task};
use crate::{klog_debug, klog_trace, Error, Result};

/// Upper bound on waiting for a process to disappear after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Handle to a running (or finished) task process.
///
/// One handle exists per task at a time; the orchestrator serializes
/// stop/start on the same task by consuming and replacing the handle.
pub struct TaskHandle {
    name: String,
    pid: Option<u32>,
    state_rx: watch::Receiver<RunState>,
    stopping: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current run state snapshot.
    pub fn state(&self) -> RunState {
        self.state_rx.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state_rx.clone()
    }

    /// Wait until the process reaches a terminal state.
    pub async fn wait(&mut self) -> RunState {
        loop {
            let state = self.state_rx.borrow_and_update().clone();
            if state.is_terminal() {
                return state;
            }
            if self.state_rx.changed().await.is_err() {
                return self.state_rx.borrow().clone();
            }
        }
    }
}

/// Process supervisor for the dev loop.
#[derive(Debug, Clone)]
pub struct Supervisor {
    grace: Duration,
    log_dir: PathBuf,
}

impl Supervisor {
    pub fn new(grace: Duration, log_dir: PathBuf) -> Self {
        Self { grace, log_dir }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.grace_period(), config.log_dir())
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Start a task's command as a child process.
    ///
    /// Output is streamed line by line to `.kit/logs/<name>.log` and echoed
    /// to stdout with the task name as prefix. The returned handle's state
    /// starts at `Running` and moves to a terminal state when the process
    /// exits.
    ///
    /// # Errors
    /// Returns an error only if the process cannot be spawned (bad
    /// executable, missing working directory). Child failures after a
    /// successful spawn are reported through the state channel.
    pub async fn start(
        &self,
        task: &Task,
        workdir: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<TaskHandle> {
        let program = task
            .command
            .program()
            .ok_or_else(|| Error::Config(format!("task {} has no command", task.name)))?;

        tokio::fs::create_dir_all(&self.log_dir).await?;
        let log_path = self.log_dir.join(format!("{}.log", task.name));
        let log_file = tokio::fs::File::create(&log_path).await?;

        let mut cmd = Command::new(program);
        cmd.args(task.command.args())
            .current_dir(workdir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        klog_debug!("started {} pid={:?} ({})", task.name, pid, task.command);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        if let Some(stdout) = stdout {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = stderr {
            let tx = line_tx;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }

        // Log writer: one task per child keeps line ordering within a task.
        let name = task.name.clone();
        tokio::spawn(async move {
            let mut log_file = log_file;
            while let Some(line) = line_rx.recv().await {
                klog_trace!("[{}] {}", name, line);
                println!("{}: {}", name, line);
                let _ = log_file.write_all(line.as_bytes()).await;
                let _ = log_file.write_all(b"\n").await;
            }
            let _ = log_file.flush().await;
        });

        let (state_tx, state_rx) = watch::channel(RunState::Running);
        let stopping = Arc::new(AtomicBool::new(false));

        let name = task.name.clone();
        let stopping_flag = Arc::clone(&stopping);
        tokio::spawn(async move {
            let state = match child.wait().await {
                Ok(status) if stopping_flag.load(Ordering::SeqCst) => {
                    klog_debug!("{} stopped ({})", name, status);
                    RunState::Killed
                }
                Ok(status) if status.success() => RunState::Succeeded,
                Ok(status) => {
                    let message = match status.code() {
                        Some(code) => format!("exit code {}", code),
                        None => format!("terminated by signal ({})", status),
                    };
                    // A signal we did not send still counts as a failure,
                    // unless we are mid-stop.
                    if stopping_flag.load(Ordering::SeqCst) {
                        RunState::Killed
                    } else {
                        RunState::Failed { message }
                    }
                }
                Err(e) => RunState::Failed {
                    message: format!("wait failed: {}", e),
                },
            };
            klog_debug!("{} exited: {}", name, state);
            let _ = state_tx.send(state);
        });

        Ok(TaskHandle {
            name: task.name.clone(),
            pid,
            state_rx,
            stopping,
        })
    }

    /// Stop a task gracefully.
    ///
    /// Sends SIGTERM to the process group, waits up to the grace period,
    /// then SIGKILLs. Returns the terminal state (usually `Killed`; a
    /// process that exited on its own just before keeps its own state).
    pub async fn stop(&self, handle: &mut TaskHandle) -> Result<RunState> {
        if handle.state().is_terminal() {
            return Ok(handle.state());
        }
        handle.stopping.store(true, Ordering::SeqCst);

        klog_debug!("stopping {} pid={:?}", handle.name, handle.pid);
        if let Some(pid) = handle.pid {
            signal_group(pid, Signal::Term);
        }

        let graceful = tokio::time::timeout(self.grace, handle.wait()).await;
        match graceful {
            Ok(state) => return Ok(state),
            Err(_) => {
                klog_debug!("{} did not exit within grace period, killing", handle.name);
                if let Some(pid) = handle.pid {
                    signal_group(pid, Signal::Kill);
                }
            }
        }

        tokio::time::timeout(KILL_WAIT, handle.wait())
            .await
            .map_err(|_| Error::Timeout(KILL_WAIT))
    }

    /// Restart composes stop + start.
    pub async fn restart(
        &self,
        handle: &mut TaskHandle,
        task: &Task,
        workdir: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<TaskHandle> {
        self.stop(handle).await?;
        self.start(task, workdir, env).await
    }
}

enum Signal {
    Term,
    Kill,
}

/// Signal the whole process group so shell-spawned grandchildren die too.
#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pgid = -(pid as libc::pid_t);
    let rc = unsafe { libc::kill(pgid, sig) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH: the group is already gone.
        if err.raw_os_error() != Some(libc::ESRCH) {
            klog_debug!("kill({}, {}) failed: {}", pgid, sig, err);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) {}
