//! Task data model for the dev loop.
//!
//! Tasks are the named units of work declared in the task file. Each task
//! carries its command line, working directory, dependencies, watch roots,
//! and restart policy. Run state is tracked separately by the supervisor.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// A command line that deserializes from either a single string or a list.
///
/// `command = "go build ."` and `command = ["go", "build", "."]` are both
/// accepted; the string form is split on whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(transparent)]
pub struct CommandLine(pub Vec<String>);

impl CommandLine {
    /// The executable, i.e. the first token of the command line.
    pub fn program(&self) -> Option<&str> {
        self.0.first().map(|s| s.as_str())
    }

    /// The arguments after the executable.
    pub fn args(&self) -> &[String] {
        if self.0.is_empty() {
            &[]
        } else {
            &self.0[1..]
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for CommandLine {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            Many(Vec<String>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::One(s) => Ok(CommandLine(
                s.split_whitespace().map(|t| t.to_string()).collect(),
            )),
            Raw::Many(v) => Ok(CommandLine(v)),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" "))
    }
}

/// What to do when a task's process exits on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Restart regardless of exit status.
    Always,
    /// Restart only on a non-zero exit.
    OnFailure,
    /// Leave the task in its terminal state.
    #[default]
    Never,
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
            RestartPolicy::Never => write!(f, "never"),
        }
    }
}

/// TCP readiness probe for service tasks.
///
/// A service with a probe is only considered ready once its port accepts
/// connections, so dependents are held back until the service is actually
/// listening rather than merely spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpProbe {
    /// Port to connect to on localhost.
    pub port: u16,
    /// Seconds between connection attempts.
    #[serde(default = "default_probe_period")]
    pub period_secs: u64,
    /// Seconds to wait before the first attempt.
    #[serde(default)]
    pub initial_delay_secs: u64,
}

fn default_probe_period() -> u64 {
    1
}

impl TcpProbe {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }
}

/// A named unit of work in the dev loop.
///
/// The name is the unique key (the key of the task table in the config
/// file); it is filled in by `Config::load` after deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task name (config table key).
    #[serde(skip)]
    pub name: String,
    /// Command line to run (string or list form).
    pub command: CommandLine,
    /// Working directory, relative to the config file's directory.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// Extra environment variables for the child process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Paths whose changes trigger a restart of this task (and dependents).
    #[serde(default)]
    pub watch: Vec<PathBuf>,
    /// Names of tasks that must be ready before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Restart behavior when the process exits on its own.
    #[serde(default)]
    pub restart: RestartPolicy,
    /// Long-running service (ready when running) vs job (ready when succeeded).
    #[serde(default)]
    pub service: bool,
    /// Optional TCP readiness probe, only meaningful for services.
    #[serde(default)]
    pub probe: Option<TcpProbe>,
}

impl Task {
    /// Create a task with just a name and command, defaults elsewhere.
    pub fn new(name: &str, command: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: CommandLine(command.iter().map(|s| s.to_string()).collect()),
            workdir: None,
            env: BTreeMap::new(),
            watch: Vec::new(),
            depends_on: Vec::new(),
            restart: RestartPolicy::Never,
            service: false,
            probe: None,
        }
    }

    /// Builder-style: mark as a service.
    pub fn as_service(mut self) -> Self {
        self.service = true;
        self
    }

    /// Builder-style: add a dependency.
    pub fn with_dependency(mut self, dep: &str) -> Self {
        self.depends_on.push(dep.to_string());
        self
    }

    /// Builder-style: add a watch root.
    pub fn with_watch(mut self, path: impl Into<PathBuf>) -> Self {
        self.watch.push(path.into());
        self
    }

    /// Builder-style: set the restart policy.
    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }
}

/// Run state of a task's process.
///
/// Mutated only by the supervisor. `Killed` means kit terminated the
/// process itself (shutdown or restart) and is not treated as a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RunState {
    /// Not started yet, or held back by an unready dependency.
    #[default]
    Pending,
    /// Process is running.
    Running,
    /// Process exited with status zero.
    Succeeded,
    /// Process exited with a non-zero status.
    Failed {
        /// Human-readable failure message, e.g. "exit code 1".
        message: String,
    },
    /// Process was deliberately terminated by kit.
    Killed,
}

impl RunState {
    /// Whether the process has stopped for good (until restarted).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed { .. } | RunState::Killed
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RunState::Failed { .. })
    }

    /// Whether a dependent of `task` may start.
    ///
    /// Services unblock dependents while running; jobs only once they have
    /// succeeded.
    pub fn satisfies(&self, task: &Task) -> bool {
        if task.service {
            matches!(self, RunState::Running)
        } else {
            matches!(self, RunState::Succeeded)
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Pending => write!(f, "pending"),
            RunState::Running => write!(f, "running"),
            RunState::Succeeded => write!(f, "succeeded"),
            RunState::Failed { message } => write!(f, "failed: {}", message),
            RunState::Killed => write!(f, "killed"),
        }
    }
}
