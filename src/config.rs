//! Task file loading and validation.
//!
//! The task file (default `kit.toml`) declares the tasks of the dev loop.
//! Configuration errors are fatal at startup: empty commands, unknown or
//! cyclic dependencies, and missing executables all fail `Config::load`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::task::Task;
use crate::{klog_debug, Error, Result};

/// Default termination grace period in seconds.
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 3;

/// Default debounce quiet window for the file watcher in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Seconds to wait for a task to exit after SIGTERM before SIGKILL.
    #[serde(default)]
    pub termination_grace_period_secs: Option<u64>,
    /// Milliseconds the watcher waits for the tree to go quiet before
    /// emitting a change event.
    #[serde(default)]
    pub debounce_ms: Option<u64>,
    /// The task table; keys are the unique task names.
    #[serde(default)]
    pub tasks: BTreeMap<String, Task>,
    /// Directory the config file was loaded from. Watch roots and workdirs
    /// are resolved against it.
    #[serde(skip)]
    pub root: PathBuf,
}

impl Config {
    /// Load and validate a task file.
    pub fn load(path: &Path) -> Result<Self> {
        klog_debug!("Config::load path={}", path.display());
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config: Self = toml::from_str(&text)?;

        config.root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        // The table key is the task's name.
        for (name, task) in config.tasks.iter_mut() {
            task.name = name.clone();
        }

        config.validate()?;
        klog_debug!(
            "Config loaded: {} tasks, grace={:?}s",
            config.tasks.len(),
            config.termination_grace_period_secs
        );
        Ok(config)
    }

    /// Validate task commands and dependency references.
    ///
    /// Cycle detection happens in `TaskGraph::new`; everything local to a
    /// single task is checked here.
    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(Error::Config("no tasks declared".to_string()));
        }
        for (name, task) in &self.tasks {
            if task.command.is_empty() {
                return Err(Error::Config(format!("task {} has no command", name)));
            }
            for dep in &task.depends_on {
                if !self.tasks.contains_key(dep) {
                    return Err(Error::UnknownDependency {
                        task: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            if task.probe.is_some() && !task.service {
                return Err(Error::Config(format!(
                    "task {} has a probe but is not a service",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Check that every task's executable can be found.
    ///
    /// Commands with a path separator are resolved against the task's
    /// working directory; bare names are looked up on PATH.
    pub fn check_executables(&self) -> Result<()> {
        for (name, task) in &self.tasks {
            // validate() guarantees a non-empty command
            let Some(program) = task.command.program() else {
                continue;
            };
            if program.contains('/') {
                let path = self.workdir_of(task).join(program);
                if !path.exists() {
                    return Err(Error::CommandNotFound {
                        task: name.clone(),
                        command: program.to_string(),
                    });
                }
            } else if which::which(program).is_err() {
                return Err(Error::CommandNotFound {
                    task: name.clone(),
                    command: program.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Absolute-ish working directory for a task.
    pub fn workdir_of(&self, task: &Task) -> PathBuf {
        match &task.workdir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.root.join(dir),
            None => self.root.clone(),
        }
    }

    /// A task's watch roots, resolved against the config directory.
    pub fn watch_roots_of(&self, task: &Task) -> Vec<PathBuf> {
        task.watch
            .iter()
            .map(|p| {
                if p.is_absolute() {
                    p.clone()
                } else {
                    self.root.join(p)
                }
            })
            .collect()
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(
            self.termination_grace_period_secs
                .unwrap_or(DEFAULT_GRACE_PERIOD_SECS),
        )
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS))
    }

    /// Directory for per-task log files, `.kit/logs` next to the task file.
    pub fn log_dir(&self) -> PathBuf {
        self.root.join(".kit").join("logs")
    }

    /// Tasks as a vector, for graph construction.
    pub fn tasks_vec(&self) -> Vec<Task> {
        self.tasks.values().cloned().collect()
    }
}
