//! The orchestrator ties the pieces together: it starts tasks in dependency
//! order, restarts the downstream closure when watched files change, applies
//! restart policies when processes exit on their own, and tears everything
//! down in reverse order on shutdown.
//!
//! Configuration errors are fatal in `Orchestrator::new`. Once the loop is
//! running, a task failing is never fatal: the failure is reported, its
//! dependents are held back, and the loop keeps serving the healthy rest.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::graph::TaskGraph;
use crate::core::task::{RestartPolicy, RunState, Task, TcpProbe};
use crate::supervisor::{Supervisor, TaskHandle};
use crate::watcher::{ChangeEvent, FileWatcher};
use crate::{klog, klog_debug, klog_warn, Result};

/// Pause before restarting a crashed task, so a crash loop does not spin.
const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// A terminal-state notification from a task's waiter.
///
/// The pid identifies which incarnation of the task exited; notifications
/// from a process we already replaced are stale and dropped.
struct Exit {
    name: String,
    pid: Option<u32>,
    state: RunState,
}

/// Outcome of waiting for a dependency to become ready.
///
/// Readiness waits can take arbitrarily long (a probed port that never
/// answers), so they also listen for change events: a change that maps to
/// watched tasks supersedes the wait instead of queueing behind it.
enum DepWait {
    /// The dependency satisfies its dependents.
    Ready,
    /// The dependency ended in a state that never will; hold the dependent.
    Blocked,
    /// Change events arrived for these tasks; re-plan before starting more.
    Superseded(Vec<String>),
    /// Shutdown was requested.
    Shutdown,
}

pub struct Orchestrator {
    config: Config,
    graph: TaskGraph,
    supervisor: Supervisor,
    handles: HashMap<String, TaskHandle>,
}

impl Orchestrator {
    /// Build an orchestrator from a validated config.
    ///
    /// # Errors
    /// Fails on graph errors (unknown dependencies, cycles) and on missing
    /// executables. All of these are configuration mistakes the user should
    /// see before anything starts.
    pub fn new(config: Config) -> Result<Self> {
        let graph = TaskGraph::new(config.tasks_vec())?;
        config.check_executables()?;
        let supervisor = Supervisor::from_config(&config);
        Ok(Self {
            config,
            graph,
            supervisor,
            handles: HashMap::new(),
        })
    }

    /// Start order of all tasks, for `kit plan`.
    pub fn plan(&self) -> Vec<String> {
        self.graph
            .start_order()
            .into_iter()
            .map(|t| t.name.clone())
            .collect()
    }

    /// Run the dev loop until `shutdown` is cancelled.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        let roots = self.watch_roots();
        let mut watcher = if roots.is_empty() {
            klog_debug!("no watch roots declared, file watching disabled");
            None
        } else {
            Some(FileWatcher::spawn(&roots, self.config.debounce())?)
        };

        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<Exit>();
        // Deferred restarts land here after their backoff.
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<String>();

        let order: Vec<Task> = self.graph.start_order().into_iter().cloned().collect();
        let mut next = 0;
        while next < order.len() {
            if shutdown.is_cancelled() {
                break;
            }
            let task = &order[next];
            // A superseding restart below may already have started this one.
            if self.handles.contains_key(&task.name) {
                next += 1;
                continue;
            }
            match self
                .start_if_deps_ready(task, &mut watcher, &exit_tx, &shutdown)
                .await?
            {
                None => next += 1,
                Some(names) => {
                    klog!("startup superseded by changes, restarting {:?}", names);
                    self.restart_downstream(names, &mut watcher, &exit_tx, &shutdown)
                        .await?;
                    // Retry the same slot; the guard above skips it if the
                    // restart already covered it.
                }
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    klog!("shutting down");
                    self.stop_all().await;
                    return Ok(());
                }
                Some(event) = next_change(&mut watcher) => {
                    let Some(names) = self.superseding_tasks(event, &mut watcher) else {
                        continue;
                    };
                    klog!("files changed, restarting {:?}", names);
                    self.restart_downstream(names, &mut watcher, &exit_tx, &shutdown)
                        .await?;
                }
                Some(exit) = exit_rx.recv() => {
                    self.on_exit(exit, &retry_tx);
                }
                Some(name) = retry_rx.recv() => {
                    let running = self
                        .handles
                        .get(&name)
                        .map(|h| !h.state().is_terminal())
                        .unwrap_or(false);
                    if running {
                        continue;
                    }
                    if let Some(task) = self.graph.get(&name).cloned() {
                        klog!("starting {} again", name);
                        if let Some(mut names) = self
                            .start_if_deps_ready(&task, &mut watcher, &exit_tx, &shutdown)
                            .await?
                        {
                            // The retried task joins the superseding set so
                            // the re-plan does not lose it.
                            names.push(task.name.clone());
                            self.restart_downstream(names, &mut watcher, &exit_tx, &shutdown)
                                .await?;
                        }
                        // A recovered service unblocks dependents that were
                        // held back; jobs do the same through their exit.
                        if task.service {
                            for held in self.held_dependents(&task.name) {
                                let _ = retry_tx.send(held);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Union of every task's watch roots.
    fn watch_roots(&self) -> Vec<PathBuf> {
        let mut roots = BTreeSet::new();
        for task in self.graph.tasks() {
            for root in self.config.watch_roots_of(task) {
                roots.insert(root);
            }
        }
        roots.into_iter().collect()
    }

    /// Tasks whose watch roots contain any of the changed paths.
    fn tasks_for_paths(&self, paths: &[PathBuf]) -> Vec<String> {
        self.graph
            .tasks()
            .iter()
            .filter(|task| {
                self.config
                    .watch_roots_of(task)
                    .iter()
                    .any(|root| paths.iter().any(|p| p.starts_with(root)))
            })
            .map(|t| t.name.clone())
            .collect()
    }

    /// Direct dependents that were never started (held back by a failure).
    fn held_dependents(&self, name: &str) -> Vec<String> {
        self.graph
            .dependents_of(name)
            .into_iter()
            .filter(|t| !self.handles.contains_key(&t.name))
            .map(|t| t.name.clone())
            .collect()
    }

    fn state_of(&self, name: &str) -> RunState {
        self.handles
            .get(name)
            .map(|h| h.state())
            .unwrap_or(RunState::Pending)
    }

    /// Start `task` once its dependencies are ready.
    ///
    /// If a dependency is in a failed state the task is held back with a
    /// message instead of started; it will be picked up again when the
    /// dependency is restarted. Returns `Some(names)` when change events
    /// arrived during a readiness wait: the caller must abandon its current
    /// sequence and re-plan with those tasks.
    async fn start_if_deps_ready(
        &mut self,
        task: &Task,
        watcher: &mut Option<FileWatcher>,
        exit_tx: &mpsc::UnboundedSender<Exit>,
        shutdown: &CancellationToken,
    ) -> Result<Option<Vec<String>>> {
        let deps: Vec<Task> = self
            .graph
            .dependencies_of(&task.name)
            .into_iter()
            .cloned()
            .collect();
        for dep in deps {
            match self.await_ready(&dep, watcher, shutdown).await {
                DepWait::Ready => {}
                DepWait::Blocked => {
                    klog_warn!(
                        "holding {} back: dependency {} is not ready",
                        task.name,
                        dep.name
                    );
                    println!(
                        "kit: not starting {} ({} is {})",
                        task.name,
                        dep.name,
                        self.state_of(&dep.name)
                    );
                    return Ok(None);
                }
                DepWait::Superseded(names) => return Ok(Some(names)),
                DepWait::Shutdown => return Ok(None),
            }
        }
        self.start_task(task, exit_tx).await?;
        Ok(None)
    }

    /// Wait until `dep` satisfies its dependents, or fail fast if it ends in
    /// a state that never will. The wait is interruptible: change events for
    /// watched tasks supersede it rather than queue behind it.
    async fn await_ready(
        &self,
        dep: &Task,
        watcher: &mut Option<FileWatcher>,
        shutdown: &CancellationToken,
    ) -> DepWait {
        let Some(handle) = self.handles.get(&dep.name) else {
            // Never started (held back itself, or skipped).
            return DepWait::Blocked;
        };

        let mut rx = handle.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            if state.satisfies(dep) {
                break;
            }
            if state.is_terminal() {
                return DepWait::Blocked;
            }
            let event = tokio::select! {
                _ = shutdown.cancelled() => return DepWait::Shutdown,
                maybe = next_change(watcher) => maybe,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return DepWait::Blocked;
                    }
                    None
                }
            };
            if let Some(event) = event {
                if let Some(names) = self.superseding_tasks(event, watcher) {
                    return DepWait::Superseded(names);
                }
            }
        }

        // A running service with a probe is only ready once the port answers.
        if dep.service {
            if let Some(probe) = &dep.probe {
                return self.probe_ready(dep, probe, watcher, shutdown).await;
            }
        }
        DepWait::Ready
    }

    /// Poll a service's TCP port until it accepts a connection. Gives up when
    /// the service dies, and hands control back when change events supersede
    /// the wait.
    async fn probe_ready(
        &self,
        dep: &Task,
        probe: &TcpProbe,
        watcher: &mut Option<FileWatcher>,
        shutdown: &CancellationToken,
    ) -> DepWait {
        let Some(handle) = self.handles.get(&dep.name) else {
            return DepWait::Blocked;
        };
        let mut rx = handle.subscribe();

        tokio::select! {
            _ = shutdown.cancelled() => return DepWait::Shutdown,
            _ = tokio::time::sleep(probe.initial_delay()) => {}
        }
        loop {
            if rx.borrow_and_update().is_terminal() {
                return DepWait::Blocked;
            }
            if TcpStream::connect(("127.0.0.1", probe.port)).await.is_ok() {
                klog_debug!("probe ok: {} port {}", dep.name, probe.port);
                return DepWait::Ready;
            }
            let event = tokio::select! {
                _ = shutdown.cancelled() => return DepWait::Shutdown,
                maybe = next_change(watcher) => maybe,
                _ = rx.changed() => None,
                _ = tokio::time::sleep(probe.period()) => None,
            };
            if let Some(event) = event {
                if let Some(names) = self.superseding_tasks(event, watcher) {
                    return DepWait::Superseded(names);
                }
            }
        }
    }

    /// Map a change event, plus anything queued behind it, to the tasks
    /// watching the changed paths. `None` when no watched task is affected.
    fn superseding_tasks(
        &self,
        event: ChangeEvent,
        watcher: &mut Option<FileWatcher>,
    ) -> Option<Vec<String>> {
        let mut paths = event.paths;
        if let Some(w) = watcher.as_mut() {
            while let Some(more) = w.try_next() {
                paths.extend(more.paths);
            }
        }
        let names = self.tasks_for_paths(&paths);
        if names.is_empty() {
            None
        } else {
            Some(names)
        }
    }

    /// Spawn the task's process and a waiter that reports its terminal state.
    async fn start_task(&mut self, task: &Task, exit_tx: &mpsc::UnboundedSender<Exit>) -> Result<()> {
        let workdir = self.config.workdir_of(task);
        println!("kit: starting {}", task.name);
        let handle = match self.supervisor.start(task, &workdir, &task.env).await {
            Ok(handle) => handle,
            Err(e) => {
                // Spawn failures are per-task, not fatal to the loop.
                klog_warn!("failed to start {}: {}", task.name, e);
                println!("kit: failed to start {}: {}", task.name, e);
                return Ok(());
            }
        };

        let name = task.name.clone();
        let pid = handle.pid();
        let mut rx = handle.subscribe();
        let tx = exit_tx.clone();
        tokio::spawn(async move {
            loop {
                let state = rx.borrow_and_update().clone();
                if state.is_terminal() {
                    let _ = tx.send(Exit { name, pid, state });
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        });

        self.handles.insert(task.name.clone(), handle);
        Ok(())
    }

    /// React to a task's process reaching a terminal state on its own.
    fn on_exit(&mut self, exit: Exit, retry_tx: &mpsc::UnboundedSender<String>) {
        // Drop notifications from processes we already replaced.
        let current_pid = self.handles.get(&exit.name).and_then(|h| h.pid());
        if current_pid != exit.pid {
            return;
        }
        // Killed means we stopped it ourselves (shutdown or restart).
        if exit.state == RunState::Killed {
            return;
        }

        let Some(task) = self.graph.get(&exit.name) else {
            return;
        };

        match &exit.state {
            RunState::Succeeded => {
                klog_debug!("{} finished", exit.name);
                if task.restart == RestartPolicy::Always {
                    schedule_retry(exit.name.clone(), retry_tx);
                }
                // A job succeeding releases dependents that were held back
                // by an earlier failure.
                for held in self.held_dependents(&exit.name) {
                    let _ = retry_tx.send(held);
                }
            }
            RunState::Failed { message } => {
                klog_warn!("{} failed: {}", exit.name, message);
                println!("kit: {} failed ({})", exit.name, message);
                if matches!(task.restart, RestartPolicy::Always | RestartPolicy::OnFailure) {
                    schedule_retry(exit.name, retry_tx);
                }
            }
            _ => {}
        }
    }

    /// Restart the downstream closure of the changed tasks: stop every
    /// affected running task in reverse dependency order, then start the
    /// closure again in dependency order.
    ///
    /// If more changes arrive while the sequence is in flight, the rest of
    /// the sequence is abandoned and re-planned with the union of the
    /// affected tasks: the newest change wins.
    async fn restart_downstream(
        &mut self,
        names: Vec<String>,
        watcher: &mut Option<FileWatcher>,
        exit_tx: &mpsc::UnboundedSender<Exit>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let mut names: BTreeSet<String> = names.into_iter().collect();
        'replan: loop {
            let closure: Vec<Task> = self
                .graph
                .restart_closure_all(names.iter().map(|s| s.as_str()))?
                .into_iter()
                .cloned()
                .collect();

            for task in closure.iter().rev() {
                if let Some(mut handle) = self.handles.remove(&task.name) {
                    if let Err(e) = self.supervisor.stop(&mut handle).await {
                        klog_warn!("stopping {} failed: {}", task.name, e);
                    }
                }
            }
            for task in &closure {
                if shutdown.is_cancelled() {
                    return Ok(());
                }
                let superseding = self.drain_changed_tasks(watcher);
                if !superseding.is_empty() {
                    klog!("restart superseded by new changes: {:?}", superseding);
                    names.extend(superseding);
                    continue 'replan;
                }
                if let Some(more) = self
                    .start_if_deps_ready(task, watcher, exit_tx, shutdown)
                    .await?
                {
                    klog!("restart superseded by new changes: {:?}", more);
                    names.extend(more);
                    continue 'replan;
                }
            }
            return Ok(());
        }
    }

    /// Tasks affected by events that queued up since the last check.
    fn drain_changed_tasks(&self, watcher: &mut Option<FileWatcher>) -> Vec<String> {
        let Some(w) = watcher.as_mut() else {
            return Vec::new();
        };
        let mut paths = Vec::new();
        while let Some(event) = w.try_next() {
            paths.extend(event.paths);
        }
        if paths.is_empty() {
            Vec::new()
        } else {
            self.tasks_for_paths(&paths)
        }
    }

    /// Stop every running task, dependents before their dependencies.
    async fn stop_all(&mut self) {
        let order: Vec<String> = self
            .graph
            .start_order()
            .into_iter()
            .rev()
            .map(|t| t.name.clone())
            .collect();
        for name in order {
            if let Some(mut handle) = self.handles.remove(&name) {
                if handle.state().is_terminal() {
                    continue;
                }
                println!("kit: stopping {}", name);
                if let Err(e) = self.supervisor.stop(&mut handle).await {
                    klog_warn!("stopping {} failed: {}", name, e);
                }
            }
        }
    }
}

/// Next change event, pending forever when watching is disabled.
async fn next_change(watcher: &mut Option<FileWatcher>) -> Option<crate::watcher::ChangeEvent> {
    match watcher {
        Some(w) => w.next().await,
        None => std::future::pending().await,
    }
}

fn schedule_retry(name: String, retry_tx: &mpsc::UnboundedSender<String>) {
    let tx = retry_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(RESTART_BACKOFF).await;
        let _ = tx.send(name);
    });
}
