use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use kit::config::Config;
use kit::core::graph::TaskGraph;
use kit::orchestrator::Orchestrator;
use kit::{klog, Result};

/// Kit - crazy fast local dev loop
#[derive(Parser, Debug)]
#[command(name = "kit")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    KIT_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Path to the task file
    #[arg(short = 'f', long = "file", default_value = "kit.toml")]
    pub file: PathBuf,

    /// Enable debug logging (writes to ~/.kit/kit.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Start all tasks and watch for changes (the default)
    Up,

    /// Print the start order without running anything
    Plan,

    /// Check the task file: commands, dependencies, executables
    Validate,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    kit::log::init_with_debug(cli.debug);

    match cli.command {
        Some(Command::Plan) => run_plan(&cli.file),
        Some(Command::Validate) => run_validate(&cli.file),
        Some(Command::Up) | None => run_up(&cli.file),
    }
}

/// Start the dev loop and run until Ctrl-C.
fn run_up(file: &PathBuf) -> Result<()> {
    klog!("kit up: file={}", file.display());

    let config = Config::load(file)?;
    let mut orchestrator = Orchestrator::new(config)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!();
                signal_token.cancel();
            }
        });
        orchestrator.run(shutdown).await
    })
}

/// Print the tasks in the order `up` would start them.
fn run_plan(file: &PathBuf) -> Result<()> {
    klog!("kit plan: file={}", file.display());

    let config = Config::load(file)?;
    let graph = TaskGraph::new(config.tasks_vec())?;
    for (i, task) in graph.start_order().iter().enumerate() {
        let kind = if task.service { "service" } else { "job" };
        if task.depends_on.is_empty() {
            println!("{}. {} ({})", i + 1, task.name, kind);
        } else {
            println!(
                "{}. {} ({}, after {})",
                i + 1,
                task.name,
                kind,
                task.depends_on.join(", ")
            );
        }
    }
    Ok(())
}

/// Validate the task file without starting anything.
fn run_validate(file: &PathBuf) -> Result<()> {
    klog!("kit validate: file={}", file.display());

    let config = Config::load(file)?;
    TaskGraph::new(config.tasks_vec())?;
    config.check_executables()?;
    println!("{}: OK ({} tasks)", file.display(), config.tasks.len());
    Ok(())
}
