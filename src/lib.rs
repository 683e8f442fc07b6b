pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestrator;
pub mod supervisor;
pub mod watcher;

pub use config::Config;
pub use crate::core::{RestartPolicy, RunState, Task, TaskGraph};
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
pub use supervisor::Supervisor;
pub use watcher::FileWatcher;
