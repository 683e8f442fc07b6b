//! Integration test suite for kit.
//!
//! These tests drive the orchestrator end to end with real child
//! processes: shell commands appending to marker files stand in for
//! builds and servers, so startup order, watch-triggered restarts, and
//! failure recovery can be asserted from the filesystem.
//!
//! # Test Categories
//!
//! - `startup`: dependency-ordered startup and readiness gating
//! - `watch`: file changes restarting the downstream closure
//! - `recovery`: per-task failures, restart policies, held dependents

mod fixtures;

mod recovery;
mod startup;
mod watch;
