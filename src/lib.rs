//! Lane-based autonomous agent scheduler.
//!
//! Each *lane* drives its own queue of tasks to completion by repeatedly
//! invoking an external coding-agent CLI, validating the result, and
//! recovering autonomously from transient failures, stale locks, and
//! circular blockers. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (selection, retry
//!   classification, deadlock recovery, state transitions). No I/O, fully
//!   testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, agent and
//!   validation processes, locks, heartbeats). Isolated to enable scripted
//!   doubles in tests.
//!
//! Orchestration modules ([`pipeline`], [`scheduler`], [`supervisor`],
//! [`manager`]) coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod manager;
pub mod pipeline;
pub mod scheduler;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
