//! Side-effecting adapters: filesystem state, locks, heartbeats, child
//! processes, agents, git, validation, and cross-lane artifacts.

pub mod agent;
pub mod audit;
pub mod config;
pub mod git;
pub mod handoff;
pub mod heartbeat;
pub mod lock;
pub mod process;
pub mod prompt;
pub mod ps;
pub mod store;
pub mod validate;
