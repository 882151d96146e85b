//! Side-effecting adapters: filesystem, git, subprocesses.

pub mod atomic;
pub mod config;
pub mod git;
pub mod goal_tracker;
pub mod guards;
pub mod integrity;
pub mod process;
pub mod prompt;
pub mod responses;
pub mod reviewer;
pub mod rounds;
pub mod session;
pub mod state_store;
pub mod transcript;
