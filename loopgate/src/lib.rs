//! Review-gated iteration controller for long-running agent sessions.
//!
//! An agent works through a plan in rounds; every attempt to stop is routed
//! through [`controller::handle_exit_attempt`], which runs the guard chain,
//! asks an external reviewer for a verdict and decides whether the session
//! continues, moves to its next phase or ends. All state lives in a session
//! directory so a crashed controller resumes on the next attempt.
//!
//! - **[`core`]**: Pure, deterministic logic (state machine, classifier,
//!   pool bookkeeping, audit cadence). No I/O.
//! - **[`io`]**: Side-effecting operations (state documents, git, reviewer
//!   subprocesses, response sources, prompts).
//!
//! Orchestration modules ([`controller`], [`pool_loop`], [`start`],
//! [`status`]) coordinate core logic with I/O to implement CLI commands.

pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pool_loop;
pub mod start;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
