//! Stable exit codes for loopgate CLI commands.

use crate::core::types::Outcome;

/// Command succeeded, or an exit attempt was allowed with the session complete.
pub const OK: i32 = 0;
/// Invalid invocation, configuration or any unexpected error.
pub const INVALID: i32 = 1;
/// `loopgate exit` was blocked; the reason is on stdout.
pub const BLOCKED: i32 = 2;
pub const CANCELLED: i32 = 3;
pub const MAX_ITERATIONS: i32 = 4;
pub const CIRCUIT_BREAK: i32 = 5;
/// The session was terminated as `error`.
pub const ERROR: i32 = 6;

/// Exit code for an allowed exit that ended the session with `outcome`.
pub fn for_outcome(outcome: Outcome) -> i32 {
    match outcome {
        Outcome::Complete => OK,
        Outcome::Cancelled => CANCELLED,
        Outcome::MaxIterations => MAX_ITERATIONS,
        Outcome::CircuitBreak => CIRCUIT_BREAK,
        Outcome::Error => ERROR,
    }
}
