//! Round controller state machine.
//!
//! Pure transition logic: given where the session is and what the reviewer
//! said, decide what happens next. Persisting the decision (prompts, state
//! document writes and renames) is the caller's job.

use crate::core::types::{Outcome, Phase, ReviewVerdict};

/// Snapshot of the session fields that drive a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundContext {
    pub phase: Phase,
    pub round: u32,
    pub max_iterations: u32,
    pub review_started: bool,
}

/// What the controller must do after a review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Block the exit and start `round` in `phase`, carrying reviewer feedback.
    Continue {
        phase: Phase,
        round: u32,
        feedback: String,
    },
    /// Implementation was approved; flip `review_started` and move to the
    /// diff-driven review phase at `round`.
    BeginReview { round: u32 },
    /// Review approved; rename into the finalize document.
    Finalize,
    /// Block the exit without touching state; the same attempt may be retried.
    Retry { reason: String },
    /// End the session with a fixed outcome.
    Terminate { outcome: Outcome, reason: String },
}

/// The round after `round`, or `None` once the iteration limit is reached.
pub fn next_round(round: u32, max_iterations: u32) -> Option<u32> {
    round.checked_add(1).filter(|next| *next <= max_iterations)
}

/// Decide the transition for a reviewed exit attempt in a repeating phase.
pub fn decide(ctx: &RoundContext, verdict: &ReviewVerdict) -> Transition {
    match verdict {
        ReviewVerdict::InvocationFailed(reason) => Transition::Retry {
            reason: reason.clone(),
        },
        ReviewVerdict::Stagnation => Transition::Terminate {
            outcome: Outcome::CircuitBreak,
            reason: format!("reviewer detected stagnation at round {}", ctx.round),
        },
        ReviewVerdict::Approved => decide_approved(ctx),
        ReviewVerdict::IssuesFound(issues) => decide_issues(ctx, issues),
    }
}

/// Decide the finalize step once guards have passed.
pub fn decide_finalize(summary_present: bool) -> Transition {
    if summary_present {
        Transition::Terminate {
            outcome: Outcome::Complete,
            reason: "review approved and finalize summary recorded".to_string(),
        }
    } else {
        Transition::Retry {
            reason: "finalize summary is missing or empty".to_string(),
        }
    }
}

fn decide_approved(ctx: &RoundContext) -> Transition {
    match ctx.phase {
        Phase::Review => Transition::Finalize,
        _ => {
            let Some(next) = next_round(ctx.round, ctx.max_iterations) else {
                return limit_reached(ctx);
            };
            if ctx.review_started {
                Transition::Continue {
                    phase: Phase::Implementation,
                    round: next,
                    feedback: "The reviewer approved this round. Continue with the remaining plan items."
                        .to_string(),
                }
            } else {
                Transition::BeginReview { round: next }
            }
        }
    }
}

fn decide_issues(ctx: &RoundContext, issues: &str) -> Transition {
    let Some(next) = next_round(ctx.round, ctx.max_iterations) else {
        return limit_reached(ctx);
    };
    let phase = if ctx.phase == Phase::Review {
        Phase::Review
    } else {
        Phase::Implementation
    };
    Transition::Continue {
        phase,
        round: next,
        feedback: issues.to_string(),
    }
}

fn limit_reached(ctx: &RoundContext) -> Transition {
    Transition::Terminate {
        outcome: Outcome::MaxIterations,
        reason: format!(
            "round {} reached the iteration limit of {}",
            ctx.round, ctx.max_iterations
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(phase: Phase, round: u32) -> RoundContext {
        RoundContext {
            phase,
            round,
            max_iterations: 10,
            review_started: phase == Phase::Review,
        }
    }

    #[test]
    fn approved_implementation_moves_to_review() {
        let t = decide(&ctx(Phase::Implementation, 3), &ReviewVerdict::Approved);
        assert_eq!(t, Transition::BeginReview { round: 4 });
    }

    #[test]
    fn approved_implementation_with_review_flag_continues() {
        let mut c = ctx(Phase::Implementation, 3);
        c.review_started = true;
        let t = decide(&c, &ReviewVerdict::Approved);
        assert!(matches!(
            t,
            Transition::Continue {
                phase: Phase::Implementation,
                round: 4,
                ..
            }
        ));
    }

    #[test]
    fn approved_at_limit_terminates() {
        let t = decide(&ctx(Phase::Implementation, 10), &ReviewVerdict::Approved);
        assert!(matches!(
            t,
            Transition::Terminate {
                outcome: Outcome::MaxIterations,
                ..
            }
        ));
    }

    #[test]
    fn issues_carry_feedback_to_next_round() {
        let t = decide(
            &ctx(Phase::Implementation, 0),
            &ReviewVerdict::IssuesFound("[P1] fix".to_string()),
        );
        assert_eq!(
            t,
            Transition::Continue {
                phase: Phase::Implementation,
                round: 1,
                feedback: "[P1] fix".to_string(),
            }
        );
    }

    #[test]
    fn issues_at_limit_terminate() {
        let t = decide(
            &ctx(Phase::Review, 10),
            &ReviewVerdict::IssuesFound("[P1] fix".to_string()),
        );
        assert!(matches!(
            t,
            Transition::Terminate {
                outcome: Outcome::MaxIterations,
                ..
            }
        ));
    }

    #[test]
    fn review_issues_stay_in_review() {
        let t = decide(
            &ctx(Phase::Review, 6),
            &ReviewVerdict::IssuesFound("[P2] nit".to_string()),
        );
        assert!(matches!(
            t,
            Transition::Continue {
                phase: Phase::Review,
                round: 7,
                ..
            }
        ));
    }

    #[test]
    fn review_approval_finalizes_even_at_limit() {
        let t = decide(&ctx(Phase::Review, 10), &ReviewVerdict::Approved);
        assert_eq!(t, Transition::Finalize);
    }

    #[test]
    fn stagnation_breaks_the_circuit() {
        let t = decide(&ctx(Phase::Implementation, 2), &ReviewVerdict::Stagnation);
        assert!(matches!(
            t,
            Transition::Terminate {
                outcome: Outcome::CircuitBreak,
                ..
            }
        ));
    }

    #[test]
    fn invocation_failure_retries_without_advancing() {
        let t = decide(
            &ctx(Phase::Implementation, 2),
            &ReviewVerdict::InvocationFailed("timed out".to_string()),
        );
        assert_eq!(
            t,
            Transition::Retry {
                reason: "timed out".to_string()
            }
        );
    }

    #[test]
    fn rounds_never_decrease() {
        let verdicts = [
            ReviewVerdict::Approved,
            ReviewVerdict::IssuesFound("[P1] x".to_string()),
            ReviewVerdict::InvocationFailed("x".to_string()),
        ];
        for phase in [Phase::Implementation, Phase::Review] {
            for round in 0..10 {
                for verdict in &verdicts {
                    match decide(&ctx(phase, round), verdict) {
                        Transition::Continue { round: next, .. }
                        | Transition::BeginReview { round: next } => assert_eq!(next, round + 1),
                        _ => {}
                    }
                }
            }
        }
    }

    #[test]
    fn largest_round_hits_the_limit_instead_of_wrapping() {
        let top = RoundContext {
            phase: Phase::Implementation,
            round: u32::MAX,
            max_iterations: u32::MAX,
            review_started: false,
        };
        for verdict in [ReviewVerdict::Approved, ReviewVerdict::IssuesFound("[P2] y".to_string())] {
            assert!(matches!(
                decide(&top, &verdict),
                Transition::Terminate { outcome: Outcome::MaxIterations, .. }
            ));
        }
        assert_eq!(next_round(u32::MAX - 1, u32::MAX), Some(u32::MAX));
        assert_eq!(next_round(3, 3), None);
    }

    #[test]
    fn finalize_requires_summary() {
        assert!(matches!(decide_finalize(false), Transition::Retry { .. }));
        assert!(matches!(
            decide_finalize(true),
            Transition::Terminate {
                outcome: Outcome::Complete,
                ..
            }
        ));
    }
}
