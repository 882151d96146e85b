//! Orchestration for a single exit attempt.
//!
//! [`handle_exit_attempt`] runs the guard chain, asks a [`ReviewStage`] for a
//! verdict, and applies the resulting [`Transition`]. Artifacts for the next
//! step are always written before the state document changes, so a crash in
//! between resumes at the earlier round.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::core::audit::CircuitBreaker;
use crate::core::classifier::classify;
use crate::core::machine::{RoundContext, Transition, decide, decide_finalize};
use crate::core::types::{
    GuardDecision, GuardFailure, Outcome, Phase, ReviewShape, ReviewVerdict, StateDoc,
};
use crate::io::config::LoopgateConfig;
use crate::io::git::Git;
use crate::io::goal_tracker::{TrackerEntry, update_tracker};
use crate::io::guards::{GuardCheck, GuardContext, evaluate};
use crate::io::integrity::write_protected;
use crate::io::prompt::{PromptEngine, ReviewPromptInput, RoundPromptInput};
use crate::io::reviewer::{
    Collected, ReviewArtifacts, ReviewInvoker, ReviewRequest, invoke_and_collect,
};
use crate::io::rounds::{RoundMeta, read_summary, write_round_meta};
use crate::io::session::SessionPaths;
use crate::io::state_store::{
    FieldUpdate, LoadedState, SessionState, StateError, StateStore, state_error,
};

/// What the caller should do with the exit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitDecision {
    /// Let the producing agent stop. `outcome` is set once the session ended.
    Allow {
        outcome: Option<Outcome>,
        message: String,
    },
    /// Keep the agent working; `reason` says what to do next.
    Block { reason: String },
}

impl ExitDecision {
    fn block(reason: impl Into<String>) -> Self {
        ExitDecision::Block {
            reason: reason.into(),
        }
    }
}

/// Collaborators for one exit attempt.
pub struct ExitEnv<'a> {
    pub session: &'a SessionPaths,
    pub store: &'a dyn StateStore,
    pub git: &'a Git,
    pub config: &'a LoopgateConfig,
    pub checks: &'a [Box<dyn GuardCheck>],
    pub prompts: &'a PromptEngine,
    /// Producing agent's transcript, for the outstanding-task check.
    pub transcript: Option<&'a Path>,
}

/// What a review stage sees.
pub struct StageInput<'a> {
    pub session: &'a SessionPaths,
    pub loaded: &'a LoadedState,
    pub workdir: &'a Path,
    pub config: &'a LoopgateConfig,
    /// The agent's summary for the round under review.
    pub summary: &'a str,
    /// Whether this round is a deep-audit round.
    pub audit: bool,
}

impl StageInput<'_> {
    pub fn round(&self) -> u32 {
        self.loaded.state.current_round
    }
}

/// One reviewer's line in the goal tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedVerdict {
    pub reviewer: String,
    pub verdict: String,
    pub note: String,
}

/// A stage's verdict plus what to record about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub verdict: ReviewVerdict,
    /// Reviewer name for the round metadata.
    pub reviewer: String,
    pub tracked: Vec<TrackedVerdict>,
}

impl StageReport {
    pub fn failed(reviewer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            verdict: ReviewVerdict::InvocationFailed(reason.into()),
            reviewer: reviewer.into(),
            tracked: Vec::new(),
        }
    }
}

/// Produces a verdict for the current round.
pub trait ReviewStage {
    fn review(&self, input: &StageInput<'_>, store: &dyn StateStore) -> Result<StageReport>;
}

/// A single external reviewer, prompt-driven or diff-driven by phase.
pub struct SingleReviewStage<I> {
    invoker: I,
    name: String,
    prompts: PromptEngine,
}

impl<I: ReviewInvoker> SingleReviewStage<I> {
    pub fn new(invoker: I, name: impl Into<String>) -> Self {
        Self {
            invoker,
            name: name.into(),
            prompts: PromptEngine::new(),
        }
    }
}

impl<I: ReviewInvoker> ReviewStage for SingleReviewStage<I> {
    #[instrument(skip_all, fields(round = input.round(), reviewer = %self.name))]
    fn review(&self, input: &StageInput<'_>, _store: &dyn StateStore) -> Result<StageReport> {
        let state = &input.loaded.state;
        let round = input.round();
        let shape = ReviewShape::for_phase(input.loaded.phase());
        let artifacts = ReviewArtifacts::for_round(input.session, round);

        let prompt = match shape {
            ReviewShape::Prompt => {
                let plan = read_plan(input.session, input.workdir, state)?;
                let tracker = if input.audit {
                    let path = input.session.goal_tracker();
                    Some(
                        fs::read_to_string(&path)
                            .with_context(|| format!("read {}", path.display()))?,
                    )
                } else {
                    None
                };
                let result_path = artifacts.result_path.display().to_string();
                let text = self.prompts.render_review(&ReviewPromptInput {
                    round,
                    plan: &plan,
                    summary: input.summary,
                    audit_tracker: tracker.as_deref(),
                    result_path: &result_path,
                })?;
                protect(input.session, &input.session.review_prompt(round), &text)?;
                Some(text)
            }
            ReviewShape::Diff => None,
        };

        let request = ReviewRequest {
            workdir: input.workdir.to_path_buf(),
            shape,
            prompt,
            base_ref: state.base_ref.clone(),
            model: state.reviewer_model.clone(),
            effort: state.reviewer_effort,
            timeout: std::time::Duration::from_secs(state.timeout_secs),
            output_limit_bytes: input.config.output_limit_bytes,
            artifacts,
        };
        let verdict = match invoke_and_collect(&self.invoker, &request)? {
            Collected::Failed(reason) => ReviewVerdict::InvocationFailed(reason),
            Collected::Output(text) => classify(shape, &text),
        };
        let tracked = tracked_for(&self.name, &verdict).into_iter().collect();
        Ok(StageReport {
            verdict,
            reviewer: self.name.clone(),
            tracked,
        })
    }
}

fn tracked_for(reviewer: &str, verdict: &ReviewVerdict) -> Option<TrackedVerdict> {
    let note = match verdict {
        ReviewVerdict::Approved => "approved".to_string(),
        ReviewVerdict::IssuesFound(issues) => issues.clone(),
        ReviewVerdict::Stagnation => "the reviewer reported that the session is not converging".to_string(),
        ReviewVerdict::InvocationFailed(_) => return None,
    };
    Some(TrackedVerdict {
        reviewer: reviewer.to_string(),
        verdict: verdict.label().to_string(),
        note,
    })
}

/// Plan text for the review prompt; the start-time snapshot if the file is gone.
fn read_plan(session: &SessionPaths, workdir: &Path, state: &SessionState) -> Result<String> {
    let path = workdir.join(&state.plan_file);
    let path = if path.is_file() {
        path
    } else {
        session.plan_snapshot()
    };
    fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
}

/// Write a controller-owned session file and record its digest.
pub(crate) fn protect(session: &SessionPaths, path: &Path, contents: &str) -> Result<()> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("invalid session file name {}", path.display()))?;
    write_protected(&session.dir, name, contents.as_bytes())
}

fn relative_display(workdir: &Path, path: &Path) -> String {
    path.strip_prefix(workdir)
        .unwrap_or(path)
        .display()
        .to_string()
}

/// Render and persist the producing agent's prompt for `round`.
pub fn write_round_prompt(
    session: &SessionPaths,
    prompts: &PromptEngine,
    workdir: &Path,
    state: &SessionState,
    round: u32,
    phase: Phase,
    feedback: Option<&str>,
) -> Result<PathBuf> {
    let path = session.round_prompt(round);
    let summary_path = relative_display(workdir, &session.round_summary(round));
    let text = prompts.render_round(&RoundPromptInput {
        round,
        phase,
        max_iterations: state.max_iterations,
        plan_file: &state.plan_file,
        plan_mutable: state.plan_mutable,
        start_branch: &state.start_branch,
        base_ref: &state.base_ref,
        summary_path: &summary_path,
        feedback,
    })?;
    protect(session, &path, &text)?;
    Ok(path)
}

/// Handle one attempt by the producing agent to stop.
#[instrument(skip_all, fields(session = %env.session.id))]
pub fn handle_exit_attempt<S: ReviewStage + ?Sized>(
    env: &ExitEnv<'_>,
    stage: &S,
) -> Result<ExitDecision> {
    if env.session.cancel_requested() {
        return cancel_session(env.session, env.store);
    }

    let Some(doc) = env.store.current_doc()? else {
        return Ok(ExitDecision::Allow {
            outcome: None,
            message: format!("no state document in {}", env.session.dir.display()),
        });
    };
    match doc {
        StateDoc::Terminal(outcome) => {
            return Ok(ExitDecision::Allow {
                outcome: Some(outcome),
                message: format!("session {} already ended ({})", env.session.id, outcome.label()),
            });
        }
        StateDoc::Setup => {
            warn!("exit attempted before setup finished");
            return Ok(ExitDecision::block(format!(
                "Session {} never finished setup.\n\nTo continue: run `loopgate cancel`, then start a new session.",
                env.session.id
            )));
        }
        StateDoc::Active | StateDoc::Finalize => {}
    }

    let loaded = match env.store.load() {
        Ok(loaded) => loaded,
        Err(err) => {
            if let Some(StateError::Corrupt { .. }) = state_error(&err) {
                return terminate_as_error(env, format!("{err:#}"));
            }
            return Err(err);
        }
    };

    let ctx = GuardContext {
        session: env.session,
        store: env.store,
        loaded: &loaded,
        git: env.git,
        config: env.config,
        transcript: env.transcript,
    };
    if let GuardDecision::Block(failure) = evaluate(env.checks, &ctx) {
        if failure.fatal {
            return terminate_as_error(env, format!("{}: {}", failure.check, failure.reason));
        }
        return Ok(ExitDecision::block(render_failure(&failure)));
    }

    if loaded.doc == StateDoc::Finalize {
        return finalize(env, &loaded);
    }
    review_round(env, &loaded, stage)
}

fn render_failure(failure: &GuardFailure) -> String {
    format!(
        "Exit blocked by the {} check: {}\n\nTo continue: {}",
        failure.check, failure.reason, failure.remediation
    )
}

fn finalize(env: &ExitEnv<'_>, loaded: &LoadedState) -> Result<ExitDecision> {
    let summary_path = env.session.finalize_summary();
    let summary = read_summary(&summary_path)?;
    match decide_finalize(summary.is_some()) {
        Transition::Terminate { outcome, reason } => terminate(env, loaded.doc, outcome, reason),
        Transition::Retry { reason } => Ok(ExitDecision::block(format!(
            "Finalize is not done: {reason}.\n\nTo continue: write your final summary to {}, then attempt the exit again.",
            relative_display(env.git.workdir(), &summary_path)
        ))),
        other => Err(anyhow!("unexpected finalize transition {other:?}")),
    }
}

fn review_round<S: ReviewStage + ?Sized>(
    env: &ExitEnv<'_>,
    loaded: &LoadedState,
    stage: &S,
) -> Result<ExitDecision> {
    let state = &loaded.state;
    let round = state.current_round;
    let phase = loaded.phase();

    let summary_path = env.session.round_summary(round);
    let Some(summary) = read_summary(&summary_path)? else {
        return Ok(ExitDecision::block(format!(
            "Round {round} has no summary.\n\nTo continue: describe what you did this round in {}, then attempt the exit again.",
            relative_display(env.git.workdir(), &summary_path)
        )));
    };

    let breaker = CircuitBreaker::new(state.audit_interval);
    let input = StageInput {
        session: env.session,
        loaded,
        workdir: env.git.workdir(),
        config: env.config,
        summary: &summary,
        audit: breaker.is_audit_round(round),
    };
    let started_at = Utc::now();
    let report = stage.review(&input, env.store)?;

    if env.session.cancel_requested() {
        return cancel_session(env.session, env.store);
    }

    if report.verdict == ReviewVerdict::Stagnation && breaker.is_off_cycle(round) {
        warn!(round, interval = breaker.interval(), "stagnation reported outside a deep-audit round; honoring it");
    }
    let transition = decide(
        &RoundContext {
            phase,
            round,
            max_iterations: state.max_iterations,
            review_started: state.review_started,
        },
        &report.verdict,
    );
    record_round(env, round, phase, &report, &transition, started_at)?;
    apply_transition(env, loaded, round, transition)
}

fn record_round(
    env: &ExitEnv<'_>,
    round: u32,
    phase: Phase,
    report: &StageReport,
    transition: &Transition,
    started_at: DateTime<Utc>,
) -> Result<()> {
    for tracked in &report.tracked {
        update_tracker(
            env.session,
            &TrackerEntry {
                round,
                reviewer: &tracked.reviewer,
                verdict: &tracked.verdict,
                note: &tracked.note,
            },
        )?;
    }
    let ended_at = Utc::now();
    write_round_meta(
        env.session,
        &RoundMeta {
            round,
            phase: phase.label(),
            reviewer: report.reviewer.clone(),
            verdict: report.verdict.label().to_string(),
            transition: describe(transition),
            started_at,
            ended_at,
            duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
        },
    )
}

fn describe(transition: &Transition) -> String {
    match transition {
        Transition::Continue { phase, round, .. } => format!("continue {} round {round}", phase.label()),
        Transition::BeginReview { round } => format!("begin review round {round}"),
        Transition::Finalize => "finalize".to_string(),
        Transition::Retry { .. } => "retry".to_string(),
        Transition::Terminate { outcome, .. } => format!("terminate {}", outcome.label()),
    }
}

fn apply_transition(
    env: &ExitEnv<'_>,
    loaded: &LoadedState,
    round: u32,
    transition: Transition,
) -> Result<ExitDecision> {
    let state = &loaded.state;
    let workdir = env.git.workdir();
    match transition {
        Transition::Retry { reason } => {
            warn!(round, reason = %reason, "review failed; exit blocked for retry");
            Ok(ExitDecision::block(format!(
                "The review of round {round} could not be completed: {reason}\n\nTo continue: attempt the exit again to retry the review."
            )))
        }
        Transition::Continue {
            phase,
            round: next,
            feedback,
        } => {
            let prompt = write_round_prompt(
                env.session,
                env.prompts,
                workdir,
                state,
                next,
                phase,
                Some(&feedback),
            )?;
            env.store.write(&[FieldUpdate::CurrentRound(next)])?;
            info!(from = round, to = next, phase = %phase.label(), "round advanced");
            Ok(ExitDecision::block(format!(
                "Round {round} is not finished. Round {next} ({}) has begun: follow {}.\n\nReviewer feedback:\n\n{}",
                phase.label(),
                relative_display(workdir, &prompt),
                feedback.trim()
            )))
        }
        Transition::BeginReview { round: next } => {
            let prompt = write_round_prompt(
                env.session,
                env.prompts,
                workdir,
                state,
                next,
                Phase::Review,
                None,
            )?;
            env.store.write(&[
                FieldUpdate::CurrentRound(next),
                FieldUpdate::ReviewStarted(true),
            ])?;
            info!(round = next, "implementation approved; review phase started");
            Ok(ExitDecision::block(format!(
                "Implementation approved. Round {next} starts the code review phase: follow {}.",
                relative_display(workdir, &prompt)
            )))
        }
        Transition::Finalize => {
            let path = env.session.finalize_prompt();
            let summary_path = relative_display(workdir, &env.session.finalize_summary());
            let text = env.prompts.render_finalize(round, &summary_path)?;
            protect(env.session, &path, &text)?;
            env.store.transition(loaded.doc, StateDoc::Finalize)?;
            info!(round, "review approved; finalizing");
            Ok(ExitDecision::block(format!(
                "Review approved. Finalize the session: follow {}.",
                relative_display(workdir, &path)
            )))
        }
        Transition::Terminate { outcome, reason } => terminate(env, loaded.doc, outcome, reason),
    }
}

fn terminate(
    env: &ExitEnv<'_>,
    from: StateDoc,
    outcome: Outcome,
    reason: String,
) -> Result<ExitDecision> {
    env.store.transition(from, StateDoc::Terminal(outcome))?;
    info!(outcome = outcome.label(), reason = %reason, "session ended");
    Ok(ExitDecision::Allow {
        outcome: Some(outcome),
        message: format!("Session ended ({}): {reason}", outcome.label()),
    })
}

fn terminate_as_error(env: &ExitEnv<'_>, reason: String) -> Result<ExitDecision> {
    env.store.mark_error()?;
    warn!(reason = %reason, "session corrupted; terminated as error");
    Ok(ExitDecision::Allow {
        outcome: Some(Outcome::Error),
        message: format!("Session ended ({}): {reason}", Outcome::Error.label()),
    })
}

/// End the session early. Requires the cancel sentinel to be present.
#[instrument(skip_all, fields(session = %session.id))]
pub fn cancel_session(session: &SessionPaths, store: &dyn StateStore) -> Result<ExitDecision> {
    if !session.cancel_requested() {
        return Err(anyhow!(
            "cancellation is not authorized: {} is missing",
            session.cancel_sentinel().display()
        ));
    }
    match store.current_doc()? {
        None => Err(StateError::NotFound(session.dir.display().to_string()).into()),
        Some(StateDoc::Terminal(outcome)) => Ok(ExitDecision::Allow {
            outcome: Some(outcome),
            message: format!("session {} already ended ({})", session.id, outcome.label()),
        }),
        Some(doc) => {
            store.transition(doc, StateDoc::Terminal(Outcome::Cancelled))?;
            info!(from = %doc.file_name(), "session cancelled");
            Ok(ExitDecision::Allow {
                outcome: Some(Outcome::Cancelled),
                message: format!("Session {} cancelled.", session.id),
            })
        }
    }
}

/// Place the cancel sentinel, then cancel.
pub fn request_cancel(session: &SessionPaths, store: &dyn StateStore) -> Result<ExitDecision> {
    let sentinel = session.cancel_sentinel();
    if !sentinel.exists() {
        fs::write(&sentinel, format!("{}\n", Utc::now().to_rfc3339()))
            .with_context(|| format!("write {}", sentinel.display()))?;
    }
    cancel_session(session, store)
}
