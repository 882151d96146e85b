//! Multi-reviewer review stage.
//!
//! Drives the [`tick`] step function from a timer loop: fetch responses,
//! fold them in, sleep, repeat until every awaited reviewer has responded or
//! timed out. The clock is injected so tests run the loop with synthetic
//! time. The cancel sentinel is checked on every iteration.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::controller::{ReviewStage, StageInput, StageReport, TrackedVerdict, protect};
use crate::core::pool::{
    Adjudication, PollReport, PollState, ReviewerResponse, adjudicate_locally,
    parse_adjudication, pool_verdict, recompute_active, tick,
};
use crate::core::types::{Phase, ReviewShape};
use crate::io::atomic::write_atomic;
use crate::io::prompt::PromptEngine;
use crate::io::responses::ResponseSource;
use crate::io::reviewer::{
    Collected, ReviewArtifacts, ReviewInvoker, ReviewRequest, invoke_and_collect,
};
use crate::io::state_store::{FieldUpdate, SessionPool, StateStore};

/// Reviewer name recorded in round metadata for pool reviews.
pub const POOL_REVIEWER: &str = "pool";

/// Time source for the poll loop.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }
}

/// Why the poll loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollExit {
    Completed(PollReport),
    Cancelled,
}

/// Poll `source` until the state settles or `cancelled` returns true.
///
/// A fetch error ends the loop; the trigger timestamp is persisted by the
/// caller, so a retried attempt keeps the same timeout anchor.
#[instrument(skip_all, fields(trigger_at = %state.trigger_at, interval_secs = interval.as_secs()))]
pub fn run_poll_loop<S, C>(
    mut state: PollState,
    source: &S,
    clock: &C,
    interval: Duration,
    cancelled: impl Fn() -> bool,
) -> Result<PollExit>
where
    S: ResponseSource + ?Sized,
    C: Clock + ?Sized,
{
    loop {
        if cancelled() {
            info!("cancel requested; polling stopped");
            return Ok(PollExit::Cancelled);
        }
        let fresh = source
            .fetch(state.trigger_at)
            .context("fetch reviewer responses")?;
        let (next, report) = tick(state, clock.now(), fresh);
        if let Some(report) = report {
            info!(
                responses = report.responses.len(),
                timed_out = report.timed_out.len(),
                "poll cycle complete"
            );
            return Ok(PollExit::Completed(report));
        }
        state = next;
        debug!(waiting = ?state.waiting(), "awaiting reviewers");
        clock.sleep(interval);
    }
}

/// One fetch folded into the pending poll cycle, without persisting anything.
///
/// Returns `None` when no review has been requested yet.
pub fn poll_once<S: ResponseSource + ?Sized>(
    pool: &SessionPool,
    source: &S,
    now: DateTime<Utc>,
) -> Result<Option<PollState>> {
    let Some(trigger_at) = pool.trigger_at else {
        return Ok(None);
    };
    let fresh = source
        .fetch(trigger_at)
        .context("fetch reviewer responses")?;
    let (state, _) = tick(poll_state(pool, trigger_at), now, fresh);
    Ok(Some(state))
}

/// Decides per-reviewer approval from collected responses.
pub trait Adjudicator {
    fn adjudicate(
        &self,
        input: &StageInput<'_>,
        responses: &[ReviewerResponse],
    ) -> Result<BTreeMap<String, Adjudication>>;
}

impl<A: Adjudicator + ?Sized> Adjudicator for Box<A> {
    fn adjudicate(
        &self,
        input: &StageInput<'_>,
        responses: &[ReviewerResponse],
    ) -> Result<BTreeMap<String, Adjudication>> {
        (**self).adjudicate(input, responses)
    }
}

/// Adjudication with the local issue classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifierAdjudicator;

impl Adjudicator for ClassifierAdjudicator {
    fn adjudicate(
        &self,
        _input: &StageInput<'_>,
        responses: &[ReviewerResponse],
    ) -> Result<BTreeMap<String, Adjudication>> {
        Ok(adjudicate_locally(responses))
    }
}

/// Adjudication by the prompt-form reviewer over all responses.
pub struct InvokerAdjudicator<I> {
    invoker: I,
    prompts: PromptEngine,
}

impl<I: ReviewInvoker> InvokerAdjudicator<I> {
    pub fn new(invoker: I) -> Self {
        Self {
            invoker,
            prompts: PromptEngine::new(),
        }
    }
}

impl<I: ReviewInvoker> Adjudicator for InvokerAdjudicator<I> {
    #[instrument(skip_all, fields(round = input.round(), responses = responses.len()))]
    fn adjudicate(
        &self,
        input: &StageInput<'_>,
        responses: &[ReviewerResponse],
    ) -> Result<BTreeMap<String, Adjudication>> {
        let state = &input.loaded.state;
        let round = input.round();
        let prompt = self.prompts.render_adjudication(responses)?;
        protect(input.session, &input.session.review_prompt(round), &prompt)?;
        let request = ReviewRequest {
            workdir: input.workdir.to_path_buf(),
            shape: ReviewShape::Prompt,
            prompt: Some(prompt),
            base_ref: state.base_ref.clone(),
            model: state.reviewer_model.clone(),
            effort: state.reviewer_effort,
            timeout: Duration::from_secs(state.timeout_secs),
            output_limit_bytes: input.config.output_limit_bytes,
            artifacts: ReviewArtifacts::for_round(input.session, round),
        };
        match invoke_and_collect(&self.invoker, &request)? {
            Collected::Output(text) => Ok(parse_adjudication(&text, responses)),
            Collected::Failed(reason) => Err(anyhow!("adjudication failed: {reason}")),
        }
    }
}

/// Review stage for sessions with a reviewer pool.
///
/// The pool gates implementation rounds; once the code review phase starts
/// every round goes to `code_review`, the diff-driven reviewer.
pub struct PoolReviewStage<S, C, A, R> {
    pub source: S,
    pub clock: C,
    pub adjudicator: A,
    pub code_review: R,
    pub poll_interval: Duration,
}

impl<S, C, A, R> ReviewStage for PoolReviewStage<S, C, A, R>
where
    S: ResponseSource,
    C: Clock,
    A: Adjudicator,
    R: ReviewStage,
{
    #[instrument(skip_all, fields(round = input.round(), phase = %input.loaded.phase().label()))]
    fn review(&self, input: &StageInput<'_>, store: &dyn StateStore) -> Result<StageReport> {
        if input.loaded.phase() == Phase::Review {
            debug!("code review phase; pool not consulted");
            return self.code_review.review(input, store);
        }
        let round = input.round();
        let pool = input
            .loaded
            .state
            .pool
            .as_ref()
            .ok_or_else(|| anyhow!("session has no reviewer pool"))?;

        let trigger_at = match pool.trigger_at {
            Some(at) => at,
            None => {
                let now = self.clock.now();
                store.write(&[FieldUpdate::TriggerAt(Some(now))])?;
                info!(trigger_at = %now, active = ?pool.active, "review requested from pool");
                now
            }
        };
        let report = match run_poll_loop(
            poll_state(pool, trigger_at),
            &self.source,
            &self.clock,
            self.poll_interval,
            || input.session.cancel_requested(),
        ) {
            Ok(PollExit::Completed(report)) => report,
            Ok(PollExit::Cancelled) => {
                return Ok(StageReport::failed(
                    POOL_REVIEWER,
                    "cancellation was requested while waiting for reviewers",
                ));
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "polling failed");
                return Ok(StageReport::failed(POOL_REVIEWER, format!("{err:#}")));
            }
        };
        write_response_log(input, &report)?;

        let adjudications = if report.responses.is_empty() {
            BTreeMap::new()
        } else {
            match self.adjudicator.adjudicate(input, &report.responses) {
                Ok(adjudications) => adjudications,
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "adjudication failed");
                    return Ok(StageReport::failed(POOL_REVIEWER, format!("{err:#}")));
                }
            }
        };

        let prior: BTreeSet<String> = pool.active.iter().cloned().collect();
        let configured: BTreeSet<String> = pool.configured.iter().cloned().collect();
        let active = recompute_active(&prior, &configured, &adjudications, &report.timed_out);
        let verdict = pool_verdict(&active, &adjudications);
        store.write(&[
            FieldUpdate::PoolActive(active.iter().cloned().collect()),
            FieldUpdate::TriggerAt(None),
        ])?;
        info!(round, active = ?active, verdict = verdict.label(), "pool adjudicated");

        Ok(StageReport {
            verdict,
            reviewer: POOL_REVIEWER.to_string(),
            tracked: tracked_verdicts(pool, &adjudications, &report.timed_out),
        })
    }
}

fn poll_state(pool: &SessionPool, trigger_at: DateTime<Utc>) -> PollState {
    let timeouts: BTreeMap<String, Duration> = pool
        .reviewer_timeouts
        .iter()
        .map(|(name, secs)| (name.clone(), Duration::from_secs(*secs)))
        .collect();
    PollState::new(
        &pool.configured,
        &pool.active,
        trigger_at,
        &timeouts,
        Duration::from_secs(pool.reviewer_timeout_secs),
    )
}

/// All responses of the cycle, for the round's combined review log.
fn write_response_log(input: &StageInput<'_>, report: &PollReport) -> Result<()> {
    let mut log = String::new();
    for response in &report.responses {
        log.push_str(&format!(
            "## {} ({})\n\n{}\n\n",
            response.reviewer,
            response.at.to_rfc3339(),
            response.body.trim()
        ));
    }
    for name in &report.timed_out {
        log.push_str(&format!("## {name}\n\n(timed out without responding)\n\n"));
    }
    let path = input.session.review_log(input.round());
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    write_atomic(&path, log.as_bytes())
}

fn tracked_verdicts(
    pool: &SessionPool,
    adjudications: &BTreeMap<String, Adjudication>,
    timed_out: &[String],
) -> Vec<TrackedVerdict> {
    let mut tracked: Vec<TrackedVerdict> = adjudications
        .iter()
        .filter(|(name, _)| pool.configured.contains(name))
        .map(|(name, adjudication)| match adjudication {
            Adjudication::Approved => TrackedVerdict {
                reviewer: name.clone(),
                verdict: "approved".to_string(),
                note: "approved".to_string(),
            },
            Adjudication::Issues(issues) => TrackedVerdict {
                reviewer: name.clone(),
                verdict: "issues".to_string(),
                note: issues.clone(),
            },
        })
        .collect();
    for name in timed_out {
        if !adjudications.contains_key(name) {
            tracked.push(TrackedVerdict {
                reviewer: name.clone(),
                verdict: "timed-out".to_string(),
                note: "no response before the reviewer's timeout".to_string(),
            });
        }
    }
    tracked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::SingleReviewStage;
    use crate::core::types::{ReviewVerdict, StateDoc};
    use crate::io::config::LoopgateConfig;
    use crate::io::session::SessionPaths;
    use crate::io::state_store::{LoadedState, MemoryStateStore};
    use crate::test_support::{
        FakeClock, ScriptedResponseSource, ScriptedReviewer, epoch, response, sample_state,
    };

    fn secs(n: i64) -> DateTime<Utc> {
        epoch() + chrono::Duration::seconds(n)
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn pool(active: &[&str]) -> SessionPool {
        SessionPool {
            configured: names(&["a", "b"]),
            active: names(active),
            trigger_at: None,
            reviewer_timeout_secs: 900,
            reviewer_timeouts: BTreeMap::new(),
        }
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        session: SessionPaths,
        store: MemoryStateStore,
        config: LoopgateConfig,
    }

    impl Fixture {
        fn new(active: &[&str]) -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let session = SessionPaths::new(temp.path(), "2026-01-01_12-00-00");
            fs::create_dir_all(&session.dir).expect("mkdir");
            let mut state = sample_state();
            state.pool = Some(pool(active));
            let store = MemoryStateStore::new();
            store.create(StateDoc::Active, &state).expect("create");
            Self {
                _temp: temp,
                session,
                store,
                config: LoopgateConfig::default(),
            }
        }

        fn review<A: Adjudicator>(
            &self,
            source: ScriptedResponseSource,
            adjudicator: A,
        ) -> StageReport {
            let loaded: LoadedState = self.store.load().expect("load");
            let input = StageInput {
                session: &self.session,
                loaded: &loaded,
                workdir: &self.session.dir,
                config: &self.config,
                summary: "did things",
                audit: false,
            };
            let stage = PoolReviewStage {
                source,
                clock: FakeClock::new(epoch()),
                adjudicator,
                code_review: SingleReviewStage::new(ScriptedReviewer::new(Vec::new()), "codex"),
                poll_interval: Duration::from_secs(30),
            };
            stage.review(&input, &self.store).expect("review")
        }

        fn pool(&self) -> SessionPool {
            self.store
                .load()
                .expect("load")
                .state
                .pool
                .expect("pool")
        }
    }

    /// A approves at t=60s, B never answers: B times out at t=900s and the
    /// pool approves with an empty active set.
    #[test]
    fn silent_reviewer_times_out_from_trigger() {
        let state = PollState::new(
            &names(&["a", "b"]),
            &names(&["a", "b"]),
            epoch(),
            &BTreeMap::new(),
            Duration::from_secs(900),
        );
        let source = ScriptedResponseSource::new(vec![
            Vec::new(),
            Vec::new(),
            vec![response("a", secs(60), "Looks good to me.")],
        ]);
        let clock = FakeClock::new(epoch());
        let exit = run_poll_loop(state, &source, &clock, Duration::from_secs(30), || false)
            .expect("poll");
        let PollExit::Completed(report) = exit else {
            panic!("expected completion");
        };
        assert_eq!(report.timed_out, names(&["b"]));
        assert_eq!(clock.now(), secs(900));

        let adjudications = adjudicate_locally(&report.responses);
        let active = recompute_active(
            &names(&["a", "b"]).into_iter().collect(),
            &names(&["a", "b"]).into_iter().collect(),
            &adjudications,
            &report.timed_out,
        );
        assert!(active.is_empty());
        assert_eq!(pool_verdict(&active, &adjudications), ReviewVerdict::Approved);
    }

    #[test]
    fn cancellation_stops_before_fetching() {
        let state = PollState::new(
            &names(&["a"]),
            &names(&["a"]),
            epoch(),
            &BTreeMap::new(),
            Duration::from_secs(900),
        );
        let source = ScriptedResponseSource::new(Vec::new());
        let clock = FakeClock::new(epoch());
        let exit = run_poll_loop(state, &source, &clock, Duration::from_secs(30), || true)
            .expect("poll");
        assert_eq!(exit, PollExit::Cancelled);
        assert_eq!(source.fetches(), 0);
    }

    #[test]
    fn stage_persists_trigger_and_clears_it_after_adjudication() {
        let fixture = Fixture::new(&["a", "b"]);
        let source = ScriptedResponseSource::new(vec![vec![
            response("a", secs(5), "LGTM"),
            response("b", secs(7), "[P1] parser drops the last token"),
        ]]);
        let report = fixture.review(source, ClassifierAdjudicator);

        let ReviewVerdict::IssuesFound(issues) = &report.verdict else {
            panic!("expected issues, got {:?}", report.verdict);
        };
        assert!(issues.contains("[P1] parser drops the last token"));
        let pool = fixture.pool();
        assert_eq!(pool.active, names(&["b"]));
        assert_eq!(pool.trigger_at, None);
        let tracked: Vec<_> = report
            .tracked
            .iter()
            .map(|t| (t.reviewer.as_str(), t.verdict.as_str()))
            .collect();
        assert_eq!(tracked, vec![("a", "approved"), ("b", "issues")]);
        assert!(fixture.session.review_log(0).exists());
    }

    #[test]
    fn previously_approved_reviewer_can_rejoin() {
        let fixture = Fixture::new(&["b"]);
        let source = ScriptedResponseSource::new(vec![vec![
            response("a", secs(5), "[P2] new regression in the CLI"),
            response("b", secs(6), "Fixed, thanks."),
        ]]);
        let report = fixture.review(source, ClassifierAdjudicator);
        assert!(matches!(report.verdict, ReviewVerdict::IssuesFound(_)));
        assert_eq!(fixture.pool().active, names(&["a"]));
    }

    #[test]
    fn fetch_failure_blocks_and_keeps_trigger() {
        let fixture = Fixture::new(&["a"]);
        let source = ScriptedResponseSource::with_results(vec![Err("gh: rate limited".to_string())]);
        let report = fixture.review(source, ClassifierAdjudicator);
        assert!(
            matches!(&report.verdict, ReviewVerdict::InvocationFailed(reason) if reason.contains("rate limited"))
        );
        assert_eq!(fixture.pool().trigger_at, Some(epoch()));
        assert_eq!(fixture.pool().active, names(&["a"]));
    }

    #[test]
    fn invoker_adjudication_parses_verdict_lines() {
        let fixture = Fixture::new(&["a", "b"]);
        let source = ScriptedResponseSource::new(vec![vec![
            response("a", secs(5), "Minor wording nits, nothing blocking."),
            response("b", secs(6), "The retry path never sleeps."),
        ]]);
        let reviewer = ScriptedReviewer::new(vec![ScriptedReviewer::result(
            "a: APPROVED\nb: ISSUES\n",
        )]);
        let report = fixture.review(source, InvokerAdjudicator::new(reviewer));
        let ReviewVerdict::IssuesFound(issues) = &report.verdict else {
            panic!("expected issues");
        };
        assert!(issues.contains("The retry path never sleeps."));
        assert_eq!(fixture.pool().active, names(&["b"]));
        assert!(fixture.session.review_prompt(0).exists());
    }

    #[test]
    fn code_review_phase_skips_the_pool() {
        let fixture = Fixture::new(&[]);
        fixture
            .store
            .write(&[FieldUpdate::ReviewStarted(true)])
            .expect("begin review");
        let loaded = fixture.store.load().expect("load");
        let input = StageInput {
            session: &fixture.session,
            loaded: &loaded,
            workdir: &fixture.session.dir,
            config: &fixture.config,
            summary: "ready for review",
            audit: false,
        };
        let reviewer = ScriptedReviewer::new(vec![ScriptedReviewer::stdout(
            "[P1] the retry loop never terminates\n",
        )]);
        let source = ScriptedResponseSource::new(Vec::new());
        let clock = FakeClock::new(epoch());
        let stage = PoolReviewStage {
            source: &source,
            clock: &clock,
            adjudicator: ClassifierAdjudicator,
            code_review: SingleReviewStage::new(&reviewer, "codex"),
            poll_interval: Duration::from_secs(30),
        };
        let report = stage.review(&input, &fixture.store).expect("review");

        assert!(matches!(&report.verdict, ReviewVerdict::IssuesFound(issues) if issues.contains("retry loop")));
        assert_eq!(report.reviewer, "codex");
        assert_eq!(source.fetches(), 0);
        assert_eq!(clock.sleeps(), 0);
        assert_eq!(reviewer.requests()[0].shape, ReviewShape::Diff);
        assert_eq!(fixture.pool().trigger_at, None);
    }

    #[test]
    fn poll_once_reports_slots_without_a_pending_cycle_as_none() {
        let source = ScriptedResponseSource::new(vec![]);
        assert_eq!(poll_once(&pool(&["a", "b"]), &source, secs(10)).expect("poll"), None);
        assert_eq!(source.fetches(), 0);

        let mut pending = pool(&["a", "b"]);
        pending.trigger_at = Some(epoch());
        let source = ScriptedResponseSource::new(vec![vec![response("a", secs(60), "LGTM")]]);
        let state = poll_once(&pending, &source, secs(120))
            .expect("poll")
            .expect("pending cycle");
        assert_eq!(state.waiting(), vec!["b"]);
        assert_eq!(state.responses.len(), 1);
    }
}
