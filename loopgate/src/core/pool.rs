//! Multi-reviewer bookkeeping.
//!
//! The poll loop is expressed as a step function: [`tick`] folds freshly
//! fetched responses and the current time into a [`PollState`] and reports
//! once every awaited reviewer has responded or timed out. Timeouts are
//! anchored to the trigger event, not to when polling started.
//!
//! After polling, [`recompute_active`] applies per-reviewer adjudications to
//! the active set and [`pool_verdict`] collapses it into one verdict.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::classifier::classify_log;
use crate::core::types::ReviewVerdict;

/// One response left by a reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerResponse {
    pub reviewer: String,
    pub at: DateTime<Utc>,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Waiting,
    Responded { at: DateTime<Utc> },
    TimedOut,
}

/// Poll-time state for one awaited reviewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewerSlot {
    pub timeout: Duration,
    pub status: SlotStatus,
}

/// State threaded through successive [`tick`] calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollState {
    pub trigger_at: DateTime<Utc>,
    /// Reviewers we wait for (the active set at trigger time).
    pub slots: BTreeMap<String, ReviewerSlot>,
    /// Every configured reviewer; responses from anyone else are ignored.
    pub configured: BTreeSet<String>,
    /// Accepted responses in arrival order, de-duplicated.
    pub responses: Vec<ReviewerResponse>,
}

impl PollState {
    pub fn new(
        configured: &[String],
        active: &[String],
        trigger_at: DateTime<Utc>,
        timeouts: &BTreeMap<String, Duration>,
        default_timeout: Duration,
    ) -> Self {
        let slots = active
            .iter()
            .map(|name| {
                let timeout = timeouts.get(name).copied().unwrap_or(default_timeout);
                (
                    name.clone(),
                    ReviewerSlot {
                        timeout,
                        status: SlotStatus::Waiting,
                    },
                )
            })
            .collect();
        Self {
            trigger_at,
            slots,
            configured: configured.iter().cloned().collect(),
            responses: Vec::new(),
        }
    }

    pub fn waiting(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.status == SlotStatus::Waiting)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    fn is_settled(&self) -> bool {
        self.slots
            .values()
            .all(|slot| slot.status != SlotStatus::Waiting)
    }

    fn report(&self) -> PollReport {
        let timed_out = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.status == SlotStatus::TimedOut)
            .map(|(name, _)| name.clone())
            .collect();
        PollReport {
            responses: self.responses.clone(),
            timed_out,
        }
    }
}

/// What a finished poll cycle produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub responses: Vec<ReviewerResponse>,
    pub timed_out: Vec<String>,
}

/// Advance the poll state by one iteration.
///
/// Returns a report once every awaited reviewer has responded or timed out.
pub fn tick(
    mut state: PollState,
    now: DateTime<Utc>,
    fresh: Vec<ReviewerResponse>,
) -> (PollState, Option<PollReport>) {
    for response in fresh {
        if response.at < state.trigger_at || !state.configured.contains(&response.reviewer) {
            continue;
        }
        if state.responses.contains(&response) {
            continue;
        }
        if let Some(slot) = state.slots.get_mut(&response.reviewer)
            && slot.status == SlotStatus::Waiting
        {
            slot.status = SlotStatus::Responded { at: response.at };
        }
        state.responses.push(response);
    }

    let elapsed = now
        .signed_duration_since(state.trigger_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    for slot in state.slots.values_mut() {
        if slot.status == SlotStatus::Waiting && elapsed >= slot.timeout {
            slot.status = SlotStatus::TimedOut;
        }
    }

    if state.is_settled() {
        let report = state.report();
        return (state, Some(report));
    }
    (state, None)
}

/// Per-reviewer judgement of its responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Adjudication {
    Approved,
    Issues(String),
}

/// Adjudicate each responding reviewer with the local classifier.
///
/// A reviewer's responses are concatenated; any line-leading severity marker
/// means issues, otherwise a non-empty response is approval evidence.
pub fn adjudicate_locally(responses: &[ReviewerResponse]) -> BTreeMap<String, Adjudication> {
    let mut bodies: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for response in responses {
        bodies
            .entry(response.reviewer.clone())
            .or_default()
            .push(response.body.as_str());
    }
    bodies
        .into_iter()
        .filter_map(|(reviewer, parts)| {
            let combined = parts.join("\n");
            match classify_log(&combined) {
                ReviewVerdict::Approved => Some((reviewer, Adjudication::Approved)),
                ReviewVerdict::IssuesFound(issues) => Some((reviewer, Adjudication::Issues(issues))),
                _ => None,
            }
        })
        .collect()
}

/// Parse `<name>: APPROVED|ISSUES` lines written by an adjudicating reviewer.
///
/// Only reviewers that actually responded are judged; an `ISSUES` verdict
/// carries that reviewer's own responses as the issue content. Unknown names
/// and unparseable lines are ignored, so an unmentioned reviewer keeps its
/// prior status.
pub fn parse_adjudication(
    text: &str,
    responses: &[ReviewerResponse],
) -> BTreeMap<String, Adjudication> {
    let mut bodies: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for response in responses {
        bodies
            .entry(response.reviewer.as_str())
            .or_default()
            .push(response.body.trim());
    }

    let mut out = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim().trim_start_matches(['-', '*']).trim();
        let Some((name, verdict)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().trim_matches('`');
        let Some(parts) = bodies.get(name) else {
            continue;
        };
        let adjudication = match verdict.trim().trim_matches('`').to_ascii_uppercase().as_str() {
            "APPROVED" => Adjudication::Approved,
            "ISSUES" => Adjudication::Issues(parts.join("\n\n")),
            _ => continue,
        };
        out.insert(name.to_string(), adjudication);
    }
    out
}

/// Apply adjudications and timeouts to the previous active set.
///
/// Approved reviewers leave the set, reviewers raising issues join it (even
/// if they approved before), timed-out reviewers leave without approving, and
/// everyone else keeps their prior status.
pub fn recompute_active(
    prior_active: &BTreeSet<String>,
    configured: &BTreeSet<String>,
    adjudications: &BTreeMap<String, Adjudication>,
    timed_out: &[String],
) -> BTreeSet<String> {
    let mut active = prior_active.clone();
    for (reviewer, adjudication) in adjudications {
        if !configured.contains(reviewer) {
            continue;
        }
        match adjudication {
            Adjudication::Approved => {
                active.remove(reviewer);
            }
            Adjudication::Issues(_) => {
                active.insert(reviewer.clone());
            }
        }
    }
    for reviewer in timed_out {
        if !adjudications.contains_key(reviewer) {
            active.remove(reviewer);
        }
    }
    active
}

/// Collapse the recomputed active set into a single verdict.
pub fn pool_verdict(
    active: &BTreeSet<String>,
    adjudications: &BTreeMap<String, Adjudication>,
) -> ReviewVerdict {
    if active.is_empty() {
        return ReviewVerdict::Approved;
    }
    let mut buf = String::new();
    for reviewer in active {
        match adjudications.get(reviewer) {
            Some(Adjudication::Issues(issues)) => {
                buf.push_str(&format!("## {reviewer}\n\n{}\n\n", issues.trim()));
            }
            _ => {
                buf.push_str(&format!(
                    "## {reviewer}\n\nStill awaiting approval from this reviewer.\n\n"
                ));
            }
        }
    }
    ReviewVerdict::IssuesFound(buf.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn response(reviewer: &str, secs: i64, body: &str) -> ReviewerResponse {
        ReviewerResponse {
            reviewer: reviewer.to_string(),
            at: t(secs),
            body: body.to_string(),
        }
    }

    fn state(active: &[&str]) -> PollState {
        PollState::new(
            &names(&["a", "b"]),
            &names(active),
            t(0),
            &BTreeMap::new(),
            Duration::from_secs(900),
        )
    }

    #[test]
    fn approval_plus_timeout_empties_active_set() {
        let s = state(&["a", "b"]);
        let (s, report) = tick(s, t(30), Vec::new());
        assert!(report.is_none());
        let (s, report) = tick(s, t(60), vec![response("a", 60, "Looks good to me.")]);
        assert!(report.is_none());
        assert_eq!(s.waiting(), vec!["b"]);

        let (_, report) = tick(s, t(900), vec![response("a", 60, "Looks good to me.")]);
        let report = report.expect("settled");
        assert_eq!(report.timed_out, names(&["b"]));
        assert_eq!(report.responses.len(), 1);

        let adjudications = adjudicate_locally(&report.responses);
        assert_eq!(adjudications.get("a"), Some(&Adjudication::Approved));
        let prior: BTreeSet<String> = names(&["a", "b"]).into_iter().collect();
        let configured = prior.clone();
        let active = recompute_active(&prior, &configured, &adjudications, &report.timed_out);
        assert!(active.is_empty());
        assert_eq!(pool_verdict(&active, &adjudications), ReviewVerdict::Approved);
    }

    #[test]
    fn timeouts_are_anchored_to_trigger() {
        let mut timeouts = BTreeMap::new();
        timeouts.insert("a".to_string(), Duration::from_secs(100));
        let s = PollState::new(
            &names(&["a", "b"]),
            &names(&["a", "b"]),
            t(0),
            &timeouts,
            Duration::from_secs(900),
        );
        let (s, report) = tick(s, t(100), Vec::new());
        assert!(report.is_none());
        assert_eq!(s.slots["a"].status, SlotStatus::TimedOut);
        assert_eq!(s.slots["b"].status, SlotStatus::Waiting);
    }

    #[test]
    fn responses_before_trigger_are_ignored() {
        let s = state(&["a"]);
        let (s, report) = tick(s, t(10), vec![response("a", -5, "old approval")]);
        assert!(report.is_none());
        assert!(s.responses.is_empty());
    }

    #[test]
    fn unknown_reviewers_are_ignored() {
        let s = state(&["a"]);
        let (s, _) = tick(s, t(10), vec![response("mallory", 5, "[P0] everything")]);
        assert!(s.responses.is_empty());
    }

    #[test]
    fn previously_approved_reviewer_rejoins_on_new_issue() {
        let s = state(&["b"]);
        let (_, report) = tick(
            s,
            t(20),
            vec![
                response("a", 10, "- [P1] regression in parser"),
                response("b", 15, "approved"),
            ],
        );
        let report = report.expect("b responded");
        let adjudications = adjudicate_locally(&report.responses);
        let prior: BTreeSet<String> = names(&["b"]).into_iter().collect();
        let configured: BTreeSet<String> = names(&["a", "b"]).into_iter().collect();
        let active = recompute_active(&prior, &configured, &adjudications, &report.timed_out);
        assert_eq!(active, names(&["a"]).into_iter().collect());

        let ReviewVerdict::IssuesFound(content) = pool_verdict(&active, &adjudications) else {
            panic!("expected issues");
        };
        assert!(content.contains("## a"));
        assert!(content.contains("[P1] regression in parser"));
    }

    #[test]
    fn silent_reviewers_keep_prior_status() {
        let prior: BTreeSet<String> = names(&["a", "b"]).into_iter().collect();
        let configured = prior.clone();
        let mut adjudications = BTreeMap::new();
        adjudications.insert("a".to_string(), Adjudication::Approved);
        let active = recompute_active(&prior, &configured, &adjudications, &[]);
        assert_eq!(active, names(&["b"]).into_iter().collect());
        let ReviewVerdict::IssuesFound(content) = pool_verdict(&active, &adjudications) else {
            panic!("expected pending reviewer");
        };
        assert!(content.contains("Still awaiting approval"));
    }

    #[test]
    fn duplicate_fetches_do_not_duplicate_responses() {
        let s = state(&["a", "b"]);
        let r = response("a", 5, "ok");
        let (s, _) = tick(s, t(5), vec![r.clone()]);
        let (s, _) = tick(s, t(10), vec![r]);
        assert_eq!(s.responses.len(), 1);
    }

    #[test]
    fn adjudication_lines_map_to_responding_reviewers() {
        let responses = vec![
            response("alpha", 1, "LGTM"),
            response("beta", 2, "[P2] nit"),
            response("beta", 3, "and another"),
        ];
        let text = "Verdicts:\n- alpha: APPROVED\n- `beta`: issues\ngamma: APPROVED\nnonsense line\n";
        let adjudications = parse_adjudication(text, &responses);
        assert_eq!(adjudications.len(), 2);
        assert_eq!(adjudications["alpha"], Adjudication::Approved);
        assert_eq!(
            adjudications["beta"],
            Adjudication::Issues("[P2] nit\n\nand another".to_string())
        );
    }
}
