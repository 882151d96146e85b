//! Shared deterministic types for the iteration controller.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fixed outcome tags a session can end with.
///
/// The tag is encoded into the state document's file name when the session
/// terminates (`<tag>-state.json`), so these strings are part of the on-disk
/// format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Complete,
    Cancelled,
    MaxIterations,
    CircuitBreak,
    Error,
}

impl Outcome {
    pub const ALL: [Outcome; 5] = [
        Outcome::Complete,
        Outcome::Cancelled,
        Outcome::MaxIterations,
        Outcome::CircuitBreak,
        Outcome::Error,
    ];

    /// File-name tag for the terminal state document.
    pub fn tag(self) -> &'static str {
        match self {
            Outcome::Complete => "complete",
            Outcome::Cancelled => "cancel",
            Outcome::MaxIterations => "maxiter",
            Outcome::CircuitBreak => "stop",
            Outcome::Error => "error",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|outcome| outcome.tag() == tag)
    }

    /// Operator-facing label.
    pub fn label(self) -> &'static str {
        match self {
            Outcome::Complete => "complete",
            Outcome::Cancelled => "cancelled",
            Outcome::MaxIterations => "max-iterations-reached",
            Outcome::CircuitBreak => "circuit-break",
            Outcome::Error => "error",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Coarse lifecycle stage of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Implementation,
    Review,
    Finalize,
    Terminal(Outcome),
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Terminal(_))
    }

    pub fn label(self) -> String {
        match self {
            Phase::Setup => "setup".to_string(),
            Phase::Implementation => "implementation".to_string(),
            Phase::Review => "review".to_string(),
            Phase::Finalize => "finalize".to_string(),
            Phase::Terminal(outcome) => format!("terminal ({outcome})"),
        }
    }
}

/// Which canonical state document currently represents the session.
///
/// Exactly one of these exists in a session directory at any time; moving
/// between them is a rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StateDoc {
    Setup,
    Active,
    Finalize,
    Terminal(Outcome),
}

impl StateDoc {
    pub const ALL: [StateDoc; 8] = [
        StateDoc::Setup,
        StateDoc::Active,
        StateDoc::Finalize,
        StateDoc::Terminal(Outcome::Complete),
        StateDoc::Terminal(Outcome::Cancelled),
        StateDoc::Terminal(Outcome::MaxIterations),
        StateDoc::Terminal(Outcome::CircuitBreak),
        StateDoc::Terminal(Outcome::Error),
    ];

    pub fn file_name(self) -> String {
        match self {
            StateDoc::Setup => "setup-state.json".to_string(),
            StateDoc::Active => "state.json".to_string(),
            StateDoc::Finalize => "finalize-state.json".to_string(),
            StateDoc::Terminal(outcome) => format!("{}-state.json", outcome.tag()),
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|doc| doc.file_name() == name)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StateDoc::Terminal(_))
    }

    /// Derive the phase; the active document covers both repeating phases.
    pub fn phase(self, review_started: bool) -> Phase {
        match self {
            StateDoc::Setup => Phase::Setup,
            StateDoc::Active if review_started => Phase::Review,
            StateDoc::Active => Phase::Implementation,
            StateDoc::Finalize => Phase::Finalize,
            StateDoc::Terminal(outcome) => Phase::Terminal(outcome),
        }
    }
}

/// How the external reviewer is pointed at the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewShape {
    /// A textual prompt is piped in; the reviewer answers free-form.
    Prompt,
    /// The reviewer inspects the change set against a base reference.
    Diff,
}

impl ReviewShape {
    pub fn for_phase(phase: Phase) -> Self {
        if phase == Phase::Review {
            ReviewShape::Diff
        } else {
            ReviewShape::Prompt
        }
    }
}

/// Classification of one reviewer invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewVerdict {
    Approved,
    IssuesFound(String),
    Stagnation,
    InvocationFailed(String),
}

impl ReviewVerdict {
    pub fn label(&self) -> &'static str {
        match self {
            ReviewVerdict::Approved => "approved",
            ReviewVerdict::IssuesFound(_) => "issues",
            ReviewVerdict::Stagnation => "stagnation",
            ReviewVerdict::InvocationFailed(_) => "invocation-failed",
        }
    }
}

/// Why a guard check vetoed an exit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardFailure {
    /// Stable check name (e.g. `clean-tree`).
    pub check: String,
    /// What is wrong.
    pub reason: String,
    /// The exact step that clears the failure.
    pub remediation: String,
    /// Fatal failures terminate the session as `error` instead of blocking.
    pub fatal: bool,
}

impl GuardFailure {
    pub fn blocking(
        check: impl Into<String>,
        reason: impl Into<String>,
        remediation: impl Into<String>,
    ) -> Self {
        Self {
            check: check.into(),
            reason: reason.into(),
            remediation: remediation.into(),
            fatal: false,
        }
    }

    pub fn fatal(check: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            check: check.into(),
            reason: reason.into(),
            remediation: "the session is corrupted and has been terminated".to_string(),
            fatal: true,
        }
    }
}

/// Result of evaluating the guard chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Pass,
    Block(GuardFailure),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_doc_file_names_round_trip() {
        for doc in StateDoc::ALL {
            assert_eq!(StateDoc::from_file_name(&doc.file_name()), Some(doc));
        }
        assert_eq!(StateDoc::from_file_name("other.json"), None);
    }

    #[test]
    fn active_doc_phase_follows_review_flag() {
        assert_eq!(StateDoc::Active.phase(false), Phase::Implementation);
        assert_eq!(StateDoc::Active.phase(true), Phase::Review);
        assert_eq!(
            StateDoc::Terminal(Outcome::Cancelled).phase(true),
            Phase::Terminal(Outcome::Cancelled)
        );
    }

    #[test]
    fn outcome_tags_are_distinct() {
        let tags: std::collections::BTreeSet<_> = Outcome::ALL.iter().map(|o| o.tag()).collect();
        assert_eq!(tags.len(), Outcome::ALL.len());
        assert_eq!(Outcome::from_tag("maxiter"), Some(Outcome::MaxIterations));
    }
}
