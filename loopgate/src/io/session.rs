//! Session directory layout and discovery.
//!
//! Sessions live under `<base>/.loopgate/<YYYY-MM-DD_HH-MM-SS>/`. Timestamps
//! sort lexicographically, so the newest session is the greatest name.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::core::types::StateDoc;
use crate::io::integrity::LEDGER_FILE;

/// Controller directory under the workspace root.
pub const LOOPGATE_DIR: &str = ".loopgate";
/// Session id format (also the directory name).
pub const SESSION_ID_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
/// Sentinel whose presence authorizes cancellation.
pub const CANCEL_SENTINEL: &str = ".cancel-requested";

/// Canonical paths for one session directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub id: String,
    pub dir: PathBuf,
}

impl SessionPaths {
    pub fn new(base: &Path, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            dir: base.join(LOOPGATE_DIR).join(&id),
            id,
        }
    }

    /// Open an existing session directory.
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let id = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { id, dir }
    }

    pub fn state_doc(&self, doc: StateDoc) -> PathBuf {
        self.dir.join(doc.file_name())
    }

    pub fn round_prompt(&self, round: u32) -> PathBuf {
        self.round_file(round, "prompt.md")
    }

    pub fn round_summary(&self, round: u32) -> PathBuf {
        self.round_file(round, "summary.md")
    }

    pub fn review_prompt(&self, round: u32) -> PathBuf {
        self.round_file(round, "review-prompt.md")
    }

    pub fn review_result(&self, round: u32) -> PathBuf {
        self.round_file(round, "review-result.md")
    }

    pub fn review_log(&self, round: u32) -> PathBuf {
        self.round_file(round, "review.log")
    }

    pub fn review_cmd(&self, round: u32) -> PathBuf {
        self.round_file(round, "review.cmd")
    }

    pub fn review_stdout(&self, round: u32) -> PathBuf {
        self.round_file(round, "review.stdout")
    }

    pub fn review_stderr(&self, round: u32) -> PathBuf {
        self.round_file(round, "review.stderr")
    }

    pub fn round_meta(&self, round: u32) -> PathBuf {
        self.round_file(round, "meta.json")
    }

    pub fn finalize_prompt(&self) -> PathBuf {
        self.dir.join("finalize-prompt.md")
    }

    pub fn finalize_summary(&self) -> PathBuf {
        self.dir.join("finalize-summary.md")
    }

    pub fn goal_tracker(&self) -> PathBuf {
        self.dir.join("goal-tracker.md")
    }

    pub fn plan_snapshot(&self) -> PathBuf {
        self.dir.join("plan.snapshot")
    }

    pub fn integrity_ledger(&self) -> PathBuf {
        self.dir.join(LEDGER_FILE)
    }

    pub fn responses_dir(&self) -> PathBuf {
        self.dir.join("responses")
    }

    pub fn cancel_sentinel(&self) -> PathBuf {
        self.dir.join(CANCEL_SENTINEL)
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_sentinel().exists()
    }

    /// The state document currently present, if any.
    ///
    /// Non-terminal documents take precedence so an interrupted rename is
    /// resolved toward the earlier phase.
    pub fn present_state_doc(&self) -> Option<StateDoc> {
        StateDoc::ALL
            .into_iter()
            .find(|doc| self.state_doc(*doc).is_file())
    }

    fn round_file(&self, round: u32, kind: &str) -> PathBuf {
        self.dir.join(format!("round-{round}-{kind}"))
    }
}

/// Session id for a creation time.
pub fn session_id(at: DateTime<Utc>) -> String {
    at.format(SESSION_ID_FORMAT).to_string()
}

/// List all session directories under `base`, oldest first.
pub fn list_sessions(base: &Path) -> Result<Vec<SessionPaths>> {
    let root = base.join(LOOPGATE_DIR);
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut sessions = Vec::new();
    for entry in fs::read_dir(&root).with_context(|| format!("read {}", root.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", root.display()))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if chrono::NaiveDateTime::parse_from_str(&name, SESSION_ID_FORMAT).is_err() {
            continue;
        }
        sessions.push(SessionPaths::from_dir(path));
    }
    sessions.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(sessions)
}

/// Newest session holding a non-terminal state document.
pub fn find_active_session(base: &Path) -> Result<Option<SessionPaths>> {
    let sessions = list_sessions(base)?;
    let active = sessions.into_iter().rev().find(|session| {
        session
            .present_state_doc()
            .is_some_and(|doc| !doc.is_terminal())
    });
    debug!(session = ?active.as_ref().map(|s| &s.id), "active session lookup");
    Ok(active)
}

/// Newest session of any kind, for status reporting.
pub fn find_latest_session(base: &Path) -> Result<Option<SessionPaths>> {
    Ok(list_sessions(base)?.pop())
}
