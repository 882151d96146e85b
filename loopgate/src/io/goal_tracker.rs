//! Controller-maintained goal/progress tracker (`goal-tracker.md`).
//!
//! The document has a summary table with one row per (round, reviewer) and an
//! append-only log. Only the controller writes it, so it is a protected file.

use std::fs;

use anyhow::{Context, Result};
use tracing::debug;

use crate::io::integrity::write_protected;
use crate::io::session::SessionPaths;

const GOAL_TRACKER_FILE: &str = "goal-tracker.md";
const SUMMARY_HEADER: &str = "| Round | Reviewer | Verdict | Note |\n|-------|----------|---------|------|\n";
const LOG_HEADING: &str = "## Log\n";
const NOTE_CELL_LIMIT: usize = 120;

/// One reviewer's outcome for one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerEntry<'a> {
    pub round: u32,
    pub reviewer: &'a str,
    pub verdict: &'a str,
    pub note: &'a str,
}

/// Create the tracker if it does not exist yet.
pub fn init_tracker(session: &SessionPaths, plan_file: &str, plan: &str) -> Result<()> {
    if session.goal_tracker().exists() {
        return Ok(());
    }
    let mut doc = String::new();
    doc.push_str("# Goal Tracker\n\n");
    doc.push_str(&format!("Plan: `{plan_file}`\n\n"));
    doc.push_str("## Goal\n\n");
    doc.push_str(plan.trim());
    doc.push_str("\n\n## Summary\n\n");
    doc.push_str(SUMMARY_HEADER);
    doc.push('\n');
    doc.push_str(LOG_HEADING);
    write_protected(&session.dir, GOAL_TRACKER_FILE, doc.as_bytes())
}

/// Record an entry; a second update for the same (round, reviewer) is a no-op.
///
/// Returns whether the tracker changed.
pub fn update_tracker(session: &SessionPaths, entry: &TrackerEntry<'_>) -> Result<bool> {
    let path = session.goal_tracker();
    let doc = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let row_key = format!("| {} | {} |", entry.round, entry.reviewer);
    if doc.lines().any(|line| line.starts_with(&row_key)) {
        debug!(round = entry.round, reviewer = entry.reviewer, "tracker entry already present");
        return Ok(false);
    }

    let row = format!(
        "{row_key} {} | {} |\n",
        entry.verdict,
        note_cell(entry.note)
    );
    let insert_at = summary_end(&doc).with_context(|| format!("malformed {}", path.display()))?;
    let mut next = String::with_capacity(doc.len() + row.len() + entry.note.len() + 64);
    next.push_str(&doc[..insert_at]);
    next.push_str(&row);
    next.push_str(&doc[insert_at..]);
    if !next.ends_with('\n') {
        next.push('\n');
    }
    next.push_str(&format!(
        "\n### Round {} · {} · {}\n\n{}\n",
        entry.round,
        entry.reviewer,
        entry.verdict,
        entry.note.trim()
    ));
    write_protected(&session.dir, GOAL_TRACKER_FILE, next.as_bytes())?;
    debug!(round = entry.round, reviewer = entry.reviewer, "tracker updated");
    Ok(true)
}

/// Byte offset just past the last summary table row.
fn summary_end(doc: &str) -> Option<usize> {
    let header_at = doc.find(SUMMARY_HEADER)?;
    let mut offset = header_at + SUMMARY_HEADER.len();
    for line in doc[offset..].split_inclusive('\n') {
        if !line.starts_with('|') {
            break;
        }
        offset += line.len();
    }
    Some(offset)
}

fn note_cell(note: &str) -> String {
    let flat = note
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('|', "\\|");
    if flat.chars().count() <= NOTE_CELL_LIMIT {
        return flat;
    }
    let mut cut: String = flat.chars().take(NOTE_CELL_LIMIT).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (tempfile::TempDir, SessionPaths) {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = SessionPaths::new(temp.path(), "2026-01-01_00-00-00");
        init_tracker(&session, "plan.md", "# Plan\n- ship it\n").expect("init");
        (temp, session)
    }

    #[test]
    fn repeated_update_is_idempotent() {
        let (_temp, session) = session();
        let entry = TrackerEntry {
            round: 2,
            reviewer: "codex",
            verdict: "issues",
            note: "[P1] handle | in names\nsecond line",
        };
        assert!(update_tracker(&session, &entry).expect("first"));
        assert!(!update_tracker(&session, &entry).expect("second"));

        let doc = fs::read_to_string(session.goal_tracker()).expect("read");
        assert_eq!(doc.matches("| 2 | codex |").count(), 1);
        assert_eq!(doc.matches("### Round 2 · codex").count(), 1);
        assert!(doc.contains("| 2 | codex | issues | [P1] handle \\| in names second line |"));
    }

    #[test]
    fn rows_stay_in_summary_table() {
        let (_temp, session) = session();
        for (round, reviewer) in [(0, "a"), (0, "b"), (1, "a")] {
            let entry = TrackerEntry {
                round,
                reviewer,
                verdict: "approved",
                note: "ok",
            };
            update_tracker(&session, &entry).expect("update");
        }
        let doc = fs::read_to_string(session.goal_tracker()).expect("read");
        let summary = &doc[doc.find("## Summary").unwrap()..doc.find(LOG_HEADING).unwrap()];
        assert_eq!(summary.matches("| approved |").count(), 3);
        let log = &doc[doc.find(LOG_HEADING).unwrap()..];
        assert_eq!(log.matches("### Round").count(), 3);
    }

    #[test]
    fn init_does_not_overwrite() {
        let (_temp, session) = session();
        let entry = TrackerEntry {
            round: 0,
            reviewer: "codex",
            verdict: "approved",
            note: "",
        };
        update_tracker(&session, &entry).expect("update");
        init_tracker(&session, "plan.md", "other").expect("re-init");
        let doc = fs::read_to_string(session.goal_tracker()).expect("read");
        assert!(doc.contains("| 0 | codex |"));
    }

    #[test]
    fn long_notes_are_truncated_in_table_only() {
        let long = "x".repeat(300);
        assert_eq!(note_cell(&long).chars().count(), NOTE_CELL_LIMIT + 1);
    }
}
