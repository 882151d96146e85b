//! Deterministic classification of reviewer output.
//!
//! Two strategies, matching the two invocation shapes:
//!
//! - Prompt-driven results end with a keyword line (`COMPLETE` or `STOP`), or
//!   carry line-leading severity markers.
//! - Diff-driven combined logs are scanned for the first line whose leading
//!   window holds a severity marker such as `[P1]`. Everything from that line
//!   onward is the actionable issue content.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{ReviewShape, ReviewVerdict};

/// Last-line keyword meaning the reviewer approves the work.
pub const COMPLETE_KEYWORD: &str = "COMPLETE";
/// Last-line keyword meaning the reviewer detected stagnation.
pub const STOP_KEYWORD: &str = "STOP";
/// Only markers inside the first characters of a line count.
pub const MARKER_WINDOW: usize = 10;

static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[P[0-9]\]").expect("severity marker regex"));

/// Classify reviewer output according to its invocation shape.
pub fn classify(shape: ReviewShape, output: &str) -> ReviewVerdict {
    match shape {
        ReviewShape::Prompt => classify_result(output),
        ReviewShape::Diff => classify_log(output),
    }
}

/// Classify a prompt-driven result artifact.
///
/// Output with neither a keyword nor a marker is ambiguous and reported as an
/// invocation failure.
pub fn classify_result(result: &str) -> ReviewVerdict {
    let Some(last) = last_non_blank_line(result) else {
        return ReviewVerdict::InvocationFailed("review result is empty".to_string());
    };
    match last {
        COMPLETE_KEYWORD => return ReviewVerdict::Approved,
        STOP_KEYWORD => return ReviewVerdict::Stagnation,
        _ => {}
    }
    if find_marker_line(result).is_some() {
        return ReviewVerdict::IssuesFound(result.trim().to_string());
    }
    ReviewVerdict::InvocationFailed(format!(
        "review result ends with neither {COMPLETE_KEYWORD} nor {STOP_KEYWORD} and lists no [P#] issues"
    ))
}

/// Classify a diff-driven combined log.
pub fn classify_log(log: &str) -> ReviewVerdict {
    if log.trim().is_empty() {
        return ReviewVerdict::InvocationFailed("review log is empty".to_string());
    }
    match extract_issues(log) {
        Some(issues) => ReviewVerdict::IssuesFound(issues.to_string()),
        None => ReviewVerdict::Approved,
    }
}

/// Return everything from the first marker line to the end of the log.
pub fn extract_issues(log: &str) -> Option<&str> {
    let index = find_marker_line(log)?;
    let offset = line_offset(log, index);
    Some(log[offset..].trim_end())
}

/// Index of the first line carrying a line-leading severity marker.
pub fn find_marker_line(text: &str) -> Option<usize> {
    text.lines().position(has_leading_marker)
}

/// True when the first [`MARKER_WINDOW`] characters of `line` contain a marker.
pub fn has_leading_marker(line: &str) -> bool {
    let window: String = line.chars().take(MARKER_WINDOW).collect();
    MARKER_RE.is_match(&window)
}

/// Trimmed last line that is not blank.
pub fn last_non_blank_line(text: &str) -> Option<&str> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
}

fn line_offset(text: &str, index: usize) -> usize {
    text.split_inclusive('\n')
        .take(index)
        .map(str::len)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_keyword_on_last_line_approves() {
        let result = "Looked at everything.\n\nCOMPLETE\n\n";
        assert_eq!(classify_result(result), ReviewVerdict::Approved);
    }

    #[test]
    fn stop_keyword_signals_stagnation() {
        let result = "The last three rounds changed nothing.\n  STOP  \n";
        assert_eq!(classify_result(result), ReviewVerdict::Stagnation);
    }

    #[test]
    fn keyword_must_be_the_whole_line() {
        let result = "- [P2] tests missing\nNot COMPLETE yet\n";
        assert_eq!(
            classify_result(result),
            ReviewVerdict::IssuesFound(result.trim().to_string())
        );
    }

    #[test]
    fn ambiguous_result_is_an_invocation_failure() {
        let verdict = classify_result("Looks mostly fine, a few nits.\n");
        assert!(matches!(verdict, ReviewVerdict::InvocationFailed(_)));
    }

    #[test]
    fn blank_result_is_an_invocation_failure() {
        assert!(matches!(
            classify_result("\n  \n"),
            ReviewVerdict::InvocationFailed(_)
        ));
    }

    #[test]
    fn log_extracts_from_first_leading_marker() {
        let mut lines: Vec<String> = (1..=60).map(|i| format!("context line {i}")).collect();
        lines[4] = "[P1] fix X".to_string();
        lines[49] = "As noted in the summary, the [P2] item is handled elsewhere.".to_string();
        let log = lines.join("\n");

        let ReviewVerdict::IssuesFound(issues) = classify_log(&log) else {
            panic!("expected issues");
        };
        assert!(issues.starts_with("[P1] fix X"));
        assert!(issues.ends_with("context line 60"));
    }

    #[test]
    fn prose_markers_do_not_count() {
        let log = "Reviewing diff against main\nThe earlier [P2] comment was addressed.\nNo findings.\n";
        assert_eq!(classify_log(log), ReviewVerdict::Approved);
    }

    #[test]
    fn bulleted_marker_inside_window_counts() {
        let log = "header\n  - [P0] data loss on retry\n    details\n";
        assert_eq!(
            classify_log(log),
            ReviewVerdict::IssuesFound("  - [P0] data loss on retry\n    details".to_string())
        );
    }

    #[test]
    fn empty_log_is_an_invocation_failure() {
        assert!(matches!(
            classify_log("   \n"),
            ReviewVerdict::InvocationFailed(_)
        ));
    }

    #[test]
    fn marker_window_counts_characters_not_bytes() {
        assert!(has_leading_marker("ééé [P3] x"));
        assert!(!has_leading_marker("ééééééé [P3] x"));
    }
}
