//! Sources of multi-reviewer responses.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::core::pool::ReviewerResponse;
use crate::io::process::run_command_with_timeout;

const GH_OUTPUT_LIMIT: usize = 8 * 1024 * 1024;

/// Fetches reviewer responses left since a point in time.
pub trait ResponseSource {
    fn fetch(&self, since: DateTime<Utc>) -> Result<Vec<ReviewerResponse>>;
}

impl<S: ResponseSource + ?Sized> ResponseSource for Box<S> {
    fn fetch(&self, since: DateTime<Utc>) -> Result<Vec<ReviewerResponse>> {
        (**self).fetch(since)
    }
}

impl<S: ResponseSource + ?Sized> ResponseSource for &S {
    fn fetch(&self, since: DateTime<Utc>) -> Result<Vec<ReviewerResponse>> {
        (**self).fetch(since)
    }
}

/// Reads `responses/*.json`, one [`ReviewerResponse`] per file.
#[derive(Debug, Clone)]
pub struct DirResponseSource {
    dir: PathBuf,
}

impl DirResponseSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ResponseSource for DirResponseSource {
    fn fetch(&self, since: DateTime<Utc>) -> Result<Vec<ReviewerResponse>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in
            fs::read_dir(&self.dir).with_context(|| format!("read {}", self.dir.display()))?
        {
            let path = entry
                .with_context(|| format!("read entry in {}", self.dir.display()))?
                .path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut responses = Vec::new();
        for path in paths {
            let raw =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            match serde_json::from_str::<ReviewerResponse>(&raw) {
                Ok(response) if response.at >= since => responses.push(response),
                Ok(_) => {}
                Err(err) => warn!(path = %path.display(), err = %err, "skipping malformed response"),
            }
        }
        debug!(count = responses.len(), "responses fetched from directory");
        Ok(responses)
    }
}

/// Pull request issue comments fetched with `gh api`.
#[derive(Debug, Clone)]
pub struct GhCommentSource {
    pub workdir: PathBuf,
    pub repo: String,
    pub pull_request: u64,
    /// Remote login → reviewer name; comments from other logins are ignored.
    pub logins: BTreeMap<String, String>,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct GhComment {
    user: GhUser,
    created_at: DateTime<Utc>,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
}

impl ResponseSource for GhCommentSource {
    #[instrument(skip_all, fields(repo = %self.repo, pull_request = self.pull_request))]
    fn fetch(&self, since: DateTime<Utc>) -> Result<Vec<ReviewerResponse>> {
        let endpoint = format!(
            "repos/{}/issues/{}/comments?since={}",
            self.repo,
            self.pull_request,
            since.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        );
        let mut cmd = Command::new("gh");
        cmd.args(["api", "--paginate", &endpoint])
            .current_dir(&self.workdir);
        let output = run_command_with_timeout(cmd, None, self.timeout, GH_OUTPUT_LIMIT)
            .context("run gh api")?;
        if output.timed_out {
            return Err(anyhow!("gh api timed out after {}s", self.timeout.as_secs()));
        }
        if !output.succeeded() {
            return Err(anyhow!("gh api failed: {}", output.stderr_lossy().trim()));
        }
        parse_gh_comments(&output.stdout_lossy(), &self.logins, since)
    }
}

/// Parse (possibly paginated, concatenated) comment arrays.
pub fn parse_gh_comments(
    raw: &str,
    logins: &BTreeMap<String, String>,
    since: DateTime<Utc>,
) -> Result<Vec<ReviewerResponse>> {
    let mut responses = Vec::new();
    for page in serde_json::Deserializer::from_str(raw).into_iter::<Vec<GhComment>>() {
        let page = page.context("parse gh api comments")?;
        for comment in page {
            let Some(reviewer) = logins.get(&comment.user.login) else {
                continue;
            };
            if comment.created_at < since {
                continue;
            }
            responses.push(ReviewerResponse {
                reviewer: reviewer.clone(),
                at: comment.created_at,
                body: comment.body,
            });
        }
    }
    Ok(responses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn directory_source_filters_by_time_and_skips_garbage() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("responses");
        fs::create_dir_all(&dir).expect("mkdir");
        for (name, response) in [
            ("1.json", ReviewerResponse { reviewer: "a".into(), at: t(-10), body: "old".into() }),
            ("2.json", ReviewerResponse { reviewer: "a".into(), at: t(10), body: "new".into() }),
        ] {
            fs::write(dir.join(name), serde_json::to_string(&response).unwrap()).expect("write");
        }
        fs::write(dir.join("3.json"), "{broken").expect("write");
        fs::write(dir.join("notes.txt"), "ignored").expect("write");

        let responses = DirResponseSource::new(&dir).fetch(t(0)).expect("fetch");
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].body, "new");
    }

    #[test]
    fn missing_directory_has_no_responses() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = DirResponseSource::new(temp.path().join("absent"));
        assert!(source.fetch(t(0)).expect("fetch").is_empty());
    }

    #[test]
    fn gh_comments_map_logins_across_pages() {
        let logins = BTreeMap::from([
            ("codex-bot".to_string(), "codex".to_string()),
            ("claude-bot".to_string(), "claude".to_string()),
        ]);
        let raw = r#"[
  {"user": {"login": "codex-bot"}, "created_at": "2023-11-14T22:13:30Z", "body": "[P1] bug"},
  {"user": {"login": "someone"}, "created_at": "2023-11-14T22:13:40Z", "body": "drive-by"}
][
  {"user": {"login": "claude-bot"}, "created_at": "2023-11-14T22:14:00Z", "body": "LGTM"},
  {"user": {"login": "claude-bot"}, "created_at": "2023-11-14T22:00:00Z", "body": "stale"}
]"#;
        let responses = parse_gh_comments(raw, &logins, t(0)).expect("parse");
        let summary: Vec<_> = responses
            .iter()
            .map(|r| (r.reviewer.as_str(), r.body.as_str()))
            .collect();
        assert_eq!(summary, vec![("codex", "[P1] bug"), ("claude", "LGTM")]);
    }

    #[test]
    fn malformed_gh_output_is_an_error() {
        assert!(parse_gh_comments("not json", &BTreeMap::new(), t(0)).is_err());
    }
}
