//! Test-only fixtures: scripted reviewers and response sources, a synthetic
//! clock, and a throwaway git repository.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use crate::core::pool::ReviewerResponse;
use crate::io::responses::ResponseSource;
use crate::io::reviewer::{InvocationOutput, ReviewInvoker, ReviewRequest};
use crate::io::state_store::{CURRENT_SCHEMA_VERSION, ReviewerEffort, SessionState};
use crate::pool_loop::Clock;

/// A schema-valid state document for round 0 of an implementation phase.
pub fn sample_state() -> SessionState {
    SessionState {
        schema_version: CURRENT_SCHEMA_VERSION,
        current_round: 0,
        max_iterations: 10,
        review_started: false,
        base_ref: "main".to_string(),
        start_branch: "main".to_string(),
        plan_file: "plan.md".to_string(),
        plan_mutable: false,
        plan_tracked: true,
        started_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        reviewer_model: "gpt-5.1-codex".to_string(),
        reviewer_effort: ReviewerEffort::High,
        timeout_secs: 600,
        audit_interval: 5,
        publish_every_round: false,
        pool: None,
    }
}

/// Fixed instant used as "trigger time" in pool tests.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
}

pub fn response(reviewer: &str, at: DateTime<Utc>, body: &str) -> ReviewerResponse {
    ReviewerResponse {
        reviewer: reviewer.to_string(),
        at,
        body: body.to_string(),
    }
}

/// A git repository in a temp dir with one initial commit on `main`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo = Self { dir };
        repo.git(&["init", "-q", "-b", "main"]);
        repo.git(&["config", "user.email", "test@example.com"]);
        repo.git(&["config", "user.name", "Test"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        repo.write("README.md", "# test\n");
        repo.commit_all("initial");
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn branch(&self) -> String {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .trim()
            .to_string()
    }

    pub fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        fs::write(&path, contents).expect("write file");
        path
    }

    pub fn commit_all(&self, message: &str) {
        self.git(&["add", "-A"]);
        self.git(&["commit", "-q", "--allow-empty", "-m", message]);
    }

    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// One scripted reviewer invocation.
#[derive(Debug, Clone)]
pub struct ScriptedStep {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    /// Bytes the output cap dropped from stdout.
    pub stdout_truncated: usize,
    /// Written to the request's result path before returning.
    pub result: Option<String>,
}

/// Reviewer that replays predetermined invocations in order.
pub struct ScriptedReviewer {
    steps: RefCell<VecDeque<ScriptedStep>>,
    requests: RefCell<Vec<ReviewRequest>>,
}

impl ScriptedReviewer {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: RefCell::new(steps.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    /// Successful invocation that only prints to stdout.
    pub fn stdout(text: &str) -> ScriptedStep {
        ScriptedStep {
            exit_code: Some(0),
            timed_out: false,
            stdout: text.to_string(),
            stderr: String::new(),
            stdout_truncated: 0,
            result: None,
        }
    }

    /// Successful invocation that writes the result artifact.
    pub fn result(text: &str) -> ScriptedStep {
        ScriptedStep {
            result: Some(text.to_string()),
            ..Self::stdout("")
        }
    }

    pub fn requests(&self) -> Vec<ReviewRequest> {
        self.requests.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.steps.borrow().len()
    }
}

impl ReviewInvoker for ScriptedReviewer {
    fn invoke(&self, request: &ReviewRequest) -> Result<InvocationOutput> {
        self.requests.borrow_mut().push(request.clone());
        let step = self
            .steps
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted reviewer has no steps left"))?;
        if let Some(result) = &step.result {
            if let Some(parent) = request.artifacts.result_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&request.artifacts.result_path, result)?;
        }
        Ok(InvocationOutput {
            command: "scripted-reviewer".to_string(),
            exit_code: step.exit_code,
            timed_out: step.timed_out,
            stdout: step.stdout,
            stderr: step.stderr,
            stdout_truncated: step.stdout_truncated,
            stderr_truncated: 0,
        })
    }
}

/// Response source that returns one scripted batch per fetch.
///
/// Once the script runs out every fetch returns no responses.
pub struct ScriptedResponseSource {
    batches: RefCell<VecDeque<Result<Vec<ReviewerResponse>, String>>>,
    fetches: Cell<u32>,
}

impl ScriptedResponseSource {
    pub fn new(batches: Vec<Vec<ReviewerResponse>>) -> Self {
        Self::with_results(batches.into_iter().map(Ok).collect())
    }

    pub fn with_results(batches: Vec<Result<Vec<ReviewerResponse>, String>>) -> Self {
        Self {
            batches: RefCell::new(batches.into()),
            fetches: Cell::new(0),
        }
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.get()
    }
}

impl ResponseSource for ScriptedResponseSource {
    fn fetch(&self, since: DateTime<Utc>) -> Result<Vec<ReviewerResponse>> {
        self.fetches.set(self.fetches.get() + 1);
        match self.batches.borrow_mut().pop_front() {
            Some(Ok(batch)) => Ok(batch.into_iter().filter(|r| r.at >= since).collect()),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(Vec::new()),
        }
    }
}

/// Clock whose `sleep` advances time instantly.
pub struct FakeClock {
    now: Cell<DateTime<Utc>>,
    sleeps: Cell<u32>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Cell::new(start),
            sleeps: Cell::new(0),
        }
    }

    pub fn sleeps(&self) -> u32 {
        self.sleeps.get()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.set(self.sleeps.get() + 1);
        let step = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        self.now.set(self.now.get() + step);
    }
}
