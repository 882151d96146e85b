//! External reviewer invocation.
//!
//! The [`ReviewInvoker`] trait decouples the controller from the reviewer
//! backend (a `codex`-style CLI by default). Tests use scripted invokers that
//! return predetermined output without spawning processes.
//!
//! [`invoke_and_collect`] owns the failure policy shared by every backend:
//! debug artifacts are always written, and timeouts, non-zero exits and
//! missing or empty results all come back as [`Collected::Failed`].

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::types::ReviewShape;
use crate::io::process::{describe_command, run_command_with_timeout};
use crate::io::session::SessionPaths;
use crate::io::state_store::ReviewerEffort;

/// Where one invocation's artifacts go.
#[derive(Debug, Clone)]
pub struct ReviewArtifacts {
    pub result_path: PathBuf,
    pub log_path: PathBuf,
    pub cmd_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl ReviewArtifacts {
    pub fn for_round(session: &SessionPaths, round: u32) -> Self {
        Self {
            result_path: session.review_result(round),
            log_path: session.review_log(round),
            cmd_path: session.review_cmd(round),
            stdout_path: session.review_stdout(round),
            stderr_path: session.review_stderr(round),
        }
    }
}

/// Parameters for a reviewer invocation.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub workdir: PathBuf,
    pub shape: ReviewShape,
    /// Prompt text piped on stdin (prompt form only).
    pub prompt: Option<String>,
    /// Base reference the change set is compared against (diff form only).
    pub base_ref: String,
    pub model: String,
    pub effort: ReviewerEffort,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub artifacts: ReviewArtifacts,
}

/// Raw result of running the reviewer.
#[derive(Debug, Clone, Default)]
pub struct InvocationOutput {
    /// Rendered command line for the debug artifact.
    pub command: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    /// Bytes dropped past the output cap.
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
}

impl InvocationOutput {
    fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    fn truncated(&self) -> bool {
        self.stdout_truncated > 0 || self.stderr_truncated > 0
    }
}

/// What the controller gets back from one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Collected {
    /// Result artifact (prompt form) or combined log (diff form) content.
    Output(String),
    Failed(String),
}

/// Abstraction over reviewer backends.
pub trait ReviewInvoker {
    /// Run the reviewer. `Err` means it could not be started at all.
    fn invoke(&self, request: &ReviewRequest) -> Result<InvocationOutput>;
}

impl<I: ReviewInvoker + ?Sized> ReviewInvoker for &I {
    fn invoke(&self, request: &ReviewRequest) -> Result<InvocationOutput> {
        (**self).invoke(request)
    }
}

/// Reviewer that spawns an external CLI.
#[derive(Debug, Clone)]
pub struct CommandReviewer {
    program: String,
}

impl CommandReviewer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn command(&self, request: &ReviewRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(build_command_args(request))
            .current_dir(&request.workdir);
        cmd
    }
}

/// Reviewer CLI arguments for either invocation shape.
pub fn build_command_args(request: &ReviewRequest) -> Vec<String> {
    let effort = format!("model_reasoning_effort={}", request.effort.as_str());
    match request.shape {
        ReviewShape::Prompt => vec![
            "exec".to_string(),
            "-m".to_string(),
            request.model.clone(),
            "-c".to_string(),
            effort,
            "-C".to_string(),
            request.workdir.display().to_string(),
            "--full-auto".to_string(),
            "--output-last-message".to_string(),
            request.artifacts.result_path.display().to_string(),
            "-".to_string(),
        ],
        ReviewShape::Diff => vec![
            "review".to_string(),
            "--base".to_string(),
            request.base_ref.clone(),
            "-m".to_string(),
            request.model.clone(),
            "-c".to_string(),
            effort,
        ],
    }
}

impl ReviewInvoker for CommandReviewer {
    #[instrument(skip_all, fields(program = %self.program, shape = ?request.shape, timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &ReviewRequest) -> Result<InvocationOutput> {
        let cmd = self.command(request);
        let command = describe_command(&cmd);
        info!(command = %command, "starting reviewer");
        let stdin = match request.shape {
            ReviewShape::Prompt => request.prompt.as_deref().map(str::as_bytes),
            ReviewShape::Diff => None,
        };
        let output = run_command_with_timeout(cmd, stdin, request.timeout, request.output_limit_bytes)
            .with_context(|| format!("run reviewer {}", self.program))?;
        Ok(InvocationOutput {
            command,
            exit_code: output.status.code(),
            timed_out: output.timed_out,
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            stdout_truncated: output.stdout_truncated,
            stderr_truncated: output.stderr_truncated,
        })
    }
}

/// Run the reviewer, persist debug artifacts, and collect its verdict text.
#[instrument(skip_all, fields(shape = ?request.shape, result = %request.artifacts.result_path.display()))]
pub fn invoke_and_collect<I: ReviewInvoker + ?Sized>(
    invoker: &I,
    request: &ReviewRequest,
) -> Result<Collected> {
    let artifacts = &request.artifacts;
    for stale in [&artifacts.result_path, &artifacts.log_path] {
        if stale.exists() {
            fs::remove_file(stale).with_context(|| format!("remove {}", stale.display()))?;
        }
    }

    let output = match invoker.invoke(request) {
        Ok(output) => output,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "reviewer could not be started");
            write_text(&artifacts.stderr_path, &format!("{err:#}\n"))?;
            return Ok(Collected::Failed(format!(
                "the reviewer could not be started: {err:#}"
            )));
        }
    };

    write_text(&artifacts.cmd_path, &format!("{}\n", output.command))?;
    write_text(&artifacts.stdout_path, &output.stdout)?;
    write_text(&artifacts.stderr_path, &output.stderr)?;

    if output.timed_out {
        warn!(timeout_secs = request.timeout.as_secs(), "reviewer timed out");
        return Ok(Collected::Failed(format!(
            "the reviewer timed out after {}s and was killed (command in {})",
            request.timeout.as_secs(),
            artifacts.cmd_path.display()
        )));
    }
    if !output.succeeded() {
        warn!(exit_code = ?output.exit_code, "reviewer failed");
        return Ok(Collected::Failed(format!(
            "the reviewer exited with status {} (stderr in {})",
            output
                .exit_code
                .map_or_else(|| "unknown".to_string(), |code| code.to_string()),
            artifacts.stderr_path.display()
        )));
    }

    match request.shape {
        ReviewShape::Prompt => collect_result(request, &output),
        ReviewShape::Diff => collect_log(request, &output),
    }
}

fn collect_result(request: &ReviewRequest, output: &InvocationOutput) -> Result<Collected> {
    let path = &request.artifacts.result_path;
    let existing = if path.exists() {
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
    } else {
        String::new()
    };
    if existing.trim().is_empty() && !output.stdout.trim().is_empty() {
        if output.stdout_truncated > 0 {
            return Ok(truncated_failure(request, output));
        }
        debug!("result artifact missing, recovering from stdout");
        write_text(path, &output.stdout)?;
    }
    if !path.exists() {
        return Ok(Collected::Failed(format!(
            "the reviewer did not produce {}",
            path.display()
        )));
    }
    let result = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    if result.trim().is_empty() {
        return Ok(Collected::Failed(format!(
            "the reviewer produced an empty {}",
            path.display()
        )));
    }
    Ok(Collected::Output(result))
}

fn collect_log(request: &ReviewRequest, output: &InvocationOutput) -> Result<Collected> {
    if output.truncated() {
        return Ok(truncated_failure(request, output));
    }
    let mut log = output.stdout.clone();
    if !output.stderr.is_empty() {
        if !log.is_empty() && !log.ends_with('\n') {
            log.push('\n');
        }
        log.push_str(&output.stderr);
    }
    let path = &request.artifacts.log_path;
    write_text(path, &log)?;
    if log.trim().is_empty() {
        return Ok(Collected::Failed(format!(
            "the reviewer produced an empty log {}",
            path.display()
        )));
    }
    Ok(Collected::Output(log))
}

/// A capped stream may have lost findings, so it is never classified.
fn truncated_failure(request: &ReviewRequest, output: &InvocationOutput) -> Collected {
    warn!(
        stdout_truncated = output.stdout_truncated,
        stderr_truncated = output.stderr_truncated,
        "reviewer output exceeded the cap"
    );
    Collected::Failed(format!(
        "the reviewer output exceeded {} bytes and was truncated (raise output_limit_bytes; stdout in {})",
        request.output_limit_bytes,
        request.artifacts.stdout_path.display()
    ))
}

fn write_text(path: &std::path::Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
