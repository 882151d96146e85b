//! Git adapter for guard checks and session setup.
//!
//! Every call runs through [`run_command_with_timeout`]. A git invocation that
//! fails, times out, or prints something unparseable is an error; guard checks
//! turn such errors into blocks, so a broken repository never reads as clean.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::{CommandOutput, run_command_with_timeout};

const GIT_OUTPUT_LIMIT: usize = 4 * 1024 * 1024;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Resolve a revision to its full SHA.
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--verify", rev])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Status entries outside the given path prefixes.
    #[instrument(skip_all)]
    pub fn dirty_entries_except(&self, allowed_prefixes: &[&str]) -> Result<Vec<StatusEntry>> {
        let entries = self.status_porcelain()?;
        let dirty: Vec<StatusEntry> = entries
            .into_iter()
            .filter(|entry| {
                !allowed_prefixes
                    .iter()
                    .any(|prefix| entry.path.starts_with(prefix))
            })
            .collect();
        debug!(dirty_count = dirty.len(), "worktree status");
        Ok(dirty)
    }

    /// True if git tracks `path` (relative to the workdir).
    pub fn is_tracked(&self, path: &str) -> Result<bool> {
        let out = self.run(&["ls-files", "--error-unmatch", "--", path])?;
        if out.timed_out {
            return Err(anyhow!("git ls-files timed out"));
        }
        Ok(out.status.success())
    }

    /// Paths changed since `base`: committed, staged, unstaged, and untracked.
    #[instrument(skip_all, fields(base))]
    pub fn changed_paths_since(&self, base: &str) -> Result<Vec<String>> {
        let diff = self.run_capture(&["diff", "--name-only", base])?;
        let untracked = self.run_capture(&["ls-files", "--others", "--exclude-standard"])?;
        let mut paths: Vec<String> = diff
            .lines()
            .chain(untracked.lines())
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    /// Commits on HEAD not yet on its upstream; `None` without an upstream.
    pub fn upstream_ahead_count(&self) -> Result<Option<u32>> {
        let upstream = self.run(&["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"])?;
        if upstream.timed_out {
            return Err(anyhow!("git rev-parse @{{u}} timed out"));
        }
        if !upstream.status.success() {
            return Ok(None);
        }
        let out = self.run_capture(&["rev-list", "--count", "@{u}..HEAD"])?;
        let count = out
            .trim()
            .parse::<u32>()
            .map_err(|e| anyhow!("unexpected rev-list output '{}': {e}", out.trim()))?;
        Ok(Some(count))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(output.stdout_lossy())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if output.timed_out {
            return Err(anyhow!(
                "git {} timed out after {}s",
                args.join(" "),
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr_lossy().trim()
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_command_with_timeout(cmd, None, self.timeout, GIT_OUTPUT_LIMIT)
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
