//! Ordered exit-attempt guard chain.
//!
//! Checks run in a fixed order and short-circuit on the first failure. Every
//! check fails closed: an inspection error (git timeout, unreadable file)
//! becomes a block, never a pass.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::types::{GuardDecision, GuardFailure, Phase};
use crate::io::config::LoopgateConfig;
use crate::io::git::Git;
use crate::io::session::{LOOPGATE_DIR, SessionPaths};
use crate::io::state_store::{LoadedState, StateStore};
use crate::io::transcript::find_outstanding;

/// Everything a guard check may inspect.
pub struct GuardContext<'a> {
    pub session: &'a SessionPaths,
    pub store: &'a dyn StateStore,
    pub loaded: &'a LoadedState,
    pub git: &'a Git,
    pub config: &'a LoopgateConfig,
    pub transcript: Option<&'a Path>,
}

/// A named precondition on exit attempts.
pub trait GuardCheck {
    fn name(&self) -> &'static str;

    /// `Err` means the check could not decide; the chain treats it as a block.
    fn check(&self, ctx: &GuardContext<'_>) -> Result<GuardDecision>;
}

/// Run `checks` in order, returning the first failure.
#[instrument(skip_all, fields(checks = checks.len()))]
pub fn evaluate(checks: &[Box<dyn GuardCheck>], ctx: &GuardContext<'_>) -> GuardDecision {
    for check in checks {
        let decision = match check.check(ctx) {
            Ok(decision) => decision,
            Err(err) => GuardDecision::Block(GuardFailure::blocking(
                check.name(),
                format!("could not be verified: {err:#}"),
                "Resolve the inspection error above, then attempt the exit again.",
            )),
        };
        match decision {
            GuardDecision::Pass => debug!(check = check.name(), "guard passed"),
            GuardDecision::Block(failure) => {
                warn!(check = check.name(), fatal = failure.fatal, reason = %failure.reason, "guard blocked");
                return GuardDecision::Block(failure);
            }
        }
    }
    GuardDecision::Pass
}

/// The standard chain, in its required order.
pub fn default_chain() -> Vec<Box<dyn GuardCheck>> {
    vec![
        Box::new(SchemaCheck),
        Box::new(BranchCheck),
        Box::new(PlanIntegrityCheck),
        Box::new(FileSizeCheck),
        Box::new(OutstandingTasksCheck),
        Box::new(CleanTreeCheck),
    ]
}

/// State document validity and protected-file integrity. Failures are fatal.
pub struct SchemaCheck;

impl GuardCheck for SchemaCheck {
    fn name(&self) -> &'static str {
        "state-schema"
    }

    fn check(&self, ctx: &GuardContext<'_>) -> Result<GuardDecision> {
        let mismatches = ctx.store.verify_integrity()?;
        if !mismatches.is_empty() {
            let detail = mismatches
                .iter()
                .map(|m| format!("{}: {}", m.file, m.detail))
                .collect::<Vec<_>>()
                .join("; ");
            return Ok(GuardDecision::Block(GuardFailure::fatal(
                self.name(),
                format!("controller-owned files were modified externally ({detail})"),
            )));
        }

        let state = &ctx.loaded.state;
        let mut problems = Vec::new();
        if state.current_round > state.max_iterations {
            problems.push(format!(
                "current_round {} exceeds max_iterations {}",
                state.current_round, state.max_iterations
            ));
        }
        if ctx.loaded.phase() == Phase::Finalize && !state.review_started {
            problems.push("finalize document without review_started".to_string());
        }
        if let Some(pool) = &state.pool
            && let Some(stray) = pool.active.iter().find(|name| !pool.configured.contains(name))
        {
            problems.push(format!("active reviewer '{stray}' is not configured"));
        }
        if problems.is_empty() {
            return Ok(GuardDecision::Pass);
        }
        Ok(GuardDecision::Block(GuardFailure::fatal(
            self.name(),
            problems.join("; "),
        )))
    }
}

/// The workspace must still be on the branch the session started on.
pub struct BranchCheck;

impl GuardCheck for BranchCheck {
    fn name(&self) -> &'static str {
        "branch-consistency"
    }

    fn check(&self, ctx: &GuardContext<'_>) -> Result<GuardDecision> {
        let expected = &ctx.loaded.state.start_branch;
        let current = ctx.git.current_branch().context("read current branch")?;
        if &current == expected {
            return Ok(GuardDecision::Pass);
        }
        Ok(GuardDecision::Block(GuardFailure::blocking(
            self.name(),
            format!("the session started on '{expected}' but the workspace is on '{current}'"),
            format!("Run `git checkout {expected}` and attempt the exit again."),
        )))
    }
}

/// The plan must match its start snapshot, or keep its tracking mode when mutable.
pub struct PlanIntegrityCheck;

impl GuardCheck for PlanIntegrityCheck {
    fn name(&self) -> &'static str {
        "plan-integrity"
    }

    fn check(&self, ctx: &GuardContext<'_>) -> Result<GuardDecision> {
        let state = &ctx.loaded.state;
        let plan_path = ctx.git.workdir().join(&state.plan_file);

        if state.plan_mutable {
            let tracked = ctx.git.is_tracked(&state.plan_file)?;
            if tracked == state.plan_tracked {
                return Ok(GuardDecision::Pass);
            }
            let (now, then, fix) = if state.plan_tracked {
                ("untracked", "tracked", format!("git add {}", state.plan_file))
            } else {
                ("tracked", "untracked", format!("git rm --cached {}", state.plan_file))
            };
            return Ok(GuardDecision::Block(GuardFailure::blocking(
                self.name(),
                format!(
                    "plan file {} is now {now} but was {then} when the session started",
                    state.plan_file
                ),
                format!("Run `{fix}` and commit, then attempt the exit again."),
            )));
        }

        let snapshot_path = ctx.session.plan_snapshot();
        let snapshot = fs::read(&snapshot_path)
            .with_context(|| format!("read plan snapshot {}", snapshot_path.display()))?;
        let restore = format!(
            "Restore it with `cp {} {}`, then attempt the exit again.",
            snapshot_path.display(),
            plan_path.display()
        );
        if !plan_path.exists() {
            return Ok(GuardDecision::Block(GuardFailure::blocking(
                self.name(),
                format!("plan file {} was deleted", state.plan_file),
                restore,
            )));
        }
        let current =
            fs::read(&plan_path).with_context(|| format!("read plan {}", plan_path.display()))?;
        if current == snapshot {
            return Ok(GuardDecision::Pass);
        }
        Ok(GuardDecision::Block(GuardFailure::blocking(
            self.name(),
            format!(
                "plan file {} differs from the snapshot taken at session start",
                state.plan_file
            ),
            restore,
        )))
    }
}

/// Changed source/doc files must stay under the line ceiling.
pub struct FileSizeCheck;

impl GuardCheck for FileSizeCheck {
    fn name(&self) -> &'static str {
        "file-size"
    }

    fn check(&self, ctx: &GuardContext<'_>) -> Result<GuardDecision> {
        let limit = ctx.config.max_file_lines;
        let changed = ctx
            .git
            .changed_paths_since(&ctx.loaded.state.base_ref)
            .context("list changed files")?;
        let mut oversized = Vec::new();
        for path in changed {
            if path.starts_with(LOOPGATE_DIR) || !ctx.config.is_size_checked(&path) {
                continue;
            }
            let full = ctx.git.workdir().join(&path);
            if !full.is_file() {
                continue;
            }
            let bytes = fs::read(&full).with_context(|| format!("read {}", full.display()))?;
            let lines = String::from_utf8_lossy(&bytes).lines().count();
            if lines > limit {
                oversized.push(format!("{path} ({lines} lines)"));
            }
        }
        if oversized.is_empty() {
            return Ok(GuardDecision::Pass);
        }
        Ok(GuardDecision::Block(GuardFailure::blocking(
            self.name(),
            format!(
                "files exceed the {limit}-line limit: {}",
                oversized.join(", ")
            ),
            "Split the listed files into smaller modules, commit, then attempt the exit again.",
        )))
    }
}

/// No unfinished todos or tasks in the producing agent's transcript.
pub struct OutstandingTasksCheck;

impl GuardCheck for OutstandingTasksCheck {
    fn name(&self) -> &'static str {
        "outstanding-tasks"
    }

    fn check(&self, ctx: &GuardContext<'_>) -> Result<GuardDecision> {
        let Some(transcript) = ctx.transcript else {
            return Ok(GuardDecision::Pass);
        };
        let items = find_outstanding(transcript)?;
        if items.is_empty() {
            return Ok(GuardDecision::Pass);
        }
        let listing = items
            .iter()
            .map(|item| item.render())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(GuardDecision::Block(GuardFailure::blocking(
            self.name(),
            format!("unfinished tasks remain:\n{listing}"),
            "Finish the listed tasks (or mark them completed), then attempt the exit again.",
        )))
    }
}

/// No uncommitted changes and, when configured, nothing left unpushed.
pub struct CleanTreeCheck;

impl GuardCheck for CleanTreeCheck {
    fn name(&self) -> &'static str {
        "clean-tree"
    }

    fn check(&self, ctx: &GuardContext<'_>) -> Result<GuardDecision> {
        let session_prefix = format!("{LOOPGATE_DIR}/");
        let dirty = ctx
            .git
            .dirty_entries_except(&[session_prefix.as_str()])
            .context("read worktree status")?;
        if !dirty.is_empty() {
            let listing = dirty
                .iter()
                .map(|e| format!("{} {}", e.code, e.path))
                .collect::<Vec<_>>()
                .join("\n");
            return Ok(GuardDecision::Block(GuardFailure::blocking(
                self.name(),
                format!("the working tree has uncommitted changes:\n{listing}"),
                "Commit your changes, then attempt the exit again.",
            )));
        }

        if !ctx.loaded.state.publish_every_round {
            return Ok(GuardDecision::Pass);
        }
        match ctx.git.upstream_ahead_count().context("compare with upstream")? {
            None => Ok(GuardDecision::Block(GuardFailure::blocking(
                self.name(),
                "the branch has no upstream but every round must be published",
                format!(
                    "Run `git push -u origin {}`, then attempt the exit again.",
                    ctx.loaded.state.start_branch
                ),
            ))),
            Some(0) => Ok(GuardDecision::Pass),
            Some(ahead) => Ok(GuardDecision::Block(GuardFailure::blocking(
                self.name(),
                format!("{ahead} commit(s) are not pushed but every round must be published"),
                "Run `git push`, then attempt the exit again.",
            ))),
        }
    }
}
