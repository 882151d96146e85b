//! Orchestration for starting a new session.
//!
//! A session is bootstrapped in the setup phase: the plan is snapshotted, the
//! goal tracker and round-0 prompt are written, and only then is the setup
//! document renamed to the active one. A crash part-way leaves a setup
//! document behind, which exit attempts refuse to review.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::controller::write_round_prompt;
use crate::core::types::{Phase, StateDoc};
use crate::io::config::LoopgateConfig;
use crate::io::git::Git;
use crate::io::goal_tracker::init_tracker;
use crate::io::integrity::write_protected;
use crate::io::prompt::PromptEngine;
use crate::io::session::{LOOPGATE_DIR, SessionPaths, find_active_session, session_id};
use crate::io::state_store::{
    CURRENT_SCHEMA_VERSION, FsStateStore, ReviewerEffort, SessionPool, SessionState, StateStore,
    parse_state_document,
};

/// Per-session choices; unset values come from `[defaults]` in the config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    pub plan_file: String,
    pub base_ref: Option<String>,
    pub max_iterations: Option<u32>,
    pub plan_mutable: bool,
    pub reviewer_model: Option<String>,
    pub reviewer_effort: Option<String>,
    pub publish_every_round: bool,
    /// Non-empty for a multi-reviewer session.
    pub reviewers: Vec<String>,
}

/// Outcome of `loopgate start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub session: SessionPaths,
    pub prompt_path: PathBuf,
}

/// Start a session rooted at `base` (the repository working directory).
#[instrument(skip_all, fields(base = %base.display(), plan = %options.plan_file))]
pub fn start_session(
    base: &Path,
    config: &LoopgateConfig,
    options: &StartOptions,
    now: DateTime<Utc>,
) -> Result<StartOutcome> {
    if let Some(active) = find_active_session(base)? {
        return Err(anyhow!(
            "session {} is still active; finish it or run `loopgate cancel` first",
            active.id
        ));
    }

    let git = Git::new(base, config.git_timeout());
    let start_branch = git.current_branch()?;
    let base_ref = match &options.base_ref {
        Some(base_ref) => base_ref.clone(),
        None => git.rev_parse("HEAD")?,
    };

    let plan_file = normalize_plan_path(base, &options.plan_file)?;
    let plan_path = base.join(&plan_file);
    let plan = fs::read(&plan_path).with_context(|| format!("read plan {}", plan_path.display()))?;
    let plan_tracked = git.is_tracked(&plan_file)?;

    let reviewer_effort = match &options.reviewer_effort {
        Some(raw) => ReviewerEffort::parse(raw)
            .ok_or_else(|| anyhow!("invalid reviewer effort '{raw}' (low, medium, high, xhigh)"))?,
        None => config.defaults.reviewer_effort,
    };
    let state = SessionState {
        schema_version: CURRENT_SCHEMA_VERSION,
        current_round: 0,
        max_iterations: options
            .max_iterations
            .unwrap_or(config.defaults.max_iterations),
        review_started: false,
        base_ref,
        start_branch,
        plan_file: plan_file.clone(),
        plan_mutable: options.plan_mutable,
        plan_tracked,
        started_at: now,
        reviewer_model: options
            .reviewer_model
            .clone()
            .unwrap_or_else(|| config.defaults.reviewer_model.clone()),
        reviewer_effort,
        timeout_secs: config.defaults.timeout_secs,
        audit_interval: config.defaults.audit_interval,
        publish_every_round: options.publish_every_round || config.defaults.publish_every_round,
        pool: pool_for(config, &options.reviewers),
    };
    // Refuse to create a session the exit path would reject as corrupt.
    parse_state_document(StateDoc::Setup, &state.to_json()?)?;

    ensure_loopgate_gitignore(&base.join(LOOPGATE_DIR).join(".gitignore"))?;
    let session = SessionPaths::new(base, session_id(now));
    if session.dir.exists() {
        return Err(anyhow!("session directory {} already exists", session.dir.display()));
    }
    fs::create_dir_all(&session.dir)
        .with_context(|| format!("create {}", session.dir.display()))?;

    let store = FsStateStore::new(session.clone());
    store.create(StateDoc::Setup, &state)?;
    write_protected(&session.dir, "plan.snapshot", &plan)?;
    init_tracker(&session, &plan_file, &String::from_utf8_lossy(&plan))?;
    let prompt_path = write_round_prompt(
        &session,
        &PromptEngine::new(),
        base,
        &state,
        0,
        Phase::Implementation,
        None,
    )?;
    store.transition(StateDoc::Setup, StateDoc::Active)?;

    info!(session = %session.id, branch = %state.start_branch, base_ref = %state.base_ref, "session started");
    Ok(StartOutcome {
        session,
        prompt_path,
    })
}

fn pool_for(config: &LoopgateConfig, reviewers: &[String]) -> Option<SessionPool> {
    let names: BTreeSet<String> = reviewers
        .iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    if names.is_empty() {
        return None;
    }
    let names: Vec<String> = names.into_iter().collect();
    Some(SessionPool {
        configured: names.clone(),
        active: names,
        trigger_at: None,
        reviewer_timeout_secs: config.pool.reviewer_timeout_secs,
        reviewer_timeouts: Default::default(),
    })
}

/// Plan path relative to `base`, rejecting paths that escape it.
fn normalize_plan_path(base: &Path, raw: &str) -> Result<String> {
    let path = Path::new(raw);
    let relative = if path.is_absolute() {
        path.strip_prefix(base)
            .with_context(|| format!("plan {raw} is outside {}", base.display()))?
    } else {
        path
    };
    if relative
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(anyhow!("plan path {raw} must not contain '..'"));
    }
    let normalized = relative.to_string_lossy().replace('\\', "/");
    if normalized.starts_with(&format!("{LOOPGATE_DIR}/")) {
        return Err(anyhow!("the plan must not live inside {LOOPGATE_DIR}/"));
    }
    Ok(normalized)
}

/// Session files never show up in `git status`.
fn ensure_loopgate_gitignore(path: &Path) -> Result<()> {
    const CONTENTS: &str = "*\n";
    if path.exists() {
        let existing =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        if existing.lines().any(|line| line.trim() == "*") {
            return Ok(());
        }
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    debug!(path = %path.display(), "writing gitignore");
    fs::write(path, CONTENTS).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::io::state_store::StateError;
    use crate::test_support::TestRepo;

    fn options(plan: &str) -> StartOptions {
        StartOptions {
            plan_file: plan.to_string(),
            ..StartOptions::default()
        }
    }

    fn at(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, second).unwrap()
    }

    #[test]
    fn start_writes_round_zero_and_activates() {
        let repo = TestRepo::new();
        repo.write("plan.md", "# Plan\n- one\n");
        repo.commit_all("plan");

        let outcome =
            start_session(repo.path(), &LoopgateConfig::default(), &options("plan.md"), at(0))
                .expect("start");
        let session = &outcome.session;
        assert_eq!(session.id, "2026-03-04_05-06-00");
        assert_eq!(outcome.prompt_path, session.round_prompt(0));
        assert!(session.goal_tracker().exists());
        assert_eq!(fs::read(session.plan_snapshot()).expect("snapshot"), b"# Plan\n- one\n");

        let loaded = FsStateStore::new(session.clone()).load().expect("load");
        assert_eq!(loaded.doc, StateDoc::Active);
        assert_eq!(loaded.state.current_round, 0);
        assert_eq!(loaded.state.start_branch, "main");
        assert!(loaded.state.plan_tracked);
        assert_eq!(loaded.state.base_ref.len(), 40);
        assert!(loaded.state.pool.is_none());

        // Session files stay out of the working tree status.
        assert!(repo.git(&["status", "--porcelain"]).trim().is_empty());
    }

    #[test]
    fn second_start_is_refused_while_active() {
        let repo = TestRepo::new();
        repo.write("plan.md", "# Plan\n");
        repo.commit_all("plan");
        let config = LoopgateConfig::default();
        start_session(repo.path(), &config, &options("plan.md"), at(0)).expect("start");
        let err = start_session(repo.path(), &config, &options("plan.md"), at(1))
            .expect_err("second start");
        assert!(err.to_string().contains("still active"));
    }

    #[test]
    fn reviewers_create_a_pool() {
        let repo = TestRepo::new();
        repo.write("plan.md", "# Plan\n");
        let mut opts = options("plan.md");
        opts.reviewers = vec!["claude".to_string(), "codex".to_string(), "claude".to_string()];
        let outcome =
            start_session(repo.path(), &LoopgateConfig::default(), &opts, at(0)).expect("start");
        let loaded = FsStateStore::new(outcome.session).load().expect("load");
        assert!(!loaded.state.plan_tracked);
        let pool = loaded.state.pool.expect("pool");
        assert_eq!(pool.configured, vec!["claude", "codex"]);
        assert_eq!(pool.active, pool.configured);
        assert_eq!(pool.reviewer_timeout_secs, 900);
    }

    #[test]
    fn invalid_model_is_rejected_before_anything_is_written() {
        let repo = TestRepo::new();
        repo.write("plan.md", "# Plan\n");
        let mut opts = options("plan.md");
        opts.reviewer_model = Some("gpt 5; rm -rf".to_string());
        let err = start_session(repo.path(), &LoopgateConfig::default(), &opts, at(0))
            .expect_err("invalid model");
        assert!(matches!(
            err.downcast_ref::<StateError>(),
            Some(StateError::Corrupt { .. })
        ));
        assert!(!repo.path().join(LOOPGATE_DIR).exists());
    }

    #[test]
    fn plan_paths_must_stay_inside_the_workspace() {
        let base = Path::new("/work/repo");
        assert_eq!(normalize_plan_path(base, "docs/plan.md").unwrap(), "docs/plan.md");
        assert_eq!(
            normalize_plan_path(base, "/work/repo/docs/plan.md").unwrap(),
            "docs/plan.md"
        );
        assert!(normalize_plan_path(base, "../plan.md").is_err());
        assert!(normalize_plan_path(base, "/elsewhere/plan.md").is_err());
        assert!(normalize_plan_path(base, ".loopgate/plan.md").is_err());
    }
}
