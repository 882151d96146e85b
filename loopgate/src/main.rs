//! Review-gated iteration controller.
//!
//! Installed as the producing agent's stop hook: every attempt to stop runs
//! `loopgate exit`, which either lets the agent stop or blocks it with the
//! next instruction. Sessions live under `.loopgate/` in the working tree.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{debug, warn};

use loopgate::controller::{
    ExitDecision, ExitEnv, ReviewStage, SingleReviewStage, handle_exit_attempt, request_cancel,
};
use loopgate::core::pool::SlotStatus;
use loopgate::exit_codes;
use loopgate::io::config::{LoopgateConfig, config_path, load_config};
use loopgate::io::git::Git;
use loopgate::io::guards::default_chain;
use loopgate::io::prompt::PromptEngine;
use loopgate::io::responses::{DirResponseSource, GhCommentSource, ResponseSource};
use loopgate::io::reviewer::CommandReviewer;
use loopgate::io::session::{SessionPaths, find_active_session};
use loopgate::io::state_store::{FsStateStore, StateStore};
use loopgate::logging;
use loopgate::pool_loop::{
    Adjudicator, ClassifierAdjudicator, InvokerAdjudicator, PoolReviewStage, SystemClock,
    poll_once,
};
use loopgate::start::{StartOptions, start_session};
use loopgate::status::session_status;

#[derive(Parser)]
#[command(
    name = "loopgate",
    version,
    about = "Review-gated iteration controller for agent sessions"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a session for a plan file and write the round-0 prompt.
    Start {
        /// Plan file, relative to the working tree.
        #[arg(long)]
        plan: String,
        /// Ref the diff-driven review compares against (default: HEAD).
        #[arg(long = "base")]
        base_ref: Option<String>,
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Allow the plan file to change during the session.
        #[arg(long)]
        mutable_plan: bool,
        /// Comma-separated reviewer names; enables the multi-reviewer pool.
        #[arg(long, value_delimiter = ',')]
        reviewers: Vec<String>,
        #[arg(long)]
        model: Option<String>,
        /// Reviewer effort: low, medium, high or xhigh.
        #[arg(long)]
        effort: Option<String>,
        /// Require every round to be pushed upstream.
        #[arg(long)]
        publish: bool,
    },
    /// Handle one attempt by the agent to stop.
    Exit {
        /// Agent transcript (JSONL) checked for unfinished tasks.
        #[arg(long)]
        transcript: Option<PathBuf>,
        /// Stop-hook mode: read hook JSON on stdin and always exit 0.
        #[arg(long)]
        hook: bool,
    },
    /// Cancel the active session.
    Cancel,
    /// Print the newest session's phase and round, or its outcome.
    Status,
    /// Show which pool reviewers have responded to the pending review.
    Poll,
}

/// Fields we read from the stop-hook payload.
#[derive(Debug, Default, Deserialize)]
struct HookInput {
    #[serde(default)]
    transcript_path: Option<PathBuf>,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let base = std::env::current_dir().context("resolve working directory")?;
    match cli.command {
        Command::Start {
            plan,
            base_ref,
            max_iterations,
            mutable_plan,
            reviewers,
            model,
            effort,
            publish,
        } => {
            let options = StartOptions {
                plan_file: plan,
                base_ref,
                max_iterations,
                plan_mutable: mutable_plan,
                reviewer_model: model,
                reviewer_effort: effort,
                publish_every_round: publish,
                reviewers,
            };
            cmd_start(&base, &options)
        }
        Command::Exit { transcript, hook } => Ok(cmd_exit(&base, transcript, hook)),
        Command::Cancel => cmd_cancel(&base),
        Command::Status => {
            println!("{}", session_status(&base)?);
            Ok(exit_codes::OK)
        }
        Command::Poll => cmd_poll(&base),
    }
}

fn cmd_start(base: &Path, options: &StartOptions) -> Result<i32> {
    let config = load_config(&config_path(base))?;
    let outcome = start_session(base, &config, options, Utc::now())?;
    eprintln!("Session {} started.", outcome.session.id);
    println!("{}", outcome.prompt_path.display());
    Ok(exit_codes::OK)
}

/// Runs an exit attempt and reports it; hook mode never fails open on errors.
fn cmd_exit(base: &Path, transcript: Option<PathBuf>, hook: bool) -> i32 {
    let result = (|| -> Result<ExitDecision> {
        let transcript = match transcript {
            Some(path) => Some(path),
            None if hook => read_hook_input(io::stdin())?.transcript_path,
            None => None,
        };
        exit_attempt(base, transcript.as_deref())
    })();
    let decision = match result {
        Ok(decision) => decision,
        Err(err) if hook => {
            warn!(err = %format!("{err:#}"), "exit attempt failed");
            ExitDecision::Block {
                reason: format!(
                    "loopgate could not evaluate this exit attempt: {err:#}\n\nTo continue: fix the problem above and attempt the exit again."
                ),
            }
        }
        Err(err) => {
            eprintln!("{err:#}");
            return exit_codes::INVALID;
        }
    };

    let code = match &decision {
        ExitDecision::Block { reason } => {
            println!("{}", block_payload(reason));
            exit_codes::BLOCKED
        }
        ExitDecision::Allow { outcome, message } => {
            eprintln!("{message}");
            outcome.map_or(exit_codes::OK, exit_codes::for_outcome)
        }
    };
    if hook { exit_codes::OK } else { code }
}

fn exit_attempt(base: &Path, transcript: Option<&Path>) -> Result<ExitDecision> {
    let Some(session) = find_active_session(base)? else {
        debug!("no active session");
        return Ok(ExitDecision::Allow {
            outcome: None,
            message: "no active loopgate session".to_string(),
        });
    };
    let config = load_config(&config_path(base))?;
    let store = FsStateStore::new(session.clone());
    let git = Git::new(base, config.git_timeout());
    let checks = default_chain();
    let prompts = PromptEngine::new();
    let env = ExitEnv {
        session: &session,
        store: &store,
        git: &git,
        config: &config,
        checks: &checks,
        prompts: &prompts,
        transcript,
    };
    // An unreadable document is left for the controller to terminate.
    let pooled = store.load().is_ok_and(|loaded| loaded.state.pool.is_some());
    let stage = review_stage(base, &session, &config, pooled);
    handle_exit_attempt(&env, stage.as_ref())
}

fn review_stage(
    base: &Path,
    session: &SessionPaths,
    config: &LoopgateConfig,
    pooled: bool,
) -> Box<dyn ReviewStage> {
    let program = config.reviewer.program.clone();
    let single = SingleReviewStage::new(CommandReviewer::new(program.clone()), program.clone());
    if !pooled {
        return Box::new(single);
    }
    let adjudicator: Box<dyn Adjudicator> = if config.pool.adjudicate_with_reviewer {
        Box::new(InvokerAdjudicator::new(CommandReviewer::new(program)))
    } else {
        Box::new(ClassifierAdjudicator)
    };
    Box::new(PoolReviewStage {
        source: response_source(base, session, config),
        clock: SystemClock,
        adjudicator,
        code_review: single,
        poll_interval: Duration::from_secs(config.pool.poll_interval_secs),
    })
}

/// Pull request comments when configured, otherwise the session's drop directory.
fn response_source(
    base: &Path,
    session: &SessionPaths,
    config: &LoopgateConfig,
) -> Box<dyn ResponseSource> {
    match (&config.pool.repo, config.pool.pull_request) {
        (Some(repo), Some(pull_request)) => Box::new(GhCommentSource {
            workdir: base.to_path_buf(),
            repo: repo.clone(),
            pull_request,
            logins: config.pool.logins.clone(),
            timeout: config.git_timeout(),
        }),
        _ => Box::new(DirResponseSource::new(session.responses_dir())),
    }
}

fn cmd_cancel(base: &Path) -> Result<i32> {
    let session = find_active_session(base)?.ok_or_else(|| anyhow!("no active session"))?;
    let store = FsStateStore::new(session.clone());
    match request_cancel(&session, &store)? {
        ExitDecision::Allow { message, .. } => println!("{message}"),
        ExitDecision::Block { reason } => println!("{reason}"),
    }
    Ok(exit_codes::OK)
}

fn cmd_poll(base: &Path) -> Result<i32> {
    let session = find_active_session(base)?.ok_or_else(|| anyhow!("no active session"))?;
    let config = load_config(&config_path(base))?;
    let loaded = FsStateStore::new(session.clone()).load()?;
    let pool = loaded
        .state
        .pool
        .ok_or_else(|| anyhow!("session {} has no reviewer pool", session.id))?;
    let source = response_source(base, &session, &config);
    let Some(state) = poll_once(&pool, source.as_ref(), Utc::now())? else {
        println!("no review requested yet; blocking: {}", pool.active.join(", "));
        return Ok(exit_codes::OK);
    };
    for (name, slot) in &state.slots {
        let status = match slot.status {
            SlotStatus::Waiting => "waiting".to_string(),
            SlotStatus::Responded { at } => format!("responded at {}", at.to_rfc3339()),
            SlotStatus::TimedOut => "timed out".to_string(),
        };
        println!("{name}: {status}");
    }
    Ok(exit_codes::OK)
}

fn read_hook_input(mut reader: impl Read) -> Result<HookInput> {
    let mut raw = String::new();
    reader
        .read_to_string(&mut raw)
        .context("read hook input from stdin")?;
    if raw.trim().is_empty() {
        return Ok(HookInput::default());
    }
    serde_json::from_str(&raw).context("parse hook input json")
}

fn block_payload(reason: &str) -> String {
    serde_json::json!({ "decision": "block", "reason": reason }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_start_with_reviewers() {
        let cli = Cli::parse_from([
            "loopgate",
            "start",
            "--plan",
            "docs/plan.md",
            "--reviewers",
            "claude,codex",
            "--max-iterations",
            "7",
            "--mutable-plan",
        ]);
        let Command::Start {
            plan,
            reviewers,
            max_iterations,
            mutable_plan,
            publish,
            ..
        } = cli.command
        else {
            panic!("expected start");
        };
        assert_eq!(plan, "docs/plan.md");
        assert_eq!(reviewers, vec!["claude", "codex"]);
        assert_eq!(max_iterations, Some(7));
        assert!(mutable_plan);
        assert!(!publish);
    }

    #[test]
    fn parse_exit_hook() {
        let cli = Cli::parse_from(["loopgate", "exit", "--hook"]);
        assert!(matches!(
            cli.command,
            Command::Exit {
                transcript: None,
                hook: true
            }
        ));
    }

    #[test]
    fn start_requires_plan() {
        assert!(Cli::try_parse_from(["loopgate", "start"]).is_err());
    }

    #[test]
    fn hook_input_reads_transcript_path() {
        let input =
            read_hook_input(r#"{"session_id":"x","transcript_path":"/tmp/t.jsonl"}"#.as_bytes())
                .unwrap();
        assert_eq!(input.transcript_path, Some(PathBuf::from("/tmp/t.jsonl")));
        assert_eq!(read_hook_input("".as_bytes()).unwrap().transcript_path, None);
        assert!(read_hook_input("not json".as_bytes()).is_err());
    }

    #[test]
    fn block_payload_is_hook_json() {
        let payload: serde_json::Value =
            serde_json::from_str(&block_payload("line one\n\"quoted\"")).unwrap();
        assert_eq!(payload["decision"], "block");
        assert_eq!(payload["reason"], "line one\n\"quoted\"");
    }
}
