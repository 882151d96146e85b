//! Reporting for `loopgate status`.

use std::fmt;
use std::path::Path;

use anyhow::Result;

use crate::core::types::{Outcome, Phase, StateDoc};
use crate::io::session::find_latest_session;
use crate::io::state_store::{FsStateStore, StateError, StateStore, state_error};

/// Snapshot of the newest session under a base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    NoSession,
    /// Directory exists but holds no state document.
    Empty { id: String },
    Live {
        id: String,
        phase: Phase,
        round: u32,
        max_iterations: u32,
        pool: Option<PoolStatus>,
    },
    Finished { id: String, outcome: Outcome },
    /// The present document failed validation; the next exit attempt ends the session.
    Unreadable { id: String, detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub configured: Vec<String>,
    pub active: Vec<String>,
    pub polling: bool,
}

/// Inspect the newest session without modifying anything.
pub fn session_status(base: &Path) -> Result<SessionStatus> {
    let Some(session) = find_latest_session(base)? else {
        return Ok(SessionStatus::NoSession);
    };
    let id = session.id.clone();
    let Some(doc) = session.present_state_doc() else {
        return Ok(SessionStatus::Empty { id });
    };
    if let StateDoc::Terminal(outcome) = doc {
        return Ok(SessionStatus::Finished { id, outcome });
    }

    match FsStateStore::new(session).load() {
        Ok(loaded) => Ok(SessionStatus::Live {
            id,
            phase: loaded.phase(),
            round: loaded.state.current_round,
            max_iterations: loaded.state.max_iterations,
            pool: loaded.state.pool.map(|pool| PoolStatus {
                polling: pool.trigger_at.is_some(),
                configured: pool.configured,
                active: pool.active,
            }),
        }),
        Err(err) => match state_error(&err) {
            Some(StateError::Corrupt { .. }) => Ok(SessionStatus::Unreadable {
                id,
                detail: err.to_string(),
            }),
            _ => Err(err),
        },
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::NoSession => write!(f, "no session"),
            SessionStatus::Empty { id } => write!(f, "session {id}: no state document"),
            SessionStatus::Live {
                id,
                phase,
                round,
                max_iterations,
                pool,
            } => {
                writeln!(f, "session {id}")?;
                writeln!(f, "phase: {}", phase.label())?;
                write!(f, "round: {round} of {max_iterations}")?;
                if let Some(pool) = pool {
                    writeln!(f)?;
                    writeln!(f, "reviewers: {}", pool.configured.join(", "))?;
                    let active = if pool.active.is_empty() {
                        "(none)".to_string()
                    } else {
                        pool.active.join(", ")
                    };
                    write!(f, "blocking: {active}")?;
                    if pool.polling {
                        write!(f, " (review requested)")?;
                    }
                }
                Ok(())
            }
            SessionStatus::Finished { id, outcome } => {
                write!(f, "session {id}: finished ({outcome})")
            }
            SessionStatus::Unreadable { id, detail } => {
                write!(f, "session {id}: unreadable state ({detail})")
            }
        }
    }
}
