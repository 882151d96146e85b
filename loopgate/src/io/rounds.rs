//! Per-round bookkeeping artifacts (`round-N-meta.json`).
//!
//! Diagnostic only; the state document stays the source of truth.

use std::fs;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::io::atomic::write_atomic;
use crate::io::session::SessionPaths;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundMeta {
    pub round: u32,
    pub phase: String,
    pub reviewer: String,
    pub verdict: String,
    /// What the controller did with the verdict.
    pub transition: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

pub fn write_round_meta(session: &SessionPaths, meta: &RoundMeta) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(meta).context("serialize round meta")?;
    buf.push('\n');
    write_atomic(&session.round_meta(meta.round), buf.as_bytes())
}

pub fn read_round_meta(session: &SessionPaths, round: u32) -> Result<Option<RoundMeta>> {
    let path = session.round_meta(round);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let meta = serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(meta))
}

/// Non-empty agent-written summary for `round`, if present.
pub fn read_summary(path: &std::path::Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let summary = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok((!summary.trim().is_empty()).then_some(summary))
}
