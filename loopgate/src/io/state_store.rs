//! Durable session state.
//!
//! One canonical JSON document represents the session. Its file name encodes
//! the lifecycle stage (see [`StateDoc`]), so a phase change is a rename and
//! the rename is the single source of truth for where the session is.
//!
//! Parsing is strict: the raw document is validated against the embedded JSON
//! Schema for its declared version before typed deserialization. Fields added
//! after the minimum supported version are defaulted only for documents of an
//! older version; anything else missing is [`StateError::Corrupt`].

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{LazyLock, Mutex};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use jsonschema::{Validator, validator_for};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::audit::DEFAULT_AUDIT_INTERVAL;
use crate::core::types::{Outcome, Phase, StateDoc};
use crate::io::integrity::{IntegrityLedger, Mismatch, write_protected};
use crate::io::session::SessionPaths;

/// Oldest state document version this controller accepts.
pub const MIN_SCHEMA_VERSION: u32 = 1;
/// Version stamped on every document this controller writes.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

pub const DEFAULT_REVIEWER_MODEL: &str = "gpt-5.1-codex";
pub const DEFAULT_TIMEOUT_SECS: u64 = 5400;

const STATE_SCHEMA_V1: &str = include_str!("../schemas/state.v1.schema.json");
const STATE_SCHEMA_V2: &str = include_str!("../schemas/state.v2.schema.json");

static VALIDATORS: LazyLock<BTreeMap<u32, Validator>> = LazyLock::new(|| {
    [(1, STATE_SCHEMA_V1), (2, STATE_SCHEMA_V2)]
        .into_iter()
        .map(|(version, raw)| {
            let schema: Value = serde_json::from_str(raw).expect("embedded state schema is json");
            let validator = validator_for(&schema).expect("embedded state schema compiles");
            (version, validator)
        })
        .collect()
});

/// Typed failures callers branch on; everything else is plain `anyhow`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("no state document in {0}")]
    NotFound(String),
    #[error("cannot move {from} to {to}: {detail}")]
    Conflict {
        from: String,
        to: String,
        detail: String,
    },
    #[error("{file} is corrupt: {detail}")]
    Corrupt { file: String, detail: String },
}

impl StateError {
    fn corrupt(doc: StateDoc, detail: impl Into<String>) -> Self {
        StateError::Corrupt {
            file: doc.file_name(),
            detail: detail.into(),
        }
    }

    fn conflict(from: StateDoc, to: StateDoc, detail: impl Into<String>) -> Self {
        StateError::Conflict {
            from: from.file_name(),
            to: to.file_name(),
            detail: detail.into(),
        }
    }
}

/// Downcast helper for controller decisions.
pub fn state_error(err: &anyhow::Error) -> Option<&StateError> {
    err.downcast_ref::<StateError>()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewerEffort {
    Low,
    Medium,
    High,
    Xhigh,
}

impl ReviewerEffort {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewerEffort::Low => "low",
            ReviewerEffort::Medium => "medium",
            ReviewerEffort::High => "high",
            ReviewerEffort::Xhigh => "xhigh",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "low" => Some(ReviewerEffort::Low),
            "medium" => Some(ReviewerEffort::Medium),
            "high" => Some(ReviewerEffort::High),
            "xhigh" => Some(ReviewerEffort::Xhigh),
            _ => None,
        }
    }
}

/// Multi-reviewer bookkeeping persisted with the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPool {
    /// Every reviewer ever expected to weigh in; never shrinks.
    pub configured: Vec<String>,
    /// Reviewers currently blocking completion.
    pub active: Vec<String>,
    /// Anchor for per-reviewer timeouts while a poll cycle is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_at: Option<DateTime<Utc>>,
    pub reviewer_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reviewer_timeouts: BTreeMap<String, u64>,
}

/// Parsed state document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub schema_version: u32,
    pub current_round: u32,
    pub max_iterations: u32,
    pub review_started: bool,
    pub base_ref: String,
    pub start_branch: String,
    pub plan_file: String,
    pub plan_mutable: bool,
    pub plan_tracked: bool,
    pub started_at: DateTime<Utc>,
    pub reviewer_model: String,
    pub reviewer_effort: ReviewerEffort,
    pub timeout_secs: u64,
    pub audit_interval: u32,
    pub publish_every_round: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<SessionPool>,
}

impl SessionState {
    pub fn to_json(&self) -> Result<String> {
        let mut stamped = self.clone();
        stamped.schema_version = CURRENT_SCHEMA_VERSION;
        let mut buf = serde_json::to_string_pretty(&stamped).context("serialize state")?;
        buf.push('\n');
        Ok(buf)
    }
}

/// Defaults for fields introduced in v2, applied only to v1 documents.
fn v2_defaults() -> [(&'static str, Value); 5] {
    [
        ("reviewer_model", Value::from(DEFAULT_REVIEWER_MODEL)),
        ("reviewer_effort", Value::from(ReviewerEffort::High.as_str())),
        ("timeout_secs", Value::from(DEFAULT_TIMEOUT_SECS)),
        ("audit_interval", Value::from(DEFAULT_AUDIT_INTERVAL)),
        ("publish_every_round", Value::from(false)),
    ]
}

/// Strictly parse a raw state document.
///
/// Errors are always [`StateError::Corrupt`].
pub fn parse_state_document(doc: StateDoc, raw: &str) -> std::result::Result<SessionState, StateError> {
    let mut value: Value = serde_json::from_str(raw)
        .map_err(|err| StateError::corrupt(doc, format!("invalid json: {err}")))?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| StateError::corrupt(doc, "document is not a json object"))?;
    let version = schema_version(object).map_err(|detail| StateError::corrupt(doc, detail))?;

    let validator = VALIDATORS
        .get(&version)
        .ok_or_else(|| StateError::corrupt(doc, format!("no schema for version {version}")))?;
    let instance = Value::Object(object.clone());
    let errors: Vec<String> = validator
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !errors.is_empty() {
        return Err(StateError::corrupt(
            doc,
            format!("schema v{version} validation failed: {}", errors.join("; ")),
        ));
    }

    if version < CURRENT_SCHEMA_VERSION {
        for (key, default) in v2_defaults() {
            object.entry(key).or_insert(default);
        }
    }

    serde_json::from_value(value)
        .map_err(|err| StateError::corrupt(doc, format!("deserialize: {err}")))
}

fn schema_version(object: &Map<String, Value>) -> std::result::Result<u32, String> {
    let raw = object
        .get("schema_version")
        .ok_or_else(|| "missing schema_version".to_string())?;
    let version = raw
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| format!("schema_version must be a non-negative integer, got {raw}"))?;
    if version < MIN_SCHEMA_VERSION {
        return Err(format!(
            "schema_version {version} is older than the minimum supported {MIN_SCHEMA_VERSION}"
        ));
    }
    if version > CURRENT_SCHEMA_VERSION {
        return Err(format!(
            "schema_version {version} is newer than the supported {CURRENT_SCHEMA_VERSION}"
        ));
    }
    Ok(version)
}

/// A parsed document plus which file it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedState {
    pub doc: StateDoc,
    pub state: SessionState,
}

impl LoadedState {
    pub fn phase(&self) -> Phase {
        self.doc.phase(self.state.review_started)
    }
}

/// Idempotent field updates applied by [`StateStore::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldUpdate {
    CurrentRound(u32),
    ReviewStarted(bool),
    PoolActive(Vec<String>),
    TriggerAt(Option<DateTime<Utc>>),
}

impl FieldUpdate {
    fn apply(&self, state: &mut SessionState) -> Result<()> {
        match self {
            FieldUpdate::CurrentRound(round) => {
                if *round < state.current_round {
                    return Err(anyhow!(
                        "refusing to move current_round backwards ({} -> {round})",
                        state.current_round
                    ));
                }
                state.current_round = *round;
            }
            FieldUpdate::ReviewStarted(flag) => state.review_started = *flag,
            FieldUpdate::PoolActive(active) => {
                let pool = state
                    .pool
                    .as_mut()
                    .ok_or_else(|| anyhow!("session has no reviewer pool"))?;
                let mut active = active.clone();
                active.sort();
                active.dedup();
                pool.active = active;
            }
            FieldUpdate::TriggerAt(at) => {
                let pool = state
                    .pool
                    .as_mut()
                    .ok_or_else(|| anyhow!("session has no reviewer pool"))?;
                pool.trigger_at = *at;
            }
        }
        Ok(())
    }
}

/// Session state persistence with compare-and-transition semantics.
pub trait StateStore {
    /// Which document is present, without parsing it.
    fn current_doc(&self) -> Result<Option<StateDoc>>;

    /// Load and strictly parse the present document.
    fn load(&self) -> Result<LoadedState>;

    /// Create the first document; conflicts if any document already exists.
    fn create(&self, doc: StateDoc, state: &SessionState) -> Result<()>;

    /// Move `from` to `to`. Succeeds once; a repeated or concurrent attempt
    /// fails with [`StateError::Conflict`] because `from` is gone.
    fn transition(&self, from: StateDoc, to: StateDoc) -> Result<()>;

    /// Apply field updates to the present non-terminal document.
    ///
    /// Returns whether anything changed; re-applying the same updates is a no-op.
    fn write(&self, updates: &[FieldUpdate]) -> Result<bool>;

    /// Force-terminate as `error` by renaming whichever non-terminal document
    /// exists, without parsing it. Returns false if none exists.
    fn mark_error(&self) -> Result<bool>;

    /// Protected files whose content changed behind the controller's back.
    fn verify_integrity(&self) -> Result<Vec<Mismatch>>;
}

/// Filesystem backend: one file per document, renames as transitions.
#[derive(Debug, Clone)]
pub struct FsStateStore {
    session: SessionPaths,
}

impl FsStateStore {
    pub fn new(session: SessionPaths) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &SessionPaths {
        &self.session
    }

    fn path(&self, doc: StateDoc) -> PathBuf {
        self.session.state_doc(doc)
    }

    fn ledger_path(&self) -> PathBuf {
        self.session.integrity_ledger()
    }

    fn write_doc(&self, doc: StateDoc, contents: &str) -> Result<()> {
        write_protected(&self.session.dir, &doc.file_name(), contents.as_bytes())
    }

    fn rename(&self, from: StateDoc, to: StateDoc) -> Result<()> {
        let to_path = self.path(to);
        if to_path.exists() {
            return Err(StateError::conflict(from, to, "target already exists").into());
        }
        let (from_name, to_name) = (from.file_name(), to.file_name());
        let ledger_path = self.ledger_path();
        let mut ledger = IntegrityLedger::load(&ledger_path)?;
        ledger.settle(&self.session.dir)?;
        let tracked = match ledger.files.get(&from_name) {
            Some(digest) => {
                ledger.stage(&to_name, digest.clone(), Some(&from_name));
                ledger.save(&ledger_path)?;
                true
            }
            None => false,
        };
        let from_path = self.path(from);
        match fs::rename(&from_path, &to_path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StateError::conflict(from, to, "source no longer exists").into());
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("rename {} -> {}", from_path.display(), to_path.display())
                });
            }
        }
        if !tracked {
            return Ok(());
        }
        ledger.commit(&to_name);
        ledger.save(&ledger_path)
    }
}

impl StateStore for FsStateStore {
    fn current_doc(&self) -> Result<Option<StateDoc>> {
        Ok(self.session.present_state_doc())
    }

    #[instrument(skip_all, fields(session = %self.session.id))]
    fn load(&self) -> Result<LoadedState> {
        let doc = self
            .current_doc()?
            .ok_or_else(|| StateError::NotFound(self.session.dir.display().to_string()))?;
        let path = self.path(doc);
        let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let state = parse_state_document(doc, &raw)?;
        debug!(doc = %doc.file_name(), round = state.current_round, "state loaded");
        Ok(LoadedState { doc, state })
    }

    #[instrument(skip_all, fields(session = %self.session.id, doc = %doc.file_name()))]
    fn create(&self, doc: StateDoc, state: &SessionState) -> Result<()> {
        if let Some(existing) = self.current_doc()? {
            return Err(StateError::conflict(existing, doc, "a state document already exists").into());
        }
        self.write_doc(doc, &state.to_json()?)?;
        info!("state document created");
        Ok(())
    }

    #[instrument(skip_all, fields(session = %self.session.id, from = %from.file_name(), to = %to.file_name()))]
    fn transition(&self, from: StateDoc, to: StateDoc) -> Result<()> {
        self.rename(from, to)?;
        info!("state transition");
        Ok(())
    }

    #[instrument(skip_all, fields(session = %self.session.id))]
    fn write(&self, updates: &[FieldUpdate]) -> Result<bool> {
        let loaded = self.load()?;
        if loaded.doc.is_terminal() {
            return Err(anyhow!("cannot update terminal {}", loaded.doc.file_name()));
        }
        let mut next = loaded.state.clone();
        for update in updates {
            update.apply(&mut next)?;
        }
        let path = self.path(loaded.doc);
        let current_raw =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let next_raw = next.to_json()?;
        if next_raw == current_raw {
            debug!("state unchanged");
            return Ok(false);
        }
        self.write_doc(loaded.doc, &next_raw)?;
        info!(round = next.current_round, review_started = next.review_started, "state updated");
        Ok(true)
    }

    #[instrument(skip_all, fields(session = %self.session.id))]
    fn mark_error(&self) -> Result<bool> {
        let Some(doc) = self.current_doc()? else {
            return Ok(false);
        };
        if doc.is_terminal() {
            return Ok(false);
        }
        self.rename(doc, StateDoc::Terminal(Outcome::Error))?;
        warn!(from = %doc.file_name(), "session terminated as error");
        Ok(true)
    }

    fn verify_integrity(&self) -> Result<Vec<Mismatch>> {
        IntegrityLedger::load(&self.ledger_path())?.verify(&self.session.dir)
    }
}

/// In-memory backend with the same transition semantics.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    docs: Mutex<BTreeMap<StateDoc, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a raw document, bypassing validation.
    pub fn insert_raw(&self, doc: StateDoc, raw: impl Into<String>) -> Result<()> {
        self.lock()?.insert(doc, raw.into());
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<StateDoc, String>>> {
        self.docs
            .lock()
            .map_err(|_| anyhow!("state store mutex poisoned"))
    }

    fn present(docs: &BTreeMap<StateDoc, String>) -> Option<StateDoc> {
        StateDoc::ALL.into_iter().find(|doc| docs.contains_key(doc))
    }
}

impl StateStore for MemoryStateStore {
    fn current_doc(&self) -> Result<Option<StateDoc>> {
        Ok(Self::present(&*self.lock()?))
    }

    fn load(&self) -> Result<LoadedState> {
        let docs = self.lock()?;
        let doc = Self::present(&docs).ok_or_else(|| StateError::NotFound("memory".to_string()))?;
        let state = parse_state_document(doc, &docs[&doc])?;
        Ok(LoadedState { doc, state })
    }

    fn create(&self, doc: StateDoc, state: &SessionState) -> Result<()> {
        let mut docs = self.lock()?;
        if let Some(existing) = Self::present(&docs) {
            return Err(StateError::conflict(existing, doc, "a state document already exists").into());
        }
        docs.insert(doc, state.to_json()?);
        Ok(())
    }

    fn transition(&self, from: StateDoc, to: StateDoc) -> Result<()> {
        let mut docs = self.lock()?;
        if docs.contains_key(&to) {
            return Err(StateError::conflict(from, to, "target already exists").into());
        }
        let raw = docs
            .remove(&from)
            .ok_or_else(|| StateError::conflict(from, to, "source no longer exists"))?;
        docs.insert(to, raw);
        Ok(())
    }

    fn write(&self, updates: &[FieldUpdate]) -> Result<bool> {
        let mut docs = self.lock()?;
        let doc = Self::present(&docs).ok_or_else(|| StateError::NotFound("memory".to_string()))?;
        if doc.is_terminal() {
            return Err(anyhow!("cannot update terminal {}", doc.file_name()));
        }
        let current_raw = docs[&doc].clone();
        let mut next = parse_state_document(doc, &current_raw)?;
        for update in updates {
            update.apply(&mut next)?;
        }
        let next_raw = next.to_json()?;
        if next_raw == current_raw {
            return Ok(false);
        }
        docs.insert(doc, next_raw);
        Ok(true)
    }

    fn mark_error(&self) -> Result<bool> {
        let mut docs = self.lock()?;
        let Some(doc) = Self::present(&docs) else {
            return Ok(false);
        };
        if doc.is_terminal() {
            return Ok(false);
        }
        if let Some(raw) = docs.remove(&doc) {
            docs.insert(StateDoc::Terminal(Outcome::Error), raw);
        }
        Ok(true)
    }

    fn verify_integrity(&self) -> Result<Vec<Mismatch>> {
        Ok(Vec::new())
    }
}
