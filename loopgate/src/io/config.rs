//! Controller configuration stored under `.loopgate/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::audit::DEFAULT_AUDIT_INTERVAL;
use crate::io::atomic::write_atomic;
use crate::io::session::LOOPGATE_DIR;
use crate::io::state_store::{DEFAULT_REVIEWER_MODEL, DEFAULT_TIMEOUT_SECS, ReviewerEffort};

pub const CONFIG_FILE: &str = "config.toml";

/// Controller configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below;
/// per-session values recorded in the state document win over `[defaults]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopgateConfig {
    /// Hard timeout for every git inspection.
    pub git_timeout_secs: u64,

    /// Truncate captured reviewer stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Line ceiling for changed files with a checked extension.
    pub max_file_lines: usize,

    /// Extensions (without dot) the size check applies to.
    pub size_check_extensions: Vec<String>,

    pub reviewer: ReviewerConfig,
    pub pool: PoolConfig,
    pub defaults: SessionDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReviewerConfig {
    /// Reviewer executable, resolved via PATH.
    pub program: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    pub poll_interval_secs: u64,
    pub reviewer_timeout_secs: u64,
    /// Remote account login → reviewer name, for comment-based responses.
    pub logins: BTreeMap<String, String>,
    /// `owner/repo` and pull request number for comment-based responses.
    pub repo: Option<String>,
    pub pull_request: Option<u64>,
    /// Judge responses with the prompt-form reviewer instead of the local classifier.
    pub adjudicate_with_reviewer: bool,
}

/// Values `start` stamps into a new session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionDefaults {
    pub max_iterations: u32,
    pub reviewer_model: String,
    pub reviewer_effort: ReviewerEffort,
    pub timeout_secs: u64,
    pub audit_interval: u32,
    pub publish_every_round: bool,
}

impl Default for ReviewerConfig {
    fn default() -> Self {
        Self {
            program: "codex".to_string(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            reviewer_timeout_secs: 900,
            logins: BTreeMap::new(),
            repo: None,
            pull_request: None,
            adjudicate_with_reviewer: false,
        }
    }
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            max_iterations: 42,
            reviewer_model: DEFAULT_REVIEWER_MODEL.to_string(),
            reviewer_effort: ReviewerEffort::High,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            audit_interval: DEFAULT_AUDIT_INTERVAL,
            publish_every_round: false,
        }
    }
}

impl Default for LoopgateConfig {
    fn default() -> Self {
        Self {
            git_timeout_secs: 30,
            output_limit_bytes: 1024 * 1024,
            max_file_lines: 2000,
            size_check_extensions: [
                "rs", "py", "js", "ts", "tsx", "jsx", "go", "java", "kt", "c", "h", "cc", "cpp",
                "hpp", "rb", "sh", "md", "txt", "toml", "yaml", "yml",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            reviewer: ReviewerConfig::default(),
            pool: PoolConfig::default(),
            defaults: SessionDefaults::default(),
        }
    }
}

impl LoopgateConfig {
    pub fn validate(&self) -> Result<()> {
        if self.git_timeout_secs == 0 {
            return Err(anyhow!("git_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.max_file_lines == 0 {
            return Err(anyhow!("max_file_lines must be > 0"));
        }
        if self.reviewer.program.trim().is_empty() {
            return Err(anyhow!("reviewer.program must be non-empty"));
        }
        if self.pool.poll_interval_secs == 0 {
            return Err(anyhow!("pool.poll_interval_secs must be > 0"));
        }
        if self.pool.reviewer_timeout_secs == 0 {
            return Err(anyhow!("pool.reviewer_timeout_secs must be > 0"));
        }
        if self.pool.repo.is_some() != self.pool.pull_request.is_some() {
            return Err(anyhow!("pool.repo and pool.pull_request must be set together"));
        }
        if self.defaults.max_iterations == 0 {
            return Err(anyhow!("defaults.max_iterations must be > 0"));
        }
        if self.defaults.timeout_secs == 0 {
            return Err(anyhow!("defaults.timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    /// True if the size check applies to `path`.
    pub fn is_size_checked(&self, path: &str) -> bool {
        Path::new(path)
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .is_some_and(|ext| self.size_check_extensions.iter().any(|e| *e == ext))
    }
}

/// Default config location for a workspace root.
pub fn config_path(base: &Path) -> PathBuf {
    base.join(LOOPGATE_DIR).join(CONFIG_FILE)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopgateConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopgateConfig> {
    if !path.exists() {
        let cfg = LoopgateConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopgateConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopgateConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
