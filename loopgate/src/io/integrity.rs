//! Digest ledger for controller-owned session files.
//!
//! The controller records a sha256 of every protected file it writes. Any
//! later mismatch means something other than the controller touched the file,
//! and the session can no longer be trusted.
//!
//! Writes are two-phase: the new digest is saved as pending before the file
//! changes and committed after. A crash between the two leaves the file with
//! either its recorded or its pending digest, and both verify.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::io::atomic::write_atomic;

/// File name → hex sha256, plus digests announced for in-flight writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityLedger {
    pub files: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pending: BTreeMap<String, PendingDigest>,
}

/// A digest saved before its write or rename lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDigest {
    pub digest: String,
    /// Source file of a rename; dropped from the ledger on commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<String>,
}

/// One protected file whose content no longer matches the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub file: String,
    pub detail: String,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn digest_of(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(Some(sha256_hex(&bytes)))
}

impl IntegrityLedger {
    /// Load the ledger; a missing ledger is empty.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(self).context("serialize integrity ledger")?;
        buf.push('\n');
        write_atomic(path, buf.as_bytes())
    }

    /// Announce the digest `file` is about to take.
    pub fn stage(&mut self, file: &str, digest: String, replaces: Option<&str>) {
        self.pending.insert(
            file.to_string(),
            PendingDigest {
                digest,
                replaces: replaces.map(str::to_string),
            },
        );
    }

    /// Promote the pending digest of `file` to its recorded digest.
    pub fn commit(&mut self, file: &str) {
        if let Some(entry) = self.pending.remove(file) {
            if let Some(source) = &entry.replaces {
                self.files.remove(source);
            }
            self.files.insert(file.to_string(), entry.digest);
        }
    }

    /// Resolve pending entries left by an interrupted write.
    ///
    /// A write that landed is committed; one that never happened is dropped.
    pub fn settle(&mut self, dir: &Path) -> Result<()> {
        let names: Vec<String> = self.pending.keys().cloned().collect();
        for file in names {
            let landed = match (digest_of(&dir.join(&file))?, self.pending.get(&file)) {
                (Some(actual), Some(entry)) => actual == entry.digest,
                _ => false,
            };
            if landed {
                info!(file = %file, "committing interrupted write");
                self.commit(&file);
            } else {
                debug!(file = %file, "dropping pending digest");
                self.pending.remove(&file);
            }
        }
        Ok(())
    }

    /// Compare every recorded file in `dir` against its digest.
    pub fn verify(&self, dir: &Path) -> Result<Vec<Mismatch>> {
        let mut mismatches = Vec::new();
        for (file, expected) in &self.files {
            let pending = self.pending.get(file).map(|entry| &entry.digest);
            match digest_of(&dir.join(file))? {
                None if self.moved_away(dir, file) => {}
                None => mismatches.push(Mismatch {
                    file: file.clone(),
                    detail: "file was removed".to_string(),
                }),
                Some(actual) if &actual == expected || Some(&actual) == pending => {}
                Some(actual) => mismatches.push(Mismatch {
                    file: file.clone(),
                    detail: format!("digest {actual} does not match recorded {expected}"),
                }),
            }
        }
        for (file, entry) in &self.pending {
            if self.files.contains_key(file) {
                continue;
            }
            if let Some(actual) = digest_of(&dir.join(file))?
                && actual != entry.digest
            {
                mismatches.push(Mismatch {
                    file: file.clone(),
                    detail: format!("digest {actual} does not match pending {}", entry.digest),
                });
            }
        }
        if mismatches.is_empty() {
            debug!(files = self.files.len(), pending = self.pending.len(), "integrity ledger verified");
        } else {
            warn!(mismatches = mismatches.len(), "integrity ledger mismatch");
        }
        Ok(mismatches)
    }

    /// Whether `file` is the source of a rename whose target already exists.
    fn moved_away(&self, dir: &Path, file: &str) -> bool {
        self.pending.iter().any(|(target, entry)| {
            entry.replaces.as_deref() == Some(file) && dir.join(target).exists()
        })
    }
}

/// Write a protected file and record its digest in the session's ledger.
pub fn write_protected(session_dir: &Path, file: &str, contents: &[u8]) -> Result<()> {
    let ledger_path = session_dir.join(LEDGER_FILE);
    let mut ledger = IntegrityLedger::load(&ledger_path)?;
    ledger.settle(session_dir)?;
    ledger.stage(file, sha256_hex(contents), None);
    ledger.save(&ledger_path)?;
    write_atomic(&session_dir.join(file), contents)?;
    ledger.commit(file);
    ledger.save(&ledger_path)
}

pub const LEDGER_FILE: &str = "integrity.json";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_external_edit_and_removal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path();
        write_protected(dir, "round-1-prompt.md", b"do the thing").expect("write");
        write_protected(dir, "goal-tracker.md", b"# Goal").expect("write");

        let ledger = IntegrityLedger::load(&dir.join(LEDGER_FILE)).expect("load");
        assert!(ledger.verify(dir).expect("verify").is_empty());

        fs::write(dir.join("round-1-prompt.md"), "do something else").expect("tamper");
        fs::remove_file(dir.join("goal-tracker.md")).expect("remove");
        let mismatches = ledger.verify(dir).expect("verify");
        let files: Vec<_> = mismatches.iter().map(|m| m.file.as_str()).collect();
        assert_eq!(files, vec!["goal-tracker.md", "round-1-prompt.md"]);
    }

    #[test]
    fn write_interrupted_before_commit_still_verifies() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path();
        let ledger_path = dir.join(LEDGER_FILE);
        write_protected(dir, "goal-tracker.md", b"round 0").expect("write");

        // Pending digest saved, file replaced, commit never happens.
        let mut ledger = IntegrityLedger::load(&ledger_path).expect("load");
        ledger.stage("goal-tracker.md", sha256_hex(b"round 1"), None);
        ledger.save(&ledger_path).expect("save");
        write_atomic(&dir.join("goal-tracker.md"), b"round 1").expect("write");

        let ledger = IntegrityLedger::load(&ledger_path).expect("load");
        assert!(ledger.verify(dir).expect("verify").is_empty());

        write_protected(dir, "round-1-prompt.md", b"next").expect("write");
        let ledger = IntegrityLedger::load(&ledger_path).expect("load");
        assert!(ledger.pending.is_empty());
        assert_eq!(ledger.files["goal-tracker.md"], sha256_hex(b"round 1"));
        assert!(ledger.verify(dir).expect("verify").is_empty());
    }

    #[test]
    fn pending_digest_does_not_excuse_other_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path();
        let ledger_path = dir.join(LEDGER_FILE);
        write_protected(dir, "goal-tracker.md", b"round 0").expect("write");
        let mut ledger = IntegrityLedger::load(&ledger_path).expect("load");
        ledger.stage("goal-tracker.md", sha256_hex(b"round 1"), None);
        ledger.save(&ledger_path).expect("save");

        fs::write(dir.join("goal-tracker.md"), "approved by me").expect("tamper");
        let mismatches = IntegrityLedger::load(&ledger_path)
            .expect("load")
            .verify(dir)
            .expect("verify");
        assert_eq!(mismatches.len(), 1);

        let mut ledger = IntegrityLedger::load(&ledger_path).expect("load");
        ledger.settle(dir).expect("settle");
        assert!(ledger.pending.is_empty());
        assert_eq!(ledger.files["goal-tracker.md"], sha256_hex(b"round 0"));
    }

    #[test]
    fn missing_ledger_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = IntegrityLedger::load(&temp.path().join(LEDGER_FILE)).expect("load");
        assert!(ledger.files.is_empty());
    }

    #[test]
    fn digest_is_stable() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
