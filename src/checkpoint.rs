//! Filesystem checkpoints: the durable side of the scheduler's state.
//!
//! Directory existence is the locking primitive. A per-test claim directory
//! means "this test was started"; a per-mutant kill directory means "this
//! mutant is dead everywhere". Both survive process restarts, so a fresh run
//! rebuilds equivalent in-memory state by re-reading them. Single-host only:
//! a distributed deployment would need a real compare-and-set store here.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::HarnessError;
use crate::registry::MutantKey;
use crate::report::MutantStatus;

const TESTS_DIR: &str = "tests";
const MUTANTS_DIR: &str = "mutants";
const SUMMARY_FILE: &str = "test-summary.json";
const FAILED_FILE: &str = "test-failed.json";
const KILL_FILE: &str = "kill.json";

/// Per-test completion record: the mutant lists this test's processing
/// produced, as `group:number` strings via [`MutantKey`]'s serde form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSummary {
    pub test: String,
    pub killed: Vec<MutantKey>,
    pub survived: Vec<MutantKey>,
    pub skipped: Vec<MutantKey>,
    pub covered: Vec<MutantKey>,
}

/// Record of an unreliable baseline: the test failed or timed out without
/// any mutant active, so none of its mutants were evaluated by it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestFailed {
    pub test: String,
    pub outcome: String,
    pub elapsed_ms: u64,
}

/// Durable "this mutant is dead" record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillRecord {
    pub mutant: MutantKey,
    pub killed_by_test: String,
    pub kill_status: MutantStatus,
}

/// Result of attempting to claim a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This worker owns the test now.
    Claimed,
    /// A summary or failed record already exists; nothing left to do.
    AlreadyDone,
}

/// Handle to the checkpoint root.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the tests/ and mutants/ subtrees. Called once before
    /// execution; dry runs never call it.
    pub fn ensure_layout(&self) -> Result<(), HarnessError> {
        std::fs::create_dir_all(self.root.join(TESTS_DIR))?;
        std::fs::create_dir_all(self.root.join(MUTANTS_DIR))?;
        Ok(())
    }

    fn test_dir(&self, test: &str) -> PathBuf {
        self.root.join(TESTS_DIR).join(test_dir_name(test))
    }

    fn mutant_dir(&self, key: &MutantKey) -> PathBuf {
        self.root
            .join(MUTANTS_DIR)
            .join(format!("{}_{}", sanitize(&key.group), key.number))
    }

    /// Atomically claim a test via directory creation.
    ///
    /// An existing directory that holds a summary or failed record means the
    /// test is finished (this run or a prior one). An existing directory
    /// with neither record is a crash leftover from a run that died
    /// mid-test; it is re-claimed, trading duplicate work for completeness.
    pub fn claim_test(&self, test: &str) -> Result<ClaimOutcome, HarnessError> {
        let dir = self.test_dir(test);
        match std::fs::create_dir(&dir) {
            Ok(()) => Ok(ClaimOutcome::Claimed),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if dir.join(SUMMARY_FILE).exists() || dir.join(FAILED_FILE).exists() {
                    Ok(ClaimOutcome::AlreadyDone)
                } else {
                    Ok(ClaimOutcome::Claimed)
                }
            }
            Err(e) => Err(HarnessError::Io(e)),
        }
    }

    pub fn record_test_summary(&self, summary: &TestSummary) -> Result<(), HarnessError> {
        write_json(&self.test_dir(&summary.test).join(SUMMARY_FILE), summary)
    }

    pub fn record_test_failed(&self, failed: &TestFailed) -> Result<(), HarnessError> {
        write_json(&self.test_dir(&failed.test).join(FAILED_FILE), failed)
    }

    pub fn read_test_summary(&self, test: &str) -> Option<TestSummary> {
        read_json(&self.test_dir(test).join(SUMMARY_FILE))
    }

    /// Whether a kill record exists for this mutant (existence = globally
    /// dead, valid across process restarts).
    pub fn is_mutant_dead(&self, key: &MutantKey) -> bool {
        self.mutant_dir(key).exists()
    }

    /// Persist a kill record. Returns `false` when another worker (or a
    /// prior run) already created one; the first resolver wins and the
    /// existing record is left untouched.
    pub fn record_kill(&self, record: &KillRecord) -> Result<bool, HarnessError> {
        let dir = self.mutant_dir(&record.mutant);
        match std::fs::create_dir(&dir) {
            Ok(()) => {
                write_json(&dir.join(KILL_FILE), record)?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(HarnessError::Io(e)),
        }
    }

    pub fn read_kill_record(&self, key: &MutantKey) -> Option<KillRecord> {
        read_json(&self.mutant_dir(key).join(KILL_FILE))
    }

    /// Scan every persisted kill record, for rebuilding in-memory state on
    /// startup. A kill directory whose record is missing or unreadable
    /// (crash between create_dir and write) yields `None` for that entry so
    /// the caller can still account for the mutant.
    pub fn load_kill_records(&self) -> Result<Vec<(MutantKey, Option<KillRecord>)>, HarnessError> {
        let dir = self.root.join(MUTANTS_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let record: Option<KillRecord> = read_json(&entry.path().join(KILL_FILE));
            let key = match &record {
                Some(r) => r.mutant.clone(),
                // Recover the key from the directory name. Groups may
                // contain '_', the trailing segment is the number.
                None => {
                    let name = entry.file_name().to_string_lossy().to_string();
                    match parse_mutant_dir_name(&name) {
                        Some(key) => key,
                        None => {
                            tracing::warn!("Ignoring unrecognized kill directory '{}'", name);
                            continue;
                        }
                    }
                }
            };
            records.push((key, record));
        }
        Ok(records)
    }

    /// Scan every persisted test-failed record, for rebuilding the
    /// unreliable set on startup. Summaries and recordless claim leftovers
    /// are not failed tests and are skipped.
    pub fn load_failed_tests(&self) -> Result<Vec<TestFailed>, HarnessError> {
        let dir = self.root.join(TESTS_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut failed = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(record) = read_json::<TestFailed>(&entry.path().join(FAILED_FILE)) {
                failed.push(record);
            }
        }
        Ok(failed)
    }
}

/// Directory name for a test: the sanitized name plus a short digest of the
/// raw name. Distinct names that sanitize identically (`a/b` vs `a_b`) must
/// not share a claim directory.
fn test_dir_name(test: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(test.as_bytes()));
    format!("{}-{}", sanitize(test), &digest[..8])
}

fn parse_mutant_dir_name(name: &str) -> Option<MutantKey> {
    let (group, number) = name.rsplit_once('_')?;
    if group.is_empty() {
        return None;
    }
    Some(MutantKey::new(group, number.parse().ok()?))
}

/// Replace anything outside `[A-Za-z0-9_-]` so test names are safe as
/// directory names.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), HarnessError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| HarnessError::Internal(format!("failed to serialize checkpoint: {e}")))?;
    std::fs::write(path, json)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, CheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.ensure_layout().unwrap();
        (dir, store)
    }

    // =========================================================================
    // Test claiming
    // =========================================================================

    #[test]
    fn test_claim_then_reclaim_without_record() {
        let (_dir, store) = store();
        assert_eq!(store.claim_test("t1").unwrap(), ClaimOutcome::Claimed);
        // No record written: a crash leftover, so claimable again.
        assert_eq!(store.claim_test("t1").unwrap(), ClaimOutcome::Claimed);
    }

    #[test]
    fn test_claim_after_summary_is_done() {
        let (_dir, store) = store();
        assert_eq!(store.claim_test("t1").unwrap(), ClaimOutcome::Claimed);
        store
            .record_test_summary(&TestSummary {
                test: "t1".to_string(),
                killed: vec![MutantKey::new("F", 2)],
                survived: vec![MutantKey::new("F", 1)],
                skipped: Vec::new(),
                covered: vec![MutantKey::new("F", 1), MutantKey::new("F", 2)],
            })
            .unwrap();
        assert_eq!(store.claim_test("t1").unwrap(), ClaimOutcome::AlreadyDone);

        let summary = store.read_test_summary("t1").unwrap();
        assert_eq!(summary.killed, vec![MutantKey::new("F", 2)]);
    }

    #[test]
    fn test_claim_after_failed_record_is_done() {
        let (_dir, store) = store();
        assert_eq!(store.claim_test("t1").unwrap(), ClaimOutcome::Claimed);
        store
            .record_test_failed(&TestFailed {
                test: "t1".to_string(),
                outcome: "failed".to_string(),
                elapsed_ms: 12,
            })
            .unwrap();
        assert_eq!(store.claim_test("t1").unwrap(), ClaimOutcome::AlreadyDone);
    }

    #[test]
    fn test_claim_sanitizes_names() {
        let (_dir, store) = store();
        assert_eq!(
            store.claim_test("suite/case with spaces").unwrap(),
            ClaimOutcome::Claimed
        );
        // Same sanitized directory.
        store
            .record_test_failed(&TestFailed {
                test: "suite/case with spaces".to_string(),
                outcome: "failed".to_string(),
                elapsed_ms: 0,
            })
            .unwrap();
        assert_eq!(
            store.claim_test("suite/case with spaces").unwrap(),
            ClaimOutcome::AlreadyDone
        );
    }

    #[test]
    fn test_distinct_names_with_same_sanitized_form_do_not_collide() {
        let (_dir, store) = store();
        // Both sanitize to "a_b"; the digest suffix keeps them apart.
        assert_eq!(store.claim_test("a/b").unwrap(), ClaimOutcome::Claimed);
        store
            .record_test_failed(&TestFailed {
                test: "a/b".to_string(),
                outcome: "failed".to_string(),
                elapsed_ms: 0,
            })
            .unwrap();

        assert_eq!(store.claim_test("a_b").unwrap(), ClaimOutcome::Claimed);
        assert_eq!(store.claim_test("a/b").unwrap(), ClaimOutcome::AlreadyDone);
    }

    #[test]
    fn test_load_failed_tests() {
        let (_dir, store) = store();
        store.claim_test("t1").unwrap();
        store
            .record_test_failed(&TestFailed {
                test: "t1".to_string(),
                outcome: "failed".to_string(),
                elapsed_ms: 10,
            })
            .unwrap();
        // A completed test contributes nothing to the failed scan.
        store.claim_test("t2").unwrap();
        store
            .record_test_summary(&TestSummary {
                test: "t2".to_string(),
                killed: Vec::new(),
                survived: Vec::new(),
                skipped: Vec::new(),
                covered: Vec::new(),
            })
            .unwrap();

        let failed = store.load_failed_tests().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].test, "t1");
        assert_eq!(failed[0].outcome, "failed");
    }

    #[test]
    fn test_load_failed_tests_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("never-created"));
        assert!(store.load_failed_tests().unwrap().is_empty());
    }

    // =========================================================================
    // Kill records
    // =========================================================================

    #[test]
    fn test_first_kill_wins() {
        let (_dir, store) = store();
        let key = MutantKey::new("F", 2);
        assert!(!store.is_mutant_dead(&key));

        let first = KillRecord {
            mutant: key.clone(),
            killed_by_test: "t1".to_string(),
            kill_status: MutantStatus::Killed,
        };
        assert!(store.record_kill(&first).unwrap());
        assert!(store.is_mutant_dead(&key));

        let second = KillRecord {
            mutant: key.clone(),
            killed_by_test: "t2".to_string(),
            kill_status: MutantStatus::Timeout,
        };
        assert!(!store.record_kill(&second).unwrap());

        let record = store.read_kill_record(&key).unwrap();
        assert_eq!(record.killed_by_test, "t1");
        assert_eq!(record.kill_status, MutantStatus::Killed);
    }

    #[test]
    fn test_load_kill_records() {
        let (_dir, store) = store();
        store
            .record_kill(&KillRecord {
                mutant: MutantKey::new("F", 1),
                killed_by_test: "t1".to_string(),
                kill_status: MutantStatus::Killed,
            })
            .unwrap();
        store
            .record_kill(&KillRecord {
                mutant: MutantKey::new("GROUP_B", 3),
                killed_by_test: "t2".to_string(),
                kill_status: MutantStatus::Timeout,
            })
            .unwrap();

        let mut records = store.load_kill_records().unwrap();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, MutantKey::new("F", 1));
        assert_eq!(
            records[1].1.as_ref().unwrap().kill_status,
            MutantStatus::Timeout
        );
    }

    #[test]
    fn test_load_kill_records_recovers_key_from_dir_name() {
        let (dir, store) = store();
        // Simulate a crash between create_dir and the record write: the
        // directory exists, kill.json does not. Group contains '_'.
        std::fs::create_dir(dir.path().join("mutants").join("GROUP_B_7")).unwrap();

        let records = store.load_kill_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, MutantKey::new("GROUP_B", 7));
        assert!(records[0].1.is_none());
    }

    #[test]
    fn test_load_kill_records_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("never-created"));
        assert!(store.load_kill_records().unwrap().is_empty());
    }
}
