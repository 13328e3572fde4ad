//! Result aggregation and the final report.
//!
//! Every registry mutant ends in exactly one terminal status, and the counts
//! must sum to the registry's mutant total. The mapping from raw run outcomes
//! to mutant statuses lives here so it stays centralized.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::HarnessError;
use crate::executor::RunOutcome;
use crate::registry::{MutantKey, ProjectRegistry};

/// Terminal status of a mutant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutantStatus {
    /// Present in the registry but absent from every trace; unreachable by
    /// any known test. Never entered by the scheduler itself.
    Uncovered,
    /// Covered, but no executed test detected it.
    Survived,
    /// A test failed with the mutant active.
    Killed,
    /// A test exceeded its derived timeout with the mutant active.
    Timeout,
    /// Resolved without a fresh evaluation and never attributed to a kill.
    Skipped,
}

impl std::fmt::Display for MutantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uncovered => write!(f, "uncovered"),
            Self::Survived => write!(f, "survived"),
            Self::Killed => write!(f, "killed"),
            Self::Timeout => write!(f, "timeout"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// The one place a raw invocation outcome becomes a mutant status. Total and
/// deterministic: a failed or timed-out run under an active mutant means the
/// mutant was detected.
pub fn status_for_outcome(outcome: RunOutcome) -> MutantStatus {
    match outcome {
        RunOutcome::Failed => MutantStatus::Killed,
        RunOutcome::Timeout => MutantStatus::Timeout,
        RunOutcome::Success => MutantStatus::Survived,
        RunOutcome::Skipped => MutantStatus::Skipped,
    }
}

/// Accumulated resolution state at the end of a run (or rebuilt from
/// checkpoints).
#[derive(Debug, Default)]
pub struct Resolution {
    /// Mutant -> name of the test whose failure killed it.
    pub killed: HashMap<MutantKey, String>,
    /// Mutant -> name of the test that timed out on it.
    pub timed_out: HashMap<MutantKey, String>,
    /// Mutants resolved on disk but never attributed to a kill in memory.
    pub skipped: HashSet<MutantKey>,
    /// Tests whose baseline failed or timed out; their traced mutants were
    /// not evaluated by them this run.
    pub unreliable_tests: Vec<String>,
}

/// Per-status counts in the final report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub uncovered: usize,
    pub survived: usize,
    pub killed: usize,
    pub timeout: usize,
    pub skipped: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.uncovered + self.survived + self.killed + self.timeout + self.skipped
    }
}

/// Final aggregate report: every registry mutant mapped to one status.
#[derive(Debug, Serialize, Deserialize)]
pub struct Report {
    pub generated_at: String,
    pub total_mutants: usize,
    pub counts: StatusCounts,
    /// Detected fraction of the covered population.
    pub mutation_score: f64,
    /// Mutant key (`group:number`) -> terminal status.
    pub mutants: BTreeMap<String, MutantStatus>,
    /// Mutant key -> killing test, for detected mutants.
    pub killed_by: BTreeMap<String, String>,
    pub unreliable_tests: Vec<String>,
}

/// Classify every registry mutant into exactly one status.
///
/// Precedence: killed > timeout > skipped > survived (traced) > uncovered.
/// A total that disagrees with the registry count is an internal bug, not a
/// reporting detail, and fails hard.
pub fn aggregate(
    registry: &ProjectRegistry,
    traced: &HashSet<MutantKey>,
    resolution: &Resolution,
) -> Result<Report, HarnessError> {
    let mut counts = StatusCounts::default();
    let mut mutants = BTreeMap::new();
    let mut killed_by = BTreeMap::new();

    for key in registry.all_keys() {
        let status = if let Some(test) = resolution.killed.get(&key) {
            killed_by.insert(key.to_string(), test.clone());
            counts.killed += 1;
            MutantStatus::Killed
        } else if let Some(test) = resolution.timed_out.get(&key) {
            killed_by.insert(key.to_string(), test.clone());
            counts.timeout += 1;
            MutantStatus::Timeout
        } else if resolution.skipped.contains(&key) {
            counts.skipped += 1;
            MutantStatus::Skipped
        } else if traced.contains(&key) {
            counts.survived += 1;
            MutantStatus::Survived
        } else {
            counts.uncovered += 1;
            MutantStatus::Uncovered
        };
        mutants.insert(key.to_string(), status);
    }

    let total_mutants = registry.mutant_count();
    if counts.total() != total_mutants {
        return Err(HarnessError::Internal(format!(
            "classified {} mutants but the registry holds {}",
            counts.total(),
            total_mutants
        )));
    }

    let covered = total_mutants - counts.uncovered;
    let detected = counts.killed + counts.timeout;
    let mutation_score = if covered == 0 {
        0.0
    } else {
        detected as f64 / covered as f64
    };

    Ok(Report {
        generated_at: chrono::Utc::now().to_rfc3339(),
        total_mutants,
        counts,
        mutation_score,
        mutants,
        killed_by,
        unreliable_tests: resolution.unreliable_tests.clone(),
    })
}

/// Persist the report as pretty-printed JSON.
pub fn write_report(report: &Report, path: &Path) -> Result<(), HarnessError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| HarnessError::Internal(format!("failed to serialize report: {e}")))?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FileRegistry;
    use std::collections::BTreeMap;

    fn registry(entries: &[(&str, &[u32])]) -> ProjectRegistry {
        let files: BTreeMap<String, FileRegistry> = entries
            .iter()
            .enumerate()
            .map(|(i, (group, numbers))| {
                (
                    format!("src/file{i}.c"),
                    FileRegistry {
                        group: group.to_string(),
                        mutants: numbers
                            .iter()
                            .map(|n| {
                                (
                                    *n,
                                    crate::registry::MutantMeta {
                                        original_op: "a".into(),
                                        mutant_op: "b".into(),
                                        span: String::new(),
                                        location: String::new(),
                                    },
                                )
                            })
                            .collect(),
                    },
                )
            })
            .collect();
        ProjectRegistry::from_files(files).unwrap()
    }

    // =========================================================================
    // Outcome mapping tests
    // =========================================================================

    #[test]
    fn test_outcome_mapping_is_total() {
        assert_eq!(status_for_outcome(RunOutcome::Failed), MutantStatus::Killed);
        assert_eq!(status_for_outcome(RunOutcome::Timeout), MutantStatus::Timeout);
        assert_eq!(status_for_outcome(RunOutcome::Success), MutantStatus::Survived);
        assert_eq!(status_for_outcome(RunOutcome::Skipped), MutantStatus::Skipped);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(MutantStatus::Killed.to_string(), "killed");
        assert_eq!(MutantStatus::Uncovered.to_string(), "uncovered");
    }

    // =========================================================================
    // Aggregation tests
    // =========================================================================

    #[test]
    fn test_aggregate_assigns_exactly_one_status() {
        let reg = registry(&[("F", &[1, 2, 3]), ("G", &[1])]);
        let traced: HashSet<MutantKey> = [
            MutantKey::new("F", 1),
            MutantKey::new("F", 2),
            MutantKey::new("F", 3),
        ]
        .into_iter()
        .collect();
        let mut resolution = Resolution::default();
        resolution
            .killed
            .insert(MutantKey::new("F", 2), "t1".to_string());
        resolution
            .timed_out
            .insert(MutantKey::new("F", 3), "t2".to_string());

        let report = aggregate(&reg, &traced, &resolution).unwrap();
        assert_eq!(report.total_mutants, 4);
        assert_eq!(report.counts.total(), 4);
        assert_eq!(report.mutants["F:1"], MutantStatus::Survived);
        assert_eq!(report.mutants["F:2"], MutantStatus::Killed);
        assert_eq!(report.mutants["F:3"], MutantStatus::Timeout);
        assert_eq!(report.mutants["G:1"], MutantStatus::Uncovered);
        assert_eq!(report.killed_by["F:2"], "t1");
    }

    #[test]
    fn test_aggregate_kill_wins_over_skip() {
        let reg = registry(&[("F", &[1])]);
        let traced: HashSet<MutantKey> = [MutantKey::new("F", 1)].into_iter().collect();
        let mut resolution = Resolution::default();
        resolution
            .killed
            .insert(MutantKey::new("F", 1), "t1".to_string());
        resolution.skipped.insert(MutantKey::new("F", 1));

        let report = aggregate(&reg, &traced, &resolution).unwrap();
        assert_eq!(report.mutants["F:1"], MutantStatus::Killed);
        assert_eq!(report.counts.skipped, 0);
    }

    #[test]
    fn test_mutation_score() {
        let reg = registry(&[("F", &[1, 2]), ("G", &[1, 2])]);
        let traced: HashSet<MutantKey> = [MutantKey::new("F", 1), MutantKey::new("F", 2)]
            .into_iter()
            .collect();
        let mut resolution = Resolution::default();
        resolution
            .killed
            .insert(MutantKey::new("F", 1), "t1".to_string());

        let report = aggregate(&reg, &traced, &resolution).unwrap();
        // 1 detected out of 2 covered; the 2 uncovered don't count.
        assert!((report.mutation_score - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_mutation_score_no_coverage() {
        let reg = registry(&[("F", &[1])]);
        let report = aggregate(&reg, &HashSet::new(), &Resolution::default()).unwrap();
        assert_eq!(report.mutation_score, 0.0);
        assert_eq!(report.counts.uncovered, 1);
    }

    #[test]
    fn test_write_report_roundtrip() {
        let reg = registry(&[("F", &[1])]);
        let report = aggregate(&reg, &HashSet::new(), &Resolution::default()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("report.json");
        write_report(&report, &path).unwrap();

        let back: Report =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.total_mutants, 1);
        assert_eq!(back.mutants["F:1"], MutantStatus::Uncovered);
    }
}
