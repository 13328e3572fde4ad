//! Execution trace store: which mutants can each test possibly reach.
//!
//! Traces are produced by a dynamic-instrumentation run of the suite and
//! consumed here as-is. The store is read-only and may be incomplete; a test
//! with no traced mutants contributes no work.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::HarnessError;
use crate::registry::MutantKey;

/// One test case, identified solely by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestCase {
    pub name: String,
}

impl TestCase {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// On-disk trace document: one JSON file per test.
#[derive(Debug, Serialize, Deserialize)]
struct TraceDocument {
    test: String,
    #[serde(default)]
    mutants: Vec<MutantKey>,
}

/// Read-only map from test name to the set of mutants it can reach.
#[derive(Debug, Default)]
pub struct TraceStore {
    traces: HashMap<String, HashSet<MutantKey>>,
}

impl TraceStore {
    /// Load every `*.json` trace document under `root`.
    ///
    /// Multiple documents for the same test are merged (union). An
    /// unparsable document is a configuration error, not something to skip.
    pub fn load(root: &Path) -> Result<Self, HarnessError> {
        let mut traces: HashMap<String, HashSet<MutantKey>> = HashMap::new();

        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| HarnessError::TraceFormat {
                path: root.to_path_buf(),
                message: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let contents =
                std::fs::read_to_string(entry.path()).map_err(|e| HarnessError::TraceFormat {
                    path: entry.path().to_path_buf(),
                    message: format!("failed to read: {e}"),
                })?;
            let doc: TraceDocument =
                serde_json::from_str(&contents).map_err(|e| HarnessError::TraceFormat {
                    path: entry.path().to_path_buf(),
                    message: e.to_string(),
                })?;

            if doc.mutants.is_empty() {
                tracing::debug!("Trace for '{}' reaches no mutants", doc.test);
            }
            traces.entry(doc.test).or_default().extend(doc.mutants);
        }

        tracing::info!("Loaded {} execution trace(s) from {}", traces.len(), root.display());
        Ok(Self { traces })
    }

    /// Build a store directly from in-memory traces.
    pub fn from_traces(traces: HashMap<String, HashSet<MutantKey>>) -> Self {
        Self { traces }
    }

    /// Mutants reachable by the given test, if a trace exists for it.
    pub fn mutants_for(&self, test: &TestCase) -> Option<&HashSet<MutantKey>> {
        self.traces.get(&test.name)
    }

    /// Union of all traced mutant keys: the initial live set.
    pub fn traced_keys(&self) -> HashSet<MutantKey> {
        self.traces.values().flatten().cloned().collect()
    }

    /// Iterate over (test name, traced mutants) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &HashSet<MutantKey>)> {
        self.traces.iter()
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }
}

/// Load the passing-tests list: newline-delimited test names, pre-sorted
/// ascending by duration by the producer. The order is trusted, not
/// re-sorted; cheap tests get attempted first.
pub fn load_passing_tests(path: &Path) -> Result<Vec<TestCase>, HarnessError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(TestCase::new)
        .collect())
}
