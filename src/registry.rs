//! Mutant identity and the mutation registry model.
//!
//! A registry is a read-only catalog of every mutant baked into the
//! instrumented build, grouped by source file. Each file's population shares
//! one group identifier, which doubles as the environment variable used to
//! activate a mutant at runtime.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::HarnessError;

/// Uniquely identifies one mutant: the group identifier of its source file's
/// population plus its number within that population.
///
/// Rendered and parsed as `group:number`, which is the form used in trace
/// documents, checkpoint records, and the final report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutantKey {
    pub group: String,
    pub number: u32,
}

impl MutantKey {
    pub fn new(group: impl Into<String>, number: u32) -> Self {
        Self {
            group: group.into(),
            number,
        }
    }
}

impl fmt::Display for MutantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.number)
    }
}

impl FromStr for MutantKey {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Group identifiers never contain ':', so the last separator is
        // unambiguous.
        let (group, number) = s
            .rsplit_once(':')
            .ok_or_else(|| HarnessError::MalformedKey(s.to_string()))?;
        if group.is_empty() {
            return Err(HarnessError::MalformedKey(s.to_string()));
        }
        let number = number
            .parse()
            .map_err(|_| HarnessError::MalformedKey(s.to_string()))?;
        Ok(Self::new(group, number))
    }
}

impl Serialize for MutantKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MutantKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(|_| {
            D::Error::custom(format!("malformed mutant key '{raw}', expected group:number"))
        })
    }
}

/// Metadata for one mutant within a file's population.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutantMeta {
    /// Kind of the original construct (e.g. `<`).
    pub original_op: String,
    /// Kind of the replacement (e.g. `<=`).
    pub mutant_op: String,
    /// Source span of the mutated construct.
    pub span: String,
    /// Human-readable location (e.g. `src/parser.c:120:8`).
    pub location: String,
}

/// All mutants of a single source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRegistry {
    /// Group identifier, also the activation environment variable name.
    pub group: String,
    /// Mutant number -> metadata. Numbers are unique within a file.
    pub mutants: BTreeMap<u32, MutantMeta>,
}

/// Project-level mutation registry: relative source path -> file registry.
///
/// Read-only once loaded. Group identifiers are unique project-wide.
#[derive(Debug, Clone)]
pub struct ProjectRegistry {
    files: BTreeMap<String, FileRegistry>,
    /// Group -> mutant numbers, for key lookups and reconciliation.
    groups: HashMap<String, BTreeSet<u32>>,
}

impl ProjectRegistry {
    /// Load a registry document from disk.
    ///
    /// Fails with [`HarnessError::RegistryFormat`] on unparsable or
    /// incomplete documents (empty group identifiers, empty mutant
    /// populations, duplicate groups across files).
    pub fn load(path: &Path) -> Result<Self, HarnessError> {
        let contents = std::fs::read_to_string(path).map_err(|e| HarnessError::RegistryFormat {
            path: path.to_path_buf(),
            message: format!("failed to read: {e}"),
        })?;
        let files: BTreeMap<String, FileRegistry> =
            serde_json::from_str(&contents).map_err(|e| HarnessError::RegistryFormat {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Self::from_files(files).map_err(|message| HarnessError::RegistryFormat {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Build a registry from already-parsed file entries, validating the
    /// identity invariants.
    pub fn from_files(files: BTreeMap<String, FileRegistry>) -> Result<Self, String> {
        let mut groups: HashMap<String, BTreeSet<u32>> = HashMap::new();
        for (source_path, file) in &files {
            if file.group.is_empty() {
                return Err(format!("file '{source_path}' has an empty group identifier"));
            }
            if file.mutants.is_empty() {
                return Err(format!("file '{source_path}' has no mutants"));
            }
            let numbers: BTreeSet<u32> = file.mutants.keys().copied().collect();
            if groups.insert(file.group.clone(), numbers).is_some() {
                return Err(format!(
                    "group identifier '{}' appears in more than one file",
                    file.group
                ));
            }
        }
        Ok(Self { files, groups })
    }

    /// Whether this exact mutant exists in the registry.
    pub fn contains(&self, key: &MutantKey) -> bool {
        self.groups
            .get(&key.group)
            .is_some_and(|numbers| numbers.contains(&key.number))
    }

    /// Every mutant key in the registry, in deterministic order.
    pub fn all_keys(&self) -> Vec<MutantKey> {
        let mut keys: Vec<MutantKey> = self
            .groups
            .iter()
            .flat_map(|(group, numbers)| {
                numbers.iter().map(|n| MutantKey::new(group.clone(), *n))
            })
            .collect();
        keys.sort();
        keys
    }

    /// Total number of mutants across all files.
    pub fn mutant_count(&self) -> usize {
        self.groups.values().map(|numbers| numbers.len()).sum()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Pre-flight equality check against an independently supplied registry
    /// (typically the one baked into the trace-producing build).
    ///
    /// This is a comparison, not a merge: group sets and per-group mutant
    /// numbers must match exactly, else [`HarnessError::RegistryMismatch`].
    pub fn reconcile(&self, other: &Self) -> Result<(), HarnessError> {
        for (group, numbers) in &self.groups {
            match other.groups.get(group) {
                None => {
                    return Err(HarnessError::RegistryMismatch(format!(
                        "group '{group}' is missing from the other registry"
                    )));
                }
                Some(other_numbers) if other_numbers != numbers => {
                    return Err(HarnessError::RegistryMismatch(format!(
                        "group '{group}' has {} mutants here but {} in the other registry",
                        numbers.len(),
                        other_numbers.len()
                    )));
                }
                Some(_) => {}
            }
        }
        for group in other.groups.keys() {
            if !self.groups.contains_key(group) {
                return Err(HarnessError::RegistryMismatch(format!(
                    "group '{group}' only exists in the other registry"
                )));
            }
        }
        Ok(())
    }
}
