//! Engine-level error types.
//!
//! Configuration and consistency failures get their own variants so the CLI
//! can tell "your inputs disagree" apart from "the engine has a bug". Raw
//! per-attempt test outcomes are never errors; they are the primary signal.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the scheduling engine and its loaders.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A mutation registry document could not be parsed or is incomplete.
    #[error("malformed mutation registry {path}: {message}")]
    RegistryFormat { path: PathBuf, message: String },

    /// Two independently supplied registries disagree. Mixing registries
    /// produced under different mutant-reduction settings would silently
    /// misattribute mutants, so this aborts before any test runs.
    #[error("registry mismatch: {0}")]
    RegistryMismatch(String),

    /// An execution trace document could not be parsed.
    #[error("malformed trace document {path}: {message}")]
    TraceFormat { path: PathBuf, message: String },

    /// A trace references a mutant that does not exist in the registry.
    /// Treated as an upstream defect, not recovered.
    #[error("trace for test '{test}' references unknown mutant {mutant}")]
    InconsistentTrace { test: String, mutant: String },

    /// A mutant key string did not have the `group:number` shape.
    #[error("malformed mutant key '{0}'")]
    MalformedKey(String),

    /// Bookkeeping invariant violated (e.g. a test's resolved-mutant count
    /// does not match its covered-mutant count). Fatal at detection.
    #[error("internal consistency error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
