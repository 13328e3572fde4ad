//! Application configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Input and output locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// External test runner invocation
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Concurrency and timeout limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Plain mutation registry document
    #[serde(default = "default_registry")]
    pub registry: PathBuf,

    /// Registry baked into the trace-producing build; must reconcile with
    /// the plain one before any test runs
    #[serde(default = "default_tracer_registry")]
    pub tracer_registry: PathBuf,

    /// Root directory of per-test execution trace documents
    #[serde(default = "default_traces_dir")]
    pub traces_dir: PathBuf,

    /// Newline-delimited passing-tests list, pre-sorted by duration
    #[serde(default = "default_passing_tests")]
    pub passing_tests: PathBuf,

    /// Checkpoint root (claims, summaries, kill records)
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Final aggregate report
    #[serde(default = "default_report")]
    pub report: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Program to invoke once per test attempt
    #[serde(default = "default_runner_command")]
    pub command: String,

    /// Fixed arguments passed before the test-name filter
    #[serde(default)]
    pub args: Vec<String>,

    /// Optional run-settings file forwarded to the runner
    #[serde(default)]
    pub run_settings: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Number of concurrent test workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Fixed timeout for unmutated baseline runs (seconds)
    #[serde(default = "default_baseline_timeout")]
    pub baseline_timeout_secs: u64,

    /// Lower bound for derived per-mutant timeouts (seconds)
    #[serde(default = "default_timeout_floor")]
    pub timeout_floor_secs: u64,

    /// Baseline-elapsed multiplier for derived timeouts
    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: u32,
}

impl LimitsConfig {
    pub fn baseline_timeout(&self) -> Duration {
        Duration::from_secs(self.baseline_timeout_secs)
    }

    /// Per-mutant timeout derived from a test's baseline duration:
    /// `max(floor, baseline * multiplier)`. Tolerates mutants that introduce
    /// slowdowns or infinite loops without starving fast tests.
    pub fn derived_timeout(&self, baseline: Duration) -> Duration {
        let floor = Duration::from_secs(self.timeout_floor_secs);
        (baseline * self.timeout_multiplier).max(floor)
    }
}

// Default value functions
fn default_registry() -> PathBuf {
    PathBuf::from("mutants.json")
}

fn default_tracer_registry() -> PathBuf {
    PathBuf::from("tracer-mutants.json")
}

fn default_traces_dir() -> PathBuf {
    PathBuf::from("traces")
}

fn default_passing_tests() -> PathBuf {
    PathBuf::from("passing-tests.txt")
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".mutrace")
}

fn default_report() -> PathBuf {
    PathBuf::from("mutrace-report.json")
}

fn default_runner_command() -> String {
    "./run-test.sh".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_baseline_timeout() -> u64 {
    300 // 5 minutes
}

fn default_timeout_floor() -> u64 {
    60
}

fn default_timeout_multiplier() -> u32 {
    3
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            tracer_registry: default_tracer_registry(),
            traces_dir: default_traces_dir(),
            passing_tests: default_passing_tests(),
            checkpoint_dir: default_checkpoint_dir(),
            report: default_report(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: default_runner_command(),
            args: Vec::new(),
            run_settings: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            baseline_timeout_secs: default_baseline_timeout(),
            timeout_floor_secs: default_timeout_floor(),
            timeout_multiplier: default_timeout_multiplier(),
        }
    }
}

impl Config {
    /// Load configuration from file, or use defaults if not found
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = if let Some(path) = path {
            if path.exists() {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config from {:?}", path))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config from {:?}", path))?
            } else {
                Config::default()
            }
        } else {
            Config::default()
        };

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Derived timeout tests
    // =========================================================================

    #[test]
    fn test_derived_timeout_floor() {
        let limits = LimitsConfig::default();
        // A 2s baseline tripled is still under the 60s floor.
        assert_eq!(
            limits.derived_timeout(Duration::from_secs(2)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_derived_timeout_above_floor() {
        let limits = LimitsConfig::default();
        assert_eq!(
            limits.derived_timeout(Duration::from_secs(30)),
            Duration::from_secs(90)
        );
    }

    #[test]
    fn test_derived_timeout_exactly_at_floor() {
        let limits = LimitsConfig::default();
        assert_eq!(
            limits.derived_timeout(Duration::from_secs(20)),
            Duration::from_secs(60)
        );
    }

    // =========================================================================
    // Config parsing tests
    // =========================================================================

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.limits.workers, 4);
        assert_eq!(config.limits.timeout_floor_secs, 60);
        assert_eq!(config.limits.timeout_multiplier, 3);
        assert_eq!(config.paths.registry, PathBuf::from("mutants.json"));
        assert!(config.runner.run_settings.is_none());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[runner]
command = "ctest-wrapper"
args = ["--quiet"]

[limits]
workers = 8
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.runner.command, "ctest-wrapper");
        assert_eq!(config.runner.args, vec!["--quiet"]);
        assert_eq!(config.limits.workers, 8);
        // Defaults still apply elsewhere
        assert_eq!(config.limits.baseline_timeout_secs, 300);
        assert_eq!(config.paths.traces_dir, PathBuf::from("traces"));
    }

    #[test]
    fn test_parse_paths() {
        let toml = r#"
[paths]
registry = "build/mutants.json"
tracer_registry = "build/tracer.json"
checkpoint_dir = "/tmp/run"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.paths.registry, PathBuf::from("build/mutants.json"));
        assert_eq!(config.paths.checkpoint_dir, PathBuf::from("/tmp/run"));
        // Unset path keeps its default
        assert_eq!(config.paths.report, PathBuf::from("mutrace-report.json"));
    }

    // =========================================================================
    // File I/O tests
    // =========================================================================

    #[test]
    fn test_config_load_nonexistent() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        std::fs::remove_file(temp_file.path()).unwrap();

        let config = Config::load(Some(temp_file.path())).unwrap();
        assert_eq!(config.limits.workers, 4);
    }

    #[test]
    fn test_config_load_valid_file() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[limits]\nworkers = 2\n").unwrap();

        let config = Config::load(Some(temp_file.path())).unwrap();
        assert_eq!(config.limits.workers, 2);
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "invalid {{{{ toml").unwrap();

        assert!(Config::load(Some(temp_file.path())).is_err());
    }
}
