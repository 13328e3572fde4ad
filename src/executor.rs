//! Test case executor.
//!
//! Runs one external test process per attempt, optionally with one mutant
//! activated, under a timeout. Test runners commonly spawn children of their
//! own, so every attempt gets its own process group and a timeout kills the
//! whole group, not just the direct child.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;

use crate::config::RunnerConfig;
use crate::error::HarnessError;
use crate::registry::MutantKey;
use crate::trace::TestCase;

/// Raw outcome of a single test invocation. Translated into a mutant status
/// only when the invocation targeted a specific mutant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit code 0.
    Success,
    /// Any non-zero exit.
    Failed,
    /// The attempt exceeded its timeout and the process group was killed.
    Timeout,
    /// The attempt was not executed because its verdict was already known.
    Skipped,
}

/// One completed attempt: outcome plus wall-clock duration.
#[derive(Debug, Clone, Copy)]
pub struct Attempt {
    pub outcome: RunOutcome,
    pub elapsed: Duration,
}

/// Output markers that indicate the runner matched no test. Logged as a
/// warning for diagnostics; the attempt's exit code still decides the
/// outcome.
const NO_MATCH_MARKERS: &[&str] = &["No tests matched", "no tests ran", "0 tests run"];

/// Invokes the external test runner, one subprocess per attempt.
#[derive(Debug, Clone)]
pub struct TestRunner {
    command: String,
    args: Vec<String>,
    run_settings: Option<std::path::PathBuf>,
}

impl TestRunner {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            run_settings: config.run_settings.clone(),
        }
    }

    /// Run the unmutated baseline for a test.
    pub async fn run(&self, test: &TestCase, timeout: Duration) -> Result<Attempt, HarnessError> {
        self.attempt(test, None, timeout).await
    }

    /// Run a test with one mutant activated.
    pub async fn run_mutant(
        &self,
        test: &TestCase,
        mutant: &MutantKey,
        timeout: Duration,
    ) -> Result<Attempt, HarnessError> {
        self.attempt(test, Some(mutant), timeout).await
    }

    async fn attempt(
        &self,
        test: &TestCase,
        mutant: Option<&MutantKey>,
        timeout: Duration,
    ) -> Result<Attempt, HarnessError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        if let Some(settings) = &self.run_settings {
            cmd.arg("--run-settings").arg(settings);
        }
        cmd.arg(&test.name);
        if let Some(key) = mutant {
            // Activation contract: binding <group>=<number> switches the
            // mutant on inside the instrumented build. Unset (or 0) runs the
            // baseline.
            cmd.env(&key.group, key.number.to_string());
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let child = cmd.spawn()?;
        let pid = child.id();

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let elapsed = start.elapsed();
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                if NO_MATCH_MARKERS
                    .iter()
                    .any(|m| stdout.contains(m) || stderr.contains(m))
                {
                    tracing::warn!("Runner matched no test named '{}'", test.name);
                }

                let outcome = if output.status.success() {
                    RunOutcome::Success
                } else {
                    tracing::debug!(
                        "Test '{}' exited with {:?}{}",
                        test.name,
                        output.status.code(),
                        mutant
                            .map(|k| format!(" under mutant {k}"))
                            .unwrap_or_default()
                    );
                    RunOutcome::Failed
                };
                Ok(Attempt { outcome, elapsed })
            }
            Ok(Err(e)) => Err(HarnessError::Io(e)),
            Err(_) => {
                terminate_group(pid);
                tracing::debug!(
                    "Test '{}' timed out after {:?}{}",
                    test.name,
                    timeout,
                    mutant
                        .map(|k| format!(" under mutant {k}"))
                        .unwrap_or_default()
                );
                Ok(Attempt {
                    outcome: RunOutcome::Timeout,
                    elapsed: start.elapsed(),
                })
            }
        }
    }
}

/// Force-terminate an attempt's entire process group. The child was spawned
/// as its own group leader, so its pid is the group id.
#[cfg(unix)]
fn terminate_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return; // already reaped
    };
    match i32::try_from(pid) {
        Ok(pid) => {
            if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                // ESRCH means the group already exited between the timeout
                // and the kill.
                if e != nix::errno::Errno::ESRCH {
                    tracing::warn!("Failed to kill process group {}: {}", pid, e);
                }
            }
        }
        Err(_) => tracing::warn!("Process id {} out of range for group kill", pid),
    }
}

#[cfg(not(unix))]
fn terminate_group(_pid: Option<u32>) {}
