//! The mutation test scheduler: the orchestrating state machine.
//!
//! A bounded pool of workers pulls test cases from a shared queue, cheapest
//! first. Different tests run concurrently; one test's mutant evaluations run
//! sequentially, because the program under test may hold shared state and two
//! concurrent activations of the same test binary risk cross-contamination.
//!
//! The in-memory live set and accumulators are redundant with the on-disk
//! checkpoints, which are authoritative: a fresh process rebuilds equivalent
//! state by re-reading traces and checkpoints.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;

use crate::checkpoint::{CheckpointStore, ClaimOutcome, KillRecord, TestFailed, TestSummary};
use crate::config::LimitsConfig;
use crate::error::HarnessError;
use crate::executor::{RunOutcome, TestRunner};
use crate::registry::{MutantKey, ProjectRegistry};
use crate::report::{self, status_for_outcome, MutantStatus, Report, Resolution};
use crate::trace::{TestCase, TraceStore};

/// Pre-flight scope counts, logged before execution and in dry runs.
#[derive(Debug, Clone, Copy)]
pub struct ScopeSummary {
    pub total_mutants: usize,
    pub covered: usize,
    pub uncovered: usize,
    pub unresolved: usize,
    pub traced_tests: usize,
}

/// Owns all shared mutable state of a run. Workers hold it by `Arc`; there
/// is no ambient or static state.
#[derive(Debug)]
pub struct Scheduler {
    registry: ProjectRegistry,
    traces: TraceStore,
    runner: TestRunner,
    checkpoints: CheckpointStore,
    limits: LimitsConfig,
    /// Union of all traced keys; immutable after construction.
    traced: HashSet<MutantKey>,
    /// Covered, still-unresolved mutants. Only shrinks.
    live: DashSet<MutantKey>,
    /// Mutant -> killing test. Only grows; first resolver wins.
    killed: DashMap<MutantKey, String>,
    /// Mutant -> test that timed out on it. Only grows.
    timed_out: DashMap<MutantKey, String>,
    /// Mutants dead on disk with no readable attribution.
    skipped: DashSet<MutantKey>,
    /// Tests whose baseline failed or timed out this run.
    unreliable: DashSet<String>,
}

impl Scheduler {
    /// Build a scheduler, eagerly enforcing construction-time invariants:
    /// every traced mutant must exist in the registry, registry mutants
    /// absent from every trace are warned about, and existing kill records
    /// are folded back into the in-memory state (crash recovery).
    pub fn new(
        registry: ProjectRegistry,
        traces: TraceStore,
        runner: TestRunner,
        checkpoints: CheckpointStore,
        limits: LimitsConfig,
    ) -> Result<Self, HarnessError> {
        for (test, keys) in traces.iter() {
            for key in keys {
                if !registry.contains(key) {
                    return Err(HarnessError::InconsistentTrace {
                        test: test.clone(),
                        mutant: key.to_string(),
                    });
                }
            }
        }

        if traces.is_empty() {
            tracing::warn!("No execution traces found; every mutant will end up uncovered");
        }

        let traced = traces.traced_keys();
        let uncovered = registry.mutant_count() - traced.len();
        if uncovered > 0 {
            tracing::warn!(
                "{} registry mutant(s) appear in no trace and are unreachable by any known test",
                uncovered
            );
        }

        let live = DashSet::new();
        for key in &traced {
            live.insert(key.clone());
        }

        let scheduler = Self {
            registry,
            traces,
            runner,
            checkpoints,
            limits,
            traced,
            live,
            killed: DashMap::new(),
            timed_out: DashMap::new(),
            skipped: DashSet::new(),
            unreliable: DashSet::new(),
        };

        let records = scheduler.checkpoints.load_kill_records()?;
        let preloaded = records.len();
        for (key, record) in records {
            if !scheduler.registry.contains(&key) {
                tracing::warn!("Ignoring kill record for unknown mutant {}", key);
                continue;
            }
            scheduler.resolve_from_record(&key, record);
        }
        if preloaded > 0 {
            tracing::info!("Restored {} kill record(s) from checkpoints", preloaded);
        }

        // Persisted failed-baseline records feed the unreliable set too, so
        // a resumed run's report still surfaces tests that never evaluated
        // their mutants.
        let failed = scheduler.checkpoints.load_failed_tests()?;
        if !failed.is_empty() {
            tracing::info!(
                "Restored {} failed-baseline record(s) from checkpoints",
                failed.len()
            );
        }
        for record in failed {
            scheduler.unreliable.insert(record.test);
        }

        Ok(scheduler)
    }

    /// Scope counts for logging and dry runs. Reads nothing and writes
    /// nothing beyond what construction already did.
    pub fn scope(&self) -> ScopeSummary {
        let total_mutants = self.registry.mutant_count();
        let covered = self.traced.len();
        ScopeSummary {
            total_mutants,
            covered,
            uncovered: total_mutants - covered,
            unresolved: self.live.len(),
            traced_tests: self.traces.len(),
        }
    }

    /// Execute the run: feed the passing-tests queue (already sorted
    /// cheapest-first by the producer) to a bounded worker pool and wait for
    /// every worker to drain.
    pub async fn run(self: Arc<Self>, tests: Vec<TestCase>) -> Result<(), HarnessError> {
        self.checkpoints.ensure_layout()?;

        let (tx, rx) = mpsc::channel::<TestCase>(100);
        let rx = Arc::new(TokioMutex::new(rx));

        let worker_count = self.limits.workers.max(1);
        let mut handles = Vec::new();
        for worker_id in 0..worker_count {
            let scheduler = Arc::clone(&self);
            let worker_rx = Arc::clone(&rx);
            handles.push(tokio::spawn(async move {
                test_worker(worker_id, scheduler, worker_rx).await
            }));
        }

        for test in tests {
            if tx.send(test).await.is_err() {
                break;
            }
        }
        drop(tx);

        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("Worker failed: {}", e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error =
                            Some(HarnessError::Internal(format!("worker task panicked: {e}")));
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Process one test end to end: claim, filter, baseline, then evaluate
    /// its still-unresolved mutants sequentially under a derived timeout.
    async fn process_test(&self, test: &TestCase) -> Result<(), HarnessError> {
        match self.checkpoints.claim_test(&test.name)? {
            ClaimOutcome::AlreadyDone => {
                tracing::debug!("Test '{}' already has a checkpoint record, skipping", test.name);
                return Ok(());
            }
            ClaimOutcome::Claimed => {}
        }

        let traced: Vec<MutantKey> = match self.traces.mutants_for(test) {
            Some(keys) if !keys.is_empty() => {
                let mut keys: Vec<MutantKey> = keys.iter().cloned().collect();
                keys.sort();
                keys
            }
            _ => {
                tracing::debug!("Test '{}' reaches no mutants", test.name);
                self.checkpoints.record_test_summary(&TestSummary {
                    test: test.name.clone(),
                    killed: Vec::new(),
                    survived: Vec::new(),
                    skipped: Vec::new(),
                    covered: Vec::new(),
                })?;
                return Ok(());
            }
        };

        // Mutants already resolved by other tests drop out of this test's
        // work list up front.
        let mut skipped_here = Vec::new();
        let mut work = Vec::new();
        for key in &traced {
            if self.live.contains(key) {
                work.push(key.clone());
            } else {
                skipped_here.push(key.clone());
            }
        }
        tracing::info!(
            "Test '{}': {} traced mutant(s), {} still unresolved",
            test.name,
            traced.len(),
            work.len()
        );

        let baseline = match self.runner.run(test, self.limits.baseline_timeout()).await {
            Ok(attempt) => attempt,
            Err(e) => {
                // Spawn failure: abandon this test's work, not the run. The
                // claim stays recordless, so a later run retries the test.
                tracing::warn!("Could not spawn baseline for '{}': {}", test.name, e);
                return Ok(());
            }
        };

        if baseline.outcome != RunOutcome::Success {
            tracing::warn!(
                "Baseline for '{}' ended {:?}; none of its mutants are evaluated by it this run",
                test.name,
                baseline.outcome
            );
            self.unreliable.insert(test.name.clone());
            self.checkpoints.record_test_failed(&TestFailed {
                test: test.name.clone(),
                outcome: match baseline.outcome {
                    RunOutcome::Timeout => "timeout".to_string(),
                    _ => "failed".to_string(),
                },
                elapsed_ms: baseline.elapsed.as_millis() as u64,
            })?;
            return Ok(());
        }

        let timeout = self.limits.derived_timeout(baseline.elapsed);
        tracing::debug!(
            "Test '{}': baseline took {:?}, per-mutant timeout {:?}",
            test.name,
            baseline.elapsed,
            timeout
        );

        let mut killed_here = Vec::new();
        let mut survived_here = Vec::new();
        for key in &work {
            // A kill record may have appeared since the filter ran, written
            // by a concurrent worker or a prior run.
            if self.checkpoints.is_mutant_dead(key) {
                self.resolve_from_disk(key);
                skipped_here.push(key.clone());
                continue;
            }

            let attempt = match self.runner.run_mutant(test, key, timeout).await {
                Ok(attempt) => attempt,
                Err(e) => {
                    tracing::warn!(
                        "Could not spawn '{}' under mutant {}: {}; abandoning this test's remaining work",
                        test.name,
                        key,
                        e
                    );
                    return Ok(());
                }
            };

            match attempt.outcome {
                RunOutcome::Failed | RunOutcome::Timeout => {
                    let status = status_for_outcome(attempt.outcome);
                    self.live.remove(key);
                    match status {
                        MutantStatus::Timeout => {
                            self.timed_out
                                .entry(key.clone())
                                .or_insert_with(|| test.name.clone());
                        }
                        _ => {
                            self.killed
                                .entry(key.clone())
                                .or_insert_with(|| test.name.clone());
                        }
                    }
                    self.checkpoints.record_kill(&KillRecord {
                        mutant: key.clone(),
                        killed_by_test: test.name.clone(),
                        kill_status: status,
                    })?;
                    killed_here.push(key.clone());
                    tracing::info!(
                        "Mutant {} {} by test '{}' ({} ms)",
                        key,
                        status,
                        test.name,
                        attempt.elapsed.as_millis()
                    );
                }
                RunOutcome::Success => {
                    // Survived this test; other tests may still catch it.
                    survived_here.push(key.clone());
                }
                RunOutcome::Skipped => {
                    self.live.remove(key);
                    self.skipped.insert(key.clone());
                    skipped_here.push(key.clone());
                }
            }
        }

        let resolved = killed_here.len() + survived_here.len() + skipped_here.len();
        if resolved != traced.len() {
            return Err(HarnessError::Internal(format!(
                "test '{}' covers {} mutants but resolved {}",
                test.name,
                traced.len(),
                resolved
            )));
        }

        self.checkpoints.record_test_summary(&TestSummary {
            test: test.name.clone(),
            killed: killed_here,
            survived: survived_here,
            skipped: skipped_here,
            covered: traced,
        })?;
        Ok(())
    }

    /// Fold an on-disk kill record into the in-memory state.
    fn resolve_from_disk(&self, key: &MutantKey) {
        let record = self.checkpoints.read_kill_record(key);
        self.resolve_from_record(key, record);
    }

    fn resolve_from_record(&self, key: &MutantKey, record: Option<KillRecord>) {
        self.live.remove(key);
        match record {
            Some(record) => match record.kill_status {
                MutantStatus::Timeout => {
                    self.timed_out
                        .entry(key.clone())
                        .or_insert(record.killed_by_test);
                }
                _ => {
                    self.killed
                        .entry(key.clone())
                        .or_insert(record.killed_by_test);
                }
            },
            // Dead on disk but unattributable (crash between claim and
            // record write).
            None => {
                self.skipped.insert(key.clone());
            }
        }
    }

    /// Snapshot the accumulated resolution state.
    pub fn resolution(&self) -> Resolution {
        let mut unreliable_tests: Vec<String> =
            self.unreliable.iter().map(|t| t.key().clone()).collect();
        unreliable_tests.sort();
        Resolution {
            killed: self
                .killed
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            timed_out: self
                .timed_out
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            skipped: self.skipped.iter().map(|k| k.key().clone()).collect(),
            unreliable_tests,
        }
    }

    /// Classify every registry mutant into its terminal status.
    pub fn aggregate(&self) -> Result<Report, HarnessError> {
        report::aggregate(&self.registry, &self.traced, &self.resolution())
    }
}

async fn test_worker(
    worker_id: usize,
    scheduler: Arc<Scheduler>,
    receiver: Arc<TokioMutex<mpsc::Receiver<TestCase>>>,
) -> Result<(), HarnessError> {
    loop {
        let test = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };

        let test = match test {
            Some(t) => t,
            None => {
                tracing::debug!("Worker {} finished - no more tests", worker_id);
                break;
            }
        };

        scheduler.process_test(&test).await?;
    }
    Ok(())
}
