//! Scheduler
//!
//! Distributes discovered test units across a bounded pool of concurrent
//! workers and aggregates their verdicts. The unit queue and the summary
//! accumulator are the only state shared between workers, both behind
//! locks; working directories and environments are per-unit. Aggregation
//! is a pure count, so the summary is identical for any execution
//! interleaving.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::RunConfig;
use crate::error::Error;
use crate::exec::Supervisor;
use crate::runner::{RunContext, TestUnit, UnitOutcome, Verdict, run_unit};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// One unit's entry in the summary.
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub path: PathBuf,
    pub verdict: Verdict,
    /// Captured output, present for failing verdicts.
    pub output: Option<String>,
}

/// Aggregated counts plus per-unit reports for a whole run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub pass: usize,
    pub fail: usize,
    pub expected_fail: usize,
    pub unexpected_pass: usize,
    pub unresolved: usize,
    pub skipped: usize,
    /// True when the run was cancelled; units still in flight at that
    /// point are not reported at all.
    pub cancelled: bool,
    pub reports: Vec<UnitReport>,
}

impl RunSummary {
    /// Fold one unit outcome into the counts. Addition commutes, so the
    /// summary does not depend on completion order.
    pub fn record(&mut self, path: PathBuf, outcome: &UnitOutcome) {
        match outcome.verdict {
            Verdict::Pass => self.pass += 1,
            Verdict::Fail => self.fail += 1,
            Verdict::ExpectedFail => self.expected_fail += 1,
            Verdict::UnexpectedPass => self.unexpected_pass += 1,
            Verdict::Unresolved => self.unresolved += 1,
            Verdict::Skipped => self.skipped += 1,
        }
        let output = outcome
            .verdict
            .is_failure()
            .then(|| outcome.report());
        self.reports.push(UnitReport {
            path,
            verdict: outcome.verdict,
            output,
        });
    }

    pub fn total(&self) -> usize {
        self.pass
            + self.fail
            + self.expected_fail
            + self.unexpected_pass
            + self.unresolved
            + self.skipped
    }

    /// Exit-code policy: success iff nothing failed and nothing was
    /// cancelled. Expected failures and skips do not count against a run.
    pub fn success(&self) -> bool {
        !self.cancelled && self.fail == 0 && self.unexpected_pass == 0 && self.unresolved == 0
    }
}

/// Run every unit on a pool of `config.workers` workers (minimum one) and
/// aggregate the verdicts. `cancel` flipping to `true` propagates to all
/// in-flight supervisors before this returns.
pub async fn run_all(
    units: Vec<TestUnit>,
    config: &RunConfig,
    cancel: watch::Receiver<bool>,
) -> RunSummary {
    let workers = config.workers.max(1).min(units.len().max(1));
    info!(units = units.len(), workers, "starting run");

    let ctx = Arc::new(RunContext {
        supervisor: Supervisor::new(config.policy).with_cancel(cancel.clone()),
        pipefail: config.pipefail,
        features: config.features.clone(),
    });
    let queue = Arc::new(Mutex::new(VecDeque::from(units)));
    let summary = Arc::new(Mutex::new(RunSummary::default()));

    let mut pool = JoinSet::new();
    for worker in 0..workers {
        let ctx = Arc::clone(&ctx);
        let queue = Arc::clone(&queue);
        let summary = Arc::clone(&summary);
        let cancel = cancel.clone();
        pool.spawn(async move {
            loop {
                if *cancel.borrow() {
                    break;
                }
                let next = lock(&queue).pop_front();
                let Some(unit) = next else { break };
                debug!(worker, unit = %unit.path.display(), "dispatching unit");
                match run_unit(&unit, &ctx).await {
                    Ok(outcome) => lock(&summary).record(unit.path.clone(), &outcome),
                    Err(Error::Cancelled) => break,
                    Err(e) => {
                        // Infrastructure failure: charge it to this unit only.
                        let outcome = UnitOutcome::unresolved(e.to_string());
                        lock(&summary).record(unit.path.clone(), &outcome);
                    }
                }
            }
        });
    }
    while let Some(joined) = pool.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "worker task failed");
        }
    }

    let mut summary = match Arc::try_unwrap(summary) {
        Ok(inner) => inner
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner),
        Err(shared) => lock(&shared).clone(),
    };
    summary.cancelled = *cancel.borrow();
    // Completion order is nondeterministic across workers; report in path
    // order instead.
    summary.reports.sort_by(|a, b| a.path.cmp(&b.path));
    info!(
        total = summary.total(),
        pass = summary.pass,
        fail = summary.fail,
        cancelled = summary.cancelled,
        "run finished"
    );
    summary
}
