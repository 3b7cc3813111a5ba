//! Fan-out of (target, command) jobs over the bounded pool.
//!
//! Per-job failure policy: an executor error (the run could not even be
//! attempted) is swallowed and logged here, and the target is simply absent
//! from the returned `ResultSet`. One bad host never aborts its siblings;
//! callers detect missing targets as failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::warn;

use crate::executor::{CommandResult, ExecError, Executor};
use crate::pool::{self, Job};
use crate::report::{Outcome, Reporter};

/// One result per target whose execution succeeded, for one dispatch round.
pub type ResultSet = HashMap<String, CommandResult>;

/// Transient unit of work for one dispatch round.
pub struct DispatchJob {
    pub target: String,
    pub command: String,
    pub executor: Arc<dyn Executor>,
    /// When false, the job emits no report (the caller prints its own).
    pub report: bool,
}

impl DispatchJob {
    pub fn new(target: impl Into<String>, command: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        Self {
            target: target.into(),
            command: command.into(),
            executor,
            report: true,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.report = false;
        self
    }
}

fn execute_job(job: DispatchJob, reporter: &Reporter) -> (String, Result<CommandResult, ExecError>) {
    let DispatchJob {
        target,
        command,
        executor,
        report,
    } = job;

    if report {
        reporter.report_run(&target, &command);
    }
    let start = Instant::now();
    let result = executor.execute(&target, &command);
    let elapsed = start.elapsed();

    if report {
        if let Ok(res) = &result {
            let outcome = if res.success() {
                Outcome::Finished
            } else {
                Outcome::Failed
            };
            reporter.report_result(&target, &command, res, elapsed, outcome);
        }
    }

    (target, result)
}

/// Run every job with at most `limit` in flight, returning only after all of
/// them completed or failed. Single-job rounds execute on the calling thread.
pub fn dispatch(jobs: Vec<DispatchJob>, reporter: &Arc<Reporter>, limit: usize) -> Result<ResultSet> {
    let expected = jobs.len();

    let pool_jobs: Vec<Job<(String, Result<CommandResult, ExecError>)>> = jobs
        .into_iter()
        .map(|job| {
            let reporter = Arc::clone(reporter);
            Box::new(move || execute_job(job, &reporter)) as Job<_>
        })
        .collect();

    let mut results = ResultSet::with_capacity(expected);
    for (target, outcome) in pool::run_bounded(limit, pool_jobs)? {
        match outcome {
            Ok(result) => {
                results.insert(target, result);
            }
            Err(err) => {
                warn!(host = %target, "execution could not be attempted: {err}");
            }
        }
    }
    Ok(results)
}

/// Convenience fan-out: the same command against every host.
pub fn run_on_hosts(
    hosts: &[String],
    command: &str,
    executor: &Arc<dyn Executor>,
    reporter: &Arc<Reporter>,
    limit: usize,
) -> Result<ResultSet> {
    let jobs = hosts
        .iter()
        .map(|host| DispatchJob::new(host.clone(), command, Arc::clone(executor)))
        .collect();
    dispatch(jobs, reporter, limit)
}
