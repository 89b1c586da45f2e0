//! Bounded parallel execution of external tool jobs.
//!
//! A batch of homogeneous jobs (one per shard) runs on at most `max_workers`
//! concurrent subprocesses. Workers pull the next queued job as soon as their
//! current one finishes, so the bound is never exceeded even transiently and
//! the pool stays saturated. The call is a synchronization barrier: it
//! returns only after every job is terminal, even when some have already
//! failed, so logs are complete and no child is orphaned. Failures are
//! collected across the whole batch and surfaced together.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::mpsc;
use std::time::Instant;

use crate::error::{PrepError, PrepResult};
use crate::process::{CancelToken, run_logged_command};

/// One self-contained unit of work: an external command with its own
/// arguments and its own log destination. Jobs in a batch never share
/// mutable state or write targets.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Completed,
    Failed { detail: String },
    /// The pipeline was cancelled before or during this job; any running
    /// child was killed and reaped.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: String,
    pub status: JobStatus,
    pub elapsed_ms: u64,
}

impl JobResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.status, JobStatus::Completed)
    }
}

/// Execute `jobs` with at most `max_workers` running concurrently and wait
/// for all of them (barrier semantics).
///
/// Every job reaches a terminal status; a failure does not stop the batch.
/// Results come back in submission order. Combine with
/// [`fail_on_job_errors`] to abort the enclosing stage when anything failed.
pub fn run_parallel(
    jobs: Vec<Job>,
    max_workers: usize,
    token: &CancelToken,
) -> PrepResult<Vec<JobResult>> {
    if max_workers == 0 {
        return Err(PrepError::InvalidConfig(
            "max_workers must be positive".to_owned(),
        ));
    }
    let total = jobs.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    let queue: Mutex<VecDeque<(usize, Job)>> = Mutex::new(jobs.into_iter().enumerate().collect());
    let (result_tx, result_rx) = mpsc::channel::<(usize, JobResult)>();
    let workers = max_workers.min(total);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let queue = &queue;
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                loop {
                    let next = queue.lock().expect("job queue poisoned").pop_front();
                    let Some((index, job)) = next else {
                        break;
                    };
                    let result = execute_job(&job, token);
                    if result_tx.send((index, result)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    let mut results: Vec<(usize, JobResult)> = result_rx.iter().collect();
    results.sort_by_key(|(index, _)| *index);
    debug_assert_eq!(results.len(), total, "every job must report a status");
    Ok(results.into_iter().map(|(_, result)| result).collect())
}

fn execute_job(job: &Job, token: &CancelToken) -> JobResult {
    // A batch that was cancelled mid-flight must not start queued jobs.
    if token.is_cancelled() {
        tracing::info!(job = %job.id, "job skipped: batch cancelled");
        return JobResult {
            job_id: job.id.clone(),
            status: JobStatus::Cancelled,
            elapsed_ms: 0,
        };
    }

    tracing::info!(job = %job.id, program = %job.program, "job started");
    let started = Instant::now();
    let outcome = run_logged_command(
        &job.program,
        &job.args,
        job.cwd.as_deref(),
        &job.log_path,
        token,
    );
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let status = match outcome {
        Ok(()) => {
            tracing::info!(job = %job.id, elapsed_ms, "job completed");
            JobStatus::Completed
        }
        Err(PrepError::Cancelled(reason)) => {
            tracing::warn!(job = %job.id, %reason, "job cancelled");
            JobStatus::Cancelled
        }
        Err(err) => {
            tracing::warn!(job = %job.id, error = %err, log = %job.log_path.display(), "job failed");
            JobStatus::Failed {
                detail: err.to_string(),
            }
        }
    };
    JobResult {
        job_id: job.id.clone(),
        status,
        elapsed_ms,
    }
}

/// Convert a completed batch into a stage verdict: `Cancelled` if the batch
/// was interrupted, otherwise [`PrepError::JobFailure`] naming every failed
/// job id (not just the first).
pub fn fail_on_job_errors(results: &[JobResult]) -> PrepResult<()> {
    if results
        .iter()
        .any(|r| matches!(r.status, JobStatus::Cancelled))
    {
        return Err(PrepError::Cancelled(
            "job batch interrupted before completion".to_owned(),
        ));
    }
    let failed: Vec<String> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.job_id.clone())
        .collect();
    if failed.is_empty() {
        Ok(())
    } else {
        Err(PrepError::JobFailure {
            failed,
            total: results.len(),
        })
    }
}
