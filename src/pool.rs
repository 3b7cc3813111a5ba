//! Bounded worker pool: the admission-control core of the dispatcher.
//!
//! `min(limit, jobs)` worker threads pull from a shared queue, so a waiting
//! job starts the instant a running one completes. No ordering is promised
//! among jobs beyond "all complete before `run_bounded` returns"; results
//! come back in completion order and carry their own identity.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex};

use anyhow::{anyhow, Result};
use tracing::{debug, warn};

pub type Job<T> = Box<dyn FnOnce() -> T + Send + 'static>;

/// Run `jobs` with at most `limit` executing concurrently, blocking until
/// every job has either produced a value or been dropped after a panic.
///
/// A panicking job never takes its worker down with it: the panic is caught,
/// logged, and the slot is reused for the next queued job. Callers treat a
/// missing result as that job's failure signal.
pub fn run_bounded<T: Send + 'static>(limit: usize, jobs: Vec<Job<T>>) -> Result<Vec<T>> {
    if limit == 0 {
        return Err(anyhow!("concurrency limit must be >= 1"));
    }
    if jobs.is_empty() {
        return Ok(Vec::new());
    }
    if jobs.len() == 1 {
        // Nothing to interleave with; run on the caller's thread.
        let job = jobs.into_iter().next().expect("exactly one job");
        return Ok(run_caught(job).into_iter().collect());
    }

    let worker_count = limit.min(jobs.len());
    let queue: Arc<Mutex<VecDeque<Job<T>>>> = Arc::new(Mutex::new(jobs.into_iter().collect()));
    let (tx, rx) = mpsc::channel::<T>();

    let mut handles = Vec::with_capacity(worker_count);
    for worker in 0..worker_count {
        let queue = Arc::clone(&queue);
        let tx = tx.clone();
        handles.push(std::thread::spawn(move || loop {
            let job = {
                let mut q = queue.lock().expect("pool queue lock poisoned");
                q.pop_front()
            };
            let Some(job) = job else {
                break;
            };
            debug!(worker, "job admitted");
            if let Some(out) = run_caught(job) {
                if tx.send(out).is_err() {
                    break;
                }
            }
            debug!(worker, "slot released");
        }));
    }
    drop(tx);

    let mut out: Vec<T> = Vec::new();
    for item in rx {
        out.push(item);
    }

    for h in handles {
        if h.join().is_err() {
            warn!("pool worker exited abnormally");
        }
    }

    Ok(out)
}

fn run_caught<T>(job: Job<T>) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(job)) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("job panicked; dropping its result");
            None
        }
    }
}
