//! Bounded worker pool for per-unit stages.
//!
//! Units (record or cluster ids) are enumerated up front into a shared
//! queue. Each worker thread opens its own store connection and completion
//! client, then pulls units until the queue is empty. Results come back over
//! a channel in completion order. A unit that fails or panics is reported as
//! such; it never takes the pool down.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::mpsc;
use std::thread;

use parking_lot::Mutex;

use crate::completion::{Completion, CompletionFactory};
use crate::db::DeskDb;
use crate::error::PipelineError;

/// Hard cap on worker threads.
pub const MAX_WORKERS: usize = 8;

/// Why a unit did not produce a value.
#[derive(Debug)]
pub enum UnitFailure {
    Error(PipelineError),
    Panic(String),
    /// No worker could start (store or client construction failed).
    NotRun(String),
}

impl std::fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitFailure::Error(e) => write!(f, "{}", e),
            UnitFailure::Panic(msg) => write!(f, "panicked: {}", msg),
            UnitFailure::NotRun(msg) => write!(f, "not run: {}", msg),
        }
    }
}

pub type UnitResult<T> = (i64, Result<T, UnitFailure>);

/// min(MAX_WORKERS, available cores, configured max, number of units), at least 1.
pub fn worker_count(configured_max: usize, units: usize) -> usize {
    let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    MAX_WORKERS
        .min(cores)
        .min(configured_max.max(1))
        .min(units)
        .max(1)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `work` once per unit across `workers` threads.
///
/// Returns one result per unit, in completion order.
pub fn run_units<T, F>(
    db_path: &Path,
    factory: &dyn CompletionFactory,
    workers: usize,
    units: Vec<i64>,
    work: F,
) -> Vec<UnitResult<T>>
where
    T: Send,
    F: Fn(&DeskDb, &dyn Completion, i64) -> Result<T, PipelineError> + Sync,
{
    if units.is_empty() {
        return Vec::new();
    }
    let total = units.len();
    let workers = workers.clamp(1, total);
    let queue = Mutex::new(VecDeque::from(units));
    let (tx, rx) = mpsc::channel::<UnitResult<T>>();
    let startup_errors = Mutex::new(Vec::new());

    let mut results = Vec::with_capacity(total);
    thread::scope(|scope| {
        for worker_id in 0..workers {
            let tx = tx.clone();
            let (queue, work, startup_errors) = (&queue, &work, &startup_errors);
            scope.spawn(move || {
                let db = match DeskDb::open_at(db_path.to_path_buf()) {
                    Ok(db) => db,
                    Err(e) => {
                        log::error!("Pool: worker {} could not open the store: {}", worker_id, e);
                        startup_errors.lock().push(e.to_string());
                        return;
                    }
                };
                let client = match factory.client() {
                    Ok(c) => c,
                    Err(e) => {
                        log::error!("Pool: worker {} could not build a client: {}", worker_id, e);
                        startup_errors.lock().push(e.to_string());
                        return;
                    }
                };

                loop {
                    let Some(unit) = queue.lock().pop_front() else {
                        break;
                    };
                    let outcome = catch_unwind(AssertUnwindSafe(|| work(&db, client.as_ref(), unit)));
                    let result = match outcome {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(UnitFailure::Error(e)),
                        Err(payload) => {
                            let msg = panic_message(payload.as_ref());
                            log::error!("Pool: unit {} panicked: {}", unit, msg);
                            Err(UnitFailure::Panic(msg))
                        }
                    };
                    if tx.send((unit, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);
        results.extend(rx.iter());
    });

    // Units left behind because every worker failed to start.
    let reason = startup_errors.lock().first().cloned().unwrap_or_default();
    for unit in queue.into_inner() {
        results.push((unit, Err(UnitFailure::NotRun(reason.clone()))));
    }
    results
}
