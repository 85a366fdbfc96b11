//! # Pool — Parallel Work Unit Evaluation
//!
//! A fixed-size rayon thread pool that applies a [`PrimalityOracle`] to every
//! candidate of a [`WorkUnit`] and sends the outcome back over a channel.
//!
//! The coordinator keeps at most `threads()` units outstanding, so each worker
//! thread holds at most one unit at a time. Outcomes arrive in completion
//! order; putting them back in numeric order is the coordinator's job.
//!
//! A panic while evaluating a unit is caught on the worker thread and
//! reported as a [`UnitFault`] for that unit only. Workers keep nothing
//! between units, so re-submitting the same unit is always safe.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use crate::error::SearchError;
use crate::partition::WorkUnit;
use crate::status::SearchStatus;
use crate::PrimalityOracle;

/// Primes found within one unit, ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitResult {
    pub unit: WorkUnit,
    pub primes: Vec<u64>,
}

/// A unit whose evaluation did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFault {
    pub message: String,
}

/// What a worker sends back for each submitted unit.
#[derive(Debug)]
pub struct UnitOutcome {
    pub unit: WorkUnit,
    /// 1 for the first evaluation, 2 for the retry, ...
    pub attempt: u32,
    pub result: Result<UnitResult, UnitFault>,
}

/// Evaluate every candidate of `unit` in ascending order.
pub fn evaluate_unit(unit: WorkUnit, oracle: &dyn PrimalityOracle) -> UnitResult {
    let primes = (unit.range_start..=unit.range_end)
        .filter(|&n| oracle.is_prime(n))
        .collect();
    UnitResult { unit, primes }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

pub struct WorkerPool {
    pool: rayon::ThreadPool,
    oracle: Arc<dyn PrimalityOracle>,
    status: Arc<SearchStatus>,
    tx: Sender<UnitOutcome>,
    rx: Receiver<UnitOutcome>,
    outstanding: usize,
}

impl WorkerPool {
    pub fn new(
        threads: usize,
        oracle: Arc<dyn PrimalityOracle>,
        status: Arc<SearchStatus>,
    ) -> Result<Self, SearchError> {
        if threads == 0 {
            return Err(SearchError::config("worker pool needs at least one thread"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("primecrawl-worker-{}", i))
            .build()
            .map_err(|e| SearchError::config(format!("could not build worker pool: {}", e)))?;
        let (tx, rx) = mpsc::channel();
        Ok(WorkerPool {
            pool,
            oracle,
            status,
            tx,
            rx,
            outstanding: 0,
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Units submitted whose outcome has not been received yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn has_idle_worker(&self) -> bool {
        self.outstanding < self.threads()
    }

    /// Schedule `unit` on the pool; its outcome is returned by a later
    /// [`WorkerPool::next_outcome`].
    pub fn submit(&mut self, unit: WorkUnit, attempt: u32) {
        let tx = self.tx.clone();
        let oracle = Arc::clone(&self.oracle);
        let status = Arc::clone(&self.status);
        self.outstanding += 1;
        self.pool.spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                evaluate_unit(unit, oracle.as_ref())
            }))
            .map_err(|payload| UnitFault {
                message: panic_message(payload.as_ref()),
            });
            if result.is_ok() {
                status.tested.fetch_add(unit.size(), Ordering::Relaxed);
            }
            // The receiver only disappears once the coordinator has given up
            // on outstanding work.
            let _ = tx.send(UnitOutcome {
                unit,
                attempt,
                result,
            });
        });
    }

    /// Block until any outstanding unit finishes. `None` when nothing is
    /// outstanding.
    pub fn next_outcome(&mut self) -> Option<UnitOutcome> {
        if self.outstanding == 0 {
            return None;
        }
        // `self.tx` keeps the channel open, so recv only fails if every
        // worker thread died without sending, which catch_unwind prevents.
        let outcome = self.rx.recv().ok()?;
        self.outstanding -= 1;
        Some(outcome)
    }
}
