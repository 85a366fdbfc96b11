//! # Coordinator — Ordered Resumable Prime Search
//!
//! Drives one search from a saved (or fresh) position to its goal or its
//! deadline. The coordinator is the only writer of [`Progress`], of the
//! reorder buffer and of the prime log; workers only ever see a [`WorkUnit`].
//!
//! ## State Machine
//!
//! ```text
//! Resuming → Running ⇄ Checkpointing
//!               │            │
//!               ▼            ▼
//!           Draining ───► TimedOut
//!               │
//! Running ──────┴──────► Completed
//! (any) ────────────────► Failed
//! ```
//!
//! ## Ordering
//!
//! Units finish in any order. Finished units wait in a `BTreeMap` keyed by
//! `range_start` and are merged only when their start equals the cursor, so
//! the merged primes, the cursor and the counters always describe a prefix of
//! a sequential scan. Work that was dispatched but not merged is never
//! credited; a resumed run simply hands it out again.
//!
//! ## Durability
//!
//! Merged primes are appended to the prime log. A checkpoint is taken every
//! `checkpoint_every` merged primes and every `checkpoint_interval`: the log
//! is synced first, then the checkpoint is atomically replaced, so the
//! checkpoint never claims more primes than the log holds.
//!
//! ## Termination
//!
//! - Goal reached: write the result set (if a sink is configured), delete the
//!   checkpoint and log, `Completed`.
//! - Deadline or stop flag: stop dispatching, drain outstanding units, merge
//!   them, save a final checkpoint, `TimedOut`. This is a successful exit.
//! - Unit failing twice, repeated checkpoint failures, failed final flush:
//!   `Failed`; the last saved checkpoint is left as it was.
//! - Pool runs dry short of the goal: `Stalled` error, unless first-n has
//!   merged every candidate up to `u64::MAX`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{format_timestamp, unix_now, CheckpointStore, Progress};
use crate::config::SearchConfig;
use crate::error::SearchError;
use crate::partition::{Goal, Partitioner, WorkUnit, FIRST_CANDIDATE};
use crate::pool::{UnitFault, UnitResult, WorkerPool};
use crate::results::{write_result_set, PrimeLog};
use crate::status::SearchStatus;
use crate::{PrimalityOracle, TrialDivision};

/// Evaluations of one unit before its failure becomes fatal.
const MAX_UNIT_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Resuming,
    Running,
    Checkpointing,
    Draining,
    Completed,
    TimedOut,
    Failed,
}

impl fmt::Display for SearchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SearchState::Resuming => "resuming",
            SearchState::Running => "running",
            SearchState::Checkpointing => "checkpointing",
            SearchState::Draining => "draining",
            SearchState::Completed => "completed",
            SearchState::TimedOut => "timed_out",
            SearchState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of a run that ended in `Completed` or `TimedOut`.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub state: SearchState,
    pub goal: Goal,
    /// Merged primes in ascending order. Complete for `Completed`, a prefix
    /// for `TimedOut`.
    pub primes: Vec<u64>,
    pub progress: Progress,
    /// Checkpoint this run started from, if any.
    pub resumed_from: Option<Progress>,
}

/// Bookkeeping of one run.
struct Scan {
    progress: Progress,
    primes: Vec<u64>,
    pending: BTreeMap<u64, UnitResult>,
    prior_elapsed: f64,
    started: Instant,
    merged_since_checkpoint: u64,
    last_checkpoint: Instant,
    checkpoint_failures: u32,
    log_needs_rewrite: bool,
}

impl Scan {
    fn new(progress: Progress, primes: Vec<u64>, started: Instant) -> Self {
        Scan {
            prior_elapsed: progress.elapsed_seconds,
            progress,
            primes,
            pending: BTreeMap::new(),
            started,
            merged_since_checkpoint: 0,
            last_checkpoint: Instant::now(),
            checkpoint_failures: 0,
            log_needs_rewrite: false,
        }
    }

    fn stamp_elapsed(&mut self) {
        self.progress.elapsed_seconds = self.prior_elapsed + self.started.elapsed().as_secs_f64();
    }
}

pub struct SearchCoordinator {
    goal: Goal,
    config: SearchConfig,
    store: CheckpointStore,
    log: PrimeLog,
    oracle: Arc<dyn PrimalityOracle>,
    stop: Arc<AtomicBool>,
    status: Arc<SearchStatus>,
    result_sink: Option<PathBuf>,
    state: SearchState,
}

impl SearchCoordinator {
    /// Validates `config` up front so bad parameters fail before any work.
    pub fn new(goal: Goal, config: SearchConfig, checkpoint: &Path) -> Result<Self, SearchError> {
        config.validate()?;
        Ok(SearchCoordinator {
            goal,
            config,
            store: CheckpointStore::new(checkpoint),
            log: PrimeLog::for_checkpoint(checkpoint),
            oracle: Arc::new(TrialDivision),
            stop: Arc::new(AtomicBool::new(false)),
            status: SearchStatus::new(),
            result_sink: None,
            state: SearchState::Resuming,
        })
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn PrimalityOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Share an externally owned stop flag (e.g. set from a signal handler).
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Write the full result set to `path` before a completed run deletes its
    /// checkpoint.
    pub fn with_result_sink(mut self, path: impl Into<PathBuf>) -> Self {
        self.result_sink = Some(path.into());
        self
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    fn transition(&mut self, next: SearchState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "search state");
            self.state = next;
        }
    }

    /// Run the search until the goal, the deadline, or a fatal error.
    pub fn run(&mut self) -> Result<SearchOutcome, SearchError> {
        let reporter = self.status.start_reporter(self.config.status_interval());
        let result = self.execute();
        self.status.stop();
        let _ = reporter.join();

        if let Err(e) = &result {
            self.transition(SearchState::Failed);
            error!(goal = %self.goal, error = %e, "search failed; last checkpoint left in place");
        }
        result
    }

    fn execute(&mut self) -> Result<SearchOutcome, SearchError> {
        let started = Instant::now();
        self.transition(SearchState::Resuming);

        if self.goal.is_empty() {
            info!(goal = %self.goal, "empty search domain, nothing to do");
            self.write_result_sink(&[])?;
            self.transition(SearchState::Completed);
            return Ok(SearchOutcome {
                state: SearchState::Completed,
                goal: self.goal,
                primes: Vec::new(),
                progress: Progress::fresh(),
                resumed_from: None,
            });
        }

        let (progress, primes, resumed_from) = self.resume()?;
        let mut scan = Scan::new(progress, primes, started);

        if self
            .goal
            .is_reached(scan.progress.cursor, scan.progress.discovered_count)
        {
            return self.complete_from_checkpoint(scan, resumed_from);
        }

        let threads = self.config.parallelism();
        let mut pool = WorkerPool::new(threads, Arc::clone(&self.oracle), Arc::clone(&self.status))?;
        let mut partitioner =
            Partitioner::new(self.goal, scan.progress.cursor, self.config.batch_size);
        // A budget past the end of `Instant` is as good as none.
        let deadline = self
            .config
            .time_limit()
            .and_then(|limit| started.checked_add(limit));

        info!(
            goal = %self.goal,
            threads,
            batch_size = self.config.batch_size,
            cursor = scan.progress.cursor,
            found = scan.progress.discovered_count,
            "search running"
        );
        self.transition(SearchState::Running);

        loop {
            if self.state == SearchState::Running {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    info!(outstanding = pool.outstanding(), "time limit reached, draining");
                    self.transition(SearchState::Draining);
                } else if self.stop.load(Ordering::SeqCst) {
                    info!(outstanding = pool.outstanding(), "stop requested, draining");
                    self.transition(SearchState::Draining);
                }
            }

            if self.state == SearchState::Running {
                while pool.has_idle_worker()
                    && !self
                        .goal
                        .is_reached(scan.progress.cursor, scan.progress.discovered_count)
                {
                    match partitioner.next_unit() {
                        Some(unit) => pool.submit(unit, 1),
                        None => break,
                    }
                }
            }

            let Some(outcome) = pool.next_outcome() else {
                break;
            };
            match outcome.result {
                Ok(result) => {
                    scan.pending.insert(result.unit.range_start, result);
                }
                Err(fault) => self.handle_fault(&mut pool, outcome.unit, outcome.attempt, fault)?,
            }

            self.merge_ready(&mut scan);
            if self
                .goal
                .is_reached(scan.progress.cursor, scan.progress.discovered_count)
            {
                break;
            }
            self.maybe_checkpoint(&mut scan)?;
        }

        if self
            .goal
            .is_reached(scan.progress.cursor, scan.progress.discovered_count)
        {
            return self.complete(scan, resumed_from);
        }
        if self.state == SearchState::Draining {
            return self.time_out(scan, resumed_from);
        }
        check_exhausted(
            self.goal,
            scan.progress.cursor,
            pool.outstanding() + scan.pending.len(),
        )?;
        warn!(
            cursor = scan.progress.cursor,
            found = scan.progress.discovered_count,
            "candidate domain exhausted before the goal was reached"
        );
        self.complete(scan, resumed_from)
    }

    /// Load the checkpoint and the matching prefix of the prime log, or start
    /// fresh when either is missing or they disagree.
    fn resume(&mut self) -> Result<(Progress, Vec<u64>, Option<Progress>), SearchError> {
        if !self.config.resume {
            info!(path = %self.store.path().display(), "resume disabled, discarding previous state");
        } else if let Some(saved) = self.store.load() {
            match self.log.restore(saved.discovered_count) {
                Ok(Some(primes))
                    if primes.last().copied().unwrap_or(0) == saved.largest_discovered =>
                {
                    let age_secs = unix_now() - saved.saved_at;
                    if age_secs < 0.0 {
                        warn!(age_secs, "checkpoint timestamp is in the future");
                    }
                    info!(
                        cursor = saved.cursor,
                        found = saved.discovered_count,
                        largest = saved.largest_discovered,
                        elapsed_secs = saved.elapsed_seconds,
                        saved_at = %format_timestamp(saved.saved_at),
                        "resuming from checkpoint"
                    );
                    return Ok((saved, primes, Some(saved)));
                }
                Ok(_) => warn!(
                    log = %self.log.path().display(),
                    "prime log does not match checkpoint, starting fresh"
                ),
                Err(e) => warn!(
                    log = %self.log.path().display(),
                    error = %e,
                    "prime log unreadable, starting fresh"
                ),
            }
        } else {
            debug!(path = %self.store.path().display(), "no usable checkpoint");
        }

        self.store.clear();
        self.log.reset().map_err(|e| {
            SearchError::checkpoint(format!("prime log {}: {}", self.log.path().display(), e))
        })?;
        Ok((Progress::fresh(), Vec::new(), None))
    }

    fn handle_fault(
        &mut self,
        pool: &mut WorkerPool,
        unit: WorkUnit,
        attempt: u32,
        fault: UnitFault,
    ) -> Result<(), SearchError> {
        if self.config.retry_failed_units && attempt < MAX_UNIT_ATTEMPTS {
            warn!(unit = %unit, attempt, error = %fault.message, "work unit failed, retrying");
            pool.submit(unit, attempt + 1);
            return Ok(());
        }
        error!(unit = %unit, attempt, error = %fault.message, "work unit failed permanently");
        Err(SearchError::UnitFailed {
            start: unit.range_start,
            end: unit.range_end,
            attempts: attempt,
            message: fault.message,
        })
    }

    /// Merge every buffered result that continues the cursor. Returns the
    /// number of primes merged.
    fn merge_ready(&mut self, scan: &mut Scan) -> u64 {
        let mut merged = 0u64;
        while let Some(result) = scan.pending.remove(&scan.progress.cursor) {
            let wanted = match self.goal {
                Goal::FirstN(count) => count.saturating_sub(scan.progress.discovered_count),
                Goal::UpTo(_) => u64::MAX,
            };
            let take = (result.primes.len() as u64).min(wanted) as usize;
            let accepted = &result.primes[..take];

            if !scan.log_needs_rewrite {
                if let Err(e) = self.log.append(accepted) {
                    warn!(error = %e, "prime log append failed; will rewrite at next checkpoint");
                    scan.log_needs_rewrite = true;
                }
            }
            scan.primes.extend_from_slice(accepted);

            if let Some(&last) = accepted.last() {
                scan.progress.largest_discovered = last;
                scan.progress.discovered_count += take as u64;
                self.status.found.fetch_add(take as u64, Ordering::Relaxed);
            }
            scan.progress.cursor = if take < result.primes.len() {
                // Goal met mid-unit: only the scanned prefix up to the last
                // accepted prime is credited.
                scan.progress.largest_discovered + 1
            } else {
                result.unit.next_position()
            };
            merged += take as u64;
            self.status.set_current(result.unit.to_string());

            if self
                .goal
                .is_reached(scan.progress.cursor, scan.progress.discovered_count)
            {
                break;
            }
        }
        scan.merged_since_checkpoint += merged;
        merged
    }

    fn maybe_checkpoint(&mut self, scan: &mut Scan) -> Result<(), SearchError> {
        let due = scan.merged_since_checkpoint >= self.config.checkpoint_every
            || scan.last_checkpoint.elapsed() >= self.config.checkpoint_interval();
        if !due {
            return Ok(());
        }

        let resume_to = self.state;
        self.transition(SearchState::Checkpointing);
        match self.persist(scan) {
            Ok(()) => scan.checkpoint_failures = 0,
            Err(e) => {
                scan.checkpoint_failures += 1;
                warn!(
                    error = %e,
                    consecutive = scan.checkpoint_failures,
                    "checkpoint failed, continuing in memory"
                );
                if scan.checkpoint_failures >= self.config.max_checkpoint_failures {
                    return Err(SearchError::checkpoint(format!(
                        "{} consecutive checkpoint failures, last: {}",
                        scan.checkpoint_failures, e
                    )));
                }
            }
        }
        scan.merged_since_checkpoint = 0;
        scan.last_checkpoint = Instant::now();
        self.transition(resume_to);
        Ok(())
    }

    /// Sync the prime log, then atomically replace the checkpoint.
    fn persist(&mut self, scan: &mut Scan) -> Result<(), SearchError> {
        scan.stamp_elapsed();
        scan.progress.saved_at = unix_now();

        let synced = if scan.log_needs_rewrite {
            self.log.rewrite(&scan.primes)
        } else {
            self.log.sync()
        };
        if let Err(e) = synced {
            scan.log_needs_rewrite = true;
            return Err(SearchError::checkpoint(format!(
                "prime log {}: {}",
                self.log.path().display(),
                e
            )));
        }
        scan.log_needs_rewrite = false;

        self.store.save(&scan.progress)?;
        info!(
            cursor = scan.progress.cursor,
            found = scan.progress.discovered_count,
            largest = scan.progress.largest_discovered,
            elapsed_secs = scan.progress.elapsed_seconds,
            "checkpoint saved"
        );
        Ok(())
    }

    fn time_out(
        &mut self,
        mut scan: Scan,
        resumed_from: Option<Progress>,
    ) -> Result<SearchOutcome, SearchError> {
        self.transition(SearchState::Checkpointing);
        self.persist(&mut scan)?;
        self.transition(SearchState::TimedOut);
        info!(
            goal = %self.goal,
            cursor = scan.progress.cursor,
            found = scan.progress.discovered_count,
            "search stopped before the goal; rerun to resume"
        );
        Ok(SearchOutcome {
            state: SearchState::TimedOut,
            goal: self.goal,
            primes: scan.primes,
            progress: scan.progress,
            resumed_from,
        })
    }

    fn complete(
        &mut self,
        mut scan: Scan,
        resumed_from: Option<Progress>,
    ) -> Result<SearchOutcome, SearchError> {
        scan.stamp_elapsed();
        self.write_result_sink(&scan.primes)?;
        self.store.clear();
        self.log.clear();
        self.transition(SearchState::Completed);
        info!(
            goal = %self.goal,
            found = scan.progress.discovered_count,
            largest = scan.progress.largest_discovered,
            elapsed_secs = scan.progress.elapsed_seconds,
            "search complete"
        );
        Ok(SearchOutcome {
            state: SearchState::Completed,
            goal: self.goal,
            primes: scan.primes,
            progress: scan.progress,
            resumed_from,
        })
    }

    /// The checkpoint already covers the goal (it came from a larger search):
    /// answer from it and leave it in place.
    fn complete_from_checkpoint(
        &mut self,
        mut scan: Scan,
        resumed_from: Option<Progress>,
    ) -> Result<SearchOutcome, SearchError> {
        trim_to_goal(self.goal, &mut scan.progress, &mut scan.primes);
        self.write_result_sink(&scan.primes)?;
        self.transition(SearchState::Completed);
        info!(
            goal = %self.goal,
            found = scan.progress.discovered_count,
            "goal already covered by checkpoint"
        );
        Ok(SearchOutcome {
            state: SearchState::Completed,
            goal: self.goal,
            primes: scan.primes,
            progress: scan.progress,
            resumed_from,
        })
    }

    fn write_result_sink(&self, primes: &[u64]) -> Result<(), SearchError> {
        if let Some(path) = &self.result_sink {
            write_result_set(path, primes)?;
            info!(path = %path.display(), count = primes.len(), "result set written");
        }
        Ok(())
    }
}

/// The loop ended without reaching the goal or draining. That is only
/// legitimate for first-n once every candidate up to `u64::MAX` has been
/// merged; anything else means results went missing.
fn check_exhausted(goal: Goal, cursor: u64, unmerged: usize) -> Result<(), SearchError> {
    match goal {
        Goal::FirstN(_) if unmerged == 0 && cursor == u64::MAX => Ok(()),
        _ => Err(SearchError::Stalled {
            cursor,
            outstanding: unmerged,
        }),
    }
}

/// Cut a covering prefix down to exactly what `goal` asks for.
fn trim_to_goal(goal: Goal, progress: &mut Progress, primes: &mut Vec<u64>) {
    match goal {
        Goal::FirstN(count) => primes.truncate(usize::try_from(count).unwrap_or(usize::MAX)),
        Goal::UpTo(limit) => {
            let keep = primes.partition_point(|&p| p <= limit);
            primes.truncate(keep);
        }
    }
    progress.discovered_count = primes.len() as u64;
    progress.largest_discovered = primes.last().copied().unwrap_or(0);
    progress.cursor = match goal {
        Goal::FirstN(_) if progress.largest_discovered > 0 => progress.largest_discovered + 1,
        Goal::FirstN(_) => FIRST_CANDIDATE,
        Goal::UpTo(limit) => limit.saturating_add(1),
    };
}
