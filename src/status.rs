//! # Status — Live Search Counters and Background Reporter
//!
//! Lock-free counters shared between the worker pool and a background status
//! reporter. Workers bump `tested` once per finished unit; the coordinator
//! bumps `found` as it merges primes in order. A Mutex guards only the
//! "current range" label, which changes once per merged unit.
//!
//! These counters are diagnostic. The authoritative, persisted state is the
//! coordinator's `Progress`.
//!
//! ## Background Reporter
//!
//! A dedicated thread logs tested count, found count, rate and the current
//! range at a fixed interval. It wakes every few hundred milliseconds to
//! check the shutdown flag, so `stop()` followed by `join()` returns promptly.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

pub struct SearchStatus {
    pub tested: AtomicU64,
    pub found: AtomicU64,
    pub current: Mutex<String>,
    start: Instant,
    shutdown: AtomicBool,
}

impl SearchStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(SearchStatus {
            tested: AtomicU64::new(0),
            found: AtomicU64::new(0),
            current: Mutex::new(String::new()),
            start: Instant::now(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn start_reporter(self: &Arc<Self>, interval: Duration) -> thread::JoinHandle<()> {
        let status = Arc::clone(self);
        thread::spawn(move || {
            let mut last_report = Instant::now();
            loop {
                thread::sleep(SHUTDOWN_POLL.min(interval));
                if status.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if last_report.elapsed() >= interval {
                    status.print_status();
                    last_report = Instant::now();
                }
            }
        })
    }

    pub fn set_current(&self, label: String) {
        if let Ok(mut current) = self.current.lock() {
            *current = label;
        }
    }

    pub fn print_status(&self) {
        let elapsed = self.start.elapsed();
        let tested = self.tested.load(Ordering::Relaxed);
        let found = self.found.load(Ordering::Relaxed);
        let current = self
            .current
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default();
        let rate = if elapsed.as_secs() > 0 {
            tested as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let h = elapsed.as_secs() / 3600;
        let m = (elapsed.as_secs() % 3600) / 60;
        let s = elapsed.as_secs() % 60;
        info!(
            current = %current,
            tested,
            rate = format_args!("{:.2}", rate),
            found,
            elapsed = format_args!("{:02}:{:02}:{:02}", h, m, s),
            "search progress"
        );
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
