//! # Partition — Search Goals and Work Units
//!
//! Splits the candidate domain of a [`Goal`] into contiguous, non-overlapping
//! [`WorkUnit`]s handed out in ascending order. The partitioner only tracks
//! the next position to *hand out*; the position up to which work is actually
//! *credited* is the coordinator's `Progress::cursor`, so a resumed run
//! rebuilds its partitioner from that cursor and re-issues anything that was
//! in flight when the previous run stopped.
//!
//! ## Domains
//!
//! | Goal | Domain | Exhausted |
//! |------|--------|-----------|
//! | `UpTo(limit)` | `[2, limit]` | once `limit` has been handed out |
//! | `FirstN(count)` | `[2, u64::MAX]` | never in practice; the coordinator stops on count |
//!
//! `UpTo(limit)` with `limit < 2` and `FirstN(0)` have an empty domain: the
//! partitioner yields nothing and the search is complete before it starts.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Smallest candidate ever tested.
pub const FIRST_CANDIDATE: u64 = 2;

/// What a search is trying to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    /// The first `count` primes.
    FirstN(u64),
    /// Every prime `<= limit`.
    UpTo(u64),
}

impl Goal {
    /// True when the goal is satisfied by the empty result.
    pub fn is_empty(&self) -> bool {
        match *self {
            Goal::FirstN(count) => count == 0,
            Goal::UpTo(limit) => limit < FIRST_CANDIDATE,
        }
    }

    /// Largest candidate that can belong to this goal's domain.
    pub fn domain_end(&self) -> u64 {
        match *self {
            Goal::FirstN(_) => u64::MAX,
            Goal::UpTo(limit) => limit,
        }
    }

    /// Whether a scan that has classified everything below `cursor` and found
    /// `discovered` primes has reached this goal.
    pub fn is_reached(&self, cursor: u64, discovered: u64) -> bool {
        match *self {
            Goal::FirstN(count) => discovered >= count,
            Goal::UpTo(limit) => limit < FIRST_CANDIDATE || cursor > limit,
        }
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Goal::FirstN(count) => write!(f, "first-n {}", count),
            Goal::UpTo(limit) => write!(f, "up-to {}", limit),
        }
    }
}

/// A contiguous, inclusive range of candidates assigned to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkUnit {
    pub range_start: u64,
    pub range_end: u64,
}

impl WorkUnit {
    pub fn new(range_start: u64, range_end: u64) -> Self {
        debug_assert!(range_start <= range_end);
        WorkUnit {
            range_start,
            range_end,
        }
    }

    /// Number of candidates in the unit.
    pub fn size(&self) -> u64 {
        self.range_end - self.range_start + 1
    }

    /// First position after this unit (saturates at `u64::MAX`).
    pub fn next_position(&self) -> u64 {
        self.range_end.saturating_add(1)
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{}]", self.range_start, self.range_end)
    }
}

/// Hands out the units of a goal's domain in ascending order.
#[derive(Debug, Clone)]
pub struct Partitioner {
    goal: Goal,
    batch_size: u64,
    next: Option<u64>,
}

impl Partitioner {
    /// Resume partitioning at `cursor` (clamped up to the first candidate).
    pub fn new(goal: Goal, cursor: u64, batch_size: u64) -> Self {
        let next = if goal.is_empty() {
            None
        } else {
            Some(cursor.max(FIRST_CANDIDATE))
        };
        Partitioner {
            goal,
            batch_size: batch_size.max(1),
            next,
        }
    }

    /// Start of the next unit that would be handed out, if any.
    pub fn peek_next(&self) -> Option<u64> {
        self.next.filter(|&n| n <= self.goal.domain_end())
    }

    pub fn is_exhausted(&self) -> bool {
        self.peek_next().is_none()
    }

    /// Next unit `[next, next + batch_size)` intersected with the domain.
    pub fn next_unit(&mut self) -> Option<WorkUnit> {
        let start = self.peek_next()?;
        let end = start
            .saturating_add(self.batch_size - 1)
            .min(self.goal.domain_end());
        self.next = end.checked_add(1);
        Some(WorkUnit::new(start, end))
    }
}

impl Iterator for Partitioner {
    type Item = WorkUnit;

    fn next(&mut self) -> Option<WorkUnit> {
        self.next_unit()
    }
}

#[cfg(test)]
mod tests {
    //! Partitioner coverage: every candidate of the domain lands in exactly
    //! one unit, in ascending order, starting from the resume cursor.

    use super::*;

    // ── Empty Domains ───────────────────────────────────────────────

    /// `up-to 0`, `up-to 1` and `first-n 0` have no candidates at all.
    #[test]
    fn empty_goals_yield_nothing() {
        for goal in [Goal::UpTo(0), Goal::UpTo(1), Goal::FirstN(0)] {
            assert!(goal.is_empty(), "{} should be empty", goal);
            let mut p = Partitioner::new(goal, 0, 100);
            assert!(p.is_exhausted());
            assert_eq!(p.next_unit(), None);
        }
    }

    // ── Up-To Coverage ──────────────────────────────────────────────

    /// The last unit is clipped to the limit.
    #[test]
    fn up_to_covers_domain_exactly() {
        let units: Vec<WorkUnit> = Partitioner::new(Goal::UpTo(30), 0, 10).collect();
        assert_eq!(
            units,
            vec![
                WorkUnit::new(2, 11),
                WorkUnit::new(12, 21),
                WorkUnit::new(22, 30),
            ]
        );
    }

    #[test]
    fn up_to_two_is_a_single_candidate() {
        let units: Vec<WorkUnit> = Partitioner::new(Goal::UpTo(2), 0, 1000).collect();
        assert_eq!(units, vec![WorkUnit::new(2, 2)]);
    }

    /// No gaps and no overlap, so the merged prefix can only advance by whole
    /// units.
    #[test]
    fn units_are_contiguous_and_non_overlapping() {
        let units: Vec<WorkUnit> = Partitioner::new(Goal::UpTo(10_007), 0, 97).collect();
        assert_eq!(units.first().unwrap().range_start, 2);
        assert_eq!(units.last().unwrap().range_end, 10_007);
        for pair in units.windows(2) {
            assert_eq!(pair[0].next_position(), pair[1].range_start);
        }
        let total: u64 = units.iter().map(WorkUnit::size).sum();
        assert_eq!(total, 10_006);
    }

    // ── Resume ──────────────────────────────────────────────────────

    #[test]
    fn resume_starts_at_cursor() {
        let mut p = Partitioner::new(Goal::UpTo(100), 57, 10);
        assert_eq!(p.next_unit(), Some(WorkUnit::new(57, 66)));
    }

    #[test]
    fn resume_past_limit_is_exhausted() {
        let mut p = Partitioner::new(Goal::UpTo(100), 101, 10);
        assert!(p.is_exhausted());
        assert_eq!(p.next_unit(), None);
    }

    // ── First-N ─────────────────────────────────────────────────────

    /// First-n has no upper bound, so units keep coming regardless of how
    /// many primes the goal asks for.
    #[test]
    fn first_n_keeps_partitioning() {
        let mut p = Partitioner::new(Goal::FirstN(5), 0, 3);
        for i in 0..1000u64 {
            let unit = p.next_unit().expect("first-n domain is unbounded");
            assert_eq!(unit.range_start, 2 + i * 3);
            assert_eq!(unit.size(), 3);
        }
    }

    /// The only way a first-n domain runs out.
    #[test]
    fn first_n_stops_at_u64_max() {
        let mut p = Partitioner::new(Goal::FirstN(1), u64::MAX - 4, 3);
        assert_eq!(p.next_unit(), Some(WorkUnit::new(u64::MAX - 4, u64::MAX - 2)));
        assert_eq!(p.next_unit(), Some(WorkUnit::new(u64::MAX - 1, u64::MAX)));
        assert_eq!(p.next_unit(), None);
    }

    /// A zero batch size degrades to single-candidate units instead of
    /// looping forever on empty ones.
    #[test]
    fn zero_batch_size_is_clamped() {
        let units: Vec<WorkUnit> = Partitioner::new(Goal::UpTo(5), 0, 0).collect();
        assert_eq!(
            units,
            vec![
                WorkUnit::new(2, 2),
                WorkUnit::new(3, 3),
                WorkUnit::new(4, 4),
                WorkUnit::new(5, 5),
            ]
        );
    }

    // ── Goals ───────────────────────────────────────────────────────

    /// First-n counts primes; up-to needs the cursor past the limit.
    #[test]
    fn goal_reached_rules() {
        assert!(Goal::FirstN(10).is_reached(30, 10));
        assert!(!Goal::FirstN(10).is_reached(30, 9));
        assert!(Goal::UpTo(30).is_reached(31, 10));
        assert!(!Goal::UpTo(30).is_reached(30, 10));
        assert!(Goal::UpTo(1).is_reached(0, 0));
    }

    #[test]
    fn goal_display_matches_cli_spelling() {
        assert_eq!(Goal::FirstN(10).to_string(), "first-n 10");
        assert_eq!(Goal::UpTo(30).to_string(), "up-to 30");
    }
}
