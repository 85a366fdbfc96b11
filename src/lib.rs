pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod partition;
pub mod pool;
pub mod results;
pub mod status;

pub use error::SearchError;

/// Primality predicate applied by the worker pool to every candidate.
/// Implementations must be deterministic and free of side effects: a unit
/// evaluated twice has to produce the same result for retries to be safe.
pub trait PrimalityOracle: Send + Sync {
    fn is_prime(&self, n: u64) -> bool;
}

/// Default oracle: trial division bounded by the integer square root.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrialDivision;

impl PrimalityOracle for TrialDivision {
    fn is_prime(&self, n: u64) -> bool {
        is_prime(n)
    }
}

/// Trial-division primality test over the full `u64` range.
///
/// Divisibility by 2 and 3 is checked directly, then only divisors of the
/// form 6k ± 1 up to `isqrt(n)` are tried.
pub fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n < 4 {
        return true;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }
    let limit = isqrt(n);
    let mut d = 5u64;
    while d <= limit {
        if n % d == 0 || n % (d + 2) == 0 {
            return false;
        }
        d += 6;
    }
    true
}

/// Floor of the square root of `n`.
///
/// Starts from the f64 estimate and corrects it, since f64 cannot represent
/// every u64 exactly.
pub fn isqrt(n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    let mut x = (n as f64).sqrt() as u64;
    while x.checked_mul(x).map_or(true, |sq| sq > n) {
        x -= 1;
    }
    while (x + 1).checked_mul(x + 1).is_some_and(|sq| sq <= n) {
        x += 1;
    }
    x
}
