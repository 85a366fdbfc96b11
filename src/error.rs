//! Error taxonomy surfaced by the search engine.
//!
//! Unit-level faults are absorbed by the coordinator (retry once); only the
//! variants below ever reach a caller, and each maps to its own exit status.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SearchError {
    /// Invalid parameters, rejected before any work starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// Durable state could not be written (repeated checkpoint or prime log failures).
    #[error("checkpoint failure: {0}")]
    Checkpoint(String),

    /// A work unit kept failing after its retry budget was spent.
    #[error("work unit [{start}, {end}] failed after {attempts} attempt(s): {message}")]
    UnitFailed {
        start: u64,
        end: u64,
        attempts: u32,
        message: String,
    },

    /// The pool stopped returning work before the goal was reached.
    #[error("search stalled at {cursor} with {outstanding} unit(s) outstanding")]
    Stalled { cursor: u64, outstanding: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SearchError {
    pub fn config(message: impl Into<String>) -> Self {
        SearchError::Config(message.into())
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        SearchError::Checkpoint(message.into())
    }

    /// Process exit status for this error category.
    pub fn exit_code(&self) -> u8 {
        match self {
            SearchError::Config(_) => 2,
            SearchError::Checkpoint(_) => 3,
            SearchError::UnitFailed { .. } | SearchError::Stalled { .. } => 4,
            SearchError::Io(_) => 1,
        }
    }
}
