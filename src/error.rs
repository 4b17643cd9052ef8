//! Error taxonomy for the execution engine.
//!
//! Operator construction and `execute()` paths return `Result<_, DbError>`
//! rather than panicking; the only panics left in this crate are
//! `debug_assert!`/`unreachable!` for states the planner is supposed to
//! make impossible.

use thiserror::Error;

/// Catch-all result alias used throughout the executor and planner.
pub type DbResult<T> = Result<T, DbError>;

/// The kinds of error this engine's physical layer can raise.
#[derive(Error, Debug)]
pub enum DbError {
    /// An operator was constructed with too small a memory budget,
    /// e.g. merge sort with fewer than 3 blocks, or grouped aggregation
    /// with fewer than `3 * non_incremental_count` blocks.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A name/type/arity mismatch discovered while compiling a plan.
    #[error("validation error: {0}")]
    Validation(String),

    /// An error raised during row production: oversized rows, a missing
    /// tmp/base file, or a propagated storage failure.
    #[error("execution error: {0}")]
    Execution(String),

    /// A primary-key (or other declared) constraint was violated.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Error surfaced unmodified from the storage trait boundary.
    #[error("storage error: {0}")]
    Storage(String),

    /// The profiling call stack was popped out of order, meaning a
    /// `StatementContext` call was begun/ended out of LIFO sequence.
    #[error("profiling error: {0}")]
    Profile(String),
}

impl DbError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        DbError::Configuration(msg.into())
    }
    pub fn validation(msg: impl Into<String>) -> Self {
        DbError::Validation(msg.into())
    }
    pub fn execution(msg: impl Into<String>) -> Self {
        DbError::Execution(msg.into())
    }
    pub fn constraint(msg: impl Into<String>) -> Self {
        DbError::Constraint(msg.into())
    }
    pub fn storage(msg: impl Into<String>) -> Self {
        DbError::Storage(msg.into())
    }
    pub fn profile(msg: impl Into<String>) -> Self {
        DbError::Profile(msg.into())
    }
}
