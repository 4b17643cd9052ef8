//! Globally visible constants and session/planner configuration.
//!
//! Constants are ported verbatim (same values) from the original
//! system's globals so that default memory budgets and cost estimates
//! stay comparable.

/// Size of a memory/disk block (a unit of transfer), in bytes.
pub const BLOCK_SIZE: usize = 4028;

/// Max size of a database (informational; not enforced by this crate).
pub const MAX_DB_SIZE: u64 = 1_000_000_000_000;

/// Max number of files/tables; places a practical limit on how many
/// runs an external merge sort may produce.
pub const MAX_FILES: usize = 10_000;

/// Default number of blocks used by block-based nested-loop join.
pub const DEFAULT_BNLJ_BUFFER_SIZE: usize = 10;

/// Default number of blocks used by sorting.
pub const DEFAULT_SORT_BUFFER_SIZE: usize = 10;

/// Default number of blocks used by sorting, if the sort is supplying
/// output to a sort-merge join.
pub const DEFAULT_SORT_LAST_BUFFER_SIZE: usize = 5;

/// Default number of blocks used by hashing.
pub const DEFAULT_HASH_BUFFER_SIZE: usize = 10;

/// Default cap on the number of partitioning passes for hashing. The
/// number of partitions grows by roughly `DEFAULT_HASH_BUFFER_SIZE`
/// with each pass; this cap prevents futile partitioning under skew
/// or (unlikely) hash collision.
pub const DEFAULT_HASH_MAX_DEPTH: u32 = 3;

/// Which rule-based planner implementation a session should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannerKind {
    Baseline,
    Naive,
    Smart,
}

impl Default for PlannerKind {
    fn default() -> Self {
        PlannerKind::Baseline
    }
}

/// Whether a transaction is read-only or read-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

impl Default for TransactionMode {
    fn default() -> Self {
        TransactionMode::ReadWrite
    }
}

/// Per-session options (`SET` statement targets).
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub autocommit: bool,
    pub transaction_mode: TransactionMode,
    pub debug: bool,
    pub planner: PlannerKind,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            autocommit: true,
            transaction_mode: TransactionMode::default(),
            debug: false,
            planner: PlannerKind::default(),
        }
    }
}

/// Enables/disables individual access and join strategies considered
/// by the planner. All on by default; an embedder can turn one off to
/// force a fallback strategy (e.g. for testing BNLJ in isolation).
#[derive(Debug, Clone, Copy)]
pub struct PlannerOptions {
    pub index_join: bool,
    pub sort_merge_join: bool,
    pub hash_join: bool,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        PlannerOptions {
            index_join: true,
            sort_merge_join: true,
            hash_join: true,
        }
    }
}
