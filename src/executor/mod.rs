//! Physical query operators: the `QPop` trait and the compiled/
//! estimated property bags every operator exposes, plus the shared
//! `Sarg` (searchable argument) type planners build for index access.
//!
//! Compiled and estimated properties are computed eagerly at
//! construction time and stored as plain fields, rather than behind a
//! `cached_property`-style lazy cell: operator trees here are built
//! once by the planner and then executed, never mutated in place, so
//! eager computation is simpler without giving anything up.

pub mod aggr;
pub mod command;
pub mod filter_project;
pub mod join;
pub mod leaf;
pub mod materialize;
pub mod mergesort;

use crate::compile::ColumnBinding;
use crate::error::DbResult;
use crate::value::{Row, RowType, Value};
use std::rc::Rc;

/// Lineage of one output column: every (table alias, column name) pair
/// it can be traced back to, across the tables this plan scans.
pub type Lineage = Vec<(Rc<str>, Rc<str>)>;
pub type OutputLineage = Vec<Lineage>;

/// Schema plus lineage/ordering/uniqueness facts about an operator's
/// output, computed once when the operator is built.
#[derive(Clone)]
pub struct CompiledProps {
    pub row_type: RowType,
    pub output_lineage: OutputLineage,
    pub ordered_columns: Vec<usize>,
    pub ordered_asc: Vec<bool>,
    pub unique_columns: Vec<usize>,
}

impl CompiledProps {
    /// The schema as a list of `ColumnBinding`s for a single alias,
    /// used when an operator's whole output is addressed under one
    /// name (e.g. a `Materialize` or a subquery result).
    pub fn bindings_for_alias(&self, alias: &str, column_names: &[Rc<str>]) -> Vec<ColumnBinding> {
        self.row_type
            .iter()
            .zip(column_names)
            .map(|(t, name)| ColumnBinding::new(alias, name, *t))
            .collect()
    }

    /// Given an output lineage, find the output column index a
    /// `(table_alias, column_name)` pair maps to, if unambiguous.
    pub fn column_in_lineage(&self, alias: &str, column: &str) -> Option<usize> {
        self.output_lineage.iter().position(|lineage| {
            lineage
                .iter()
                .any(|(a, c)| a.as_ref() == alias && c.as_ref() == column)
        })
    }

    /// Build a `CompiledProps` for a two-input operator whose output is
    /// simply both schemas concatenated, with no ordering/uniqueness
    /// carried over (the common default for joins; merge-join-style
    /// operators override this after construction).
    pub fn from_inputs(left: &CompiledProps, right: &CompiledProps) -> Self {
        let mut row_type = left.row_type.clone();
        row_type.extend(right.row_type.iter().copied());
        let mut output_lineage = left.output_lineage.clone();
        output_lineage.extend(right.output_lineage.iter().cloned());
        CompiledProps {
            row_type,
            output_lineage,
            ordered_columns: Vec::new(),
            ordered_asc: Vec::new(),
            unique_columns: Vec::new(),
        }
    }
}

/// Estimated I/O cost, used by the planner to choose among strategies.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsInBlocks {
    pub self_reads: u64,
    pub self_writes: u64,
    pub overall: u64,
}

#[derive(Clone, Default)]
pub struct EstimatedProps {
    pub row_count: u64,
    pub blocks: StatsInBlocks,
    /// One-time extra I/O incurred only by the first `execute()` pass
    /// (e.g. the initial spill-or-not decision of a `Materialize`).
    pub blocks_extra_init: Option<StatsInBlocks>,
}

/// A single searchable argument against one indexed column: an
/// optional lower bound and an optional upper bound, each with its own
/// inclusive/exclusive flag. `Some(lo) == Some(hi)` with both inclusive
/// represents an equality lookup.
#[derive(Debug, Clone)]
pub struct Sarg {
    pub lower: Option<(Value, bool)>,
    pub upper: Option<(Value, bool)>,
}

impl Sarg {
    pub fn eq(v: Value) -> Self {
        Sarg {
            lower: Some((v.clone(), true)),
            upper: Some((v, true)),
        }
    }

    pub fn is_point(&self) -> bool {
        matches!((&self.lower, &self.upper), (Some((a, true)), Some((b, true))) if a == b)
    }
}

/// A physical query plan operator: given its children and compiled
/// properties, produces a lazy row sequence.
pub trait QPop {
    fn children(&self) -> Vec<&dyn QPop>;
    fn compiled(&self) -> &CompiledProps;
    fn estimated(&self) -> &EstimatedProps;
    fn memory_blocks_required(&self) -> usize;

    /// Total memory blocks required by this operator and all of its
    /// descendants, used to size the overall plan's footprint.
    fn total_memory_blocks_required(&self) -> usize {
        self.memory_blocks_required()
            + self.children().iter().map(|c| c.total_memory_blocks_required()).sum::<usize>()
    }

    fn estimated_cost(&self) -> u64 {
        let extra: u64 = self
            .children()
            .iter()
            .map(|c| c.estimated_cost())
            .sum::<u64>();
        let own_extra = self
            .estimated()
            .blocks_extra_init
            .map(|b| b.overall)
            .unwrap_or(0);
        extra + own_extra + self.estimated().blocks.overall
    }

    fn execute<'a>(&'a self) -> Box<dyn Iterator<Item = DbResult<Row>> + 'a>;
}
