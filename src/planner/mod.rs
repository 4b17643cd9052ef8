//! Logical query representation consumed by the planner, and the
//! planner trait itself.
//!
//! SQL parsing, validation, and name resolution happen upstream of
//! this crate; a `SfwghBlock` is the form an already-validated
//! statement takes by the time it reaches a planner. It's deliberately
//! thinner than a full logical-operator hierarchy: every `FROM` entry
//! is a base table (no subqueries), matching `BaselinePlanner`'s own
//! restriction in `optimize_block`.

pub mod baseline;

use crate::error::DbResult;
use crate::executor::{CompiledProps, QPop};
use crate::expr::ValExpr;
use crate::storage::{BplusTree, HeapFile};
use crate::value::{RowType, ValType};
use std::rc::Rc;

/// One of a base table's indexes (primary or secondary): the B+tree
/// backing it and the position of the indexed column within the
/// table's row type. This engine's B+tree is covering (see
/// `executor::leaf::IndexScanPop`), so scanning it needs no separate
/// join back to the heap file to retrieve the rest of a row's columns.
pub struct IndexInfo {
    pub tree: Rc<dyn BplusTree>,
    pub column_index: usize,
}

/// A base table as the planner sees it: its storage handle, its full
/// schema, and whichever indexes are available to drive access-path
/// selection.
pub struct BaseTable {
    pub heap: Rc<dyn HeapFile>,
    pub row_type: RowType,
    pub column_names: Vec<Rc<str>>,
    pub return_row_id: bool,
    pub primary_key: Option<IndexInfo>,
    pub secondary_indexes: Vec<IndexInfo>,
}

impl BaseTable {
    /// The name of the column that identifies a row: the primary key's
    /// column name if one is declared, else the synthetic row id.
    pub fn id_name(&self) -> Rc<str> {
        match &self.primary_key {
            Some(pk) => Rc::clone(&self.column_names[pk.column_index]),
            None => Rc::from("row_id"),
        }
    }

    pub fn id_type(&self) -> ValType {
        match &self.primary_key {
            Some(pk) => self.row_type[pk.column_index],
            None => ValType::Integer,
        }
    }

    pub fn id_column_index(&self) -> usize {
        match &self.primary_key {
            Some(pk) => pk.column_index,
            None => 0,
        }
    }

    /// Every index available on this table, paired with the name of
    /// the column it's keyed on, primary key first.
    pub fn indexes(&self) -> Vec<(&IndexInfo, &Rc<str>)> {
        self.primary_key
            .iter()
            .chain(self.secondary_indexes.iter())
            .map(|info| (info, &self.column_names[info.column_index]))
            .collect()
    }
}

/// A single SELECT-FROM-WHERE-GROUP BY-HAVING block. Every `FROM` entry
/// is a base table; `select_exprs`/`select_aliases` give the output
/// list (aliases are `None` for a column that keeps its source name).
pub struct SfwghBlock {
    pub from_tables: Vec<BaseTable>,
    pub from_aliases: Vec<String>,
    pub where_cond: Option<ValExpr>,
    pub groupby_exprs: Option<Vec<ValExpr>>,
    pub having_cond: Option<ValExpr>,
    pub select_exprs: Vec<ValExpr>,
    pub select_aliases: Vec<Option<String>>,
}

/// Converts a validated logical block into an executable physical plan.
pub trait Planner {
    fn optimize_block(&self, block: SfwghBlock) -> DbResult<Box<dyn QPop>>;
}

/// Find the output column index a `ValExpr` maps to in `pop`'s own
/// output, if it's a direct reference (a named reference resolved via
/// lineage, or a reference relative to `pop` itself). Used to check
/// whether an expression is already present (and so, possibly already
/// ordered on) in a subplan's output without recompiling anything.
pub fn column_in_output(compiled: &CompiledProps, expr: &ValExpr) -> Option<usize> {
    match expr {
        ValExpr::NamedColumnRef(alias, column, _) => compiled.column_in_lineage(alias, column),
        ValExpr::RelativeColumnRef(0, index, _) => Some(*index),
        _ => None,
    }
}
