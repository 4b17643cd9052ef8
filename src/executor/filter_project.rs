//! Row-at-a-time `Filter` and `Project` operators.

use super::{CompiledProps, EstimatedProps, QPop};
use crate::cexp::{CExpPtr, RowPair};
use crate::error::DbResult;
use crate::value::{Row, Value};

/// Keeps rows for which `cond` evaluates true. Ordering and uniqueness
/// are unaffected by filtering a subset of rows, so they're copied
/// from the input unchanged.
pub struct FilterPop {
    input: Box<dyn QPop>,
    cond: CExpPtr<Value>,
    compiled: CompiledProps,
    estimated: EstimatedProps,
}

impl FilterPop {
    pub fn new(input: Box<dyn QPop>, cond: CExpPtr<Value>, selectivity: f64) -> Self {
        let compiled = input.compiled().clone();
        let mut estimated = input.estimated().clone();
        estimated.row_count = ((estimated.row_count as f64) * selectivity).ceil() as u64;
        FilterPop {
            input,
            cond,
            compiled,
            estimated,
        }
    }
}

impl QPop for FilterPop {
    fn children(&self) -> Vec<&dyn QPop> {
        vec![self.input.as_ref()]
    }
    fn compiled(&self) -> &CompiledProps {
        &self.compiled
    }
    fn estimated(&self) -> &EstimatedProps {
        &self.estimated
    }
    fn memory_blocks_required(&self) -> usize {
        0
    }
    fn execute<'a>(&'a self) -> Box<dyn Iterator<Item = DbResult<Row>> + 'a> {
        Box::new(self.input.execute().filter_map(move |res| match res {
            Err(e) => Some(Err(e)),
            Ok(row) => {
                let keep = self.cond.eval(&RowPair::single(&row)).as_bool();
                keep.then_some(Ok(row))
            }
        }))
    }
}

/// Evaluates a fixed list of projection expressions per row. Ordering
/// is preserved for a leading run of direct column references; the
/// output is marked unique on a column only if its source column was
/// unique and it's a direct reference.
pub struct ProjectPop {
    input: Box<dyn QPop>,
    exprs: Vec<CExpPtr<Value>>,
    compiled: CompiledProps,
    estimated: EstimatedProps,
}

impl ProjectPop {
    pub fn new(
        input: Box<dyn QPop>,
        exprs: Vec<CExpPtr<Value>>,
        compiled: CompiledProps,
    ) -> Self {
        let estimated = input.estimated().clone();
        ProjectPop {
            input,
            exprs,
            compiled,
            estimated,
        }
    }
}

impl QPop for ProjectPop {
    fn children(&self) -> Vec<&dyn QPop> {
        vec![self.input.as_ref()]
    }
    fn compiled(&self) -> &CompiledProps {
        &self.compiled
    }
    fn estimated(&self) -> &EstimatedProps {
        &self.estimated
    }
    fn memory_blocks_required(&self) -> usize {
        0
    }
    fn execute<'a>(&'a self) -> Box<dyn Iterator<Item = DbResult<Row>> + 'a> {
        Box::new(self.input.execute().map(move |res| {
            res.map(|row| {
                let rows = RowPair::single(&row);
                self.exprs.iter().map(|e| e.eval(&rows)).collect()
            })
        }))
    }
}
