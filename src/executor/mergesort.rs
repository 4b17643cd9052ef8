//! Sorts its input via an `ExtSortBuffer`, using a comparator compiled
//! from the requested sort expressions.

use super::{CompiledProps, EstimatedProps, QPop};
use crate::cexp::RowComparator;
use crate::error::DbResult;
use crate::storage::StorageManager;
use crate::util::ExtSortBuffer;
use crate::value::Row;
use std::cmp::Ordering;
use std::rc::Rc;

pub struct MergeSortPop {
    input: Box<dyn QPop>,
    comparator: Rc<RowComparator>,
    storage: Rc<dyn StorageManager>,
    scope: String,
    num_memory_blocks: usize,
    compiled: CompiledProps,
    estimated: EstimatedProps,
}

impl MergeSortPop {
    /// `ordered_columns`/`ordered_asc` describe the sort key columns in
    /// the *output* schema (same as the input's, since sorting doesn't
    /// change the schema); trailing orderings inherited from an
    /// already-sorted input that agrees with and extends the requested
    /// keys should be appended by the caller before construction.
    pub fn new(
        input: Box<dyn QPop>,
        comparator: RowComparator,
        storage: Rc<dyn StorageManager>,
        scope: &str,
        num_memory_blocks: usize,
        ordered_columns: Vec<usize>,
        ordered_asc: Vec<bool>,
    ) -> Self {
        let mut compiled = input.compiled().clone();
        compiled.ordered_columns = ordered_columns;
        compiled.ordered_asc = ordered_asc;
        let estimated = input.estimated().clone();
        MergeSortPop {
            input,
            comparator: Rc::new(comparator),
            storage,
            scope: scope.to_string(),
            num_memory_blocks,
            compiled,
            estimated,
        }
    }
}

impl QPop for MergeSortPop {
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
        self.num_memory_blocks
    }
    fn execute<'a>(&'a self) -> Box<dyn Iterator<Item = DbResult<Row>> + 'a> {
        let comparator = Rc::clone(&self.comparator);
        let compare: Rc<dyn Fn(&Row, &Row) -> Ordering> =
            Rc::new(move |a: &Row, b: &Row| comparator.compare(a, b));
        let mut buf = match ExtSortBuffer::new(
            compare,
            Rc::clone(&self.storage),
            &self.scope,
            self.compiled.row_type.clone(),
            self.num_memory_blocks,
            None,
            false,
        ) {
            Ok(b) => b,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        for res in self.input.execute() {
            match res {
                Ok(row) => {
                    if let Err(e) = buf.add(row) {
                        return Box::new(std::iter::once(Err(e)));
                    }
                }
                Err(e) => return Box::new(std::iter::once(Err(e))),
            }
        }
        let sorted = match buf.into_sorted_rows() {
            Ok(r) => r,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        Box::new(sorted.into_iter().map(Ok))
    }
}
