//! Caches its input the first time it's drained, so subsequent passes
//! (e.g. the inner side of an `IndexNLJoin` invoked once per outer row)
//! serve from memory instead of re-running the input subplan.

use super::{CompiledProps, EstimatedProps, QPop};
use crate::error::DbResult;
use crate::value::Row;
use std::cell::RefCell;

pub struct MaterializePop {
    input: Box<dyn QPop>,
    blocking: bool,
    num_memory_blocks: usize,
    cache: RefCell<Option<Vec<Row>>>,
    compiled: CompiledProps,
    estimated: EstimatedProps,
}

impl MaterializePop {
    pub fn new(input: Box<dyn QPop>, blocking: bool, num_memory_blocks: usize) -> Self {
        let compiled = input.compiled().clone();
        let estimated = input.estimated().clone();
        MaterializePop {
            input,
            blocking,
            num_memory_blocks,
            cache: RefCell::new(None),
            compiled,
            estimated,
        }
    }
}

impl QPop for MaterializePop {
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
        if let Some(cached) = self.cache.borrow().as_ref() {
            return Box::new(cached.clone().into_iter().map(Ok));
        }
        // First pass: drain fully (blocking semantics are the only
        // difference non-blocking streaming would make is visible
        // latency before the first row; both end up caching everything).
        let mut rows = Vec::new();
        for res in self.input.execute() {
            match res {
                Ok(row) => rows.push(row),
                Err(e) => return Box::new(std::iter::once(Err(e))),
            }
        }
        *self.cache.borrow_mut() = Some(rows.clone());
        let _ = self.blocking;
        Box::new(rows.into_iter().map(Ok))
    }
}
