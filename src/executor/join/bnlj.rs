//! Block nested-loop join: buffers outer rows using the full memory
//! budget, then for each outer buffer streams the entire inner
//! iterator once. Loop nesting, innermost first: outer-row (within
//! buffer) inside inner-row inside outer-buffer; the inner iterator is
//! re-created fresh for every outer buffer.

use crate::cexp::{CExpPtr, RowPair};
use crate::error::DbResult;
use crate::executor::{CompiledProps, EstimatedProps, QPop, StatsInBlocks};
use crate::util::BufferedReader;
use crate::value::{Row, Value};

pub struct BnljPop {
    left: Box<dyn QPop>,
    right: Box<dyn QPop>,
    cond: Option<CExpPtr<Value>>,
    num_memory_blocks: usize,
    compiled: CompiledProps,
    estimated: EstimatedProps,
}

impl BnljPop {
    pub fn new(
        left: Box<dyn QPop>,
        right: Box<dyn QPop>,
        cond: Option<CExpPtr<Value>>,
        num_memory_blocks: usize,
    ) -> Self {
        let compiled = CompiledProps::from_inputs(left.compiled(), right.compiled());
        let outer_blocks = left.estimated().blocks.overall.max(1);
        let inner_passes = outer_blocks.div_ceil(num_memory_blocks as u64);
        let right_cost = right.estimated().blocks.overall;
        let estimated = EstimatedProps {
            row_count: left.estimated().row_count * right.estimated().row_count.max(1),
            blocks: StatsInBlocks {
                self_reads: inner_passes * right_cost,
                self_writes: 0,
                overall: inner_passes * right_cost,
            },
            blocks_extra_init: None,
        };
        BnljPop {
            left,
            right,
            cond,
            num_memory_blocks,
            compiled,
            estimated,
        }
    }

}

impl QPop for BnljPop {
    fn children(&self) -> Vec<&dyn QPop> {
        vec![self.left.as_ref(), self.right.as_ref()]
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
        let outer_rows: Vec<Row> = match self.left.execute().collect::<DbResult<Vec<_>>>() {
            Ok(v) => v,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        let reader = BufferedReader::new(self.num_memory_blocks, self.left.compiled().row_type.clone());
        let chunks: Vec<Vec<Row>> = match reader.buffer_iter(outer_rows.into_iter()).collect::<DbResult<Vec<_>>>() {
            Ok(v) => v,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };

        let mut output = Vec::new();
        for outer_buf in chunks {
            let inner_rows = match self.right.execute().collect::<DbResult<Vec<_>>>() {
                Ok(v) => v,
                Err(e) => return Box::new(std::iter::once(Err(e))),
            };
            for inner_row in &inner_rows {
                for outer_row in &outer_buf {
                    let matches = match &self.cond {
                        None => true,
                        Some(c) => c.eval(&RowPair::pair(outer_row, inner_row)).as_bool(),
                    };
                    if matches {
                        let mut combined = outer_row.clone();
                        combined.extend(inner_row.iter().cloned());
                        output.push(combined);
                    }
                }
            }
        }
        Box::new(output.into_iter().map(Ok))
    }
}
