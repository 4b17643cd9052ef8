//! Index nested-loop join: for each outer row, computes a `Sarg` from
//! the join condition and re-targets the inner `IndexScanPop`'s range
//! before draining it. Needs no extra memory blocks of its own.

use crate::cexp::{CExpPtr, RowPair};
use crate::error::DbResult;
use crate::executor::leaf::IndexScanPop;
use crate::executor::{CompiledProps, EstimatedProps, QPop, Sarg, StatsInBlocks};
use crate::value::{Row, Value};

/// How to derive the inner range from an outer row: a single
/// expression evaluated against the outer row, used as an equality key.
pub struct IndexNLJoinPop {
    left: Box<dyn QPop>,
    inner: IndexScanPop,
    outer_key: CExpPtr<Value>,
    residual: Option<CExpPtr<Value>>,
    compiled: CompiledProps,
    estimated: EstimatedProps,
}

impl IndexNLJoinPop {
    pub fn new(
        left: Box<dyn QPop>,
        inner: IndexScanPop,
        outer_key: CExpPtr<Value>,
        residual: Option<CExpPtr<Value>>,
    ) -> Self {
        let compiled = CompiledProps::from_inputs(left.compiled(), inner.compiled());
        let outer_rows = left.estimated().row_count.max(1);
        let estimated = EstimatedProps {
            row_count: outer_rows,
            blocks: StatsInBlocks {
                self_reads: outer_rows,
                self_writes: 0,
                overall: outer_rows,
            },
            blocks_extra_init: None,
        };
        IndexNLJoinPop {
            left,
            inner,
            outer_key,
            residual,
            compiled,
            estimated,
        }
    }
}

impl QPop for IndexNLJoinPop {
    fn children(&self) -> Vec<&dyn QPop> {
        vec![self.left.as_ref(), &self.inner]
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
        let outer_rows: Vec<Row> = match self.left.execute().collect::<DbResult<Vec<_>>>() {
            Ok(v) => v,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        let mut output = Vec::new();
        for outer_row in outer_rows {
            let key = self.outer_key.eval(&RowPair::single(&outer_row));
            self.inner.set_range(Sarg::eq(key));
            let inner_rows: Vec<Row> = match self.inner.execute().collect::<DbResult<Vec<_>>>() {
                Ok(v) => v,
                Err(e) => return Box::new(std::iter::once(Err(e))),
            };
            for inner_row in inner_rows {
                let keep = match &self.residual {
                    None => true,
                    Some(r) => r.eval(&RowPair::pair(&outer_row, &inner_row)).as_bool(),
                };
                if keep {
                    let mut combined = outer_row.clone();
                    combined.extend(inner_row);
                    output.push(combined);
                }
            }
        }
        Box::new(output.into_iter().map(Ok))
    }
}
