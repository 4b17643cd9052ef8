//! Merge equi-join: assumes both inputs are already sorted by the join
//! expressions in matching order. Advances two cursors; matching keys
//! are batched (all left rows sharing a key, all right rows sharing
//! the same key) and the cross product of the two batches is emitted
//! as a small BNL over the batch.

use crate::cexp::{CExpPtr, EqComparator, RowPair};
use crate::error::DbResult;
use crate::executor::{CompiledProps, EstimatedProps, QPop, StatsInBlocks};
use crate::value::{Row, Value};
use std::cmp::Ordering;

pub struct MergeEqJoinPop {
    left: Box<dyn QPop>,
    right: Box<dyn QPop>,
    left_key: CExpPtr<Value>,
    right_key: CExpPtr<Value>,
    eq: EqComparator,
    compiled: CompiledProps,
    estimated: EstimatedProps,
}

impl MergeEqJoinPop {
    pub fn new(
        left: Box<dyn QPop>,
        right: Box<dyn QPop>,
        left_key: CExpPtr<Value>,
        right_key: CExpPtr<Value>,
        eq: EqComparator,
        inherit_left_ordering: bool,
        inherit_right_ordering: bool,
    ) -> Self {
        let mut compiled = CompiledProps::from_inputs(left.compiled(), right.compiled());
        let left_ordered = left.compiled().ordered_columns.clone();
        let left_width = left.compiled().row_type.len();
        if inherit_left_ordering {
            compiled.ordered_columns = left_ordered;
            compiled.ordered_asc = left.compiled().ordered_asc.clone();
        } else if inherit_right_ordering {
            compiled.ordered_columns = right
                .compiled()
                .ordered_columns
                .iter()
                .map(|c| c + left_width)
                .collect();
            compiled.ordered_asc = right.compiled().ordered_asc.clone();
        }
        let estimated = EstimatedProps {
            row_count: left.estimated().row_count.max(right.estimated().row_count),
            blocks: StatsInBlocks {
                self_reads: left.estimated().blocks.overall + right.estimated().blocks.overall,
                self_writes: 0,
                overall: left.estimated().blocks.overall + right.estimated().blocks.overall,
            },
            blocks_extra_init: None,
        };
        MergeEqJoinPop {
            left,
            right,
            left_key,
            right_key,
            eq,
            compiled,
            estimated,
        }
    }
}

impl QPop for MergeEqJoinPop {
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
        4 // two spill-capable two-block batch buffers
    }

    fn execute<'a>(&'a self) -> Box<dyn Iterator<Item = DbResult<Row>> + 'a> {
        let left_rows: Vec<Row> = match self.left.execute().collect::<DbResult<Vec<_>>>() {
            Ok(v) => v,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        let right_rows: Vec<Row> = match self.right.execute().collect::<DbResult<Vec<_>>>() {
            Ok(v) => v,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };

        let mut output = Vec::new();
        let (mut i, mut j) = (0usize, 0usize);
        while i < left_rows.len() && j < right_rows.len() {
            let lk = self.left_key.eval(&RowPair::single(&left_rows[i]));
            let rk = self.right_key.eval(&RowPair::single(&right_rows[j]));
            match lk.cmp(&rk) {
                Ordering::Less => i += 1,
                Ordering::Greater => j += 1,
                Ordering::Equal => {
                    let li_start = i;
                    while i < left_rows.len()
                        && self.left_key.eval(&RowPair::single(&left_rows[i])) == lk
                    {
                        i += 1;
                    }
                    let rj_start = j;
                    while j < right_rows.len()
                        && self.right_key.eval(&RowPair::single(&right_rows[j])) == rk
                    {
                        j += 1;
                    }
                    for l in &left_rows[li_start..i] {
                        for r in &right_rows[rj_start..j] {
                            if self.eq.eval(l, r) {
                                let mut combined = l.clone();
                                combined.extend(r.iter().cloned());
                                output.push(combined);
                            }
                        }
                    }
                }
            }
        }
        Box::new(output.into_iter().map(Ok))
    }
}
