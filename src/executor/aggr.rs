//! Grouped aggregation. Assumes the input is already sorted so that
//! rows sharing a group-by value are contiguous; the planner is
//! responsible for inserting a `MergeSortPop` upstream when needed.

use super::{CompiledProps, EstimatedProps, QPop};
use crate::cexp::{AggState, Aggregate};
use crate::compile::CompiledAggregate;
use crate::error::{DbError, DbResult};
use crate::storage::StorageManager;
use crate::util::ExtSortBuffer;
use crate::value::{Row, Value};
use std::rc::Rc;

pub struct GroupByPop {
    input: Box<dyn QPop>,
    group_by: crate::cexp::TupleExp,
    aggregates: Vec<CompiledAggregate>,
    storage: Rc<dyn StorageManager>,
    scope: String,
    num_memory_blocks: usize,
    compiled: CompiledProps,
    estimated: EstimatedProps,
}

impl GroupByPop {
    pub fn new(
        input: Box<dyn QPop>,
        group_by: crate::cexp::TupleExp,
        aggregates: Vec<CompiledAggregate>,
        storage: Rc<dyn StorageManager>,
        scope: &str,
        num_memory_blocks: usize,
        compiled: CompiledProps,
    ) -> DbResult<Self> {
        let non_incremental = aggregates.iter().filter(|a| !a.incremental).count();
        if num_memory_blocks < 3 * non_incremental.max(1) && non_incremental > 0 {
            return Err(DbError::configuration(format!(
                "grouped aggregation needs at least {} memory blocks for {non_incremental} non-incremental aggregate(s)",
                3 * non_incremental
            )));
        }
        let estimated = input.estimated().clone();
        Ok(GroupByPop {
            input,
            group_by,
            aggregates,
            storage,
            scope: scope.to_string(),
            num_memory_blocks,
            compiled,
            estimated,
        })
    }

    fn emit(&self, key: &[Value], states: Vec<AggState>) -> Row {
        let mut out: Row = key.to_vec();
        for (agg, state) in self.aggregates.iter().zip(states) {
            out.push(agg.agg.finalize(state));
        }
        out
    }
}

/// One group's in-flight accumulator: either a folded incremental
/// state, or a buffer of raw input values awaiting a final sort pass.
enum Acc {
    Incremental(AggState),
    Buffered(Box<ExtSortBuffer>),
}

impl QPop for GroupByPop {
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
        let mut current_key: Option<Vec<Value>> = None;
        let mut accs: Vec<Acc> = Vec::new();
        let mut output: Vec<Row> = Vec::new();

        macro_rules! bail {
            ($e:expr) => {
                return Box::new(std::iter::once(Err($e)))
            };
        }

        let flush = |accs: Vec<Acc>, key: &[Value]| -> DbResult<Row> {
            let mut states = Vec::with_capacity(accs.len());
            for (agg, acc) in self.aggregates.iter().zip(accs) {
                let state = match acc {
                    Acc::Incremental(s) => s,
                    Acc::Buffered(buf) => {
                        let rows = buf.into_sorted_rows()?;
                        let mut state = agg.agg.init();
                        for row in rows {
                            state = agg.agg.add(state, &row[0]);
                        }
                        state
                    }
                };
                states.push(state);
            }
            Ok(self.emit(key, states))
        };

        for res in self.input.execute() {
            let row = match res {
                Ok(r) => r,
                Err(e) => bail!(e),
            };
            let key = self.group_by.eval(&row);
            let boundary = current_key.as_deref() != Some(key.as_slice());
            if boundary {
                if let Some(prev_key) = current_key.take() {
                    match flush(std::mem::take(&mut accs), &prev_key) {
                        Ok(row) => output.push(row),
                        Err(e) => bail!(e),
                    }
                }
                accs = self
                    .aggregates
                    .iter()
                    .enumerate()
                    .map(|(i, agg)| {
                        if agg.incremental {
                            Acc::Incremental(agg.agg.init())
                        } else {
                            let cmp: Rc<dyn Fn(&Row, &Row) -> std::cmp::Ordering> =
                                Rc::new(|a: &Row, b: &Row| a[0].cmp(&b[0]));
                            let buf = ExtSortBuffer::new(
                                cmp,
                                Rc::clone(&self.storage),
                                &format!("{}_{}", self.scope, i),
                                vec![agg.input_type()],
                                self.num_memory_blocks,
                                None,
                                agg.is_distinct,
                            );
                            match buf {
                                Ok(b) => Acc::Buffered(Box::new(b)),
                                Err(_) => Acc::Incremental(agg.agg.init()),
                            }
                        }
                    })
                    .collect();
                current_key = Some(key.clone());
            }
            let rows = crate::cexp::RowPair::single(&row);
            for (acc, agg) in accs.iter_mut().zip(self.aggregates.iter()) {
                let v = agg.input.eval(&rows);
                match acc {
                    Acc::Incremental(state) => {
                        let s = std::mem::replace(state, agg.agg.init());
                        *state = agg.agg.add(s, &v);
                    }
                    Acc::Buffered(buf) => {
                        if let Err(e) = buf.add(vec![v]) {
                            bail!(e);
                        }
                    }
                }
            }
        }
        if let Some(key) = current_key {
            match flush(accs, &key) {
                Ok(row) => output.push(row),
                Err(e) => bail!(e),
            }
        }
        Box::new(output.into_iter().map(Ok))
    }
}
