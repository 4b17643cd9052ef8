//! Hash equi-join: recursive partitioning until one side's largest
//! partition fits in `M-1` blocks, then in-memory hash build on that
//! side and stream-probe on the other.

use crate::cexp::{EqComparator, TupleExp};
use crate::config::BLOCK_SIZE;
use crate::error::DbResult;
use crate::executor::{CompiledProps, EstimatedProps, QPop, StatsInBlocks};
use crate::storage::StorageManager;
use crate::util::BufferedWriter;
use crate::value::{Row, Value};
use rustc_hash::FxHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// A fixed 32-bit avalanche mix of `rustc_hash::FxHasher`'s 64-bit
/// output, so partitions at different recursion depths don't collapse
/// onto the same bits.
fn scrambled_hash(key: &[Value]) -> u32 {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    let h = hasher.finish();
    let mut x = h as u32;
    x = ((x >> 16) ^ x).wrapping_mul(0x45d9f3b);
    x = ((x >> 16) ^ x).wrapping_mul(0x45d9f3b);
    x = (x >> 16) ^ x;
    x
}

fn partition_index(key: &[Value], fanout: usize, divisor: u64) -> usize {
    let h = scrambled_hash(key) as u64;
    ((h / divisor) % fanout as u64) as usize
}

fn approx_bytes(rows: &[Row], width: usize) -> usize {
    rows.len() * width * 16
}

pub struct HashEqJoinPop {
    left: Box<dyn QPop>,
    right: Box<dyn QPop>,
    left_key: TupleExp,
    right_key: TupleExp,
    eq: EqComparator,
    storage: Rc<dyn StorageManager>,
    scope: String,
    num_memory_blocks: usize,
    max_depth: u32,
    compiled: CompiledProps,
    estimated: EstimatedProps,
}

impl HashEqJoinPop {
    pub fn new(
        left: Box<dyn QPop>,
        right: Box<dyn QPop>,
        left_key: TupleExp,
        right_key: TupleExp,
        eq: EqComparator,
        storage: Rc<dyn StorageManager>,
        scope: &str,
        num_memory_blocks: usize,
        max_depth: u32,
    ) -> Self {
        let compiled = CompiledProps::from_inputs(left.compiled(), right.compiled());
        let estimated = EstimatedProps {
            row_count: left.estimated().row_count.max(right.estimated().row_count),
            blocks: StatsInBlocks {
                self_reads: 2 * (left.estimated().blocks.overall + right.estimated().blocks.overall),
                self_writes: left.estimated().blocks.overall + right.estimated().blocks.overall,
                overall: 3 * (left.estimated().blocks.overall + right.estimated().blocks.overall),
            },
            blocks_extra_init: None,
        };
        HashEqJoinPop {
            left,
            right,
            left_key,
            right_key,
            eq,
            storage,
            scope: scope.to_string(),
            num_memory_blocks,
            max_depth,
            compiled,
            estimated,
        }
    }

    fn budget_bytes(&self) -> usize {
        (self.num_memory_blocks - 1) * BLOCK_SIZE
    }

    fn partition(&self, rows: Vec<Row>, is_left: bool, fanout: usize, divisor: u64, level: u32) -> DbResult<Vec<Vec<Row>>> {
        let row_type = if is_left {
            self.left.compiled().row_type.clone()
        } else {
            self.right.compiled().row_type.clone()
        };
        let mut names = Vec::with_capacity(fanout);
        let mut files = Vec::with_capacity(fanout);
        for i in 0..fanout {
            let name = crate::storage::tmp_file_name(
                &format!("{}_{}_{}", self.scope, if is_left { "l" } else { "r" }, level),
                level,
                i,
            );
            files.push(self.storage.heap_file(&name, row_type.clone())?);
            names.push(name);
        }
        let mut writers: Vec<BufferedWriter> = files
            .iter()
            .map(|f| BufferedWriter::new(Rc::clone(f), 1))
            .collect();
        for row in rows {
            let key = if is_left {
                self.left_key.eval(&row)
            } else {
                self.right_key.eval(&row)
            };
            let idx = partition_index(&key, fanout, divisor);
            writers[idx].write(row)?;
        }
        for w in &mut writers {
            w.flush()?;
        }
        let partitions: Vec<Vec<Row>> = files.iter().map(|f| f.iter_scan(false).map(|(_, row)| row).collect()).collect();
        // Every row is already read back into `partitions`; the temporary
        // files backing this partitioning round are consumed as soon as
        // this call returns.
        for name in &names {
            self.storage.delete_heap_file(name)?;
        }
        Ok(partitions)
    }

    fn hash_join_recursive(
        &self,
        left: Vec<Row>,
        right: Vec<Row>,
        depth: u32,
        divisor: u64,
    ) -> DbResult<Vec<Row>> {
        // The build side is fixed to the left input for the life of this
        // join; recursion is driven by the left side's partition size only.
        let left_width = self.left.compiled().row_type.len();
        let left_fits = approx_bytes(&left, left_width) <= self.budget_bytes();
        if depth >= self.max_depth || left_fits {
            return Ok(self.build_probe(left, right));
        }
        let fanout = if depth == 0 {
            self.num_memory_blocks
        } else {
            self.num_memory_blocks - 1
        };
        let left_parts = self.partition(left, true, fanout, divisor, depth)?;
        let right_parts = self.partition(right, false, fanout, divisor, depth)?;
        let mut out = Vec::new();
        for (l, r) in left_parts.into_iter().zip(right_parts) {
            if l.is_empty() || r.is_empty() {
                continue;
            }
            out.extend(self.hash_join_recursive(l, r, depth + 1, divisor * fanout as u64)?);
        }
        Ok(out)
    }

    /// Builds an in-memory multimap on the left side and streams the
    /// right side against it, applying the full equality condition to
    /// every candidate pair before emitting.
    fn build_probe(&self, left: Vec<Row>, right: Vec<Row>) -> Vec<Row> {
        let mut map: HashMap<Vec<Value>, Vec<Row>> = HashMap::new();
        for row in left {
            let key = self.left_key.eval(&row);
            map.entry(key).or_default().push(row);
        }
        let mut out = Vec::new();
        for probe_row in right {
            let key = self.right_key.eval(&probe_row);
            if let Some(candidates) = map.get(&key) {
                for build_row in candidates {
                    if self.eq.eval(build_row, &probe_row) {
                        let mut combined = build_row.clone();
                        combined.extend(probe_row.iter().cloned());
                        out.push(combined);
                    }
                }
            }
        }
        out
    }
}

impl QPop for HashEqJoinPop {
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
        let left_rows: Vec<Row> = match self.left.execute().collect::<DbResult<Vec<_>>>() {
            Ok(v) => v,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        let right_rows: Vec<Row> = match self.right.execute().collect::<DbResult<Vec<_>>>() {
            Ok(v) => v,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        match self.hash_join_recursive(left_rows, right_rows, 0, 1) {
            Ok(rows) => Box::new(rows.into_iter().map(Ok)),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile_scalar;
    use crate::executor::leaf::LiteralTablePop;
    use crate::expr::ValExpr;
    use crate::storage::MemStorageManager;
    use crate::value::ValType;
    use std::cell::RefCell;

    fn key_expr(index: usize) -> TupleExp {
        TupleExp {
            parts: vec![compile_scalar(&ValExpr::RelativeColumnRef(0, index, ValType::Integer), &[&[]])],
        }
    }

    #[test]
    fn matches_rows_across_two_partitioning_rounds() {
        let left_rows: Vec<Row> = (0..40).map(|i| vec![Value::Integer(i), Value::Integer(i * 10)]).collect();
        let right_rows: Vec<Row> = (0..40).map(|i| vec![Value::Integer(i), Value::Varchar(Rc::from(format!("r{i}")))]).collect();
        let left = Box::new(LiteralTablePop::new(left_rows, vec![ValType::Integer, ValType::Integer]));
        let right = Box::new(LiteralTablePop::new(right_rows, vec![ValType::Integer, ValType::Varchar]));

        let eq = EqComparator {
            pairs: vec![(
                compile_scalar(&ValExpr::RelativeColumnRef(0, 0, ValType::Integer), &[&[]]),
                compile_scalar(&ValExpr::RelativeColumnRef(0, 0, ValType::Integer), &[&[]]),
            )],
        };
        let storage: Rc<dyn StorageManager> = Rc::new(MemStorageManager::new());
        let join = HashEqJoinPop::new(left, right, key_expr(0), key_expr(0), eq, storage, "test_hasheqj", 3, 3);

        let rows: Vec<Row> = join.execute().collect::<DbResult<Vec<_>>>().unwrap();
        assert_eq!(rows.len(), 40);
        for row in &rows {
            assert_eq!(row[0], row[2]);
        }
    }

    #[test]
    fn non_matching_keys_produce_no_rows() {
        let left = Box::new(LiteralTablePop::new(vec![vec![Value::Integer(1)]], vec![ValType::Integer]));
        let right = Box::new(LiteralTablePop::new(vec![vec![Value::Integer(2)]], vec![ValType::Integer]));
        let eq = EqComparator {
            pairs: vec![(
                compile_scalar(&ValExpr::RelativeColumnRef(0, 0, ValType::Integer), &[&[]]),
                compile_scalar(&ValExpr::RelativeColumnRef(0, 0, ValType::Integer), &[&[]]),
            )],
        };
        let storage: Rc<dyn StorageManager> = Rc::new(MemStorageManager::new());
        let join = HashEqJoinPop::new(left, right, key_expr(0), key_expr(0), eq, storage, "test_hasheqj_empty", 3, 3);
        let rows: Vec<Row> = join.execute().collect::<DbResult<Vec<_>>>().unwrap();
        assert!(rows.is_empty());
    }

    /// Counts every heap file created vs. deleted, to check that
    /// recursive partitioning doesn't leak its temporary partition files.
    struct CountingStorage {
        inner: MemStorageManager,
        created: RefCell<usize>,
        deleted: RefCell<usize>,
    }

    impl StorageManager for CountingStorage {
        fn heap_file(&self, name: &str, row_type: crate::value::RowType) -> DbResult<Rc<dyn crate::storage::HeapFile>> {
            *self.created.borrow_mut() += 1;
            self.inner.heap_file(name, row_type)
        }
        fn delete_heap_file(&self, name: &str) -> DbResult<()> {
            *self.deleted.borrow_mut() += 1;
            self.inner.delete_heap_file(name)
        }
        fn bplus_tree(&self, name: &str, row_type: crate::value::RowType, unique: bool) -> DbResult<Rc<dyn crate::storage::BplusTree>> {
            self.inner.bplus_tree(name, row_type, unique)
        }
        fn delete_bplus_tree(&self, name: &str) -> DbResult<()> {
            self.inner.delete_bplus_tree(name)
        }
        fn shutdown(&self) -> DbResult<()> {
            self.inner.shutdown()
        }
    }

    #[test]
    fn recursive_partitioning_deletes_every_temporary_partition() {
        // Large enough that the left side's approximate size exceeds the
        // 2-block partitioning budget, forcing at least one partitioning
        // round rather than an immediate in-memory build_probe.
        let left_rows: Vec<Row> = (0..1000).map(|i| vec![Value::Integer(i), Value::Integer(i * 10)]).collect();
        let right_rows: Vec<Row> = (0..1000).map(|i| vec![Value::Integer(i), Value::Varchar(Rc::from(format!("r{i}")))]).collect();
        let left = Box::new(LiteralTablePop::new(left_rows, vec![ValType::Integer, ValType::Integer]));
        let right = Box::new(LiteralTablePop::new(right_rows, vec![ValType::Integer, ValType::Varchar]));
        let eq = EqComparator {
            pairs: vec![(
                compile_scalar(&ValExpr::RelativeColumnRef(0, 0, ValType::Integer), &[&[]]),
                compile_scalar(&ValExpr::RelativeColumnRef(0, 0, ValType::Integer), &[&[]]),
            )],
        };
        let storage = Rc::new(CountingStorage {
            inner: MemStorageManager::new(),
            created: RefCell::new(0),
            deleted: RefCell::new(0),
        });
        let join = HashEqJoinPop::new(
            left,
            right,
            key_expr(0),
            key_expr(0),
            eq,
            Rc::clone(&storage) as Rc<dyn StorageManager>,
            "test_hasheqj_leak",
            3,
            4,
        );
        let rows: Vec<Row> = join.execute().collect::<DbResult<Vec<_>>>().unwrap();
        assert_eq!(rows.len(), 1000);
        assert!(*storage.created.borrow() > 0);
        assert_eq!(*storage.created.borrow(), *storage.deleted.borrow());
    }
}
