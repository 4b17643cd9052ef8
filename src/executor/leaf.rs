//! Leaf operators: table scan, index scan, and a fixed literal table.

use super::{CompiledProps, EstimatedProps, OutputLineage, QPop, Sarg, StatsInBlocks};
use crate::error::DbResult;
use crate::storage::{BplusTree, HeapFile};
use crate::value::{Row, RowType, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// Scans a base table's heap file (emitting `row_id` as the first
/// column if requested) or its primary-key B+tree (which already
/// carries the key as the first column). Declares the output sorted
/// ascending by, and unique on, that leading column.
pub enum TableSource {
    Heap(Rc<dyn HeapFile>, bool),
    Keyed(Rc<dyn BplusTree>),
}

pub struct TableScanPop {
    source: TableSource,
    alias: Rc<str>,
    compiled: CompiledProps,
    estimated: EstimatedProps,
}

impl TableScanPop {
    /// `row_type` is the full output schema: for `Heap` with
    /// `return_row_id` set, it leads with an INTEGER id column; for
    /// `Keyed`, it leads with the primary key's own column type.
    pub fn new(source: TableSource, alias: &str, row_type: RowType, column_names: &[Rc<str>]) -> Self {
        let alias_rc: Rc<str> = Rc::from(alias);
        let output_lineage: OutputLineage = column_names
            .iter()
            .map(|c| vec![(Rc::clone(&alias_rc), Rc::clone(c))])
            .collect();
        let row_count = match &source {
            TableSource::Heap(file, _) => file.stat().row_count,
            TableSource::Keyed(tree) => tree.stat().row_count,
        };
        TableScanPop {
            source,
            alias: Rc::from(alias),
            compiled: CompiledProps {
                row_type,
                output_lineage,
                ordered_columns: vec![0],
                ordered_asc: vec![true],
                unique_columns: vec![0],
            },
            estimated: EstimatedProps {
                row_count,
                blocks: StatsInBlocks {
                    self_reads: row_count / 64 + 1,
                    self_writes: 0,
                    overall: row_count / 64 + 1,
                },
                blocks_extra_init: None,
            },
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }
}

impl QPop for TableScanPop {
    fn children(&self) -> Vec<&dyn QPop> {
        Vec::new()
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
        match &self.source {
            TableSource::Heap(file, return_row_id) => {
                let return_row_id = *return_row_id;
                Box::new(file.iter_scan(return_row_id).map(move |(id, mut row)| {
                    if return_row_id {
                        let id = id.expect("row id requested but not returned");
                        row.insert(0, Value::Integer(id as i64));
                    }
                    Ok(row)
                }))
            }
            TableSource::Keyed(tree) => Box::new(tree.iter_scan(None).map(Ok)),
        }
    }
}

/// Scans a B+tree index. A point lookup uses `set_key`; a range scan
/// uses `set_range` with per-bound inclusivity. The range may be reset
/// before each `execute()` call (e.g. once per outer row of an
/// `IndexNLJoin`), hence the `RefCell`.
///
/// This engine's `BplusTree` is a covering index (it stores the whole
/// row under its key, not just a row id), so an index scan emits full
/// rows, ordered ascending on `key_column_index`, rather than just the
/// key. A non-covering secondary index would instead emit (key, row
/// id) pairs and need a further join back to the base table.
pub struct IndexScanPop {
    tree: Rc<dyn BplusTree>,
    alias: Rc<str>,
    range: RefCell<Option<Sarg>>,
    compiled: CompiledProps,
    estimated: EstimatedProps,
}

impl IndexScanPop {
    pub fn new(
        tree: Rc<dyn BplusTree>,
        alias: &str,
        row_type: RowType,
        column_names: &[Rc<str>],
        key_column_index: usize,
    ) -> Self {
        let alias_rc: Rc<str> = Rc::from(alias);
        let output_lineage: OutputLineage = column_names
            .iter()
            .map(|c| vec![(Rc::clone(&alias_rc), Rc::clone(c))])
            .collect();
        let row_count = tree.stat().row_count;
        IndexScanPop {
            tree,
            alias: alias_rc,
            range: RefCell::new(None),
            compiled: CompiledProps {
                row_type,
                output_lineage,
                ordered_columns: vec![key_column_index],
                ordered_asc: vec![true],
                unique_columns: vec![key_column_index],
            },
            estimated: EstimatedProps {
                row_count,
                blocks: StatsInBlocks {
                    self_reads: row_count / 128 + 1,
                    self_writes: 0,
                    overall: row_count / 128 + 1,
                },
                blocks_extra_init: None,
            },
        }
    }

    /// Narrow the next `execute()` call to an exact key.
    pub fn set_key(&self, key: Value) {
        *self.range.borrow_mut() = Some(Sarg::eq(key));
    }

    /// Narrow the next `execute()` call to a (possibly open-ended) range.
    pub fn set_range(&self, sarg: Sarg) {
        *self.range.borrow_mut() = Some(sarg);
    }
}

impl QPop for IndexScanPop {
    fn children(&self) -> Vec<&dyn QPop> {
        Vec::new()
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
        let sarg = self.range.borrow().clone();
        let key_idx = self.compiled.ordered_columns[0];
        match sarg {
            None => Box::new(self.tree.iter_scan(None).map(Ok)),
            Some(s) if s.is_point() => {
                let key = s.lower.unwrap().0;
                Box::new(self.tree.iter_get(&[key]).map(Ok))
            }
            Some(s) => {
                let lower_bound = s.lower.as_ref().map(|(v, _)| vec![v.clone()]);
                let lower_excl = s.lower;
                let upper_excl = s.upper;
                let it = self.tree.iter_scan(lower_bound.as_deref());
                Box::new(it.filter_map(move |row| {
                    let key = &row[key_idx];
                    if let Some((bound, inclusive)) = &lower_excl {
                        let within = if *inclusive { key >= bound } else { key > bound };
                        if !within {
                            return None;
                        }
                    }
                    if let Some((bound, inclusive)) = &upper_excl {
                        let within = if *inclusive { key <= bound } else { key < bound };
                        if !within {
                            return None;
                        }
                    }
                    Some(Ok(row))
                }))
            }
        }
    }
}

/// Emits a fixed, already-materialized vector of rows.
pub struct LiteralTablePop {
    rows: Vec<Row>,
    compiled: CompiledProps,
    estimated: EstimatedProps,
}

impl LiteralTablePop {
    pub fn new(rows: Vec<Row>, row_type: RowType) -> Self {
        let row_count = rows.len() as u64;
        LiteralTablePop {
            rows,
            compiled: CompiledProps {
                row_type,
                output_lineage: Vec::new(),
                ordered_columns: Vec::new(),
                ordered_asc: Vec::new(),
                unique_columns: Vec::new(),
            },
            estimated: EstimatedProps {
                row_count,
                blocks: StatsInBlocks::default(),
                blocks_extra_init: None,
            },
        }
    }
}

impl QPop for LiteralTablePop {
    fn children(&self) -> Vec<&dyn QPop> {
        Vec::new()
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
        Box::new(self.rows.clone().into_iter().map(Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemBplusTree;
    use crate::value::ValType;

    fn tree_with(values: &[i64]) -> Rc<dyn BplusTree> {
        let tree = Rc::new(MemBplusTree::new(true));
        for &v in values {
            tree.put(vec![Value::Integer(v)], vec![Value::Integer(v), Value::Varchar(Rc::from(format!("v{v}")))])
                .unwrap();
        }
        tree as Rc<dyn BplusTree>
    }

    #[test]
    fn unscoped_scan_yields_every_row_in_key_order() {
        let tree = tree_with(&[3, 1, 2]);
        let scan = IndexScanPop::new(tree, "t", vec![ValType::Integer, ValType::Varchar], &[Rc::from("id"), Rc::from("name")], 0);
        let rows: Vec<Row> = scan.execute().collect::<DbResult<Vec<_>>>().unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r[0].as_int()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn point_lookup_returns_only_the_matching_row() {
        let tree = tree_with(&[1, 2, 3]);
        let scan = IndexScanPop::new(tree, "t", vec![ValType::Integer, ValType::Varchar], &[Rc::from("id"), Rc::from("name")], 0);
        scan.set_key(Value::Integer(2));
        let rows: Vec<Row> = scan.execute().collect::<DbResult<Vec<_>>>().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], Value::Integer(2));
    }

    #[test]
    fn range_scan_respects_inclusive_and_exclusive_bounds() {
        let tree = tree_with(&[1, 2, 3, 4, 5]);
        let scan = IndexScanPop::new(tree, "t", vec![ValType::Integer, ValType::Varchar], &[Rc::from("id"), Rc::from("name")], 0);
        scan.set_range(Sarg {
            lower: Some((Value::Integer(2), true)),
            upper: Some((Value::Integer(4), false)),
        });
        let rows: Vec<Row> = scan.execute().collect::<DbResult<Vec<_>>>().unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r[0].as_int()).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn range_scan_skips_the_excluded_lower_bound() {
        let tree = tree_with(&[1, 2, 3, 4, 5]);
        let scan = IndexScanPop::new(tree, "t", vec![ValType::Integer, ValType::Varchar], &[Rc::from("id"), Rc::from("name")], 0);
        scan.set_range(Sarg {
            lower: Some((Value::Integer(2), false)),
            upper: Some((Value::Integer(4), true)),
        });
        let rows: Vec<Row> = scan.execute().collect::<DbResult<Vec<_>>>().unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r[0].as_int()).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn table_scan_over_heap_prepends_row_id_when_requested() {
        use crate::storage::MemHeapFile;
        let heap = Rc::new(MemHeapFile::new(vec![ValType::Varchar]));
        heap.put(vec![Value::Varchar(Rc::from("a"))], None).unwrap();
        heap.put(vec![Value::Varchar(Rc::from("b"))], None).unwrap();
        let scan = TableScanPop::new(
            TableSource::Heap(heap, true),
            "t",
            vec![ValType::Integer, ValType::Varchar],
            &[Rc::from("row_id"), Rc::from("name")],
        );
        let rows: Vec<Row> = scan.execute().collect::<DbResult<Vec<_>>>().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Value::Integer(0));
        assert_eq!(rows[1][0], Value::Integer(1));
    }
}
