//! The key/value storage boundary the executor runs against.
//!
//! The genuine on-disk heap file / B+tree store is an external
//! collaborator and explicitly out of scope; this module gives the
//! executor a trait-based seam (`HeapFile`, `BplusTree`,
//! `StorageManager`) plus a simple in-memory reference implementation
//! so operators, the external-sort buffer, and the planner's Sarg
//! index lookups can all be exercised without a real storage engine
//! behind them.

use crate::error::{DbError, DbResult};
use crate::value::{Row, RowType, Value};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// A handle to an append/scan/update-capable table of fixed-arity rows,
/// addressed by an opaque monotonically increasing row id.
pub trait HeapFile {
    fn get(&self, row_id: u64) -> DbResult<Option<Row>>;
    /// Iterate all rows, optionally paired with their row id.
    fn iter_scan(&self, return_row_id: bool) -> Box<dyn Iterator<Item = (Option<u64>, Row)>>;
    fn put(&self, row: Row, row_id: Option<u64>) -> DbResult<u64>;
    /// Append a batch of rows in one call, returning (first id, count).
    fn batch_append(&self, rows: Vec<Row>) -> DbResult<(u64, usize)>;
    fn truncate(&self) -> DbResult<usize>;
    fn delete(&self, row_id: u64) -> DbResult<usize>;
    fn row_type(&self) -> &RowType;
    /// Approximate row count, for cost estimation.
    fn stat(&self) -> HeapFileStat;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeapFileStat {
    pub row_count: u64,
}

/// A handle to an ordered key -> row index, used for both primary keys
/// (`unique = true`) and secondary indices.
pub trait BplusTree {
    fn get_one(&self, key: &[Value]) -> DbResult<Option<Row>>;
    fn iter_get(&self, key: &[Value]) -> Box<dyn Iterator<Item = Row>>;
    /// Scan in key order, optionally starting at `key_lower` (inclusive).
    fn iter_scan(&self, key_lower: Option<&[Value]>) -> Box<dyn Iterator<Item = Row>>;
    fn put(&self, key: Vec<Value>, row: Row) -> DbResult<()>;
    fn delete(&self, key: &[Value], row: Option<&Row>) -> DbResult<usize>;
    fn stat(&self) -> BplusTreeStat;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BplusTreeStat {
    pub row_count: u64,
}

/// Creates and destroys heap files and B+trees, including the
/// anonymous temporary heap files the external-sort buffer spills to.
pub trait StorageManager {
    fn heap_file(&self, name: &str, row_type: RowType) -> DbResult<Rc<dyn HeapFile>>;
    fn delete_heap_file(&self, name: &str) -> DbResult<()>;
    fn bplus_tree(
        &self,
        name: &str,
        row_type: RowType,
        unique: bool,
    ) -> DbResult<Rc<dyn BplusTree>>;
    fn delete_bplus_tree(&self, name: &str) -> DbResult<()>;
    fn shutdown(&self) -> DbResult<()>;
}

/// An in-memory `HeapFile`: a `Vec` of rows behind a `RefCell`, ids
/// assigned densely and never reused (matching the on-disk engine's
/// contract that deleted ids are never recycled within a transaction).
pub struct MemHeapFile {
    row_type: RowType,
    rows: RefCell<BTreeMap<u64, Row>>,
    next_id: RefCell<u64>,
}

impl MemHeapFile {
    pub fn new(row_type: RowType) -> Self {
        MemHeapFile {
            row_type,
            rows: RefCell::new(BTreeMap::new()),
            next_id: RefCell::new(0),
        }
    }
}

impl HeapFile for MemHeapFile {
    fn get(&self, row_id: u64) -> DbResult<Option<Row>> {
        Ok(self.rows.borrow().get(&row_id).cloned())
    }

    fn iter_scan(&self, return_row_id: bool) -> Box<dyn Iterator<Item = (Option<u64>, Row)>> {
        let snapshot: Vec<(u64, Row)> = self.rows.borrow().iter().map(|(k, v)| (*k, v.clone())).collect();
        Box::new(snapshot.into_iter().map(move |(id, row)| {
            (if return_row_id { Some(id) } else { None }, row)
        }))
    }

    fn put(&self, row: Row, row_id: Option<u64>) -> DbResult<u64> {
        let id = match row_id {
            Some(id) => id,
            None => {
                let mut next = self.next_id.borrow_mut();
                let id = *next;
                *next += 1;
                id
            }
        };
        self.rows.borrow_mut().insert(id, row);
        Ok(id)
    }

    fn batch_append(&self, rows: Vec<Row>) -> DbResult<(u64, usize)> {
        let mut next = self.next_id.borrow_mut();
        let start = *next;
        let count = rows.len();
        let mut map = self.rows.borrow_mut();
        for row in rows {
            map.insert(*next, row);
            *next += 1;
        }
        Ok((start, count))
    }

    fn truncate(&self) -> DbResult<usize> {
        let n = self.rows.borrow().len();
        self.rows.borrow_mut().clear();
        Ok(n)
    }

    fn delete(&self, row_id: u64) -> DbResult<usize> {
        Ok(self.rows.borrow_mut().remove(&row_id).is_some() as usize)
    }

    fn row_type(&self) -> &RowType {
        &self.row_type
    }

    fn stat(&self) -> HeapFileStat {
        HeapFileStat {
            row_count: self.rows.borrow().len() as u64,
        }
    }
}

/// An in-memory `BplusTree`: an ordered map from key tuple to the rows
/// stored under it (a `Vec` rather than a single row, since
/// `unique = false` trees allow duplicate keys).
pub struct MemBplusTree {
    unique: bool,
    entries: RefCell<BTreeMap<Vec<Value>, Vec<Row>>>,
}

impl MemBplusTree {
    pub fn new(unique: bool) -> Self {
        MemBplusTree {
            unique,
            entries: RefCell::new(BTreeMap::new()),
        }
    }
}

impl BplusTree for MemBplusTree {
    fn get_one(&self, key: &[Value]) -> DbResult<Option<Row>> {
        Ok(self.entries.borrow().get(key).and_then(|v| v.first().cloned()))
    }

    fn iter_get(&self, key: &[Value]) -> Box<dyn Iterator<Item = Row>> {
        let rows = self.entries.borrow().get(key).cloned().unwrap_or_default();
        Box::new(rows.into_iter())
    }

    fn iter_scan(&self, key_lower: Option<&[Value]>) -> Box<dyn Iterator<Item = Row>> {
        let lower = key_lower.map(|k| k.to_vec());
        let snapshot: Vec<(Vec<Value>, Vec<Row>)> = self
            .entries
            .borrow()
            .iter()
            .filter(|(k, _)| lower.as_ref().map_or(true, |l| k.as_slice() >= l.as_slice()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Box::new(snapshot.into_iter().flat_map(|(_, rows)| rows.into_iter()))
    }

    fn put(&self, key: Vec<Value>, row: Row) -> DbResult<()> {
        let mut entries = self.entries.borrow_mut();
        let bucket = entries.entry(key).or_default();
        if self.unique && !bucket.is_empty() {
            return Err(DbError::constraint("duplicate key in unique index"));
        }
        bucket.push(row);
        Ok(())
    }

    fn delete(&self, key: &[Value], row: Option<&Row>) -> DbResult<usize> {
        let mut entries = self.entries.borrow_mut();
        let Some(bucket) = entries.get_mut(key) else {
            return Ok(0);
        };
        let before = bucket.len();
        match row {
            Some(r) => bucket.retain(|existing| existing != r),
            None => bucket.clear(),
        }
        Ok(before - bucket.len())
    }

    fn stat(&self) -> BplusTreeStat {
        let count: usize = self.entries.borrow().values().map(Vec::len).sum();
        BplusTreeStat {
            row_count: count as u64,
        }
    }
}

/// A `StorageManager` that keeps everything in process memory. Its
/// temporary-file names are namespaced so the external-sort buffer's
/// (level, run) pairs never collide with user tables.
pub struct MemStorageManager {
    heaps: RefCell<BTreeMap<String, Rc<dyn HeapFile>>>,
    trees: RefCell<BTreeMap<String, Rc<dyn BplusTree>>>,
}

impl MemStorageManager {
    pub fn new() -> Self {
        MemStorageManager {
            heaps: RefCell::new(BTreeMap::new()),
            trees: RefCell::new(BTreeMap::new()),
        }
    }
}

impl Default for MemStorageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageManager for MemStorageManager {
    fn heap_file(&self, name: &str, row_type: RowType) -> DbResult<Rc<dyn HeapFile>> {
        let mut heaps = self.heaps.borrow_mut();
        Ok(heaps
            .entry(name.to_string())
            .or_insert_with(|| Rc::new(MemHeapFile::new(row_type)))
            .clone())
    }

    fn delete_heap_file(&self, name: &str) -> DbResult<()> {
        self.heaps.borrow_mut().remove(name);
        Ok(())
    }

    fn bplus_tree(&self, name: &str, _row_type: RowType, unique: bool) -> DbResult<Rc<dyn BplusTree>> {
        let mut trees = self.trees.borrow_mut();
        Ok(trees
            .entry(name.to_string())
            .or_insert_with(|| Rc::new(MemBplusTree::new(unique)))
            .clone())
    }

    fn delete_bplus_tree(&self, name: &str) -> DbResult<()> {
        self.trees.borrow_mut().remove(name);
        Ok(())
    }

    fn shutdown(&self) -> DbResult<()> {
        Ok(())
    }
}

/// Allocates distinct temporary heap file names for the external-sort
/// buffer's (level, run) pairs, e.g. `tmp_sort_3_7_0_2`.
pub fn tmp_file_name(scope: &str, level: u32, run: usize) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("tmp_{scope}_{id}_{level}_{run}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(n: i64) -> Row {
        vec![Value::Integer(n)]
    }

    #[test]
    fn heap_file_assigns_dense_never_reused_ids() {
        let heap = MemHeapFile::new(vec![crate::value::ValType::Integer]);
        let a = heap.put(row(1), None).unwrap();
        let b = heap.put(row(2), None).unwrap();
        heap.delete(a).unwrap();
        let c = heap.put(row(3), None).unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
        assert!(heap.get(a).unwrap().is_none());
        assert_eq!(heap.stat().row_count, 2);
    }

    #[test]
    fn unique_tree_rejects_duplicate_key() {
        let tree = MemBplusTree::new(true);
        tree.put(vec![Value::Integer(1)], row(1)).unwrap();
        assert!(tree.put(vec![Value::Integer(1)], row(2)).is_err());
    }

    #[test]
    fn non_unique_tree_allows_duplicate_key() {
        let tree = MemBplusTree::new(false);
        tree.put(vec![Value::Integer(1)], row(1)).unwrap();
        tree.put(vec![Value::Integer(1)], row(2)).unwrap();
        assert_eq!(tree.iter_get(&[Value::Integer(1)]).count(), 2);
    }

    #[test]
    fn delete_with_row_removes_only_that_entry_from_a_shared_bucket() {
        let tree = MemBplusTree::new(false);
        tree.put(vec![Value::Integer(1)], row(10)).unwrap();
        tree.put(vec![Value::Integer(1)], row(20)).unwrap();

        let removed = tree.delete(&[Value::Integer(1)], Some(&row(10))).unwrap();
        assert_eq!(removed, 1);
        let remaining: Vec<Row> = tree.iter_get(&[Value::Integer(1)]).collect();
        assert_eq!(remaining, vec![row(20)]);
    }

    #[test]
    fn delete_without_a_row_clears_the_whole_bucket() {
        let tree = MemBplusTree::new(false);
        tree.put(vec![Value::Integer(1)], row(10)).unwrap();
        tree.put(vec![Value::Integer(1)], row(20)).unwrap();

        let removed = tree.delete(&[Value::Integer(1)], None).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(tree.iter_get(&[Value::Integer(1)]).count(), 0);
    }

    #[test]
    fn storage_manager_returns_the_same_handle_for_repeated_names() {
        let storage = MemStorageManager::new();
        let a = storage.heap_file("t", vec![crate::value::ValType::Integer]).unwrap();
        a.put(row(1), None).unwrap();
        let b = storage.heap_file("t", vec![crate::value::ValType::Integer]).unwrap();
        assert_eq!(b.stat().row_count, 1);
    }
}
