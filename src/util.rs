//! External-memory building blocks shared by every execution operator:
//! [`BufferedReader`] batches an input iterator into byte-budgeted
//! chunks, [`BufferedWriter`] batches writes to a [`HeapFile`], and
//! [`ExtSortBuffer`] performs an external-memory sort (with optional
//! deduplication) via run generation and k-way merge.

use crate::config::BLOCK_SIZE;
use crate::error::{DbError, DbResult};
use crate::storage::{tmp_file_name, HeapFile, StorageManager};
use crate::value::{Row, RowType, ValType};
use std::cmp::Ordering;
use std::rc::Rc;

/// In debug builds, behaves like `debug_assert!`; kept as a distinct
/// macro so a release-mode relaxation can be introduced later without
/// touching call sites, matching the teacher's `perf_assert!` idiom.
macro_rules! perf_assert {
    ($cond:expr, $($arg:tt)*) => {
        debug_assert!($cond, $($arg)*);
    };
}
pub(crate) use perf_assert;

fn row_approx_bytes(row: &[crate::value::Value], types: &RowType) -> usize {
    debug_assert_eq!(row.len(), types.len());
    types.iter().map(|t| t.approx_size()).sum()
}

/// Buffers rows from an input iterator and yields them a chunk at a
/// time, where each chunk fits within `num_memory_blocks * BLOCK_SIZE`
/// bytes. Used so an operator can hold a whole chunk in memory (e.g.
/// the outer side of block nested-loop join) without re-reading it.
pub struct BufferedReader {
    max_bytes: usize,
    row_type: RowType,
}

impl BufferedReader {
    pub fn new(num_memory_blocks: usize, row_type: RowType) -> Self {
        BufferedReader {
            max_bytes: num_memory_blocks * BLOCK_SIZE,
            row_type,
        }
    }

    /// Drain `input` into successive buffers, each as large as the byte
    /// budget allows. The final, possibly partial, buffer is included.
    pub fn buffer_iter(
        &self,
        input: impl Iterator<Item = Row> + 'static,
    ) -> impl Iterator<Item = DbResult<Vec<Row>>> {
        BufferIter {
            input,
            row_type: self.row_type.clone(),
            max_bytes: self.max_bytes,
            lookahead: None,
            done: false,
        }
    }
}

/// Stateful iterator backing [`BufferedReader::buffer_iter`]: a single
/// row of lookahead lets a buffer be closed off as soon as the next
/// row wouldn't fit, without needing the input iterator to support peek.
struct BufferIter<I> {
    input: I,
    row_type: RowType,
    max_bytes: usize,
    lookahead: Option<Row>,
    done: bool,
}

impl<I: Iterator<Item = Row>> Iterator for BufferIter<I> {
    type Item = DbResult<Vec<Row>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buffer = Vec::new();
        let mut num_bytes = 0usize;
        if let Some(row) = self.lookahead.take() {
            num_bytes += row_approx_bytes(&row, &self.row_type);
            buffer.push(row);
        }
        loop {
            match self.input.next() {
                None => {
                    self.done = true;
                    break;
                }
                Some(row) => {
                    let row_size = row_approx_bytes(&row, &self.row_type);
                    if row_size > self.max_bytes {
                        return Some(Err(DbError::execution(format!(
                            "row too big to fit in buffer of {} bytes",
                            self.max_bytes
                        ))));
                    }
                    if num_bytes + row_size > self.max_bytes {
                        self.lookahead = Some(row);
                        break;
                    }
                    buffer.push(row);
                    num_bytes += row_size;
                }
            }
        }
        if buffer.is_empty() {
            None
        } else {
            Some(Ok(buffer))
        }
    }
}

/// Buffers rows to be appended to a [`HeapFile`], flushing in one
/// batch either when the buffer is full or on explicit request. If all
/// rows fit in memory, the file may end up touched only once.
pub struct BufferedWriter {
    file: Rc<dyn HeapFile>,
    max_bytes: usize,
    row_type: RowType,
    buffer: Vec<Row>,
    num_bytes: usize,
    num_blocks_flushed: usize,
}

impl BufferedWriter {
    pub fn new(file: Rc<dyn HeapFile>, num_memory_blocks: usize) -> Self {
        let row_type = file.row_type().clone();
        BufferedWriter {
            file,
            max_bytes: num_memory_blocks * BLOCK_SIZE,
            row_type,
            buffer: Vec::new(),
            num_bytes: 0,
            num_blocks_flushed: 0,
        }
    }

    pub fn write(&mut self, row: Row) -> DbResult<()> {
        let row_size = row_approx_bytes(&row, &self.row_type);
        if self.num_bytes + row_size > self.max_bytes {
            self.flush()?;
        }
        self.num_bytes += row_size;
        self.buffer.push(row);
        Ok(())
    }

    pub fn flush(&mut self) -> DbResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.file.batch_append(std::mem::take(&mut self.buffer))?;
        self.num_blocks_flushed += 1;
        self.num_bytes = 0;
        Ok(())
    }

    pub fn num_blocks_flushed(&self) -> usize {
        self.num_blocks_flushed
    }
}

/// Buffers rows, sorts them (with optional deduplication), and yields
/// them back in order. If everything fits in `num_memory_blocks`
/// blocks, no temporary file is ever created; otherwise runs are
/// spilled and merged in passes of up to `num_memory_blocks - 1` runs,
/// down to `num_memory_blocks_final` runs for the final streaming pass.
///
/// All rows must be added before any are retrieved.
pub struct ExtSortBuffer {
    compare: Rc<dyn Fn(&Row, &Row) -> Ordering>,
    storage: Rc<dyn StorageManager>,
    scope: String,
    row_type: RowType,
    num_memory_blocks: usize,
    num_memory_blocks_final: usize,
    max_bytes: usize,
    deduplicate: bool,
    buffer: Vec<Row>,
    num_bytes: usize,
    num_blocks_flushed: usize,
    runs: Vec<(String, Rc<dyn HeapFile>)>,
}

impl ExtSortBuffer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        compare: Rc<dyn Fn(&Row, &Row) -> Ordering>,
        storage: Rc<dyn StorageManager>,
        scope: &str,
        row_type: RowType,
        num_memory_blocks: usize,
        num_memory_blocks_final: Option<usize>,
        deduplicate: bool,
    ) -> DbResult<Self> {
        if num_memory_blocks <= 2 {
            return Err(DbError::configuration(
                "merge sort needs at least 3 memory blocks to perform a merge",
            ));
        }
        let num_memory_blocks_final = num_memory_blocks_final.unwrap_or(num_memory_blocks);
        if num_memory_blocks_final <= 1 {
            return Err(DbError::configuration(
                "merge sort needs at least 2 memory blocks to perform the final merge",
            ));
        }
        Ok(ExtSortBuffer {
            compare,
            storage,
            scope: scope.to_string(),
            row_type,
            num_memory_blocks,
            num_memory_blocks_final,
            max_bytes: num_memory_blocks * BLOCK_SIZE,
            deduplicate,
            buffer: Vec::new(),
            num_bytes: 0,
            num_blocks_flushed: 0,
            runs: Vec::new(),
        })
    }

    fn new_run(&self, level: u32) -> DbResult<(String, Rc<dyn HeapFile>)> {
        let name = tmp_file_name(&self.scope, level, self.runs.len());
        let file = self.storage.heap_file(&name, self.row_type.clone())?;
        Ok((name, file))
    }

    fn flush(&mut self) -> DbResult<()> {
        let mut rows = std::mem::take(&mut self.buffer);
        rows.sort_by(|a, b| (self.compare)(a, b));
        if self.deduplicate {
            rows.dedup_by(|a, b| a == b);
        }
        let (name, run) = self.new_run(0)?;
        run.batch_append(rows)?;
        self.runs.push((name, run));
        self.num_bytes = 0;
        self.num_blocks_flushed += self.num_memory_blocks;
        Ok(())
    }

    /// Add a row, spilling the in-memory buffer to a temporary run if
    /// it would otherwise exceed the byte budget.
    pub fn add(&mut self, row: Row) -> DbResult<()> {
        if self.deduplicate && self.buffer.iter().any(|r| r == &row) {
            return Ok(());
        }
        let row_size = row_approx_bytes(&row, &self.row_type);
        if row_size > self.max_bytes {
            return Err(DbError::execution(format!(
                "row too big to fit in sort buffer of {} bytes",
                self.max_bytes
            )));
        }
        if self.num_bytes + row_size > self.max_bytes {
            self.flush()?;
        }
        self.num_bytes += row_size;
        self.buffer.push(row);
        Ok(())
    }

    /// Merge a fixed set of sorted runs into a single sorted stream,
    /// collapsing adjacent duplicates when deduplicating. One memory
    /// block is effectively required per run being merged.
    fn merge_runs(&self, runs: &[(String, Rc<dyn HeapFile>)]) -> Vec<Row> {
        let mut heads: Vec<_> = runs
            .iter()
            .map(|(_, r)| r.iter_scan(false).map(|(_, row)| row).peekable())
            .collect();
        let mut out = Vec::new();
        let mut last: Option<Row> = None;
        loop {
            let mut best: Option<usize> = None;
            for (i, it) in heads.iter_mut().enumerate() {
                if let Some(row) = it.peek() {
                    match best {
                        None => best = Some(i),
                        Some(b) => {
                            if (self.compare)(row, heads[b].peek().unwrap()) == Ordering::Less {
                                best = Some(i);
                            }
                        }
                    }
                }
            }
            let Some(i) = best else { break };
            let row = heads[i].next().unwrap();
            let keep = !self.deduplicate || last.as_ref() != Some(&row);
            if keep {
                out.push(row.clone());
            }
            last = Some(row);
        }
        out
    }

    /// Consume the buffer and return all rows in sorted order,
    /// resetting the buffer to empty for reuse.
    pub fn into_sorted_rows(mut self) -> DbResult<Vec<Row>> {
        if self.num_blocks_flushed == 0 {
            let mut rows = std::mem::take(&mut self.buffer);
            rows.sort_by(|a, b| (self.compare)(a, b));
            if self.deduplicate {
                rows.dedup_by(|a, b| a == b);
            }
            return Ok(rows);
        }
        if !self.buffer.is_empty() {
            self.flush()?;
        }
        let mut level = 1u32;
        while self.runs.len() > self.num_memory_blocks_final {
            log::debug!("merge pass {level}: merging {} runs", self.runs.len());
            let mut new_runs = Vec::new();
            let chunk = self.num_memory_blocks - 1;
            for subset in self.runs.chunks(chunk) {
                let merged = self.merge_runs(subset);
                let name = tmp_file_name(&self.scope, level, new_runs.len());
                let new_run = self.storage.heap_file(&name, self.row_type.clone())?;
                new_run.batch_append(merged)?;
                for (run_name, _) in subset {
                    self.storage.delete_heap_file(run_name)?;
                }
                new_runs.push((name, new_run));
            }
            self.runs = new_runs;
            level += 1;
        }
        log::debug!("final merge of {} runs", self.runs.len());
        let result = self.merge_runs(&self.runs);
        for (run_name, _) in &self.runs {
            self.storage.delete_heap_file(run_name)?;
        }
        Ok(result)
    }
}

/// Sentinel sizes for `ValType`-typed rows used by budget accounting;
/// kept alongside the buffer types since that's their only consumer.
pub fn row_fits(types: &[ValType], num_memory_blocks: usize) -> bool {
    let size: usize = types.iter().map(|t| t.approx_size()).sum();
    size <= num_memory_blocks * BLOCK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorageManager;
    use crate::value::Value;
    use std::cell::RefCell;

    fn int_row(n: i64) -> Row {
        vec![Value::Integer(n)]
    }

    #[test]
    fn buffered_writer_flushes_without_exceeding_budget() {
        let storage = MemStorageManager::new();
        let file = storage
            .heap_file("t", vec![ValType::Integer])
            .unwrap();
        let mut writer = BufferedWriter::new(file.clone(), 1);
        for i in 0..1000 {
            writer.write(int_row(i)).unwrap();
        }
        writer.flush().unwrap();
        assert_eq!(file.stat().row_count, 1000);
        assert!(writer.num_blocks_flushed() > 1);
    }

    #[test]
    fn ext_sort_buffer_sorts_in_memory() {
        let storage: Rc<dyn StorageManager> = Rc::new(MemStorageManager::new());
        let cmp: Rc<dyn Fn(&Row, &Row) -> Ordering> =
            Rc::new(|a: &Row, b: &Row| a[0].cmp(&b[0]));
        let mut buf = ExtSortBuffer::new(
            cmp,
            storage,
            "test",
            vec![ValType::Integer],
            5,
            None,
            false,
        )
        .unwrap();
        for i in [3, 1, 4, 1, 5, 9, 2, 6].into_iter() {
            buf.add(int_row(i)).unwrap();
        }
        let rows = buf.into_sorted_rows().unwrap();
        let values: Vec<i64> = rows.iter().map(|r| r[0].as_int()).collect();
        assert_eq!(values, vec![1, 1, 2, 3, 4, 5, 6, 9]);
    }

    #[test]
    fn ext_sort_buffer_spills_and_merges() {
        let storage: Rc<dyn StorageManager> = Rc::new(MemStorageManager::new());
        let cmp: Rc<dyn Fn(&Row, &Row) -> Ordering> =
            Rc::new(|a: &Row, b: &Row| a[0].cmp(&b[0]));
        // Tiny budget forces multiple spilled runs.
        let mut buf = ExtSortBuffer::new(
            cmp,
            storage,
            "test2",
            vec![ValType::Integer],
            3,
            Some(2),
            true,
        )
        .unwrap();
        let input: Vec<i64> = (0..200).rev().chain(0..200).collect();
        for i in input {
            buf.add(int_row(i)).unwrap();
        }
        let rows = buf.into_sorted_rows().unwrap();
        let values: Vec<i64> = rows.iter().map(|r| r[0].as_int()).collect();
        let expected: Vec<i64> = (0..200).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn add_rejects_a_row_too_big_for_the_buffer() {
        let storage: Rc<dyn StorageManager> = Rc::new(MemStorageManager::new());
        let cmp: Rc<dyn Fn(&Row, &Row) -> Ordering> = Rc::new(|a: &Row, b: &Row| a[0].cmp(&b[0]));
        // `ValType::approx_size` charges a fixed estimate per column
        // regardless of content, so a row wide enough to blow the
        // 3-block budget needs many columns, not a long string.
        let row_type: Vec<ValType> = std::iter::repeat(ValType::Varchar).take(500).collect();
        let mut buf = ExtSortBuffer::new(cmp, storage, "test3", row_type.clone(), 3, None, false).unwrap();
        let huge: Row = row_type.iter().map(|_| Value::Varchar(Rc::from("x"))).collect();
        assert!(buf.add(huge).is_err());
    }

    /// Counts every heap file created vs. deleted, to check that a
    /// multi-pass sort doesn't leak its intermediate runs.
    struct CountingStorage {
        inner: MemStorageManager,
        created: RefCell<usize>,
        deleted: RefCell<usize>,
    }

    impl StorageManager for CountingStorage {
        fn heap_file(&self, name: &str, row_type: RowType) -> DbResult<Rc<dyn HeapFile>> {
            *self.created.borrow_mut() += 1;
            self.inner.heap_file(name, row_type)
        }
        fn delete_heap_file(&self, name: &str) -> DbResult<()> {
            *self.deleted.borrow_mut() += 1;
            self.inner.delete_heap_file(name)
        }
        fn bplus_tree(&self, name: &str, row_type: RowType, unique: bool) -> DbResult<Rc<dyn crate::storage::BplusTree>> {
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
    fn multi_pass_sort_deletes_every_intermediate_run() {
        let storage = Rc::new(CountingStorage {
            inner: MemStorageManager::new(),
            created: RefCell::new(0),
            deleted: RefCell::new(0),
        });
        let cmp: Rc<dyn Fn(&Row, &Row) -> Ordering> = Rc::new(|a: &Row, b: &Row| a[0].cmp(&b[0]));
        let mut buf = ExtSortBuffer::new(
            cmp,
            Rc::clone(&storage) as Rc<dyn StorageManager>,
            "test4",
            vec![ValType::Integer],
            3,
            Some(2),
            false,
        )
        .unwrap();
        // Enough 8-byte integer rows to overflow the 3-block budget
        // several times over, forcing multiple spilled runs and at
        // least one merge pass.
        let input: Vec<i64> = (0..5000).rev().collect();
        for i in input {
            buf.add(int_row(i)).unwrap();
        }
        let rows = buf.into_sorted_rows().unwrap();
        assert_eq!(rows.len(), 5000);
        assert!(*storage.created.borrow() > 0);
        assert_eq!(*storage.created.borrow(), *storage.deleted.borrow());
    }
}
