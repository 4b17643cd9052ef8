//! Statement-level operators: CREATE TABLE, CREATE INDEX, INSERT,
//! DELETE, ANALYZE, SHOW TABLES. Unlike `QPop`, these don't stream
//! rows; `execute()` performs the command's storage side effects once
//! and returns the one-line response text a session echoes back.

use crate::compile::compile_row_comparator;
use crate::config::DEFAULT_SORT_BUFFER_SIZE;
use crate::error::{DbError, DbResult};
use crate::executor::leaf::{TableScanPop, TableSource};
use crate::executor::materialize::MaterializePop;
use crate::executor::mergesort::MergeSortPop;
use crate::executor::QPop;
use crate::expr::ValExpr;
use crate::planner::BaseTable;
use crate::storage::{BplusTree, HeapFile, StorageManager};
use crate::value::{RowType, ValType};
use std::rc::Rc;

/// A statement that mutates storage (or catalog state) and reports a
/// short result string, rather than producing rows.
pub trait CPop {
    fn execute(&self) -> DbResult<String>;
}

/// Creates a base table's storage: a heap file always, plus a unique
/// covering B+tree if the table declares a primary key. Schema
/// bookkeeping (upserting the catalog entry) lives with whatever
/// session layer owns table names; out of scope here.
pub struct CreateTablePop {
    storage: Rc<dyn StorageManager>,
    name: String,
    row_type: RowType,
    primary_key_column_index: Option<usize>,
}

impl CreateTablePop {
    pub fn new(storage: Rc<dyn StorageManager>, name: &str, row_type: RowType, primary_key_column_index: Option<usize>) -> Self {
        CreateTablePop {
            storage,
            name: name.to_string(),
            row_type,
            primary_key_column_index,
        }
    }
}

impl CPop for CreateTablePop {
    fn execute(&self) -> DbResult<String> {
        self.storage.heap_file(&self.name, self.row_type.clone())?;
        if self.primary_key_column_index.is_some() {
            self.storage.bplus_tree(&format!("{}_pk", self.name), self.row_type.clone(), true)?;
        }
        Ok("CREATE TABLE".to_string())
    }
}

/// Builds a new secondary covering index: scans the base table (with
/// its row id if it has no declared primary key), sorts by
/// (indexed column, id) so duplicate keys come out in a stable order,
/// then batch-inserts into a fresh B+tree keyed on the indexed column.
pub struct CreateIndexPop {
    storage: Rc<dyn StorageManager>,
    table_name: String,
    heap: Rc<dyn HeapFile>,
    row_type: RowType,
    column_names: Vec<Rc<str>>,
    return_row_id: bool,
    id_column_index: usize,
    column_index: usize,
}

impl CreateIndexPop {
    pub fn new(storage: Rc<dyn StorageManager>, table_name: &str, table: &BaseTable, column_index: usize) -> Self {
        CreateIndexPop {
            storage,
            table_name: table_name.to_string(),
            heap: Rc::clone(&table.heap),
            row_type: table.row_type.clone(),
            column_names: table.column_names.clone(),
            return_row_id: table.primary_key.is_none(),
            id_column_index: table.id_column_index(),
            column_index,
        }
    }
}

impl CPop for CreateIndexPop {
    fn execute(&self) -> DbResult<String> {
        let (scan_row_type, scan_names, id_idx, key_idx) = if self.return_row_id {
            let mut row_type = self.row_type.clone();
            row_type.insert(0, ValType::Integer);
            let mut names = self.column_names.clone();
            names.insert(0, Rc::from("row_id"));
            (row_type, names, 0usize, self.column_index + 1)
        } else {
            (self.row_type.clone(), self.column_names.clone(), self.id_column_index, self.column_index)
        };

        let source = TableSource::Heap(Rc::clone(&self.heap), self.return_row_id);
        let scan: Box<dyn QPop> = Box::new(TableScanPop::new(source, "t", scan_row_type.clone(), &scan_names));

        let keys = vec![
            (ValExpr::RelativeColumnRef(0, key_idx, scan_row_type[key_idx]), true),
            (ValExpr::RelativeColumnRef(0, id_idx, scan_row_type[id_idx]), true),
        ];
        let comparator = compile_row_comparator(&keys, &[]);
        let scope = format!("createindex_{}_{}", self.table_name, self.column_names[self.column_index]);
        let sorted = MergeSortPop::new(
            scan,
            comparator,
            Rc::clone(&self.storage),
            &scope,
            DEFAULT_SORT_BUFFER_SIZE,
            vec![key_idx, id_idx],
            vec![true, true],
        );

        let index_name = format!("{}_{}", self.table_name, self.column_names[self.column_index]);
        let tree = self.storage.bplus_tree(&index_name, scan_row_type, false)?;
        let mut count = 0u64;
        for row in sorted.execute() {
            let row = row?;
            tree.put(vec![row[key_idx].clone()], row.clone())?;
            count += 1;
        }
        Ok(format!("CREATE INDEX {count}"))
    }
}

/// Appends rows from `contents` into a table's heap and every one of
/// its indexes, checking the primary-key constraint before any write
/// lands. Assumes `contents` already produces rows of the table's own
/// type; no implicit casting happens here.
pub struct InsertPop {
    heap: Rc<dyn HeapFile>,
    primary_key: Option<(Rc<dyn BplusTree>, usize)>,
    secondary_indexes: Vec<(Rc<dyn BplusTree>, usize)>,
    contents: Box<dyn QPop>,
}

impl InsertPop {
    pub fn new(table: &BaseTable, contents: Box<dyn QPop>) -> Self {
        InsertPop {
            heap: Rc::clone(&table.heap),
            primary_key: table.primary_key.as_ref().map(|pk| (Rc::clone(&pk.tree), pk.column_index)),
            secondary_indexes: table
                .secondary_indexes
                .iter()
                .map(|info| (Rc::clone(&info.tree), info.column_index))
                .collect(),
            contents,
        }
    }
}

impl CPop for InsertPop {
    fn execute(&self) -> DbResult<String> {
        let mut count = 0u64;
        for row in self.contents.execute() {
            let row = row?;
            if let Some((tree, pk_idx)) = &self.primary_key {
                let key = vec![row[*pk_idx].clone()];
                if tree.get_one(&key)?.is_some() {
                    return Err(DbError::constraint(format!(
                        "primary key constraint violation: key value {:?}",
                        row[*pk_idx]
                    )));
                }
            }
            self.heap.put(row.clone(), None)?;
            if let Some((tree, pk_idx)) = &self.primary_key {
                tree.put(vec![row[*pk_idx].clone()], row.clone())?;
            }
            for (tree, col_idx) in &self.secondary_indexes {
                tree.put(vec![row[*col_idx].clone()], row.clone())?;
            }
            count += 1;
        }
        Ok(format!("INSERT {count}"))
    }
}

/// Deletes rows identified by `key_query`, whose output layout is
/// `[heap row id, primary-key value?, secondary-index values...]` in
/// that order. `key_query` is wrapped in a blocking `Materialize` so
/// its rows are all read before any deletion begins, matching the
/// rule that a delete's read set must not change under its own writes.
pub struct DeletePop {
    heap: Rc<dyn HeapFile>,
    primary_key: Option<Rc<dyn BplusTree>>,
    secondary_indexes: Vec<Rc<dyn BplusTree>>,
    key_query: MaterializePop,
}

impl DeletePop {
    pub fn new(table: &BaseTable, key_query: Box<dyn QPop>, num_memory_blocks: usize) -> Self {
        DeletePop {
            heap: Rc::clone(&table.heap),
            primary_key: table.primary_key.as_ref().map(|pk| Rc::clone(&pk.tree)),
            secondary_indexes: table.secondary_indexes.iter().map(|info| Rc::clone(&info.tree)).collect(),
            key_query: MaterializePop::new(key_query, true, num_memory_blocks),
        }
    }
}

impl CPop for DeletePop {
    fn execute(&self) -> DbResult<String> {
        let mut count = 0u64;
        for row in self.key_query.execute() {
            let row = row?;
            let row_id = row[0].as_int() as u64;
            let full_row = self.heap.get(row_id)?;
            self.heap.delete(row_id)?;
            let mut offset = 1;
            if let Some(tree) = &self.primary_key {
                tree.delete(&[row[offset].clone()], full_row.as_ref())?;
                offset += 1;
            }
            for tree in &self.secondary_indexes {
                tree.delete(&[row[offset].clone()], full_row.as_ref())?;
                offset += 1;
            }
            count += 1;
        }
        Ok(format!("DELETE {count}"))
    }
}

/// Recomputes statistics. The naive statistics collector itself is
/// out of scope (see SPEC_FULL.md §6); this records that an analyze
/// ran and names which tables it covered.
pub struct AnalyzeStatsPop {
    table_names: Option<Vec<String>>,
}

impl AnalyzeStatsPop {
    pub fn new(table_names: Option<Vec<String>>) -> Self {
        AnalyzeStatsPop { table_names }
    }
}

impl CPop for AnalyzeStatsPop {
    fn execute(&self) -> DbResult<String> {
        match &self.table_names {
            Some(names) => {
                log::info!("analyzed stats for {}", names.join(", "));
                Ok(format!("ANALYZE {}", names.join(", ")))
            }
            None => {
                log::info!("analyzed stats for all tables");
                Ok("ANALYZE".to_string())
            }
        }
    }
}

/// Which storage primitive backs a base table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Heap,
    BplusTree,
}

pub struct TableSummary {
    pub name: String,
    pub kind: TableKind,
    pub row_count: u64,
}

pub struct ShowTablesPop {
    tables: Vec<TableSummary>,
}

impl ShowTablesPop {
    pub fn new(tables: Vec<TableSummary>) -> Self {
        ShowTablesPop { tables }
    }
}

impl CPop for ShowTablesPop {
    fn execute(&self) -> DbResult<String> {
        let mut lines: Vec<String> = self
            .tables
            .iter()
            .map(|t| {
                let kind = match t.kind {
                    TableKind::Heap => "heap",
                    TableKind::BplusTree => "bplus_tree",
                };
                format!("{} ({}, {} rows)", t.name, kind, t.row_count)
            })
            .collect();
        lines.push(format!("SELECT {}", self.tables.len()));
        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::leaf::LiteralTablePop;
    use crate::planner::IndexInfo;
    use crate::storage::MemStorageManager;
    use crate::value::Value;

    fn int_row(v: i64) -> Vec<Value> {
        vec![Value::Integer(v)]
    }

    #[test]
    fn create_table_builds_heap_and_pk_tree() {
        let storage: Rc<dyn StorageManager> = Rc::new(MemStorageManager::new());
        let pop = CreateTablePop::new(Rc::clone(&storage), "widgets", vec![ValType::Integer, ValType::Varchar], Some(0));
        assert_eq!(pop.execute().unwrap(), "CREATE TABLE");
        let heap = storage.heap_file("widgets", vec![ValType::Integer, ValType::Varchar]).unwrap();
        assert_eq!(heap.stat().row_count, 0);
        let pk = storage.bplus_tree("widgets_pk", vec![ValType::Integer, ValType::Varchar], true).unwrap();
        assert_eq!(pk.stat().row_count, 0);
    }

    fn make_table(storage: &Rc<dyn StorageManager>, with_pk: bool) -> BaseTable {
        let row_type = vec![ValType::Integer, ValType::Varchar];
        let names: Vec<Rc<str>> = vec![Rc::from("id"), Rc::from("name")];
        let heap = storage.heap_file("t", row_type.clone()).unwrap();
        let primary_key = if with_pk {
            let pk = storage.bplus_tree("t_pk", row_type.clone(), true).unwrap();
            Some(IndexInfo { tree: pk, column_index: 0 })
        } else {
            None
        };
        BaseTable {
            heap,
            row_type,
            column_names: names,
            return_row_id: !with_pk,
            primary_key,
            secondary_indexes: Vec::new(),
        }
    }

    #[test]
    fn insert_rejects_duplicate_primary_key() {
        let storage: Rc<dyn StorageManager> = Rc::new(MemStorageManager::new());
        let table = make_table(&storage, true);
        let rows = vec![
            vec![Value::Integer(1), Value::Varchar(Rc::from("a"))],
            vec![Value::Integer(1), Value::Varchar(Rc::from("b"))],
        ];
        let contents = Box::new(LiteralTablePop::new(rows, table.row_type.clone()));
        let pop = InsertPop::new(&table, contents);
        assert!(pop.execute().is_err());
        assert_eq!(table.heap.stat().row_count, 1);
    }

    #[test]
    fn insert_then_delete_round_trips() {
        let storage: Rc<dyn StorageManager> = Rc::new(MemStorageManager::new());
        let table = make_table(&storage, true);
        let rows = vec![
            vec![Value::Integer(1), Value::Varchar(Rc::from("a"))],
            vec![Value::Integer(2), Value::Varchar(Rc::from("b"))],
        ];
        let contents = Box::new(LiteralTablePop::new(rows, table.row_type.clone()));
        InsertPop::new(&table, contents).execute().unwrap();
        assert_eq!(table.heap.stat().row_count, 2);

        let scan: Box<dyn QPop> = Box::new(TableScanPop::new(
            TableSource::Heap(Rc::clone(&table.heap), true),
            "t",
            vec![ValType::Integer, ValType::Integer, ValType::Varchar],
            &[Rc::from("row_id"), Rc::from("id"), Rc::from("name")],
        ));
        let key_query: Box<dyn QPop> = Box::new(crate::executor::filter_project::ProjectPop::new(
            scan,
            vec![
                crate::compile::compile_scalar(&ValExpr::RelativeColumnRef(0, 0, ValType::Integer), &[&[]]),
                crate::compile::compile_scalar(&ValExpr::RelativeColumnRef(0, 1, ValType::Integer), &[&[]]),
            ],
            crate::executor::CompiledProps {
                row_type: vec![ValType::Integer, ValType::Integer],
                output_lineage: Vec::new(),
                ordered_columns: Vec::new(),
                ordered_asc: Vec::new(),
                unique_columns: Vec::new(),
            },
        ));
        let pop = DeletePop::new(&table, key_query, DEFAULT_SORT_BUFFER_SIZE);
        assert_eq!(pop.execute().unwrap(), "DELETE 2");
        assert_eq!(table.heap.stat().row_count, 0);
    }

    #[test]
    fn show_tables_lists_kind_and_count() {
        let pop = ShowTablesPop::new(vec![
            TableSummary { name: "t".to_string(), kind: TableKind::Heap, row_count: 3 },
            TableSummary { name: "u".to_string(), kind: TableKind::BplusTree, row_count: 1 },
        ]);
        let out = pop.execute().unwrap();
        assert!(out.contains("t (heap, 3 rows)"));
        assert!(out.ends_with("SELECT 2"));
    }

    #[test]
    fn analyze_reports_named_tables() {
        let pop = AnalyzeStatsPop::new(Some(vec!["t".to_string(), "u".to_string()]));
        assert_eq!(pop.execute().unwrap(), "ANALYZE t, u");
        let _ = int_row(0);
    }
}
