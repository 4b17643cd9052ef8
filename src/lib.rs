//! Physical execution engine for an instructional relational database.
//!
//! This crate covers the layer between a validated logical query and
//! the bytes it reads and writes: streaming iterator operators
//! (`executor`), the external-memory algorithms they're built from
//! (sort-merge, block nested-loop join, hash partitioning join, index
//! nested-loop join, merge equi-join, grouped aggregation), a
//! rule-based planner (`planner`) that chooses among them, a compiled
//! value-expression interpreter (`compile`/`cexp`), and the storage
//! traits (`storage`) an embedder implements to supply heap files and
//! B+trees. Parsing, validation, name resolution, transactions, and
//! the session/REPL layer are all upstream or downstream collaborators
//! and out of scope here.
//!
//! ```
//! use ddb_exec::executor::leaf::LiteralTablePop;
//! use ddb_exec::executor::QPop;
//! use ddb_exec::value::{ValType, Value};
//!
//! let rows = vec![vec![Value::Integer(1)], vec![Value::Integer(2)]];
//! let scan = LiteralTablePop::new(rows, vec![ValType::Integer]);
//! let total: i64 = scan.execute().map(|r| r.unwrap()[0].as_int()).sum();
//! assert_eq!(total, 3);
//! ```

pub mod cexp;
pub mod compile;
pub mod config;
pub mod error;
pub mod executor;
pub mod expr;
pub mod planner;
pub mod profile;
pub mod storage;
pub mod util;
pub mod value;
