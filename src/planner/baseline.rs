//! The rule-based planner: a single top-to-bottom pass over a
//! `SfwghBlock`'s `FROM` list that, for each table in turn, prefers an
//! index access path driven off the tables already joined, then falls
//! back to sort-merge join, then hash join, then block nested-loop join.
//!
//! Mirrors a classic single-pass greedy join-order planner: tables are
//! joined in the order they appear in `FROM`, never reordered, and each
//! step picks the cheapest strategy *that applies*, not the cheapest of
//! all strategies considered together. A cost-based planner exploring
//! join orders is out of scope (see SPEC_FULL.md's Open Questions).

use super::{BaseTable, IndexInfo, Planner, SfwghBlock, column_in_output};
use crate::cexp::CExpPtr;
use crate::compile::{ColumnBinding, CompiledAggregate};
use crate::config::{
    DEFAULT_BNLJ_BUFFER_SIZE, DEFAULT_HASH_BUFFER_SIZE, DEFAULT_HASH_MAX_DEPTH, DEFAULT_SORT_BUFFER_SIZE,
    PlannerOptions,
};
use crate::error::{DbError, DbResult};
use crate::executor::aggr::GroupByPop;
use crate::executor::filter_project::{FilterPop, ProjectPop};
use crate::executor::join::bnlj::BnljPop;
use crate::executor::join::hasheqj::HashEqJoinPop;
use crate::executor::join::indexnlj::IndexNLJoinPop;
use crate::executor::join::mergeeqj::MergeEqJoinPop;
use crate::executor::leaf::{IndexScanPop, TableScanPop, TableSource};
use crate::executor::mergesort::MergeSortPop;
use crate::executor::{CompiledProps, QPop, Sarg};
use crate::expr::{BinaryOp, ValExpr, in_scope};
use crate::storage::StorageManager;
use crate::value::{RowType, Value};
use std::cell::Cell;
use std::rc::Rc;

// ---------------------------------------------------------------------
// Small free-standing helpers shared by several of the planner's steps.
// ---------------------------------------------------------------------

/// `ColumnBinding`s for a subplan's own output, one per column, named
/// from its first lineage entry (anonymous columns get a synthetic
/// name that can never collide with a real alias).
fn bindings_for(compiled: &CompiledProps) -> Vec<ColumnBinding> {
    compiled
        .row_type
        .iter()
        .enumerate()
        .map(|(i, t)| match compiled.output_lineage.get(i).and_then(|l| l.first()) {
            Some((alias, column)) => ColumnBinding {
                alias: Rc::clone(alias),
                column: Rc::clone(column),
                typ: *t,
            },
            None => ColumnBinding::new("", &format!("_col{i}"), *t),
        })
        .collect()
}

fn compile_one(e: &ValExpr, schema: &[ColumnBinding]) -> CExpPtr<Value> {
    crate::compile::compile_scalar(e, &[schema])
}

fn compile_two(e: &ValExpr, left_schema: &[ColumnBinding], right_schema: &[ColumnBinding]) -> CExpPtr<Value> {
    crate::compile::compile_scalar(e, &[left_schema, right_schema])
}

fn compile_against(pop: &dyn QPop, e: &ValExpr) -> CExpPtr<Value> {
    compile_one(e, &bindings_for(pop.compiled()))
}

fn compile_pair_cond(left: &dyn QPop, right: &dyn QPop, e: &ValExpr) -> CExpPtr<Value> {
    compile_two(e, &bindings_for(left.compiled()), &bindings_for(right.compiled()))
}

/// Structural equality for `ValExpr`, used only to dedupe aggregate
/// subexpressions and locate them again in HAVING/SELECT; `ValExpr`
/// doesn't derive `PartialEq` since its leaves hold `Value`, whose own
/// `PartialEq` panics across mismatched variants.
fn value_eq(a: &Value, b: &Value) -> bool {
    use Value::*;
    match (a, b) {
        (Null, Null) => true,
        (DateTime(x), DateTime(y)) | (Varchar(x), Varchar(y)) => x == y,
        (Float(x), Float(y)) => x == y,
        (Integer(x), Integer(y)) => x == y,
        (Boolean(x), Boolean(y)) => x == y,
        _ => false,
    }
}

fn expr_eq(a: &ValExpr, b: &ValExpr) -> bool {
    match (a, b) {
        (ValExpr::Literal(x), ValExpr::Literal(y)) => value_eq(x, y),
        (ValExpr::NamedColumnRef(a1, c1, t1), ValExpr::NamedColumnRef(a2, c2, t2)) => {
            a1 == a2 && c1 == c2 && t1 == t2
        }
        (ValExpr::RelativeColumnRef(i1, j1, t1), ValExpr::RelativeColumnRef(i2, j2, t2)) => {
            i1 == i2 && j1 == j2 && t1 == t2
        }
        (ValExpr::Unary(o1, x), ValExpr::Unary(o2, y)) => o1 == o2 && expr_eq(x, y),
        (ValExpr::Binary(o1, l1, r1), ValExpr::Binary(o2, l2, r2)) => {
            o1 == o2 && expr_eq(l1, l2) && expr_eq(r1, r2)
        }
        (ValExpr::FuncCall(n1, a1), ValExpr::FuncCall(n2, a2)) => {
            n1 == n2 && a1.len() == a2.len() && a1.iter().zip(a2).all(|(x, y)| expr_eq(x, y))
        }
        (ValExpr::Aggregate(f1, e1, d1), ValExpr::Aggregate(f2, e2, d2)) => f1 == f2 && d1 == d2 && expr_eq(e1, e2),
        _ => false,
    }
}

fn find_aggrs<'a>(e: &'a ValExpr, out: &mut Vec<&'a ValExpr>) {
    if let ValExpr::Aggregate(..) = e {
        out.push(e);
    } else {
        for c in e.children() {
            find_aggrs(c, out);
        }
    }
}

/// Rewrites `e` so that every subexpression matching one of
/// `computed_exprs` (a GROUP BY key or an aggregate call) becomes a
/// `RelativeColumnRef` into a `GroupByPop`'s output (group columns
/// first, then aggregate columns, matching `GroupByPop::emit`'s order).
fn relativize(e: &ValExpr, computed: &[ValExpr]) -> ValExpr {
    if let Some(i) = computed.iter().position(|c| expr_eq(c, e)) {
        return ValExpr::RelativeColumnRef(0, i, crate::expr::infer_type(e));
    }
    match e {
        ValExpr::Literal(_) | ValExpr::NamedColumnRef(..) | ValExpr::RelativeColumnRef(..) => e.clone(),
        ValExpr::Unary(op, x) => ValExpr::Unary(*op, Box::new(relativize(x, computed))),
        ValExpr::Binary(op, l, r) => {
            ValExpr::Binary(*op, Box::new(relativize(l, computed)), Box::new(relativize(r, computed)))
        }
        ValExpr::FuncCall(name, args) => {
            ValExpr::FuncCall(name.clone(), args.iter().map(|a| relativize(a, computed)).collect())
        }
        ValExpr::Aggregate(..) => unreachable!("aggregate not found among its own computed_exprs"),
    }
}

/// Checks whether `pop`'s existing ordering already satisfies
/// `exprs`/`required` as a prefix, returning the actual ascending flags
/// if so (which may satisfy a caller that didn't require a direction).
fn already_ordered(compiled: &CompiledProps, exprs: &[ValExpr], required: &[Option<bool>]) -> Option<Vec<bool>> {
    if exprs.len() > compiled.ordered_columns.len() {
        return None;
    }
    let mut out = Vec::with_capacity(exprs.len());
    for (i, e) in exprs.iter().enumerate() {
        let idx = column_in_output(compiled, e)?;
        if idx != compiled.ordered_columns[i] {
            return None;
        }
        let asc = compiled.ordered_asc[i];
        if let Some(req) = required[i] {
            if req != asc {
                return None;
            }
        }
        out.push(asc);
    }
    Some(out)
}

/// Splits `cond`'s conjuncts into equi-join pairs between `left_aliases`
/// and `right_aliases` (in either order) and everything left over.
/// Returns `None` if no equi-join pair was found.
fn make_eqj_cond(
    left_aliases: &[String],
    right_aliases: &[String],
    cond: &ValExpr,
) -> Option<(Vec<ValExpr>, Vec<ValExpr>, Option<ValExpr>)> {
    let mut left_exprs = Vec::new();
    let mut right_exprs = Vec::new();
    let mut remaining = Vec::new();
    for part in crate::expr::conjunctive_parts(cond) {
        if let ValExpr::Binary(BinaryOp::Eq, l, r) = part {
            if in_scope(l, left_aliases) && in_scope(r, right_aliases) {
                left_exprs.push((**l).clone());
                right_exprs.push((**r).clone());
                continue;
            }
            if in_scope(l, right_aliases) && in_scope(r, left_aliases) {
                right_exprs.push((**l).clone());
                left_exprs.push((**r).clone());
                continue;
            }
        }
        remaining.push(part.clone());
    }
    if left_exprs.is_empty() {
        None
    } else {
        Some((left_exprs, right_exprs, crate::expr::make_conjunction(remaining)))
    }
}

/// A searchable argument still in `ValExpr` form (bounds not yet
/// evaluated), the form `sarg_cond` builds while scanning a WHERE
/// conjunction; distinct from `executor::Sarg`, whose bounds are
/// already-evaluated `Value`s ready for a storage-layer lookup.
#[derive(Debug, Clone, Default)]
struct SargExpr {
    is_range: bool,
    key_lower: Option<ValExpr>,
    key_upper: Option<ValExpr>,
    lower_exclusive: bool,
    upper_exclusive: bool,
}

/// The rule-based planner described in SPEC_FULL.md §6: single-pass,
/// left-deep, greedy per-table strategy selection.
pub struct BaselinePlanner {
    storage: Rc<dyn StorageManager>,
    options: PlannerOptions,
    scope_counter: Cell<u64>,
}

impl BaselinePlanner {
    pub fn new(storage: Rc<dyn StorageManager>, options: PlannerOptions) -> Self {
        BaselinePlanner {
            storage,
            options,
            scope_counter: Cell::new(0),
        }
    }

    fn next_scope(&self, prefix: &str) -> String {
        let n = self.scope_counter.get();
        self.scope_counter.set(n + 1);
        format!("{prefix}_{n}")
    }

    fn make_table_scan(&self, alias: &str, table: &BaseTable) -> Box<dyn QPop> {
        let source = TableSource::Heap(Rc::clone(&table.heap), table.return_row_id);
        let mut row_type = table.row_type.clone();
        let mut names = table.column_names.clone();
        if table.return_row_id {
            row_type.insert(0, table.id_type());
            names.insert(0, Rc::from("row_id"));
        }
        Box::new(TableScanPop::new(source, alias, row_type, &names))
    }

    fn make_project(
        &self,
        input: Box<dyn QPop>,
        exprs: &[ValExpr],
        aliases: &[Option<String>],
    ) -> DbResult<Box<dyn QPop>> {
        let schema = bindings_for(input.compiled());
        let compiled_exprs: Vec<CExpPtr<Value>> = exprs.iter().map(|e| compile_one(e, &schema)).collect();
        let row_type: RowType = exprs.iter().map(crate::expr::infer_type).collect();
        let output_lineage = exprs
            .iter()
            .zip(aliases)
            .enumerate()
            .map(|(i, (e, a))| match (e, a) {
                (_, Some(name)) => vec![(Rc::from(""), Rc::from(name.as_str()))],
                (ValExpr::NamedColumnRef(alias, column, _), None) => vec![(Rc::clone(alias), Rc::clone(column))],
                _ => vec![(Rc::from(""), Rc::from(format!("_col{i}").as_str()))],
            })
            .collect();
        let compiled = CompiledProps {
            row_type,
            output_lineage,
            ordered_columns: Vec::new(),
            ordered_asc: Vec::new(),
            unique_columns: Vec::new(),
        };
        Ok(Box::new(ProjectPop::new(input, compiled_exprs, compiled)))
    }

    /// Find the best single-column sarg available against `table` under
    /// alias `inner_alias`, from conjuncts of `cond` that also mention
    /// only `outer_aliases` (or are constant). A range sarg is preferred
    /// over an equality one only if no equality sarg was found; among
    /// ties the primary key is preferred over a secondary index.
    fn sarg_cond(
        &self,
        outer_aliases: &[String],
        inner_alias: &str,
        table: &BaseTable,
        cond: &ValExpr,
    ) -> Option<(usize, SargExpr, Option<ValExpr>)> {
        let indexed = table.indexes();
        let parts: Vec<ValExpr> = crate::expr::conjunctive_parts(cond).into_iter().cloned().collect();
        let mut candidates: std::collections::HashMap<Rc<str>, Vec<usize>> = std::collections::HashMap::new();
        for (i, part) in parts.iter().enumerate() {
            let ValExpr::Binary(op, l, r) = part else { continue };
            if !op.is_comparison() || *op == BinaryOp::Ne {
                continue;
            }
            if !(in_scope(l, outer_aliases) || in_scope(r, outer_aliases)) {
                continue;
            }
            for side in [l.as_ref(), r.as_ref()] {
                if let ValExpr::NamedColumnRef(a, column, _) = side {
                    if a.as_ref() == inner_alias && indexed.iter().any(|(_, name)| name.as_ref() == column.as_ref()) {
                        candidates.entry(Rc::clone(column)).or_default().push(i);
                    }
                }
            }
        }
        let id_name = table.id_name();
        let mut best: Option<(Rc<str>, SargExpr, Vec<usize>)> = None;
        for (column, idxs) in candidates {
            let (sarg, covered) = Self::gen_sarg(inner_alias, &column, &parts, &idxs);
            let replace = match &best {
                None => true,
                Some((best_col, best_sarg, _)) => {
                    (best_sarg.is_range && !sarg.is_range)
                        || (best_sarg.is_range == sarg.is_range
                            && best_col.as_ref() != id_name.as_ref()
                            && column.as_ref() == id_name.as_ref())
                }
            };
            if replace {
                best = Some((column, sarg, covered));
            }
        }
        let (column, sarg, covered) = best?;
        let column_index = table.column_names.iter().position(|c| c.as_ref() == column.as_ref())?;
        let remainder = if covered.is_empty() {
            Some(cond.clone())
        } else {
            let remaining: Vec<ValExpr> = parts
                .iter()
                .enumerate()
                .filter(|(i, _)| !covered.contains(i))
                .map(|(_, p)| p.clone())
                .collect();
            crate::expr::make_conjunction(remaining)
        };
        Some((column_index, sarg, remainder))
    }

    /// Folds every candidate conjunct on `column_name` into a single
    /// `SargExpr`, in the conjunct order they were found (an equality
    /// conjunct always wins outright; a later equality overwrites an
    /// in-progress range).
    fn gen_sarg(inner_alias: &str, column_name: &str, parts: &[ValExpr], candidates: &[usize]) -> (SargExpr, Vec<usize>) {
        let mut sarg = SargExpr::default();
        let mut covered = Vec::new();
        for &i in candidates {
            let ValExpr::Binary(op, l, r) = &parts[i] else { continue };
            let left_is_col =
                matches!(l.as_ref(), ValExpr::NamedColumnRef(a, c, _) if a.as_ref() == inner_alias && c.as_ref() == column_name);
            let bound = if left_is_col { r.as_ref() } else { l.as_ref() };
            use BinaryOp::*;
            if *op == Eq {
                sarg = SargExpr {
                    is_range: false,
                    key_lower: Some(bound.clone()),
                    key_upper: Some(bound.clone()),
                    lower_exclusive: false,
                    upper_exclusive: false,
                };
                covered = vec![i];
                continue;
            }
            let is_lower = matches!(op, Ge | Gt if left_is_col) || matches!(op, Le | Lt if !left_is_col);
            let is_upper = matches!(op, Le | Lt if left_is_col) || matches!(op, Ge | Gt if !left_is_col);
            let exclusive = matches!(op, Gt | Lt);
            if is_lower && sarg.key_lower.is_none() {
                sarg.is_range = true;
                sarg.key_lower = Some(bound.clone());
                sarg.lower_exclusive = exclusive;
                covered.push(i);
            } else if is_upper && sarg.key_upper.is_none() {
                sarg.is_range = true;
                sarg.key_upper = Some(bound.clone());
                sarg.upper_exclusive = exclusive;
                covered.push(i);
            }
        }
        (sarg, covered)
    }

    fn index_for(table: &BaseTable, column_index: usize) -> DbResult<&IndexInfo> {
        table
            .indexes()
            .into_iter()
            .find(|(info, _)| info.column_index == column_index)
            .map(|(info, _)| info)
            .ok_or_else(|| DbError::validation("sarg chose a column with no index"))
    }

    fn make_independent_index_scan(
        &self,
        alias: &str,
        table: &BaseTable,
        column_index: usize,
        sarg: SargExpr,
        remainder: Option<ValExpr>,
    ) -> DbResult<Box<dyn QPop>> {
        let info = Self::index_for(table, column_index)?;
        let scan = IndexScanPop::new(
            Rc::clone(&info.tree),
            alias,
            table.row_type.clone(),
            &table.column_names,
            column_index,
        );
        let lower = sarg.key_lower.as_ref().map(|e| (crate::expr::eval_literal(e), !sarg.lower_exclusive));
        let upper = sarg.key_upper.as_ref().map(|e| (crate::expr::eval_literal(e), !sarg.upper_exclusive));
        if lower.is_some() || upper.is_some() {
            scan.set_range(Sarg { lower, upper });
        }
        let mut pop: Box<dyn QPop> = Box::new(scan);
        if let Some(cond) = remainder {
            let cexp = compile_against(pop.as_ref(), &cond);
            pop = Box::new(FilterPop::new(pop, cexp, 0.3));
        }
        Ok(pop)
    }

    fn make_indexnljoin_with_table(
        &self,
        left: Box<dyn QPop>,
        alias: &str,
        table: &BaseTable,
        column_index: usize,
        sarg: SargExpr,
        remainder: Option<ValExpr>,
    ) -> DbResult<Box<dyn QPop>> {
        let info = Self::index_for(table, column_index)?;
        let inner = IndexScanPop::new(
            Rc::clone(&info.tree),
            alias,
            table.row_type.clone(),
            &table.column_names,
            column_index,
        );
        let key_expr = sarg
            .key_lower
            .filter(|_| !sarg.is_range)
            .ok_or_else(|| DbError::validation("index nested-loop join needs an equality sarg"))?;
        let outer_key = compile_against(left.as_ref(), &key_expr);
        let residual = remainder.as_ref().map(|c| compile_pair_cond(left.as_ref(), &inner, c));
        Ok(Box::new(IndexNLJoinPop::new(left, inner, outer_key, residual)))
    }

    fn make_sorted(&self, pop: Box<dyn QPop>, exprs: &[ValExpr], required: &[Option<bool>], scope: &str) -> (Box<dyn QPop>, Vec<bool>) {
        if let Some(asc) = already_ordered(pop.compiled(), exprs, required) {
            return (pop, asc);
        }
        let orders_asc: Vec<bool> = required.iter().map(|o| o.unwrap_or(true)).collect();
        let ordered_columns: Vec<usize> = exprs.iter().map(|e| column_in_output(pop.compiled(), e).unwrap_or(0)).collect();
        let schema = bindings_for(pop.compiled());
        let keys: Vec<(ValExpr, bool)> = exprs.iter().cloned().zip(orders_asc.iter().copied()).collect();
        let comparator = crate::compile::compile_row_comparator(&keys, &schema);
        let sorted = MergeSortPop::new(
            pop,
            comparator,
            Rc::clone(&self.storage),
            scope,
            DEFAULT_SORT_BUFFER_SIZE,
            ordered_columns,
            orders_asc.clone(),
        );
        (Box::new(sorted), orders_asc)
    }

    #[allow(clippy::too_many_arguments)]
    fn make_smjoin(
        &self,
        left: Box<dyn QPop>,
        left_bare: Option<&(String, Rc<str>)>,
        right: Box<dyn QPop>,
        right_bare: Option<&(String, Rc<str>)>,
        mut left_exprs: Vec<ValExpr>,
        mut right_exprs: Vec<ValExpr>,
        remainder: Option<ValExpr>,
        scope: &str,
    ) -> Box<dyn QPop> {
        let mut required: Vec<Option<bool>> = vec![None; left_exprs.len()];
        if already_ordered(left.compiled(), &left_exprs, &required).is_none()
            && already_ordered(right.compiled(), &right_exprs, &required).is_none()
        {
            let pki = left_bare
                .and_then(|(a, id)| crate::expr::find_column_in_exprs(a, id, &left_exprs))
                .or_else(|| right_bare.and_then(|(a, id)| crate::expr::find_column_in_exprs(a, id, &right_exprs)));
            if let Some(i) = pki {
                let le = left_exprs.remove(i);
                left_exprs.insert(0, le);
                let re = right_exprs.remove(i);
                right_exprs.insert(0, re);
                required[0] = Some(true);
            }
        }
        let (left, _) = self.make_sorted(left, &left_exprs, &required, &format!("{scope}_l"));
        let (right, _) = self.make_sorted(right, &right_exprs, &required, &format!("{scope}_r"));
        let lschema = bindings_for(left.compiled());
        let rschema = bindings_for(right.compiled());
        let left_key = compile_one(&left_exprs[0], &lschema);
        let right_key = compile_one(&right_exprs[0], &rschema);
        let eq = crate::compile::compile_eq_comparator(&left_exprs, &lschema, &right_exprs, &rschema);
        let mut pop: Box<dyn QPop> = Box::new(MergeEqJoinPop::new(left, right, left_key, right_key, eq, true, false));
        if let Some(cond) = remainder {
            let cexp = compile_against(pop.as_ref(), &cond);
            pop = Box::new(FilterPop::new(pop, cexp, 0.5));
        }
        pop
    }

    fn make_hashjoin(
        &self,
        left: Box<dyn QPop>,
        right: Box<dyn QPop>,
        left_exprs: Vec<ValExpr>,
        right_exprs: Vec<ValExpr>,
        remainder: Option<ValExpr>,
        scope: &str,
    ) -> Box<dyn QPop> {
        let lschema = bindings_for(left.compiled());
        let rschema = bindings_for(right.compiled());
        let left_key = crate::compile::compile_tuple(&left_exprs, &lschema);
        let right_key = crate::compile::compile_tuple(&right_exprs, &rschema);
        let eq = crate::compile::compile_eq_comparator(&left_exprs, &lschema, &right_exprs, &rschema);
        let mut pop: Box<dyn QPop> = Box::new(HashEqJoinPop::new(
            left,
            right,
            left_key,
            right_key,
            eq,
            Rc::clone(&self.storage),
            scope,
            DEFAULT_HASH_BUFFER_SIZE,
            DEFAULT_HASH_MAX_DEPTH,
        ));
        if let Some(cond) = remainder {
            let cexp = compile_against(pop.as_ref(), &cond);
            pop = Box::new(FilterPop::new(pop, cexp, 0.5));
        }
        pop
    }

    /// Joins one more table onto the accumulated plan (`None` for the
    /// first table), returning the new plan together with whether it's
    /// still literally a bare, unfiltered table scan (used by
    /// `make_smjoin` to seed the merge order with a primary key).
    #[allow(clippy::too_many_arguments)]
    fn optimize_one_more_table(
        &self,
        left: Option<Box<dyn QPop>>,
        left_bare: Option<(String, Rc<str>)>,
        left_aliases: &[String],
        alias: &str,
        table: &BaseTable,
        cond: Option<ValExpr>,
        scope: &str,
    ) -> DbResult<(Box<dyn QPop>, Option<(String, Rc<str>)>)> {
        let sarg_out = cond.as_ref().and_then(|c| self.sarg_cond(left_aliases, alias, table, c));
        if let Some((column_index, sarg, remainder)) = &sarg_out {
            if left.is_none() {
                let pop = self.make_independent_index_scan(alias, table, *column_index, sarg.clone(), remainder.clone())?;
                return Ok((pop, None));
            }
            if self.options.index_join && !sarg.is_range {
                let pop = self.make_indexnljoin_with_table(
                    left.unwrap(),
                    alias,
                    table,
                    *column_index,
                    sarg.clone(),
                    remainder.clone(),
                )?;
                return Ok((pop, None));
            }
        }

        let right_aliases = [alias.to_string()];
        let eqj_cond = if left.is_some() {
            cond.as_ref().and_then(|c| make_eqj_cond(left_aliases, &right_aliases, c))
        } else {
            None
        };
        if self.options.sort_merge_join {
            if let Some((le, re, rem)) = eqj_cond.clone() {
                let right = self.make_table_scan(alias, table);
                let right_bare = Some((alias.to_string(), table.id_name()));
                let scope = self.next_scope(&format!("{scope}_smj"));
                let pop = self.make_smjoin(left.unwrap(), left_bare.as_ref(), right, right_bare.as_ref(), le, re, rem, &scope);
                return Ok((pop, None));
            }
        }
        if self.options.hash_join {
            if let Some((le, re, rem)) = eqj_cond {
                let right = self.make_table_scan(alias, table);
                let scope = self.next_scope(&format!("{scope}_hj"));
                let pop = self.make_hashjoin(left.unwrap(), right, le, re, rem, &scope);
                return Ok((pop, None));
            }
        }

        let right = self.make_table_scan(alias, table);
        match left {
            None => match cond {
                Some(cond) => {
                    let cexp = compile_against(right.as_ref(), &cond);
                    Ok((Box::new(FilterPop::new(right, cexp, 0.3)), None))
                }
                None => Ok((right, Some((alias.to_string(), table.id_name())))),
            },
            Some(l) => {
                let cexp = cond.as_ref().map(|c| compile_pair_cond(l.as_ref(), right.as_ref(), c));
                Ok((Box::new(BnljPop::new(l, right, cexp, DEFAULT_BNLJ_BUFFER_SIZE)), None))
            }
        }
    }

    /// Sorts `input` on the group-by keys (appending any computed,
    /// non-column group-by expression as a trailing projected column
    /// first), returning the sorted plan and the group-by keys' column
    /// indices in its output.
    fn add_groupby_by_sorting(&self, input: Box<dyn QPop>, groupby_exprs: &[ValExpr]) -> DbResult<(Box<dyn QPop>, Vec<usize>)> {
        let mut appended: Vec<ValExpr> = Vec::new();
        let mut offset = input.compiled().row_type.len();
        let mut indices = Vec::new();
        for g in groupby_exprs {
            match column_in_output(input.compiled(), g) {
                Some(i) => indices.push(i),
                None => {
                    indices.push(offset);
                    appended.push(g.clone());
                    offset += 1;
                }
            }
        }
        let mut input = input;
        if !appended.is_empty() {
            let base_width = input.compiled().row_type.len();
            let mut exprs: Vec<ValExpr> = (0..base_width)
                .map(|i| ValExpr::RelativeColumnRef(0, i, input.compiled().row_type[i]))
                .collect();
            exprs.extend(appended.iter().cloned());
            let mut aliases: Vec<Option<String>> = vec![None; base_width];
            aliases.extend(appended.iter().map(|_| None));
            input = self.make_project(input, &exprs, &aliases)?;
        }
        if appended.is_empty() && indices.iter().all(|ci| input.compiled().ordered_columns.contains(ci)) {
            return Ok((input, indices));
        }
        let sort_exprs: Vec<ValExpr> = indices
            .iter()
            .map(|&ci| ValExpr::RelativeColumnRef(0, ci, input.compiled().row_type[ci]))
            .collect();
        let required: Vec<Option<bool>> = vec![Some(true); indices.len()];
        let scope = self.next_scope("groupby_sort");
        let (sorted, _) = self.make_sorted(input, &sort_exprs, &required, &scope);
        Ok((sorted, indices))
    }

    /// Builds the `GroupByPop`, then applies HAVING and the SELECT list,
    /// relativizing both against the group's output schema (group
    /// columns first, then aggregate columns, in discovery order).
    fn add_having_and_select(
        &self,
        input: Box<dyn QPop>,
        groupby_exprs: &[ValExpr],
        groupby_indices: &[usize],
        having_cond: Option<ValExpr>,
        select_exprs: Vec<ValExpr>,
        select_aliases: Vec<Option<String>>,
    ) -> DbResult<Box<dyn QPop>> {
        let mut found = Vec::new();
        if let Some(h) = &having_cond {
            find_aggrs(h, &mut found);
        }
        for s in &select_exprs {
            find_aggrs(s, &mut found);
        }
        let mut aggr_exprs: Vec<ValExpr> = Vec::new();
        for e in found {
            if !aggr_exprs.iter().any(|a| expr_eq(a, e)) {
                aggr_exprs.push(e.clone());
            }
        }

        let schema = bindings_for(input.compiled());
        let relativized_groupby: Vec<ValExpr> = groupby_indices
            .iter()
            .zip(groupby_exprs)
            .map(|(&ci, g)| ValExpr::RelativeColumnRef(0, ci, crate::expr::infer_type(g)))
            .collect();
        let group_by = crate::compile::compile_tuple(&relativized_groupby, &schema);
        let compiled_aggs: Vec<CompiledAggregate> = aggr_exprs.iter().map(|e| crate::compile::compile_aggregate(e, &schema)).collect();
        let non_incremental = compiled_aggs.iter().filter(|a| !a.incremental).count();
        let num_blocks = (3 * non_incremental).max(DEFAULT_SORT_BUFFER_SIZE);

        let mut row_type: RowType = groupby_exprs.iter().map(crate::expr::infer_type).collect();
        row_type.extend(aggr_exprs.iter().map(crate::expr::infer_type));
        let compiled = CompiledProps {
            row_type,
            output_lineage: Vec::new(),
            ordered_columns: Vec::new(),
            ordered_asc: Vec::new(),
            unique_columns: Vec::new(),
        };
        let scope = self.next_scope("groupby_agg");
        let mut plan: Box<dyn QPop> = Box::new(GroupByPop::new(input, group_by, compiled_aggs, Rc::clone(&self.storage), &scope, num_blocks, compiled)?);

        let computed_exprs: Vec<ValExpr> = groupby_exprs.iter().cloned().chain(aggr_exprs.iter().cloned()).collect();
        if let Some(having) = having_cond {
            let rel = relativize(&having, &computed_exprs);
            let cexp = compile_against(plan.as_ref(), &rel);
            plan = Box::new(FilterPop::new(plan, cexp, 0.5));
        }
        let rel_select: Vec<ValExpr> = select_exprs.iter().map(|e| relativize(e, &computed_exprs)).collect();
        self.make_project(plan, &rel_select, &select_aliases)
    }
}

impl Planner for BaselinePlanner {
    fn optimize_block(&self, block: SfwghBlock) -> DbResult<Box<dyn QPop>> {
        let SfwghBlock {
            from_tables,
            from_aliases,
            where_cond,
            groupby_exprs,
            having_cond,
            select_exprs,
            select_aliases,
        } = block;

        let mut cond = where_cond;
        let mut plan: Option<Box<dyn QPop>> = None;
        let mut bare: Option<(String, Rc<str>)> = None;
        let mut outer_aliases: Vec<String> = Vec::new();

        for (table, alias) in from_tables.into_iter().zip(from_aliases.iter()) {
            let mut scope_aliases = outer_aliases.clone();
            scope_aliases.push(alias.clone());
            let (local_cond, remaining) = match cond.take() {
                Some(c) => crate::expr::push_down_conds(&c, &scope_aliases),
                None => (None, None),
            };
            cond = remaining;

            let scope = self.next_scope(&format!("join_{alias}"));
            let (new_plan, new_bare) = self.optimize_one_more_table(plan, bare, &outer_aliases, alias, &table, local_cond, &scope)?;
            plan = Some(new_plan);
            bare = new_bare;
            outer_aliases.push(alias.clone());
        }

        let mut plan = plan.ok_or_else(|| DbError::validation("FROM clause has no tables"))?;
        if let Some(cond) = cond {
            let cexp = compile_against(plan.as_ref(), &cond);
            plan = Box::new(FilterPop::new(plan, cexp, 0.5));
        }

        match groupby_exprs {
            Some(groupby_exprs) => {
                let (sorted, indices) = self.add_groupby_by_sorting(plan, &groupby_exprs)?;
                self.add_having_and_select(sorted, &groupby_exprs, &indices, having_cond, select_exprs, select_aliases)
            }
            None => self.make_project(plan, &select_exprs, &select_aliases),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorageManager;
    use crate::value::ValType;

    fn customers(storage: &dyn StorageManager) -> BaseTable {
        let row_type = vec![ValType::Integer, ValType::Varchar];
        let names: Vec<Rc<str>> = vec![Rc::from("id"), Rc::from("name")];
        let heap = storage.heap_file("customers", row_type.clone()).unwrap();
        let pk = storage.bplus_tree("customers_pk", row_type.clone(), true).unwrap();
        for (id, name) in [(1i64, "alice"), (2, "bob")] {
            let row = vec![Value::Integer(id), Value::Varchar(Rc::from(name))];
            heap.put(row.clone(), Some(id as u64)).unwrap();
            pk.put(vec![Value::Integer(id)], row).unwrap();
        }
        BaseTable {
            heap,
            row_type,
            column_names: names,
            return_row_id: false,
            primary_key: Some(IndexInfo { tree: pk, column_index: 0 }),
            secondary_indexes: Vec::new(),
        }
    }

    fn orders(storage: &dyn StorageManager) -> BaseTable {
        let row_type = vec![ValType::Integer, ValType::Integer, ValType::Float];
        let names: Vec<Rc<str>> = vec![Rc::from("id"), Rc::from("customer_id"), Rc::from("total")];
        let heap = storage.heap_file("orders", row_type.clone()).unwrap();
        let pk = storage.bplus_tree("orders_pk", row_type.clone(), true).unwrap();
        for (id, cust, total) in [(10i64, 1i64, 9.5), (11, 1, 2.0), (12, 2, 5.0)] {
            let row = vec![Value::Integer(id), Value::Integer(cust), Value::Float(total)];
            heap.put(row.clone(), Some(id as u64)).unwrap();
            pk.put(vec![Value::Integer(id)], row).unwrap();
        }
        BaseTable {
            heap,
            row_type,
            column_names: names,
            return_row_id: false,
            primary_key: Some(IndexInfo { tree: pk, column_index: 0 }),
            secondary_indexes: Vec::new(),
        }
    }

    fn drain(pop: Box<dyn QPop>) -> Vec<Vec<Value>> {
        pop.execute().collect::<DbResult<Vec<_>>>().unwrap()
    }

    #[test]
    fn plans_an_equi_join_between_two_tables() {
        let storage: Rc<dyn StorageManager> = Rc::new(MemStorageManager::new());
        let planner = BaselinePlanner::new(Rc::clone(&storage), PlannerOptions::default());
        let block = SfwghBlock {
            from_tables: vec![orders(storage.as_ref()), customers(storage.as_ref())],
            from_aliases: vec!["o".to_string(), "c".to_string()],
            where_cond: Some(ValExpr::Binary(
                BinaryOp::Eq,
                Box::new(ValExpr::named("o", "customer_id", ValType::Integer)),
                Box::new(ValExpr::named("c", "id", ValType::Integer)),
            )),
            groupby_exprs: None,
            having_cond: None,
            select_exprs: vec![
                ValExpr::named("o", "id", ValType::Integer),
                ValExpr::named("c", "name", ValType::Varchar),
            ],
            select_aliases: vec![None, None],
        };
        let plan = planner.optimize_block(block).unwrap();
        let mut rows = drain(plan);
        rows.sort_by_key(|r| r[0].as_int());
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][1], Value::Varchar(Rc::from("alice")));
        assert_eq!(rows[2][1], Value::Varchar(Rc::from("bob")));
    }

    #[test]
    fn plans_a_grouped_aggregate() {
        let storage: Rc<dyn StorageManager> = Rc::new(MemStorageManager::new());
        let planner = BaselinePlanner::new(Rc::clone(&storage), PlannerOptions::default());
        let block = SfwghBlock {
            from_tables: vec![orders(storage.as_ref())],
            from_aliases: vec!["o".to_string()],
            where_cond: None,
            groupby_exprs: Some(vec![ValExpr::named("o", "customer_id", ValType::Integer)]),
            having_cond: None,
            select_exprs: vec![
                ValExpr::named("o", "customer_id", ValType::Integer),
                ValExpr::Aggregate(crate::expr::AggrFunc::Sum, Box::new(ValExpr::named("o", "total", ValType::Float)), false),
            ],
            select_aliases: vec![None, Some("total_spent".to_string())],
        };
        let plan = planner.optimize_block(block).unwrap();
        let mut rows = drain(plan);
        rows.sort_by_key(|r| r[0].as_int());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Value::Integer(1));
        assert_eq!(rows[0][1], Value::Float(11.5));
        assert_eq!(rows[1][0], Value::Integer(2));
        assert_eq!(rows[1][1], Value::Float(5.0));
    }

    #[test]
    fn independent_scan_uses_the_primary_key_index_for_a_point_lookup() {
        let storage: Rc<dyn StorageManager> = Rc::new(MemStorageManager::new());
        let planner = BaselinePlanner::new(Rc::clone(&storage), PlannerOptions::default());
        let block = SfwghBlock {
            from_tables: vec![customers(storage.as_ref())],
            from_aliases: vec!["c".to_string()],
            where_cond: Some(ValExpr::Binary(
                BinaryOp::Eq,
                Box::new(ValExpr::named("c", "id", ValType::Integer)),
                Box::new(ValExpr::Literal(Value::Integer(2))),
            )),
            groupby_exprs: None,
            having_cond: None,
            select_exprs: vec![ValExpr::named("c", "name", ValType::Varchar)],
            select_aliases: vec![None],
        };
        let plan = planner.optimize_block(block).unwrap();
        let rows = drain(plan);
        assert_eq!(rows, vec![vec![Value::Varchar(Rc::from("bob"))]]);
    }
}
