//! Uncompiled value-expression trees (`ValExpr`) produced by validation
//! (out of scope for this crate) and consumed by `compile` to build
//! `CExp` evaluators.

use crate::value::{Value, ValType};
use std::rc::Rc;

/// Binary operators. Division on INTEGER is floor division;
/// `RegexpLike` is a boolean pattern match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Concat,
    RegexpLike,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Built-in scalar functions.
#[derive(Debug, Clone, PartialEq)]
pub enum FuncName {
    Lower,
    Upper,
    Replace,
    Cast(ValType),
}

/// Built-in aggregate functions; see `crate::cexp` for their
/// init/add/merge/finalize semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggrFunc {
    Sum,
    Count,
    Avg,
    StddevPop,
    Min,
    Max
}

impl AggrFunc {
    /// MIN and MAX are always incremental; the rest are incremental
    /// only when DISTINCT is not requested.
    pub fn is_incremental(self, is_distinct: bool) -> bool {
        match self {
            AggrFunc::Min | AggrFunc::Max => true,
            _ => !is_distinct,
        }
    }
}

/// A value-expression tree, as produced by a (separately implemented)
/// validator from parsed SQL.
#[derive(Debug, Clone)]
pub enum ValExpr {
    /// A constant value.
    Literal(Value),
    /// A column reference resolved by (table alias, column name), used
    /// above the operator that introduced the alias.
    NamedColumnRef(Rc<str>, Rc<str>, ValType),
    /// A column reference resolved relative to one immediate input:
    /// (input index, column index).
    RelativeColumnRef(usize, usize, ValType),
    Unary(UnaryOp, Box<ValExpr>),
    Binary(BinaryOp, Box<ValExpr>, Box<ValExpr>),
    FuncCall(FuncName, Vec<ValExpr>),
    /// An aggregate call; never nested inside another aggregate.
    Aggregate(AggrFunc, Box<ValExpr>, bool),
}

impl ValExpr {
    pub fn named(alias: &str, column: &str, t: ValType) -> Self {
        ValExpr::NamedColumnRef(Rc::from(alias), Rc::from(column), t)
    }

    /// The two child expressions of a binary/comparison node, if any.
    pub fn children(&self) -> Vec<&ValExpr> {
        match self {
            ValExpr::Literal(_) | ValExpr::NamedColumnRef(..) | ValExpr::RelativeColumnRef(..) => {
                Vec::new()
            }
            ValExpr::Unary(_, e) => vec![e.as_ref()],
            ValExpr::Binary(_, l, r) => vec![l.as_ref(), r.as_ref()],
            ValExpr::FuncCall(_, args) => args.iter().collect(),
            ValExpr::Aggregate(_, e, _) => vec![e.as_ref()],
        }
    }
}

/// Split a top-level AND-conjunction into its conjuncts (the
/// expression itself if it isn't an AND).
pub fn conjunctive_parts(e: &ValExpr) -> Vec<&ValExpr> {
    match e {
        ValExpr::Binary(BinaryOp::And, l, r) => {
            let mut parts = conjunctive_parts(l);
            parts.extend(conjunctive_parts(r));
            parts
        }
        _ => vec![e],
    }
}

/// Re-form a conjunction from a list of parts (returns `None` for an
/// empty list, as "no condition" rather than a literal `true`).
pub fn make_conjunction(parts: Vec<ValExpr>) -> Option<ValExpr> {
    let mut it = parts.into_iter();
    let first = it.next()?;
    Some(it.fold(first, |acc, p| {
        ValExpr::Binary(BinaryOp::And, Box::new(acc), Box::new(p))
    }))
}

/// Whether every `NamedColumnRef` within `e` refers to one of `aliases`.
/// Used to check whether a condition (or sub-expression) can be
/// evaluated given only those tables in scope.
pub fn in_scope(e: &ValExpr, aliases: &[String]) -> bool {
    match e {
        ValExpr::NamedColumnRef(alias, ..) => aliases.iter().any(|a| a.as_str() == &**alias),
        ValExpr::RelativeColumnRef(..) | ValExpr::Literal(_) => true,
        _ => e.children().into_iter().all(|c| in_scope(c, aliases)),
    }
}

/// Partition a WHERE conjunction into (parts fully evaluable given
/// `aliases`, remaining parts). Mirrors the planner's predicate
/// push-down rule in SPEC_FULL.md §4.10.
pub fn push_down_conds(cond: &ValExpr, aliases: &[String]) -> (Option<ValExpr>, Option<ValExpr>) {
    let mut local = Vec::new();
    let mut remaining = Vec::new();
    for part in conjunctive_parts(cond) {
        if in_scope(part, aliases) {
            local.push(part.clone());
        } else {
            remaining.push(part.clone());
        }
    }
    (make_conjunction(local), make_conjunction(remaining))
}

/// Find the index of an expression referencing `(alias, column)` among
/// `exprs`, if any (used to detect a primary key among join columns).
pub fn find_column_in_exprs(alias: &str, column: &str, exprs: &[ValExpr]) -> Option<usize> {
    exprs.iter().position(|e| {
        matches!(e, ValExpr::NamedColumnRef(a, c, _) if a.as_ref() == alias && c.as_ref() == column)
    })
}

/// Evaluate a constant (column-reference-free) expression at plan time.
/// Used by the planner when setting up an independent index scan's range.
pub fn eval_literal(e: &ValExpr) -> Value {
    match e {
        ValExpr::Literal(v) => v.clone(),
        _ => panic!("eval_literal called on a non-constant expression"),
    }
}

/// Static result type of a validated expression tree. Validation (out
/// of scope here) is assumed to have already rejected anything that
/// would make this ambiguous or ill-typed.
pub fn infer_type(e: &ValExpr) -> ValType {
    match e {
        ValExpr::Literal(v) => v.valtype().unwrap_or(ValType::Any),
        ValExpr::NamedColumnRef(_, _, t) | ValExpr::RelativeColumnRef(_, _, t) => *t,
        ValExpr::Unary(UnaryOp::Not, _) => ValType::Boolean,
        ValExpr::Unary(UnaryOp::Neg, x) => infer_type(x),
        ValExpr::Binary(op, l, _) if op.is_comparison() || matches!(op, BinaryOp::And | BinaryOp::Or) => {
            let _ = l;
            ValType::Boolean
        }
        ValExpr::Binary(BinaryOp::Concat, ..) => ValType::Varchar,
        ValExpr::Binary(_, l, _) => infer_type(l),
        ValExpr::FuncCall(FuncName::Cast(t), _) => *t,
        ValExpr::FuncCall(FuncName::Lower | FuncName::Upper | FuncName::Replace, _) => ValType::Varchar,
        ValExpr::Aggregate(f, inner, _) => crate::compile::aggregate_result_type(*f, infer_type(inner)),
    }
}
