//! Compiles validated `ValExpr` trees into `cexp::CExp<Value>` node
//! trees, resolving every column reference to a concrete `(side, index)`
//! pair up front so the evaluator never looks a name up twice.
//!
//! `ValExpr` is assumed to already be the output of validation (out of
//! scope for this crate): a type or arity mismatch found here is a
//! compiler-internal bug, not bad user input, so this module panics on
//! those the way the teacher's `c_check`/`c_value` do, rather than
//! returning a `DbError`.

use crate::cexp::{self, Aggregate, CExpPtr, RowComparator};
use crate::expr::{AggrFunc, BinaryOp, FuncName, UnaryOp, ValExpr};
use crate::value::{ValType, Value};
use std::rc::Rc;

/// One column a compiled expression may reference: its owning alias,
/// its name, and its static type, in the position it appears in a
/// producer's output row.
#[derive(Debug, Clone)]
pub struct ColumnBinding {
    pub alias: Rc<str>,
    pub column: Rc<str>,
    pub typ: ValType,
}

impl ColumnBinding {
    pub fn new(alias: &str, column: &str, typ: ValType) -> Self {
        ColumnBinding {
            alias: Rc::from(alias),
            column: Rc::from(column),
            typ,
        }
    }
}

/// The schema(s) available when compiling a scalar expression: one
/// slice per bound input row (row0's schema, optionally row1's).
pub type Inputs<'a> = &'a [&'a [ColumnBinding]];

fn resolve_named(alias: &str, column: &str, inputs: Inputs) -> (cexp::Side, usize) {
    for (side, schema) in [cexp::Side::Row0, cexp::Side::Row1].into_iter().zip(inputs.iter()) {
        if let Some(index) = schema
            .iter()
            .position(|c| c.alias.as_ref() == alias && c.column.as_ref() == column)
        {
            return (side, index);
        }
    }
    panic!("unresolved column reference {alias}.{column}");
}

fn relative_side(input_index: usize) -> cexp::Side {
    match input_index {
        0 => cexp::Side::Row0,
        1 => cexp::Side::Row1,
        _ => panic!("at most two inputs are ever bound at once"),
    }
}

/// Compile a scalar `ValExpr` (no bare `Aggregate` node) into a `CExp<Value>`.
pub fn compile_scalar(e: &ValExpr, inputs: Inputs) -> CExpPtr<Value> {
    match e {
        ValExpr::Literal(v) => Box::new(cexp::Const { value: v.clone() }),
        ValExpr::NamedColumnRef(alias, column, _) => {
            let (side, index) = resolve_named(alias, column, inputs);
            Box::new(cexp::Column { side, index })
        }
        ValExpr::RelativeColumnRef(input_index, index, _) => Box::new(cexp::Column {
            side: relative_side(*input_index),
            index: *index,
        }),
        ValExpr::Unary(UnaryOp::Not, x) => Box::new(cexp::Not {
            ce: compile_scalar(x, inputs),
        }),
        ValExpr::Unary(UnaryOp::Neg, x) => Box::new(cexp::Neg {
            ce: compile_scalar(x, inputs),
        }),
        ValExpr::Binary(op, l, r) => compile_binary(*op, l, r, inputs),
        ValExpr::FuncCall(name, args) => compile_func(name, args, inputs),
        ValExpr::Aggregate(..) => panic!("bare Aggregate node outside a GroupBy compile path"),
    }
}

fn compile_binary(op: BinaryOp, l: &ValExpr, r: &ValExpr, inputs: Inputs) -> CExpPtr<Value> {
    let cl = compile_scalar(l, inputs);
    let cr = compile_scalar(r, inputs);
    use BinaryOp::*;
    match op {
        Add => Box::new(cexp::ArithExp { op: cexp::Arith::Add, l: cl, r: cr }),
        Sub => Box::new(cexp::ArithExp { op: cexp::Arith::Sub, l: cl, r: cr }),
        Mul => Box::new(cexp::ArithExp { op: cexp::Arith::Mul, l: cl, r: cr }),
        Div => Box::new(cexp::ArithExp { op: cexp::Arith::Div, l: cl, r: cr }),
        Mod => Box::new(cexp::ArithExp { op: cexp::Arith::Mod, l: cl, r: cr }),
        Eq => Box::new(cexp::CompareExp { op: cexp::Compare::Eq, l: cl, r: cr }),
        Ne => Box::new(cexp::CompareExp { op: cexp::Compare::Ne, l: cl, r: cr }),
        Lt => Box::new(cexp::CompareExp { op: cexp::Compare::Lt, l: cl, r: cr }),
        Le => Box::new(cexp::CompareExp { op: cexp::Compare::Le, l: cl, r: cr }),
        Gt => Box::new(cexp::CompareExp { op: cexp::Compare::Gt, l: cl, r: cr }),
        Ge => Box::new(cexp::CompareExp { op: cexp::Compare::Ge, l: cl, r: cr }),
        And => Box::new(cexp::And { l: cl, r: cr }),
        Or => Box::new(cexp::Or { l: cl, r: cr }),
        Concat => Box::new(cexp::Concat { l: cl, r: cr }),
        RegexpLike => Box::new(cexp::RegexpLike { s: cl, pattern: cr }),
    }
}

fn compile_func(name: &FuncName, args: &[ValExpr], inputs: Inputs) -> CExpPtr<Value> {
    match name {
        FuncName::Lower => Box::new(cexp::Lower { ce: compile_scalar(&args[0], inputs) }),
        FuncName::Upper => Box::new(cexp::Upper { ce: compile_scalar(&args[0], inputs) }),
        FuncName::Replace => Box::new(cexp::Replace {
            haystack: compile_scalar(&args[0], inputs),
            from: compile_scalar(&args[1], inputs),
            to: compile_scalar(&args[2], inputs),
        }),
        FuncName::Cast(target) => Box::new(cexp::Cast {
            target: *target,
            ce: compile_scalar(&args[0], inputs),
        }),
    }
}

/// Compile a multi-key ORDER BY / sort spec against a single input schema.
pub fn compile_row_comparator(keys: &[(ValExpr, bool)], schema: &[ColumnBinding]) -> RowComparator {
    let inputs: Inputs = &[schema];
    RowComparator {
        keys: keys
            .iter()
            .map(|(e, asc)| (compile_scalar(e, inputs), *asc))
            .collect(),
    }
}

/// Compile an equi-join condition, split into (left expr, right expr)
/// pairs, into an `EqComparator`. `left_exprs[i]` is compiled against
/// `left_schema` alone, `right_exprs[i]` against `right_schema` alone.
pub fn compile_eq_comparator(
    left_exprs: &[ValExpr],
    left_schema: &[ColumnBinding],
    right_exprs: &[ValExpr],
    right_schema: &[ColumnBinding],
) -> cexp::EqComparator {
    let linputs: Inputs = &[left_schema];
    let rinputs: Inputs = &[right_schema];
    let pairs = left_exprs
        .iter()
        .zip(right_exprs)
        .map(|(l, r)| (compile_scalar(l, linputs), compile_scalar(r, rinputs)))
        .collect();
    cexp::EqComparator { pairs }
}

/// Compile a tuple of expressions (a hash-join partitioning key, a
/// GROUP BY key) against a single input schema.
pub fn compile_tuple(exprs: &[ValExpr], schema: &[ColumnBinding]) -> cexp::TupleExp {
    let inputs: Inputs = &[schema];
    cexp::TupleExp {
        parts: exprs.iter().map(|e| compile_scalar(e, inputs)).collect(),
    }
}

/// One compiled `SELECT`-list aggregate: its accumulator, the compiled
/// input expression to feed it, whether it needs DISTINCT dedup, and
/// whether it may be folded incrementally (see `AggrFunc::is_incremental`).
pub struct CompiledAggregate {
    pub agg: Box<dyn Aggregate>,
    pub input: CExpPtr<Value>,
    pub is_distinct: bool,
    pub incremental: bool,
    input_type: ValType,
}

impl CompiledAggregate {
    /// The static type of the value fed to `add()`, used to size a
    /// per-group `ExtSortBuffer` for DISTINCT/non-incremental aggregates.
    pub fn input_type(&self) -> ValType {
        self.input_type
    }
}

/// Compile a bare `Aggregate` node (only ever found directly in a
/// GROUP BY's SELECT list, never nested).
pub fn compile_aggregate(e: &ValExpr, schema: &[ColumnBinding]) -> CompiledAggregate {
    match e {
        ValExpr::Aggregate(f, inner, is_distinct) => {
            let inputs: Inputs = &[schema];
            CompiledAggregate {
                agg: cexp::aggregate_for(*f),
                input: compile_scalar(inner, inputs),
                is_distinct: *is_distinct,
                incremental: f.is_incremental(*is_distinct),
                input_type: crate::expr::infer_type(inner),
            }
        }
        _ => panic!("compile_aggregate called on a non-Aggregate node"),
    }
}

/// Resolve a `ValType` from an `AggrFunc`'s result, used by planners
/// wiring up the schema of a `GroupByPop`'s output.
pub fn aggregate_result_type(f: AggrFunc, input_type: ValType) -> ValType {
    match f {
        AggrFunc::Count => ValType::Integer,
        AggrFunc::Sum | AggrFunc::Avg | AggrFunc::StddevPop => ValType::Float,
        AggrFunc::Min | AggrFunc::Max => input_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cexp::RowPair;

    #[test]
    fn relative_column_ref_ignores_the_schema_argument() {
        let e = ValExpr::RelativeColumnRef(0, 1, ValType::Integer);
        let ce = compile_scalar(&e, &[&[]]);
        let row = vec![Value::Integer(10), Value::Integer(20)];
        assert_eq!(ce.eval(&RowPair::single(&row)), Value::Integer(20));
    }

    #[test]
    fn named_column_ref_resolves_by_alias_and_name() {
        let schema = [ColumnBinding::new("t", "b", ValType::Integer)];
        let e = ValExpr::NamedColumnRef(Rc::from("t"), Rc::from("b"), ValType::Integer);
        let ce = compile_scalar(&e, &[&schema]);
        let row = vec![Value::Integer(1), Value::Integer(2)];
        assert_eq!(ce.eval(&RowPair::single(&row)), Value::Integer(2));
    }

    #[test]
    fn row_comparator_orders_by_multiple_keys_with_mixed_direction() {
        let keys = vec![
            (ValExpr::RelativeColumnRef(0, 0, ValType::Integer), true),
            (ValExpr::RelativeColumnRef(0, 1, ValType::Integer), false),
        ];
        let cmp = compile_row_comparator(&keys, &[]);
        let a = vec![Value::Integer(1), Value::Integer(5)];
        let b = vec![Value::Integer(1), Value::Integer(2)];
        assert_eq!(cmp.compare(&a, &b), std::cmp::Ordering::Less);
    }
}
