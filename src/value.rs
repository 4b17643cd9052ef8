//! Run-time `Value`s and their static `ValType`s.
//!
//! Follows the teacher's convention of sharing variable-length payloads
//! through `Rc` rather than cloning them on every row copy, and of
//! giving `Value` a manual `Ord` that panics on cross-variant
//! comparisons (a compiled expression tree guarantees operands already
//! agree in type, so a mismatch here is a compiler bug, not user input).

use std::cmp::Ordering;
use std::rc::Rc;

/// Types supported by the engine. The ordering of variants reflects
/// type precedence: when an operator combines expressions of
/// different types, the lower-precedence one is implicitly cast up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValType {
    DateTime,
    Float,
    Integer,
    Boolean,
    Varchar,
    Any,
}

impl ValType {
    /// Whether a value of this type may be used where `other` is expected,
    /// without an explicit CAST.
    pub fn implicitly_casts_to(self, other: ValType) -> bool {
        use ValType::*;
        if self == other {
            true
        } else if self == Boolean && matches!(other, Integer | Float) {
            true
        } else if self == Integer && other == Float {
            true
        } else if self == Varchar && other == DateTime {
            true
        } else if self == DateTime && other == Varchar {
            true
        } else {
            other == Any
        }
    }

    /// Whether a value of this type may be CAST to `other`.
    pub fn can_cast_to(self, other: ValType) -> bool {
        use ValType::*;
        if self.implicitly_casts_to(other) {
            true
        } else if self == Any || other == Varchar {
            true
        } else {
            self == Float && other == Integer
        }
    }

    /// An approximate in-memory size estimate for one value of this type,
    /// used by `BufferedReader`/`BufferedWriter`/`ExtSortBuffer` budget
    /// accounting. VARCHAR/ANY sizes are only a guess.
    pub fn approx_size(self) -> usize {
        match self {
            ValType::DateTime => 24,
            ValType::Float => 8,
            ValType::Integer => 8,
            ValType::Boolean => 1,
            ValType::Varchar => 32,
            ValType::Any => 32,
        }
    }
}

/// A row type: the ordered sequence of column types a producer emits.
pub type RowType = Vec<ValType>;

/// A run-time row: a fixed-arity sequence of typed values.
pub type Row = Vec<Value>;

/// A run-time value. DATETIME is kept in canonical ISO-8601 text form;
/// the engine never performs date arithmetic, only comparison and
/// VARCHAR<->DATETIME round-trip casts, so no calendar library is
/// needed to implement the spec faithfully.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    DateTime(Rc<str>),
    Float(f64),
    Integer(i64),
    Boolean(bool),
    Varchar(Rc<str>),
}

impl Value {
    pub fn valtype(&self) -> Option<ValType> {
        match self {
            Value::Null => None,
            Value::DateTime(_) => Some(ValType::DateTime),
            Value::Float(_) => Some(ValType::Float),
            Value::Integer(_) => Some(ValType::Integer),
            Value::Boolean(_) => Some(ValType::Boolean),
            Value::Varchar(_) => Some(ValType::Varchar),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> i64 {
        match self {
            Value::Integer(x) => *x,
            Value::Boolean(b) => *b as i64,
            _ => panic!("as_int called on non-integer value"),
        }
    }

    pub fn as_float(&self) -> f64 {
        match self {
            Value::Float(x) => *x,
            Value::Integer(x) => *x as f64,
            Value::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            _ => panic!("as_float called on non-numeric value"),
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Boolean(b) => *b,
            _ => panic!("as_bool called on non-boolean value"),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Value::Varchar(s) => s,
            Value::DateTime(s) => s,
            _ => panic!("as_str called on non-string value"),
        }
    }
}

// Cross-variant comparisons only ever happen if a compiled expression
// tree was built over mismatched column types, which the compiler is
// responsible for preventing: such a mismatch is an internal bug, so
// we panic the way the teacher's `Value` does rather than returning a
// `DbError`.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Varchar(a), Value::Varchar(b)) => a == b,
            _ => panic!("comparing values of different types"),
        }
    }
}
impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b).expect("NaN in sort key"),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Varchar(a), Value::Varchar(b)) => a.cmp(b),
            _ => panic!("comparing values of different types"),
        }
    }
}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::DateTime(s) => s.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Boolean(b) => b.hash(state),
            Value::Varchar(s) => s.hash(state),
        }
    }
}

/// Approximate byte size of a row given its types, for budget accounting.
pub fn row_approx_size(types: &[ValType]) -> usize {
    types.iter().map(|t| t.approx_size()).sum()
}
