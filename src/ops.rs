//! The operator registry.
//!
//! Built-in operators live in a process-wide, lazily constructed, read-only
//! table; ad hoc operators are registered per [`Environment`] through the
//! builder and never touch the shared table. Every operator is an ordinary
//! pure function over [`Value`]s; the compiler core only ever calls through
//! [`OpImpl::invoke`].
//!
//! [`Environment`]: crate::env::Environment
use std::{collections::HashMap, sync::Arc, sync::LazyLock};

use crate::{eval::Binding, value::Value};

/// Execution context handed to operator implementations.
///
/// During constant folding there is no binding source, so `binding` is
/// `None`; at evaluation time it is the caller's [`Binding`].
#[derive(Clone, Copy, Default)]
pub struct OpContext<'a> {
    pub binding: Option<&'a dyn Binding>,
}

impl OpContext<'_> {
    /// The nil context used for compile-time folding attempts.
    pub const NIL: OpContext<'static> = OpContext { binding: None };
}

pub type BuiltinFn = fn(&OpContext<'_>, &[Value]) -> Result<Value, OperatorError>;
pub type CustomFn =
    Arc<dyn Fn(&OpContext<'_>, &[Value]) -> Result<Value, OperatorError> + Send + Sync>;

/// A callable operator as stored in AST nodes and compiled instructions.
#[derive(Clone)]
pub enum OpImpl {
    Builtin(BuiltinFn),
    Custom(CustomFn),
}

impl OpImpl {
    pub fn invoke(&self, ctx: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
        match self {
            Self::Builtin(f) => f(ctx, args),
            Self::Custom(f) => f(ctx, args),
        }
    }
}

impl std::fmt::Debug for OpImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Builtin(_) => f.write_str("OpImpl::Builtin"),
            Self::Custom(_) => f.write_str("OpImpl::Custom"),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum OperatorError {
    #[error("expected {expected} argument(s), got {got}")]
    WrongArgCount { expected: usize, got: usize },
    #[error("expected {expected}, got {got}")]
    TypeMismatch {
        expected: &'static str,
        got: &'static str,
    },
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow")]
    Overflow,
    #[error("unparseable version `{0}`")]
    BadVersion(Box<str>),
    #[error("unparseable date `{0}`")]
    BadDate(Box<str>),
    #[error("{0}")]
    Custom(Box<str>),
}

fn want(args: &[Value], expected: usize) -> Result<(), OperatorError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(OperatorError::WrongArgCount {
            expected,
            got: args.len(),
        })
    }
}

fn int(v: &Value) -> Result<i64, OperatorError> {
    v.as_int().ok_or(OperatorError::TypeMismatch {
        expected: "int",
        got: v.type_name(),
    })
}

fn boolean(v: &Value) -> Result<bool, OperatorError> {
    v.as_bool().ok_or(OperatorError::TypeMismatch {
        expected: "bool",
        got: v.type_name(),
    })
}

fn string(v: &Value) -> Result<&str, OperatorError> {
    v.as_str().ok_or(OperatorError::TypeMismatch {
        expected: "string",
        got: v.type_name(),
    })
}

fn fold_ints(
    args: &[Value],
    init: i64,
    f: fn(i64, i64) -> Option<i64>,
) -> Result<Value, OperatorError> {
    let mut acc = match args.first() {
        Some(first) if args.len() > 1 => int(first)?,
        Some(only) => return f(init, int(only)?).map(Value::Int).ok_or(OperatorError::Overflow),
        None => return Err(OperatorError::WrongArgCount { expected: 1, got: 0 }),
    };
    for arg in &args[1..] {
        acc = f(acc, int(arg)?).ok_or(OperatorError::Overflow)?;
    }
    Ok(Value::Int(acc))
}

fn op_add(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    fold_ints(args, 0, i64::checked_add)
}

fn op_sub(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    fold_ints(args, 0, i64::checked_sub)
}

fn op_mul(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    fold_ints(args, 1, i64::checked_mul)
}

fn op_div(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    want(args, 2)?;
    let (a, b) = (int(&args[0])?, int(&args[1])?);
    if b == 0 {
        return Err(OperatorError::DivisionByZero);
    }
    a.checked_div(b).map(Value::Int).ok_or(OperatorError::Overflow)
}

fn op_rem(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    want(args, 2)?;
    let (a, b) = (int(&args[0])?, int(&args[1])?);
    if b == 0 {
        return Err(OperatorError::DivisionByZero);
    }
    a.checked_rem(b).map(Value::Int).ok_or(OperatorError::Overflow)
}

fn op_min(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    extremum(args, i64::min)
}

fn op_max(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    extremum(args, i64::max)
}

fn extremum(args: &[Value], pick: fn(i64, i64) -> i64) -> Result<Value, OperatorError> {
    let first = args
        .first()
        .ok_or(OperatorError::WrongArgCount { expected: 1, got: 0 })?;
    let mut acc = int(first)?;
    for arg in &args[1..] {
        acc = pick(acc, int(arg)?);
    }
    Ok(Value::Int(acc))
}

fn same_type(a: &Value, b: &Value) -> Result<(), OperatorError> {
    if std::mem::discriminant(a) == std::mem::discriminant(b) {
        Ok(())
    } else {
        Err(OperatorError::TypeMismatch {
            expected: a.type_name(),
            got: b.type_name(),
        })
    }
}

fn op_eq(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    want(args, 2)?;
    same_type(&args[0], &args[1])?;
    Ok(Value::Bool(args[0] == args[1]))
}

fn op_ne(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    want(args, 2)?;
    same_type(&args[0], &args[1])?;
    Ok(Value::Bool(args[0] != args[1]))
}

fn ordering(args: &[Value]) -> Result<std::cmp::Ordering, OperatorError> {
    want(args, 2)?;
    match (&args[0], &args[1]) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Ok(a.as_ref().cmp(b.as_ref())),
        (a, b) => Err(OperatorError::TypeMismatch {
            expected: "two ints or two strings",
            got: if a.type_name() == b.type_name() {
                a.type_name()
            } else {
                b.type_name()
            },
        }),
    }
}

fn op_lt(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    Ok(Value::Bool(ordering(args)?.is_lt()))
}

fn op_le(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    Ok(Value::Bool(ordering(args)?.is_le()))
}

fn op_gt(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    Ok(Value::Bool(ordering(args)?.is_gt()))
}

fn op_ge(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    Ok(Value::Bool(ordering(args)?.is_ge()))
}

fn op_and(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    for arg in args {
        if !boolean(arg)? {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn op_or(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    for arg in args {
        if boolean(arg)? {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn op_not(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    want(args, 1)?;
    Ok(Value::Bool(!boolean(&args[0])?))
}

fn op_in(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    want(args, 2)?;
    match &args[1] {
        Value::List(items) => Ok(Value::Bool(items.contains(&args[0]))),
        other => Err(OperatorError::TypeMismatch {
            expected: "list",
            got: other.type_name(),
        }),
    }
}

fn op_count(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    want(args, 1)?;
    match &args[0] {
        Value::List(items) => Ok(Value::Int(items.len() as i64)),
        other => Err(OperatorError::TypeMismatch {
            expected: "list",
            got: other.type_name(),
        }),
    }
}

fn op_matches(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    want(args, 2)?;
    Ok(Value::Bool(string(&args[0])?.contains(string(&args[1])?)))
}

/// Dotted-version comparison: each `.`-separated segment is a decimal
/// number, compared segment-wise with missing segments treated as zero.
fn version_segments(s: &str) -> Result<Vec<u64>, OperatorError> {
    if s.is_empty() {
        return Err(OperatorError::BadVersion(Box::from(s)));
    }
    s.split('.')
        .map(|seg| {
            seg.parse::<u64>()
                .map_err(|_| OperatorError::BadVersion(Box::from(s)))
        })
        .collect()
}

fn version_ordering(args: &[Value]) -> Result<std::cmp::Ordering, OperatorError> {
    want(args, 2)?;
    let mut a = version_segments(string(&args[0])?)?;
    let mut b = version_segments(string(&args[1])?)?;
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    Ok(a.cmp(&b))
}

fn op_ver_lt(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    Ok(Value::Bool(version_ordering(args)?.is_lt()))
}

fn op_ver_le(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    Ok(Value::Bool(version_ordering(args)?.is_le()))
}

fn op_ver_gt(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    Ok(Value::Bool(version_ordering(args)?.is_gt()))
}

fn op_ver_ge(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    Ok(Value::Bool(version_ordering(args)?.is_ge()))
}

/// Calendar instant parsed from `"YYYY-MM-DD"` or `"YYYY-MM-DD HH:MM:SS"`.
type DateTuple = (u16, u8, u8, u8, u8, u8);

fn parse_date(s: &str) -> Result<DateTuple, OperatorError> {
    let bad = || OperatorError::BadDate(Box::from(s));
    let (date, time) = match s.split_once(' ') {
        Some((d, t)) => (d, Some(t)),
        None => (s, None),
    };
    let mut parts = date.split('-');
    let year: u16 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
    let month: u8 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
    let day: u8 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
    if parts.next().is_some() || !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(bad());
    }
    let (hour, minute, second) = match time {
        None => (0, 0, 0),
        Some(t) => {
            let mut parts = t.split(':');
            let h: u8 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
            let m: u8 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
            let s: u8 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
            if parts.next().is_some() || h > 23 || m > 59 || s > 59 {
                return Err(bad());
            }
            (h, m, s)
        }
    };
    Ok((year, month, day, hour, minute, second))
}

fn date_ordering(args: &[Value]) -> Result<std::cmp::Ordering, OperatorError> {
    want(args, 2)?;
    let a = parse_date(string(&args[0])?)?;
    let b = parse_date(string(&args[1])?)?;
    Ok(a.cmp(&b))
}

fn op_date_lt(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    Ok(Value::Bool(date_ordering(args)?.is_lt()))
}

fn op_date_le(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    Ok(Value::Bool(date_ordering(args)?.is_le()))
}

fn op_date_gt(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    Ok(Value::Bool(date_ordering(args)?.is_gt()))
}

fn op_date_ge(_: &OpContext<'_>, args: &[Value]) -> Result<Value, OperatorError> {
    Ok(Value::Bool(date_ordering(args)?.is_ge()))
}

/// The process-wide built-in table. Constructed once, never mutated.
pub static BUILTINS: LazyLock<HashMap<&'static str, BuiltinFn>> = LazyLock::new(|| {
    let mut table: HashMap<&'static str, BuiltinFn> = HashMap::new();
    table.insert("+", op_add);
    table.insert("-", op_sub);
    table.insert("*", op_mul);
    table.insert("/", op_div);
    table.insert("%", op_rem);
    table.insert("min", op_min);
    table.insert("max", op_max);
    table.insert("=", op_eq);
    table.insert("!=", op_ne);
    table.insert("<", op_lt);
    table.insert("<=", op_le);
    table.insert(">", op_gt);
    table.insert(">=", op_ge);
    table.insert("and", op_and);
    table.insert("or", op_or);
    table.insert("not", op_not);
    table.insert("in", op_in);
    table.insert("count", op_count);
    table.insert("matches", op_matches);
    table.insert("ver<", op_ver_lt);
    table.insert("ver<=", op_ver_le);
    table.insert("ver>", op_ver_gt);
    table.insert("ver>=", op_ver_ge);
    table.insert("date<", op_date_lt);
    table.insert("date<=", op_date_le);
    table.insert("date>", op_date_gt);
    table.insert("date>=", op_date_ge);
    table
});

pub fn builtin(name: &str) -> Option<OpImpl> {
    BUILTINS.get(name).copied().map(OpImpl::Builtin)
}
