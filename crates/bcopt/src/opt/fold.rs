// Compile-time evaluation of binary operators and comparisons on constants.
//
// Every function mirrors the VM's runtime semantics exactly or refuses to
// fold. Refusals are `FoldError`s; the peephole pass logs them and leaves the
// instructions alone.

use std::cmp::Ordering;

use crate::code::{BinaryOperator, CompareKind, Value};
use crate::error::FoldError;

/// Longest string, bytes or tuple a fold may produce.
pub const MAX_FOLDED_LEN: usize = 4096;

/// Largest integer magnitude converted to a float without rounding.
const EXACT_FLOAT_INT: i64 = 1 << 53;

type FoldResult<T> = std::result::Result<T, FoldError>;

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Int(i64::from(*b))),
            Value::Int(i) => Some(Self::Int(*i)),
            Value::Float(f) => Some(Self::Float(*f)),
            _ => None,
        }
    }

    fn to_float(self, operator: &'static str) -> FoldResult<f64> {
        match self {
            Self::Float(f) => Ok(f),
            Self::Int(i) if (-EXACT_FLOAT_INT..=EXACT_FLOAT_INT).contains(&i) => Ok(i as f64),
            Self::Int(_) => Err(arithmetic(operator, "integer too large to convert exactly")),
        }
    }
}

fn unsupported(operator: &'static str, lhs: &Value, rhs: &Value) -> FoldError {
    FoldError::FoldEvaluation {
        operator,
        lhs: lhs.type_name(),
        rhs: rhs.type_name(),
    }
}

const fn arithmetic(operator: &'static str, reason: &'static str) -> FoldError {
    FoldError::Arithmetic { operator, reason }
}

/// Evaluate `lhs <op> rhs`.
pub fn binary(op: BinaryOperator, lhs: &Value, rhs: &Value) -> FoldResult<Value> {
    let symbol = op.symbol();
    match op {
        BinaryOperator::Add => match (lhs, rhs) {
            (Value::Str(a), Value::Str(b)) => {
                check_len(a.chars().count() + b.chars().count())?;
                Ok(Value::Str(format!("{a}{b}")))
            }
            (Value::Bytes(a), Value::Bytes(b)) => {
                check_len(a.len() + b.len())?;
                Ok(Value::Bytes([a.as_slice(), b.as_slice()].concat()))
            }
            (Value::Tuple(a), Value::Tuple(b)) => {
                check_len(a.len() + b.len())?;
                Ok(Value::Tuple([a.as_slice(), b.as_slice()].concat()))
            }
            _ => numeric(symbol, lhs, rhs, i64::checked_add, |a, b| a + b),
        },
        BinaryOperator::Subtract => numeric(symbol, lhs, rhs, i64::checked_sub, |a, b| a - b),
        BinaryOperator::Multiply => match (lhs, rhs) {
            (seq @ (Value::Str(_) | Value::Bytes(_) | Value::Tuple(_)), count)
            | (count, seq @ (Value::Str(_) | Value::Bytes(_) | Value::Tuple(_))) => {
                repeat(seq, count).ok_or_else(|| unsupported(symbol, lhs, rhs))?
            }
            _ => numeric(symbol, lhs, rhs, i64::checked_mul, |a, b| a * b),
        },
        BinaryOperator::TrueDivide => {
            let (a, b) = numbers(symbol, lhs, rhs)?;
            let (a, b) = (a.to_float(symbol)?, b.to_float(symbol)?);
            if b == 0.0 {
                return Err(arithmetic(symbol, "division by zero"));
            }
            Ok(Value::Float(a / b))
        }
        BinaryOperator::FloorDivide => match numbers(symbol, lhs, rhs)? {
            (Num::Int(a), Num::Int(b)) => floor_div(a, b).map(Value::Int),
            (a, b) => {
                let (div, _) = float_divmod(a.to_float(symbol)?, b.to_float(symbol)?, symbol)?;
                Ok(Value::Float(div))
            }
        },
        BinaryOperator::Modulo => {
            if matches!(lhs, Value::Str(_) | Value::Bytes(_)) {
                // String formatting.
                return Err(unsupported(symbol, lhs, rhs));
            }
            match numbers(symbol, lhs, rhs)? {
                (Num::Int(a), Num::Int(b)) => floor_mod(a, b).map(Value::Int),
                (a, b) => {
                    let (_, rem) =
                        float_divmod(a.to_float(symbol)?, b.to_float(symbol)?, symbol)?;
                    Ok(Value::Float(rem))
                }
            }
        }
        BinaryOperator::Power => power(lhs, rhs),
        BinaryOperator::LeftShift | BinaryOperator::RightShift => {
            let (Some(Num::Int(a)), Some(Num::Int(b))) = (Num::of(lhs), Num::of(rhs)) else {
                return Err(unsupported(symbol, lhs, rhs));
            };
            if b < 0 {
                return Err(arithmetic(symbol, "negative shift count"));
            }
            if op == BinaryOperator::RightShift {
                return Ok(Value::Int(if b >= 63 { a >> 63 } else { a >> b }));
            }
            if a == 0 {
                return Ok(Value::Int(0));
            }
            if b >= 63 || (a << b) >> b != a {
                return Err(arithmetic(symbol, "integer overflow"));
            }
            Ok(Value::Int(a << b))
        }
        BinaryOperator::And | BinaryOperator::Or | BinaryOperator::Xor => {
            let apply = |a: i64, b: i64| match op {
                BinaryOperator::And => a & b,
                BinaryOperator::Or => a | b,
                _ => a ^ b,
            };
            match (lhs, rhs) {
                (Value::Bool(a), Value::Bool(b)) => {
                    Ok(Value::Bool(apply(i64::from(*a), i64::from(*b)) != 0))
                }
                _ => match (Num::of(lhs), Num::of(rhs)) {
                    (Some(Num::Int(a)), Some(Num::Int(b))) => Ok(Value::Int(apply(a, b))),
                    _ => Err(unsupported(symbol, lhs, rhs)),
                },
            }
        }
        BinaryOperator::Subscript => subscript(lhs, rhs),
        BinaryOperator::MatrixMultiply => Err(unsupported(symbol, lhs, rhs)),
    }
}

/// Evaluate the comparison selected by a `COMPARE_OP` operand.
pub fn compare(operand: u32, lhs: &Value, rhs: &Value) -> FoldResult<Value> {
    let kind =
        CompareKind::from_operand(operand).ok_or(FoldError::AmbiguousComparisonKind(operand))?;
    let symbol = kind.symbol();
    let result = match kind {
        CompareKind::Eq => equal(lhs, rhs)?,
        CompareKind::Ne => !equal(lhs, rhs)?,
        CompareKind::Lt | CompareKind::Le | CompareKind::Gt | CompareKind::Ge => {
            match order(lhs, rhs, symbol)? {
                // Unordered floats compare false every way.
                None => false,
                Some(ordering) => match kind {
                    CompareKind::Lt => ordering == Ordering::Less,
                    CompareKind::Le => ordering != Ordering::Greater,
                    CompareKind::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                },
            }
        }
        CompareKind::In => contains(rhs, lhs, symbol)?,
        CompareKind::NotIn => !contains(rhs, lhs, symbol)?,
        CompareKind::Is | CompareKind::IsNot | CompareKind::ExceptionMatch => {
            return Err(FoldError::AmbiguousComparisonKind(operand));
        }
    };
    Ok(Value::Bool(result))
}

fn check_len(len: usize) -> FoldResult<()> {
    if len > MAX_FOLDED_LEN {
        return Err(FoldError::TooLarge { len });
    }
    Ok(())
}

fn numbers(operator: &'static str, lhs: &Value, rhs: &Value) -> FoldResult<(Num, Num)> {
    match (Num::of(lhs), Num::of(rhs)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(unsupported(operator, lhs, rhs)),
    }
}

fn numeric(
    operator: &'static str,
    lhs: &Value,
    rhs: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> FoldResult<Value> {
    match numbers(operator, lhs, rhs)? {
        (Num::Int(a), Num::Int(b)) => int_op(a, b)
            .map(Value::Int)
            .ok_or_else(|| arithmetic(operator, "integer overflow")),
        (a, b) => Ok(Value::Float(float_op(
            a.to_float(operator)?,
            b.to_float(operator)?,
        ))),
    }
}

fn floor_div(a: i64, b: i64) -> FoldResult<i64> {
    if b == 0 {
        return Err(arithmetic("//", "division by zero"));
    }
    let q = a
        .checked_div(b)
        .ok_or_else(|| arithmetic("//", "integer overflow"))?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

fn floor_mod(a: i64, b: i64) -> FoldResult<i64> {
    if b == 0 {
        return Err(arithmetic("%", "division by zero"));
    }
    let r = a
        .checked_rem(b)
        .ok_or_else(|| arithmetic("%", "integer overflow"))?;
    if r != 0 && ((r < 0) != (b < 0)) {
        Ok(r + b)
    } else {
        Ok(r)
    }
}

/// Floored quotient and remainder of two floats, rounding the quotient the
/// way the VM does.
fn float_divmod(vx: f64, wx: f64, operator: &'static str) -> FoldResult<(f64, f64)> {
    if wx == 0.0 {
        return Err(arithmetic(operator, "division by zero"));
    }
    let mut rem = vx % wx;
    let mut div = (vx - rem) / wx;
    if rem == 0.0 {
        rem = 0.0_f64.copysign(wx);
    } else if (wx < 0.0) != (rem < 0.0) {
        rem += wx;
        div -= 1.0;
    }
    let floordiv = if div == 0.0 {
        0.0_f64.copysign(vx / wx)
    } else {
        let mut floored = div.floor();
        if div - floored > 0.5 {
            floored += 1.0;
        }
        floored
    };
    Ok((floordiv, rem))
}

fn power(lhs: &Value, rhs: &Value) -> FoldResult<Value> {
    match numbers("**", lhs, rhs)? {
        (Num::Int(base), Num::Int(exp)) => {
            let exp = u32::try_from(exp)
                .map_err(|_| arithmetic("**", "negative or oversized exponent"))?;
            base.checked_pow(exp)
                .map(Value::Int)
                .ok_or_else(|| arithmetic("**", "integer overflow"))
        }
        (base, exp) => {
            let (base, exp) = (base.to_float("**")?, exp.to_float("**")?);
            if !base.is_finite() || !exp.is_finite() {
                return Err(arithmetic("**", "non-finite operand"));
            }
            if base == 0.0 && exp < 0.0 {
                return Err(arithmetic("**", "zero to a negative power"));
            }
            if base < 0.0 && exp.fract() != 0.0 {
                return Err(arithmetic("**", "complex result"));
            }
            let result = base.powf(exp);
            if !result.is_finite() {
                return Err(arithmetic("**", "result out of range"));
            }
            Ok(Value::Float(result))
        }
    }
}

/// `seq * count` for strings, bytes and tuples; `None` when `count` is not
/// an integer.
fn repeat(seq: &Value, count: &Value) -> Option<FoldResult<Value>> {
    let Some(Num::Int(n)) = Num::of(count) else {
        return None;
    };
    let n = usize::try_from(n).unwrap_or(0);
    let len = match seq {
        Value::Str(s) => s.chars().count(),
        Value::Bytes(b) => b.len(),
        Value::Tuple(t) => t.len(),
        _ => return None,
    };
    let total = match len.checked_mul(n) {
        Some(total) => total,
        None => return Some(Err(FoldError::TooLarge { len: usize::MAX })),
    };
    if let Err(err) = check_len(total) {
        return Some(Err(err));
    }
    Some(Ok(match seq {
        Value::Str(s) => Value::Str(s.repeat(n)),
        Value::Bytes(b) => Value::Bytes(b.repeat(n)),
        Value::Tuple(t) => Value::Tuple((0..n).flat_map(|_| t.iter().cloned()).collect()),
        _ => return None,
    }))
}

fn subscript(container: &Value, index: &Value) -> FoldResult<Value> {
    let Some(Num::Int(i)) = Num::of(index) else {
        return Err(unsupported("[]", container, index));
    };
    let resolve = |len: usize| -> FoldResult<usize> {
        let len = i64::try_from(len).map_err(|_| arithmetic("[]", "sequence too long"))?;
        let at = if i < 0 { i + len } else { i };
        if (0..len).contains(&at) {
            Ok(at as usize)
        } else {
            Err(arithmetic("[]", "index out of range"))
        }
    };
    match container {
        Value::Str(s) => {
            let at = resolve(s.chars().count())?;
            let ch = s
                .chars()
                .nth(at)
                .ok_or_else(|| arithmetic("[]", "index out of range"))?;
            Ok(Value::Str(ch.to_string()))
        }
        Value::Bytes(b) => Ok(Value::Int(i64::from(b[resolve(b.len())?]))),
        Value::Tuple(t) => Ok(t[resolve(t.len())?].clone()),
        _ => Err(unsupported("[]", container, index)),
    }
}

/// `==` as the VM evaluates it on constants.
fn equal(lhs: &Value, rhs: &Value) -> FoldResult<bool> {
    if let (Some(a), Some(b)) = (Num::of(lhs), Num::of(rhs)) {
        return Ok(match (a, b) {
            (Num::Int(a), Num::Int(b)) => a == b,
            (a, b) => a.to_float("==")? == b.to_float("==")?,
        });
    }
    match (lhs, rhs) {
        (Value::None, Value::None) | (Value::Ellipsis, Value::Ellipsis) => Ok(true),
        (Value::Str(a), Value::Str(b)) => Ok(a == b),
        (Value::Bytes(a), Value::Bytes(b)) => Ok(a == b),
        (Value::Tuple(a), Value::Tuple(b)) => {
            if a.len() != b.len() {
                return Ok(false);
            }
            for (x, y) in a.iter().zip(b) {
                if !element_equal(x, y)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        // Equality of code objects depends on more than their contents.
        (Value::Code(_), _) | (_, Value::Code(_)) => Err(unsupported("==", lhs, rhs)),
        _ => Ok(false),
    }
}

/// Element comparison inside containers, which checks identity first. NaN
/// equals itself only when both sides are the same object, which constants
/// cannot tell us.
fn element_equal(lhs: &Value, rhs: &Value) -> FoldResult<bool> {
    let is_nan = |v: &Value| matches!(v, Value::Float(f) if f.is_nan());
    if is_nan(lhs) || is_nan(rhs) {
        return Err(unsupported("==", lhs, rhs));
    }
    equal(lhs, rhs)
}

/// Ordering for `<`, `<=`, `>`, `>=`; `Ok(None)` for unordered floats.
fn order(lhs: &Value, rhs: &Value, symbol: &'static str) -> FoldResult<Option<Ordering>> {
    if let (Some(a), Some(b)) = (Num::of(lhs), Num::of(rhs)) {
        return Ok(match (a, b) {
            (Num::Int(a), Num::Int(b)) => Some(a.cmp(&b)),
            (a, b) => a.to_float(symbol)?.partial_cmp(&b.to_float(symbol)?),
        });
    }
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
        (Value::Bytes(a), Value::Bytes(b)) => Ok(Some(a.cmp(b))),
        (Value::Tuple(a), Value::Tuple(b)) => {
            for (x, y) in a.iter().zip(b) {
                if !element_equal(x, y)? {
                    return order(x, y, symbol);
                }
            }
            Ok(Some(a.len().cmp(&b.len())))
        }
        _ => Err(unsupported(symbol, lhs, rhs)),
    }
}

/// `needle in haystack`.
fn contains(haystack: &Value, needle: &Value, symbol: &'static str) -> FoldResult<bool> {
    match (haystack, needle) {
        (Value::Str(h), Value::Str(n)) => Ok(h.contains(n.as_str())),
        (Value::Bytes(h), Value::Bytes(n)) => {
            Ok(n.is_empty() || h.windows(n.len()).any(|w| w == n.as_slice()))
        }
        (Value::Bytes(h), Value::Int(n)) => {
            let byte = u8::try_from(*n).map_err(|_| arithmetic(symbol, "byte must be in range(0, 256)"))?;
            Ok(h.contains(&byte))
        }
        (Value::Tuple(items), _) => {
            for item in items {
                if element_equal(item, needle)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(unsupported(symbol, needle, haystack)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(i: i64) -> Value {
        Value::Int(i)
    }

    #[test]
    fn integer_arithmetic() {
        assert_eq!(binary(BinaryOperator::Add, &int(10), &int(20)), Ok(int(30)));
        assert_eq!(binary(BinaryOperator::Subtract, &int(3), &int(5)), Ok(int(-2)));
        assert_eq!(binary(BinaryOperator::Multiply, &int(6), &int(7)), Ok(int(42)));
        assert_eq!(binary(BinaryOperator::Power, &int(2), &int(10)), Ok(int(1024)));
        assert_eq!(binary(BinaryOperator::Add, &Value::Bool(true), &int(1)), Ok(int(2)));
    }

    #[test]
    fn overflow_refuses_to_fold() {
        assert!(matches!(
            binary(BinaryOperator::Add, &int(i64::MAX), &int(1)),
            Err(FoldError::Arithmetic { .. })
        ));
        assert!(binary(BinaryOperator::Power, &int(10), &int(40)).is_err());
        assert!(binary(BinaryOperator::LeftShift, &int(1), &int(64)).is_err());
    }

    #[test]
    fn floored_division_and_modulo() {
        assert_eq!(binary(BinaryOperator::FloorDivide, &int(7), &int(2)), Ok(int(3)));
        assert_eq!(binary(BinaryOperator::FloorDivide, &int(-7), &int(2)), Ok(int(-4)));
        assert_eq!(binary(BinaryOperator::Modulo, &int(-7), &int(2)), Ok(int(1)));
        assert_eq!(binary(BinaryOperator::Modulo, &int(7), &int(-2)), Ok(int(-1)));
        assert_eq!(
            binary(BinaryOperator::FloorDivide, &Value::Float(-7.5), &int(2)),
            Ok(Value::Float(-4.0))
        );
        assert_eq!(
            binary(BinaryOperator::Modulo, &Value::Float(-7.5), &int(2)),
            Ok(Value::Float(0.5))
        );
        assert!(binary(BinaryOperator::Modulo, &int(1), &int(0)).is_err());
    }

    #[test]
    fn true_division_yields_float() {
        assert_eq!(
            binary(BinaryOperator::TrueDivide, &int(7), &int(2)),
            Ok(Value::Float(3.5))
        );
        assert_eq!(
            binary(BinaryOperator::TrueDivide, &int(4), &int(2)),
            Ok(Value::Float(2.0))
        );
        assert!(binary(BinaryOperator::TrueDivide, &int(1), &int(0)).is_err());
    }

    #[test]
    fn shifts_and_bitwise() {
        assert_eq!(binary(BinaryOperator::RightShift, &int(-9), &int(1)), Ok(int(-5)));
        assert_eq!(binary(BinaryOperator::RightShift, &int(-9), &int(100)), Ok(int(-1)));
        assert_eq!(binary(BinaryOperator::LeftShift, &int(3), &int(4)), Ok(int(48)));
        assert_eq!(
            binary(BinaryOperator::And, &Value::Bool(true), &Value::Bool(false)),
            Ok(Value::Bool(false))
        );
        assert_eq!(binary(BinaryOperator::Xor, &int(6), &Value::Bool(true)), Ok(int(7)));
        assert!(binary(BinaryOperator::Or, &Value::Float(1.0), &int(1)).is_err());
    }

    #[test]
    fn sequences() {
        assert_eq!(
            binary(BinaryOperator::Add, &"ab".into(), &"cd".into()),
            Ok("abcd".into())
        );
        assert_eq!(
            binary(BinaryOperator::Multiply, &int(3), &"ab".into()),
            Ok("ababab".into())
        );
        assert_eq!(
            binary(BinaryOperator::Multiply, &"ab".into(), &int(-1)),
            Ok(Value::Str(String::new()))
        );
        assert_eq!(
            binary(BinaryOperator::Subscript, &"héllo".into(), &int(-4)),
            Ok("é".into())
        );
        assert_eq!(
            binary(BinaryOperator::Subscript, &Value::Bytes(b"AB".to_vec()), &int(1)),
            Ok(int(66))
        );
        assert_eq!(
            binary(
                BinaryOperator::Multiply,
                &Value::Tuple(vec![int(1), "x".into()]),
                &int(2)
            ),
            Ok(Value::Tuple(vec![int(1), "x".into(), int(1), "x".into()]))
        );
        assert_eq!(
            binary(BinaryOperator::Multiply, &int(0), &Value::Tuple(vec![int(1)])),
            Ok(Value::Tuple(Vec::new()))
        );
        assert!(binary(BinaryOperator::Subscript, &"ab".into(), &int(2)).is_err());
        assert!(matches!(
            binary(BinaryOperator::Multiply, &"ab".into(), &int(4000)),
            Err(FoldError::TooLarge { .. })
        ));
        assert!(binary(BinaryOperator::Add, &"a".into(), &int(1)).is_err());
        assert!(binary(BinaryOperator::Modulo, &"%d".into(), &int(1)).is_err());
    }

    #[test]
    fn comparisons() {
        assert_eq!(compare(0, &int(3), &int(5)), Ok(Value::Bool(true)));
        assert_eq!(compare(4, &int(3), &int(5)), Ok(Value::Bool(false)));
        assert_eq!(compare(2, &int(1), &Value::Float(1.0)), Ok(Value::Bool(true)));
        assert_eq!(compare(2, &int(1), &"1".into()), Ok(Value::Bool(false)));
        assert_eq!(
            compare(0, &Value::Float(f64::NAN), &int(1)),
            Ok(Value::Bool(false))
        );
        assert_eq!(
            compare(
                0,
                &Value::Tuple(vec![int(1), int(2)]),
                &Value::Tuple(vec![int(1), int(3)])
            ),
            Ok(Value::Bool(true))
        );
        assert_eq!(compare(6, &"b".into(), &"abc".into()), Ok(Value::Bool(true)));
        assert_eq!(
            compare(7, &int(4), &Value::Tuple(vec![int(1), int(2)])),
            Ok(Value::Bool(true))
        );
        assert!(compare(0, &int(1), &"a".into()).is_err());
    }

    #[test]
    fn identity_comparisons_are_not_folded() {
        assert_eq!(
            compare(8, &Value::None, &Value::None),
            Err(FoldError::AmbiguousComparisonKind(8))
        );
        assert_eq!(
            compare(42, &int(1), &int(1)),
            Err(FoldError::AmbiguousComparisonKind(42))
        );
    }
}
