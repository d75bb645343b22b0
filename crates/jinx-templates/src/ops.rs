use std::cmp::Ordering;

use crate::ast::BinOp;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::value::Value;

fn unsupported(op: &str, left: &Value, right: &Value) -> Error {
    Error::new(
        ErrorKind::InvalidOperation,
        format!(
            "unsupported operand type(s) for {op}: '{}' and '{}'",
            left.kind_name(),
            right.kind_name()
        ),
    )
}

fn overflow() -> Error {
    Error::new(ErrorKind::InvalidOperation, "integer overflow")
}

/// Upper bound on the length of a repeated string or list.
const MAX_REPEAT_LEN: usize = 1 << 24;

fn repeated_len(len: usize, count: usize) -> Result<usize, Error> {
    len.checked_mul(count)
        .filter(|total| *total <= MAX_REPEAT_LEN)
        .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "repeated sequence is too large"))
}

fn division_by_zero() -> Error {
    Error::new(ErrorKind::InvalidOperation, "division by zero")
}

/// Host objects stand in for their plain value; undefined operands fail.
fn operand(value: &Value) -> Result<Value, Error> {
    match value.resolved()? {
        Value::Undefined(undefined) => Err(undefined.error()),
        other => Ok(other),
    }
}

fn numbers(left: &Value, right: &Value) -> Option<(f64, f64)> {
    match (left, right) {
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            Some((left.as_f64()?, right.as_f64()?))
        }
        _ => None,
    }
}

/// Evaluate every binary operator except the short-circuiting `and`/`or`.
pub(crate) fn binary(op: BinOp, left: &Value, right: &Value) -> Result<Value, Error> {
    match op {
        BinOp::Concat => Ok(Value::from(left.to_output()? + &right.to_output()?)),
        BinOp::Eq => Ok(Value::Bool(operand_eq(left, right)?)),
        BinOp::Ne => Ok(Value::Bool(!operand_eq(left, right)?)),
        BinOp::In => Ok(Value::Bool(contains(right, left)?)),
        BinOp::NotIn => Ok(Value::Bool(!contains(right, left)?)),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let (left, right) = (operand(left)?, operand(right)?);
            let ordering = compare(&left, &right).ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidOperation,
                    format!(
                        "comparison not supported between instances of '{}' and '{}'",
                        left.kind_name(),
                        right.kind_name()
                    ),
                )
            })?;
            let result = match op {
                BinOp::Lt => ordering == Ordering::Less,
                BinOp::Le => ordering != Ordering::Greater,
                BinOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        _ => arithmetic(op, &operand(left)?, &operand(right)?),
    }
}

fn operand_eq(left: &Value, right: &Value) -> Result<bool, Error> {
    Ok(left.resolved()? == right.resolved()?)
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn arithmetic(op: BinOp, left: &Value, right: &Value) -> Result<Value, Error> {
    let symbol = match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::FloorDiv => "//",
        BinOp::Mod => "%",
        _ => "**",
    };

    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => return Ok(Value::from(format!("{a}{b}"))),
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.snapshot();
            items.extend(b.snapshot());
            return Ok(Value::list(items));
        }
        (BinOp::Mul, Value::Str(s), Value::Int(n)) | (BinOp::Mul, Value::Int(n), Value::Str(s)) => {
            let count = usize::try_from(*n).unwrap_or(0);
            repeated_len(s.len(), count)?;
            return Ok(Value::from(s.repeat(count)));
        }
        (BinOp::Mul, Value::List(list), Value::Int(n)) | (BinOp::Mul, Value::Int(n), Value::List(list)) => {
            let count = usize::try_from(*n).unwrap_or(0);
            let items = list.snapshot();
            let mut out = Vec::with_capacity(repeated_len(items.len(), count)?);
            for _ in 0..count {
                out.extend(items.iter().cloned());
            }
            return Ok(Value::list(out));
        }
        _ => {}
    }

    if let (Some(a), Some(b)) = (int_operand(left), int_operand(right)) {
        return match op {
            BinOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
            BinOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
            BinOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
            BinOp::Div => {
                if b == 0 {
                    Err(division_by_zero())
                } else {
                    Ok(Value::Float(a as f64 / b as f64))
                }
            }
            BinOp::FloorDiv => floor_div(a, b).map(Value::Int),
            BinOp::Mod => floor_mod(a, b).map(Value::Int),
            _ => match u32::try_from(b) {
                Ok(exp) => a.checked_pow(exp).map(Value::Int).ok_or_else(overflow),
                Err(_) => Ok(Value::Float((a as f64).powf(b as f64))),
            },
        };
    }

    let Some((a, b)) = numbers(left, right) else {
        return Err(unsupported(symbol, left, right));
    };
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div | BinOp::FloorDiv | BinOp::Mod if b == 0.0 => return Err(division_by_zero()),
        BinOp::Div => a / b,
        BinOp::FloorDiv => (a / b).floor(),
        BinOp::Mod => a - b * (a / b).floor(),
        _ => a.powf(b),
    };
    Ok(Value::Float(result))
}

fn int_operand(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn floor_div(a: i64, b: i64) -> Result<i64, Error> {
    if b == 0 {
        return Err(division_by_zero());
    }
    let quotient = a.checked_div(b).ok_or_else(overflow)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Ok(quotient - 1)
    } else {
        Ok(quotient)
    }
}

fn floor_mod(a: i64, b: i64) -> Result<i64, Error> {
    if b == 0 {
        return Err(division_by_zero());
    }
    let remainder = a.checked_rem(b).ok_or_else(overflow)?;
    if remainder != 0 && ((remainder < 0) != (b < 0)) {
        Ok(remainder + b)
    } else {
        Ok(remainder)
    }
}

pub(crate) fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::List(a), Value::List(b)) => {
            let (a, b) = (a.snapshot(), b.snapshot());
            for (x, y) in a.iter().zip(&b) {
                match compare(x, y)? {
                    Ordering::Equal => {}
                    ordering => return Some(ordering),
                }
            }
            Some(a.len().cmp(&b.len()))
        }
        _ => numbers(left, right).and_then(|(a, b)| a.partial_cmp(&b)),
    }
}

/// Membership test `item in container`.
pub(crate) fn contains(container: &Value, item: &Value) -> Result<bool, Error> {
    let item = item.resolved()?;
    match container.resolved()? {
        Value::Str(haystack) => match &item {
            Value::Str(needle) => Ok(haystack.contains(&**needle)),
            other => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.kind_name()
                ),
            )),
        },
        Value::Map(map) => Ok(item.as_str().is_some_and(|key| map.contains_key(key))),
        Value::Undefined(_) => Ok(false),
        other => Ok(other.try_iter()?.contains(&item)),
    }
}

pub(crate) fn negate(value: &Value) -> Result<Value, Error> {
    match operand(value)? {
        Value::Int(i) => i.checked_neg().map(Value::Int).ok_or_else(overflow),
        Value::Bool(b) => Ok(Value::Int(-i64::from(b))),
        Value::Float(f) => Ok(Value::Float(-f)),
        other => Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("bad operand type for unary -: '{}'", other.kind_name()),
        )),
    }
}

pub(crate) fn positive(value: &Value) -> Result<Value, Error> {
    match operand(value)? {
        Value::Bool(b) => Ok(Value::Int(i64::from(b))),
        number @ (Value::Int(_) | Value::Float(_)) => Ok(number),
        other => Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("bad operand type for unary +: '{}'", other.kind_name()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::undefined::Undefined;

    fn int(i: i64) -> Value {
        Value::Int(i)
    }

    #[test]
    fn test_floor_division_rounds_down() {
        assert_eq!(binary(BinOp::FloorDiv, &int(-7), &int(2)).unwrap(), int(-4));
        assert_eq!(binary(BinOp::FloorDiv, &int(7), &int(-2)).unwrap(), int(-4));
        assert_eq!(binary(BinOp::Mod, &int(-7), &int(3)).unwrap(), int(2));
        assert_eq!(binary(BinOp::Mod, &int(7), &int(-3)).unwrap(), int(-2));
    }

    #[test]
    fn test_true_division_is_float() {
        assert_eq!(binary(BinOp::Div, &int(3), &int(2)).unwrap(), Value::Float(1.5));
        assert!(binary(BinOp::Div, &int(1), &int(0)).is_err());
    }

    #[test]
    fn test_string_and_list_arithmetic() {
        assert_eq!(
            binary(BinOp::Add, &Value::from("a"), &Value::from("b")).unwrap(),
            Value::from("ab")
        );
        assert_eq!(
            binary(BinOp::Mul, &Value::from("ab"), &int(2)).unwrap(),
            Value::from("abab")
        );
        assert_eq!(
            binary(BinOp::Add, &Value::from(vec![1]), &Value::from(vec![2])).unwrap(),
            Value::from(vec![1, 2])
        );
    }

    #[test]
    fn test_oversized_repeat_fails() {
        let err = binary(BinOp::Mul, &Value::from("ab"), &int(i64::MAX)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        let err = binary(BinOp::Mul, &int(i64::MAX), &Value::from(vec![1, 2])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        assert_eq!(
            binary(BinOp::Mul, &Value::from(vec![1]), &int(-3)).unwrap(),
            Value::list(vec![])
        );
    }

    #[test]
    fn test_mixed_types_fail() {
        let err = binary(BinOp::Add, &int(1), &Value::from("a")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        assert_eq!(
            err.detail(),
            "unsupported operand type(s) for +: 'int' and 'str'"
        );
    }

    #[test]
    fn test_undefined_operand_fails() {
        let undefined = Value::Undefined(Arc::new(Undefined::new("x", None)));
        let err = binary(BinOp::Add, &undefined, &int(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UndefinedError);
        assert_eq!(err.detail(), "'x' is undefined");
    }

    #[test]
    fn test_concat_renders_both_sides() {
        assert_eq!(
            binary(BinOp::Concat, &int(1), &Value::None).unwrap(),
            Value::from("1None")
        );
    }

    #[test]
    fn test_membership() {
        assert!(contains(&Value::from("abc"), &Value::from("b")).unwrap());
        assert!(contains(&Value::from(vec![1, 2]), &Value::Float(2.0)).unwrap());
        assert!(!contains(&Value::from(vec![1, 2]), &int(3)).unwrap());
        assert!(contains(&Value::from("abc"), &int(1)).is_err());
    }

    #[test]
    fn test_comparison() {
        assert_eq!(binary(BinOp::Lt, &int(1), &Value::Float(1.5)).unwrap(), Value::Bool(true));
        assert!(binary(BinOp::Lt, &int(1), &Value::from("a")).is_err());
    }
}
