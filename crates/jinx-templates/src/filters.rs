use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::Error;
use crate::error::ErrorKind;
use crate::object::CallArgs;
use crate::ops;
use crate::undefined::Undefined;
use crate::value::Value;

fn runtime(message: String) -> Error {
    Error::new(ErrorKind::TemplateRuntime, message)
}

fn bool_arg(args: &CallArgs, index: usize, name: &str) -> Result<bool, Error> {
    args.get(index, name)
        .map(Value::is_true)
        .transpose()
        .map(|flag| flag.unwrap_or(false))
}

fn empty_sequence(filter: &str) -> Value {
    let hint = format!("no {filter} item, sequence was empty");
    Value::Undefined(Arc::new(Undefined::new(filter, Some(&hint))))
}

/// Apply the built-in filter `name` to `value`.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub(crate) fn apply_filter(name: &str, value: Value, args: CallArgs) -> Result<Value, Error> {
    match name {
        "default" | "d" => {
            let fallback = args
                .get(0, "default_value")
                .cloned()
                .unwrap_or_else(|| Value::from(""));
            let boolean = bool_arg(&args, 1, "boolean")?;
            if value.is_undefined() || (boolean && !value.is_true()?) {
                Ok(fallback)
            } else {
                Ok(value)
            }
        }
        "length" | "count" => {
            let value = value.resolved()?;
            match value {
                Value::Object(object) => Ok(Value::from(object.iterate()?.len())),
                other => other.len().map(Value::from).ok_or_else(|| {
                    Error::new(
                        ErrorKind::InvalidOperation,
                        format!("object of type '{}' has no len()", other.kind_name()),
                    )
                }),
            }
        }
        "lower" => Ok(Value::from(value.to_output()?.to_lowercase())),
        "upper" => Ok(Value::from(value.to_output()?.to_uppercase())),
        "trim" => Ok(Value::from(value.to_output()?.trim())),
        "capitalize" => {
            let text = value.to_output()?;
            let mut chars = text.chars();
            let capitalized = chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect()
            });
            Ok(Value::from(capitalized))
        }
        "title" => {
            let text = value.to_output()?;
            let mut out = String::with_capacity(text.len());
            let mut at_word_start = true;
            for c in text.chars() {
                if c.is_alphanumeric() {
                    if at_word_start {
                        out.extend(c.to_uppercase());
                    } else {
                        out.extend(c.to_lowercase());
                    }
                    at_word_start = false;
                } else {
                    out.push(c);
                    at_word_start = true;
                }
            }
            Ok(Value::from(out))
        }
        "replace" => {
            let text = value.to_output()?;
            let old = args.get(0, "old").map(Value::to_output).transpose()?.unwrap_or_default();
            let new = args.get(1, "new").map(Value::to_output).transpose()?.unwrap_or_default();
            Ok(Value::from(text.replace(&old, &new)))
        }
        "join" => {
            let separator = args.get(0, "d").map(Value::to_output).transpose()?.unwrap_or_default();
            let parts = value
                .try_iter()?
                .iter()
                .map(Value::to_output)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::from(parts.join(&separator)))
        }
        "string" => Ok(Value::from(value.to_output()?)),
        "int" => {
            let fallback = args.get(0, "default").cloned().unwrap_or(Value::Int(0));
            Ok(match value.resolved()? {
                Value::Int(i) => Value::Int(i),
                Value::Bool(b) => Value::Int(i64::from(b)),
                Value::Float(f) if f.is_finite() => Value::Int(f.trunc() as i64),
                Value::Str(s) => {
                    let s = s.trim();
                    s.parse::<i64>()
                        .ok()
                        .or_else(|| {
                            s.parse::<f64>()
                                .ok()
                                .filter(|f| f.is_finite())
                                .map(|f| f.trunc() as i64)
                        })
                        .map_or(fallback, Value::Int)
                }
                _ => fallback,
            })
        }
        "float" => {
            let fallback = args.get(0, "default").cloned().unwrap_or(Value::Float(0.0));
            Ok(match value.resolved()? {
                Value::Int(i) => Value::Float(i as f64),
                Value::Bool(b) => Value::Float(f64::from(u8::from(b))),
                Value::Float(f) => Value::Float(f),
                Value::Str(s) => s.trim().parse::<f64>().map_or(fallback, Value::Float),
                _ => fallback,
            })
        }
        "list" => Ok(Value::list(value.try_iter()?)),
        "first" => Ok(value
            .try_iter()?
            .into_iter()
            .next()
            .unwrap_or_else(|| empty_sequence("first"))),
        "last" => Ok(value
            .try_iter()?
            .pop()
            .unwrap_or_else(|| empty_sequence("last"))),
        "tojson" => serde_json::to_string(&value)
            .map(Value::from)
            .map_err(|err| Error::new(ErrorKind::InvalidOperation, err.to_string())),
        "abs" => match value.resolved()? {
            Value::Int(i) => i
                .checked_abs()
                .map(Value::Int)
                .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "integer overflow")),
            Value::Float(f) => Ok(Value::Float(f.abs())),
            other => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("bad operand type for abs(): '{}'", other.kind_name()),
            )),
        },
        "round" => {
            let precision = args.get(0, "precision").and_then(Value::as_i64).unwrap_or(0);
            let method = args
                .get(1, "method")
                .map(Value::to_output)
                .transpose()?
                .unwrap_or_else(|| "common".to_string());
            let number = value.resolved()?.as_f64().ok_or_else(|| {
                Error::new(ErrorKind::InvalidOperation, "round() requires a number")
            })?;
            let factor = 10f64.powi(i32::try_from(precision).unwrap_or(0));
            let scaled = number * factor;
            let rounded = match method.as_str() {
                "common" => scaled.round(),
                "ceil" => scaled.ceil(),
                "floor" => scaled.floor(),
                other => return Err(runtime(format!("method must be common, ceil or floor, got '{other}'"))),
            };
            Ok(Value::Float(rounded / factor))
        }
        "unique" => {
            let mut seen: Vec<Value> = Vec::new();
            for item in value.try_iter()? {
                if !seen.contains(&item) {
                    seen.push(item);
                }
            }
            Ok(Value::list(seen))
        }
        "sort" => {
            let reverse = bool_arg(&args, 0, "reverse")?;
            let mut items = value.try_iter()?;
            let mut failed = false;
            items.sort_by(|a, b| {
                ops::compare(a, b).unwrap_or_else(|| {
                    failed = true;
                    Ordering::Equal
                })
            });
            if failed {
                return Err(Error::new(
                    ErrorKind::InvalidOperation,
                    "sort requires values of comparable types",
                ));
            }
            if reverse {
                items.reverse();
            }
            Ok(Value::list(items))
        }
        "items" => match value.resolved()? {
            Value::Map(map) => Ok(Value::list(
                map.snapshot()
                    .into_iter()
                    .map(|(key, value)| Value::list(vec![Value::from(key), value]))
                    .collect(),
            )),
            Value::Undefined(_) => Ok(Value::list(Vec::new())),
            other => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("can only get item pairs from a mapping, not '{}'", other.kind_name()),
            )),
        },
        _ => Err(runtime(format!("no filter named '{name}'"))),
    }
}

/// Evaluate the built-in test `name` (`value is name(args)`).
pub(crate) fn perform_test(name: &str, value: &Value, args: &[Value]) -> Result<bool, Error> {
    let arg = || {
        args.first()
            .ok_or_else(|| runtime(format!("test '{name}' requires an argument")))
    };
    Ok(match name {
        "defined" => !value.is_undefined(),
        "undefined" => value.is_undefined(),
        "none" => value.is_none(),
        "string" => matches!(value, Value::Str(_)),
        "number" => matches!(value, Value::Int(_) | Value::Float(_)),
        "mapping" => matches!(value, Value::Map(_)),
        "sequence" => matches!(value, Value::Str(_) | Value::List(_) | Value::Map(_)),
        "iterable" => matches!(value, Value::Str(_) | Value::List(_) | Value::Map(_)),
        "callable" => value.is_callable(),
        "true" => matches!(value, Value::Bool(true)),
        "false" => matches!(value, Value::Bool(false)),
        "eq" | "equalto" | "==" => value.resolved()? == arg()?.resolved()?,
        "ne" | "!=" => value.resolved()? != arg()?.resolved()?,
        "sameas" => match (value, arg()?) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (a, b) => matches!((a, b), (Value::List(x), Value::List(y)) if x.ptr_eq(y))
                || matches!((a, b), (Value::Map(x), Value::Map(y)) if x.ptr_eq(y)),
        },
        "in" => ops::contains(arg()?, value)?,
        "divisibleby" => {
            let divisor = arg()?.as_i64().unwrap_or(0);
            divisor != 0 && value.as_i64().is_some_and(|n| n % divisor == 0)
        }
        "odd" => value.as_i64().is_some_and(|n| n % 2 != 0),
        "even" => value.as_i64().is_some_and(|n| n % 2 == 0),
        _ => return Err(runtime(format!("no test named '{name}'"))),
    })
}
