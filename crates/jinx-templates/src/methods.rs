use crate::error::Error;
use crate::error::ErrorKind;
use crate::object::CallArgs;
use crate::value::Value;

/// A built-in method on a plain value, called with the receiver and arguments.
pub(crate) type Method = fn(&Value, CallArgs) -> Result<Value, Error>;

/// Find the built-in method `name` for the receiver's type.
pub(crate) fn lookup(receiver: &Value, name: &str) -> Option<Method> {
    let method: Method = match (receiver, name) {
        (Value::Str(_), "upper") => |s, _| Ok(Value::from(text(s).to_uppercase())),
        (Value::Str(_), "lower") => |s, _| Ok(Value::from(text(s).to_lowercase())),
        (Value::Str(_), "strip") => |s, args| strip(s, &args, |s, c| s.trim_matches(c), str::trim),
        (Value::Str(_), "lstrip") => {
            |s, args| strip(s, &args, |s, c| s.trim_start_matches(c), str::trim_start)
        }
        (Value::Str(_), "rstrip") => {
            |s, args| strip(s, &args, |s, c| s.trim_end_matches(c), str::trim_end)
        }
        (Value::Str(_), "split") => split,
        (Value::Str(_), "replace") => |s, args| {
            let old = string_arg(&args, 0, "old")?;
            let new = string_arg(&args, 1, "new")?;
            Ok(Value::from(text(s).replace(&old, &new)))
        },
        (Value::Str(_), "startswith") => |s, args| {
            let prefix = string_arg(&args, 0, "prefix")?;
            Ok(Value::Bool(text(s).starts_with(prefix.as_str())))
        },
        (Value::Str(_), "endswith") => |s, args| {
            let suffix = string_arg(&args, 0, "suffix")?;
            Ok(Value::Bool(text(s).ends_with(suffix.as_str())))
        },
        (Value::Str(_), "join") => |s, args| {
            let items = required(&args, 0, "iterable")?.try_iter()?;
            let parts = items
                .iter()
                .map(Value::to_output)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::from(parts.join(text(s))))
        },
        (Value::List(_), "append") => |list, args| {
            let item = required(&args, 0, "object")?.clone();
            if let Value::List(list) = list {
                list.push(item);
            }
            Ok(Value::None)
        },
        (Value::List(_), "extend") => |list, args| {
            let items = required(&args, 0, "iterable")?.try_iter()?;
            if let Value::List(list) = list {
                list.extend(items);
            }
            Ok(Value::None)
        },
        (Value::List(_), "pop") => list_pop,
        (Value::List(_), "index") => |list, args| {
            let needle = required(&args, 0, "value")?;
            let items = list.as_list().unwrap_or_default();
            items
                .iter()
                .position(|item| item == needle)
                .map(Value::from)
                .ok_or_else(|| invalid(format!("{} is not in list", needle.repr())))
        },
        (Value::List(_), "count") => |list, args| {
            let needle = required(&args, 0, "value")?;
            let items = list.as_list().unwrap_or_default();
            Ok(Value::from(items.iter().filter(|item| *item == needle).count()))
        },
        (Value::Map(_), "get") => |map, args| {
            let key = string_arg(&args, 0, "key")?;
            let fallback = args.get(1, "default").cloned().unwrap_or_default();
            Ok(entries(map).get(&key).cloned().unwrap_or(fallback))
        },
        (Value::Map(_), "items") => |map, _| {
            Ok(Value::list(
                entries(map)
                    .into_iter()
                    .map(|(key, value)| Value::list(vec![Value::from(key), value]))
                    .collect(),
            ))
        },
        (Value::Map(_), "keys") => |map, _| {
            Ok(Value::list(entries(map).into_keys().map(Value::from).collect()))
        },
        (Value::Map(_), "values") => |map, _| Ok(Value::list(entries(map).into_values().collect())),
        (Value::Map(_), "update") => map_update,
        (Value::Map(_), "pop") => |map, args| {
            let key = string_arg(&args, 0, "key")?;
            let removed = match map {
                Value::Map(map) => map.remove(&key),
                _ => None,
            };
            match (removed, args.get(1, "default")) {
                (Some(value), _) => Ok(value),
                (None, Some(fallback)) => Ok(fallback.clone()),
                (None, None) => Err(invalid(format!("key '{key}' not found"))),
            }
        },
        (Value::Map(_), "setdefault") => |map, args| {
            let key = string_arg(&args, 0, "key")?;
            let fallback = args.get(1, "default").cloned().unwrap_or_default();
            let Value::Map(map) = map else {
                return Ok(fallback);
            };
            if let Some(existing) = map.get(&key) {
                return Ok(existing);
            }
            map.insert(key, fallback.clone());
            Ok(fallback)
        },
        _ => return None,
    };
    Some(method)
}

fn invalid(message: String) -> Error {
    Error::new(ErrorKind::InvalidOperation, message)
}

fn text(value: &Value) -> &str {
    value.as_str().unwrap_or_default()
}

fn entries(value: &Value) -> indexmap::IndexMap<String, Value> {
    value.as_map().unwrap_or_default()
}

fn required<'a>(args: &'a CallArgs, index: usize, name: &str) -> Result<&'a Value, Error> {
    args.get(index, name)
        .ok_or_else(|| invalid(format!("missing required argument '{name}'")))
}

fn string_arg(args: &CallArgs, index: usize, name: &str) -> Result<String, Error> {
    required(args, index, name)?.to_output()
}

fn strip(
    value: &Value,
    args: &CallArgs,
    with_chars: for<'a> fn(&'a str, &'a [char]) -> &'a str,
    whitespace: fn(&str) -> &str,
) -> Result<Value, Error> {
    let s = text(value);
    match args.get(0, "chars") {
        Some(chars) if !chars.is_none() => {
            let chars: Vec<char> = chars.to_output()?.chars().collect();
            Ok(Value::from(with_chars(s, &chars)))
        }
        _ => Ok(Value::from(whitespace(s))),
    }
}

fn split(value: &Value, args: CallArgs) -> Result<Value, Error> {
    let s = text(value);
    let maxsplit = args
        .get(1, "maxsplit")
        .and_then(Value::as_i64)
        .and_then(|n| usize::try_from(n).ok());
    let parts: Vec<Value> = match args.get(0, "sep").filter(|sep| !sep.is_none()) {
        Some(sep) => {
            let sep = sep.to_output()?;
            if sep.is_empty() {
                return Err(invalid("empty separator".to_string()));
            }
            match maxsplit {
                Some(n) => s.splitn(n + 1, sep.as_str()).map(Value::from).collect(),
                None => s.split(sep.as_str()).map(Value::from).collect(),
            }
        }
        None => {
            let mut parts: Vec<Value> = Vec::new();
            let mut rest = s.trim_start();
            while !rest.is_empty() {
                if maxsplit.is_some_and(|n| parts.len() == n) {
                    parts.push(Value::from(rest.trim_end()));
                    break;
                }
                let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                parts.push(Value::from(&rest[..end]));
                rest = rest[end..].trim_start();
            }
            parts
        }
    };
    Ok(Value::list(parts))
}

fn list_pop(list: &Value, args: CallArgs) -> Result<Value, Error> {
    let Value::List(list) = list else {
        return Ok(Value::None);
    };
    let len = list.len();
    if len == 0 {
        return Err(invalid("pop from empty list".to_string()));
    }
    let index = match args.get(0, "index").and_then(Value::as_i64) {
        Some(index) if index < 0 => usize::try_from(index + i64::try_from(len).unwrap_or(i64::MAX)).ok(),
        Some(index) => usize::try_from(index).ok(),
        None => Some(len - 1),
    };
    index
        .and_then(|index| list.remove(index))
        .ok_or_else(|| invalid("pop index out of range".to_string()))
}

fn map_update(map: &Value, args: CallArgs) -> Result<Value, Error> {
    let Value::Map(target) = map else {
        return Ok(Value::None);
    };
    if let Some(other) = args.positional.first() {
        match other.resolved()? {
            Value::Map(source) => {
                for (key, value) in source.snapshot() {
                    target.insert(key, value);
                }
            }
            other => {
                return Err(invalid(format!(
                    "'{}' object is not a mapping",
                    other.kind_name()
                )));
            }
        }
    }
    for (key, value) in args.keyword {
        target.insert(key, value);
    }
    Ok(Value::None)
}
