use std::fmt;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use indexmap::IndexMap;
use serde::ser::Error as _;
use serde::ser::SerializeMap;
use serde::ser::SerializeSeq;
use serde::Serialize;
use serde::Serializer;

use crate::error::Error;
use crate::error::ErrorKind;
use crate::macros::Macro;
use crate::object::CallArgs;
use crate::object::Object;
use crate::undefined::Undefined;

/// Variables handed to a render, by name.
pub type Context = IndexMap<String, Value>;

type FunctionImpl = dyn Fn(CallArgs) -> Result<Value, Error> + Send + Sync;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    None,
    Undefined(Arc<Undefined>),
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(ListRef),
    Map(MapRef),
    Macro(Arc<Macro>),
    Function(Function),
    Object(Arc<dyn Object>),
}

/// A shared, mutable list. Clones alias the same storage.
#[derive(Clone, Default)]
pub struct ListRef(Arc<RwLock<Vec<Value>>>);

impl ListRef {
    #[must_use]
    pub fn new(items: Vec<Value>) -> Self {
        Self(Arc::new(RwLock::new(items)))
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Value>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Value>> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Value> {
        self.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<Value> {
        self.read().get(index).cloned()
    }

    pub fn push(&self, value: Value) {
        self.write().push(value);
    }

    pub fn extend(&self, values: Vec<Value>) {
        self.write().extend(values);
    }

    pub fn insert(&self, index: usize, value: Value) {
        let mut items = self.write();
        let index = index.min(items.len());
        items.insert(index, value);
    }

    pub fn remove(&self, index: usize) -> Option<Value> {
        let mut items = self.write();
        (index < items.len()).then(|| items.remove(index))
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &ListRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A shared, mutable, insertion-ordered map with string keys.
#[derive(Clone, Default)]
pub struct MapRef(Arc<RwLock<IndexMap<String, Value>>>);

impl MapRef {
    #[must_use]
    pub fn new(entries: IndexMap<String, Value>) -> Self {
        Self(Arc::new(RwLock::new(entries)))
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexMap<String, Value>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexMap<String, Value>> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn snapshot(&self) -> IndexMap<String, Value> {
        self.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn insert(&self, key: String, value: Value) -> Option<Value> {
        self.write().insert(key, value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.write().shift_remove(key)
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &MapRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A named host function callable from templates.
#[derive(Clone)]
pub struct Function {
    name: Arc<str>,
    func: Arc<FunctionImpl>,
}

impl Function {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: CallArgs) -> Result<Value, Error> {
        (self.func)(args)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Function").field(&self.name).finish()
    }
}

impl Value {
    pub fn from_object<T: Object + 'static>(object: T) -> Value {
        Value::Object(Arc::new(object))
    }

    pub fn from_function<F>(name: &str, func: F) -> Value
    where
        F: Fn(CallArgs) -> Result<Value, Error> + Send + Sync + 'static,
    {
        Value::Function(Function {
            name: Arc::from(name),
            func: Arc::new(func),
        })
    }

    #[must_use]
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(ListRef::new(items))
    }

    #[must_use]
    pub fn map(entries: IndexMap<String, Value>) -> Value {
        Value::Map(MapRef::new(entries))
    }

    /// Jinja-style type name used in error messages.
    #[must_use]
    pub fn kind_name(&self) -> &str {
        match self {
            Value::None => "NoneType",
            Value::Undefined(_) => "Undefined",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "dict",
            Value::Macro(_) => "macro",
            Value::Function(_) => "function",
            Value::Object(object) => object.type_name(),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<Vec<Value>> {
        match self {
            Value::List(list) => Some(list.snapshot()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<IndexMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map.snapshot()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_object(&self) -> Option<&Arc<dyn Object>> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    #[must_use]
    pub fn is_undefined(&self) -> bool {
        match self {
            Value::Undefined(_) => true,
            Value::Object(object) => object.is_undefined(),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Macro(_) | Value::Function(_) | Value::Object(_))
    }

    #[must_use]
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::Str(s) => Some(s.chars().count()),
            Value::List(list) => Some(list.len()),
            Value::Map(map) => Some(map.len()),
            Value::Undefined(_) => Some(0),
            _ => None,
        }
    }

    /// Finalize the value as output text.
    pub fn to_output(&self) -> Result<String, Error> {
        let mut out = String::new();
        self.write_into(&mut out, false, true)?;
        Ok(out)
    }

    pub fn is_true(&self) -> Result<bool, Error> {
        Ok(match self {
            Value::None | Value::Undefined(_) => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(list) => !list.is_empty(),
            Value::Map(map) => !map.is_empty(),
            Value::Macro(_) | Value::Function(_) => true,
            Value::Object(object) => object.is_true()?,
        })
    }

    /// The items a `for` loop would visit.
    pub fn try_iter(&self) -> Result<Vec<Value>, Error> {
        match self {
            Value::List(list) => Ok(list.snapshot()),
            Value::Map(map) => Ok(map.keys().into_iter().map(Value::from).collect()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::from(c.to_string())).collect()),
            Value::Undefined(_) => Ok(Vec::new()),
            Value::Object(object) => object.iterate(),
            other => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("'{}' object is not iterable", other.kind_name()),
            )),
        }
    }

    /// Replace a host object by the plain value it stands for.
    pub fn resolved(&self) -> Result<Value, Error> {
        match self {
            Value::Object(object) => Ok(object.resolve()?.unwrap_or_else(|| self.clone())),
            _ => Ok(self.clone()),
        }
    }

    pub fn call(&self, args: CallArgs) -> Result<Value, Error> {
        match self {
            Value::Macro(m) => m.call(args),
            Value::Function(function) => function.call(args),
            Value::Object(object) => object.call(args),
            Value::Undefined(undefined) => Err(undefined.error()),
            other => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("'{}' object is not callable", other.kind_name()),
            )),
        }
    }

    /// Jinja-style `repr`.
    #[must_use]
    pub fn repr(&self) -> String {
        let mut out = String::new();
        // the lenient path never fails
        let _ = self.write_into(&mut out, true, false);
        out
    }

    fn write_into(&self, out: &mut String, repr: bool, strict: bool) -> Result<(), Error> {
        match self {
            Value::None => out.push_str("None"),
            Value::Undefined(_) => {
                if repr {
                    out.push_str("Undefined");
                }
            }
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(i) => out.push_str(&i.to_string()),
            Value::Float(f) => out.push_str(&format_float(*f)),
            Value::Str(s) if repr => out.push_str(&quote(s)),
            Value::Str(s) => out.push_str(s),
            Value::List(list) => {
                out.push('[');
                for (index, item) in list.snapshot().iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    item.write_into(out, true, strict)?;
                }
                out.push(']');
            }
            Value::Map(map) => {
                out.push('{');
                for (index, (key, item)) in map.snapshot().iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&quote(key));
                    out.push_str(": ");
                    item.write_into(out, true, strict)?;
                }
                out.push('}');
            }
            Value::Macro(m) => out.push_str(&format!("<macro {}>", m.name())),
            Value::Function(function) => out.push_str(&format!("<function {}>", function.name())),
            Value::Object(object) => match object.render() {
                Ok(text) => out.push_str(&text),
                Err(err) if strict => return Err(err),
                Err(_) => out.push_str(&format!("<{} object>", object.type_name())),
            },
        }
        Ok(())
    }
}

fn quote(s: &str) -> String {
    let delimiter = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(delimiter);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c == delimiter => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(delimiter);
    out
}

pub(crate) fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        // the lenient path never fails
        let _ = self.write_into(&mut out, false, false);
        f.write_str(&out)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined(undefined) => write!(f, "Undefined({:?})", undefined.name()),
            Value::Object(object) => fmt::Debug::fmt(object, f),
            Value::Function(function) => fmt::Debug::fmt(function, f),
            other => f.write_str(&other.repr()),
        }
    }
}

impl PartialEq for Value {
    #[allow(clippy::cast_precision_loss, clippy::float_cmp)]
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) | (Value::Undefined(_), Value::Undefined(_)) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a.ptr_eq(b) || a.snapshot() == b.snapshot(),
            (Value::Map(a), Value::Map(b)) => {
                if a.ptr_eq(b) {
                    return true;
                }
                let (a, b) = (a.snapshot(), b.snapshot());
                a.len() == b.len() && a.iter().all(|(key, value)| b.get(key) == Some(value))
            }
            (Value::Macro(a), Value::Macro(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(&a.func, &b.func),
            (Value::Object(a), Value::Object(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            _ => false,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::None => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::List(list) => {
                let items = list.snapshot();
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in &items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(map) => {
                let entries = map.snapshot();
                let mut out = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in &entries {
                    out.serialize_entry(key, value)?;
                }
                out.end()
            }
            Value::Undefined(undefined) => Err(S::Error::custom(undefined.message())),
            Value::Macro(m) => Err(S::Error::custom(format!("cannot serialize macro '{}'", m.name()))),
            Value::Function(function) => Err(S::Error::custom(format!(
                "cannot serialize function '{}'",
                function.name()
            ))),
            Value::Object(object) => match object.resolve() {
                Ok(Some(value)) => value.serialize(serializer),
                Ok(None) => match object.render() {
                    Ok(text) => serializer.serialize_str(&text),
                    Err(err) => Err(S::Error::custom(err.detail())),
                },
                Err(err) => Err(S::Error::custom(err.detail())),
            },
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(Arc::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(Arc::from(value))
    }
}

impl From<Arc<str>> for Value {
    fn from(value: Arc<str>) -> Self {
        Value::Str(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Value::list(values.into_iter().map(Into::into).collect())
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(entries: IndexMap<String, Value>) -> Self {
        Value::map(entries)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::None, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Value::Int)
                .or_else(|| n.as_f64().map(Value::Float))
                .unwrap_or(Value::None),
            serde_json::Value::String(s) => Value::from(s),
            serde_json::Value::Array(items) => {
                Value::list(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => Value::map(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}
