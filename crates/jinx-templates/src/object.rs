use std::fmt;

use indexmap::IndexMap;

use crate::error::Error;
use crate::error::ErrorKind;
use crate::value::Value;

/// Arguments of a call: positionals in order plus keyword arguments.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub keyword: IndexMap<String, Value>,
}

impl CallArgs {
    #[must_use]
    pub fn new(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keyword: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    /// Look an argument up by position, falling back to its keyword name.
    #[must_use]
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional
            .get(index)
            .or_else(|| self.keyword.get(name))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.positional.len() + self.keyword.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A host value exposed to templates.
///
/// Every hook that turns the object into something concrete (text, a truth
/// value, a sequence, a plain value for operators and serialization) is
/// fallible, so an object can refuse to be used that way.
pub trait Object: fmt::Debug + Send + Sync {
    fn type_name(&self) -> &str {
        "object"
    }

    fn get_attr(&self, _name: &str) -> Option<Value> {
        None
    }

    fn get_item(&self, _key: &Value) -> Option<Value> {
        None
    }

    fn call(&self, _args: CallArgs) -> Result<Value, Error> {
        Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("'{}' object is not callable", self.type_name()),
        ))
    }

    fn render(&self) -> Result<String, Error> {
        Ok(format!("<{} object>", self.type_name()))
    }

    fn is_true(&self) -> Result<bool, Error> {
        Ok(true)
    }

    fn iterate(&self) -> Result<Vec<Value>, Error> {
        Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("'{}' object is not iterable", self.type_name()),
        ))
    }

    /// The plain value operators and serialization should see, if any.
    fn resolve(&self) -> Result<Option<Value>, Error> {
        Ok(None)
    }

    /// Whether `is defined` should report this object as undefined.
    fn is_undefined(&self) -> bool {
        false
    }
}
