use std::sync::Arc;

use crate::error::Error;
use crate::error::ErrorKind;
use crate::value::Value;

/// Produces the value a template sees for a name or attribute that does not exist.
pub trait UndefinedFactory: Send + Sync {
    fn create(&self, name: &str, hint: Option<&str>) -> Value;
}

/// The default: renders as nothing, is falsy and iterates as empty, but any
/// attribute access, call or arithmetic on it fails.
#[derive(Debug, Default)]
pub struct LenientUndefined;

impl UndefinedFactory for LenientUndefined {
    fn create(&self, name: &str, hint: Option<&str>) -> Value {
        Value::Undefined(Arc::new(Undefined::new(name, hint)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Undefined {
    name: String,
    hint: Option<String>,
}

impl Undefined {
    #[must_use]
    pub fn new(name: &str, hint: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            hint: hint.map(ToString::to_string),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    #[must_use]
    pub fn message(&self) -> String {
        self.hint
            .clone()
            .unwrap_or_else(|| format!("'{}' is undefined", self.name))
    }

    #[must_use]
    pub fn error(&self) -> Error {
        Error::new(ErrorKind::UndefinedError, self.message())
    }
}
