use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use jinx_templates::CallArgs;
use jinx_templates::Object;
use jinx_templates::UndefinedFactory;
use jinx_templates::Value;

use crate::error::CompilationError;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::node::Node;

#[derive(Debug, Clone)]
enum Deferred {
    Unresolved { name: String, hint: Option<String> },
    Finalized(CompilationError),
}

/// Stands in for a name that does not exist while macros are being captured.
///
/// Attribute access, indexing and calls all yield another unresolved
/// reference, so the value can be passed around freely. Anything that needs a
/// concrete value (output, truth tests, iteration, serialization, operators)
/// fails with an undefined-reference error attributed to the owning node.
pub struct DeferredReference {
    state: Mutex<Deferred>,
    owner: Option<Arc<dyn Node>>,
}

impl DeferredReference {
    #[must_use]
    pub fn new(name: &str, hint: Option<&str>, owner: Option<Arc<dyn Node>>) -> Self {
        Self {
            state: Mutex::new(Deferred::Unresolved {
                name: name.to_string(),
                hint: hint.map(ToString::to_string),
            }),
            owner,
        }
    }

    /// The last name accessed through this reference.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        match &*self.lock() {
            Deferred::Unresolved { name, .. } => Some(name.clone()),
            Deferred::Finalized(_) => None,
        }
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        matches!(&*self.lock(), Deferred::Finalized(_))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Deferred> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A new unresolved reference for `name`, keeping hint and owner.
    fn derive(&self, name: Option<&str>) -> Value {
        let (current, hint) = match &*self.lock() {
            Deferred::Unresolved { name, hint } => (name.clone(), hint.clone()),
            Deferred::Finalized(err) => return Value::from_object(Finalized(err.clone())),
        };
        Value::from_object(DeferredReference::new(
            name.unwrap_or(&current),
            hint.as_deref(),
            self.owner.clone(),
        ))
    }

    fn finalize(&self) -> jinx_templates::Error {
        let mut state = self.lock();
        let err = match &*state {
            Deferred::Finalized(err) => err.clone(),
            Deferred::Unresolved { name, .. } => {
                CompilationError::new(ErrorKind::UndefinedReference, format!("{name} is undefined"))
                    .with_node(self.owner.as_deref())
            }
        };
        *state = Deferred::Finalized(err.clone());
        Error::Compilation(err).into()
    }
}

impl fmt::Debug for DeferredReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredReference")
            .field("state", &*self.lock())
            .field("owner", &self.owner.as_ref().map(|owner| owner.unique_id().to_string()))
            .finish()
    }
}

impl Object for DeferredReference {
    fn type_name(&self) -> &str {
        "undefined"
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        // `name` reads the reference itself rather than an attribute of it
        if name == "name" {
            return Some(self.derive(None));
        }
        Some(self.derive(Some(name)))
    }

    fn get_item(&self, _key: &Value) -> Option<Value> {
        Some(self.derive(None))
    }

    fn call(&self, _args: CallArgs) -> Result<Value, jinx_templates::Error> {
        Ok(self.derive(None))
    }

    fn render(&self) -> Result<String, jinx_templates::Error> {
        Err(self.finalize())
    }

    fn is_true(&self) -> Result<bool, jinx_templates::Error> {
        Err(self.finalize())
    }

    fn iterate(&self) -> Result<Vec<Value>, jinx_templates::Error> {
        Err(self.finalize())
    }

    fn resolve(&self) -> Result<Option<Value>, jinx_templates::Error> {
        Err(self.finalize())
    }

    fn is_undefined(&self) -> bool {
        true
    }
}

/// A reference derived from one that already failed; it keeps failing the same way.
#[derive(Debug)]
struct Finalized(CompilationError);

impl Finalized {
    fn fail(&self) -> jinx_templates::Error {
        Error::Compilation(self.0.clone()).into()
    }
}

impl Object for Finalized {
    fn type_name(&self) -> &str {
        "undefined"
    }

    fn call(&self, _args: CallArgs) -> Result<Value, jinx_templates::Error> {
        Err(self.fail())
    }

    fn render(&self) -> Result<String, jinx_templates::Error> {
        Err(self.fail())
    }

    fn is_true(&self) -> Result<bool, jinx_templates::Error> {
        Err(self.fail())
    }

    fn iterate(&self) -> Result<Vec<Value>, jinx_templates::Error> {
        Err(self.fail())
    }

    fn resolve(&self) -> Result<Option<Value>, jinx_templates::Error> {
        Err(self.fail())
    }

    fn is_undefined(&self) -> bool {
        true
    }
}

/// Undefined factory that produces [`DeferredReference`]s owned by `node`.
#[derive(Clone, Default)]
pub struct CaptureUndefined {
    node: Option<Arc<dyn Node>>,
}

impl CaptureUndefined {
    #[must_use]
    pub fn new(node: Option<Arc<dyn Node>>) -> Self {
        Self { node }
    }
}

impl UndefinedFactory for CaptureUndefined {
    fn create(&self, name: &str, hint: Option<&str>) -> Value {
        Value::from_object(DeferredReference::new(name, hint, self.node.clone()))
    }
}
