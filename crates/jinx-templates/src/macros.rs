use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;

use crate::ast::MacroDef;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::eval;
use crate::eval::Frame;
use crate::eval::ModuleScope;
use crate::object::CallArgs;
use crate::value::Value;

pub(crate) const MAX_RECURSION: usize = 64;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct DepthGuard;

impl DepthGuard {
    fn enter(name: &str) -> Result<Self, Error> {
        DEPTH.with(|depth| {
            if depth.get() >= MAX_RECURSION {
                return Err(Error::new(
                    ErrorKind::TemplateRuntime,
                    format!("maximum recursion depth exceeded while calling macro '{name}'"),
                ));
            }
            depth.set(depth.get() + 1);
            Ok(DepthGuard)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// A macro bound to the template module that defined it.
///
/// The module is held weakly: macros live inside their module's namespace, so a
/// strong reference would keep every module alive forever.
pub struct Macro {
    def: Arc<MacroDef>,
    scope: Weak<ModuleScope>,
    closure: Vec<Frame>,
}

impl Macro {
    pub(crate) fn new(def: Arc<MacroDef>, scope: Weak<ModuleScope>, closure: Vec<Frame>) -> Self {
        Self {
            def,
            scope,
            closure,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.def.name
    }

    #[must_use]
    pub fn params(&self) -> Vec<&str> {
        self.def.params.iter().map(|param| param.name.as_str()).collect()
    }

    /// Run the macro body with `args` bound to its parameters; the result is the rendered text.
    pub fn call(&self, args: CallArgs) -> Result<Value, Error> {
        let scope = self.scope.upgrade().ok_or_else(|| {
            Error::new(
                ErrorKind::TemplateRuntime,
                format!(
                    "macro '{}' was called after its template module was dropped",
                    self.def.name
                ),
            )
        })?;
        let _depth = DepthGuard::enter(&self.def.name)?;
        eval::call_macro(&scope, &self.def, &self.closure, args)
    }
}

impl fmt::Debug for Macro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Macro").field("name", &self.def.name).finish()
    }
}
