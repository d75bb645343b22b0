//! Calling macros defined in macro files.
//!
//! A [`MacroGenerator`] stands for one macro node. Each call resolves the
//! node's compiled module through the template cache, records the call on the
//! worker's [`MacroStack`], runs the macro and translates whatever it raised
//! into the compiler-error domain.

use std::fmt;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::Weak;

use jinx_templates::CallArgs;
use jinx_templates::Context;
use jinx_templates::Module;
use jinx_templates::Object;
use jinx_templates::Template;
use jinx_templates::Value;

use crate::cache::template_cache;
use crate::cache::TemplateCache;
use crate::error::macro_return;
use crate::error::translate;
use crate::error::CompilationError;
use crate::error::Error;
use crate::error::InternalError;
use crate::error::MacroReturn;
use crate::mangle::mangle_macro;
use crate::node::MacroNode;
use crate::node::Node;
use crate::render::get_template;
use crate::stack::MacroStack;

const QUERY_COMMENT_MACRO: &str = "query_comment_macro";

/// The variables macros see, shared by every generator of a compilation.
///
/// Generators only hold it weakly, so a context that contains its own
/// generators is not a reference cycle.
#[derive(Debug, Clone, Default)]
pub struct SharedContext(Arc<RwLock<Context>>);

impl SharedContext {
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self(Arc::new(RwLock::new(ctx)))
    }

    pub fn insert(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value.into());
    }

    #[must_use]
    pub fn snapshot(&self) -> Context {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn downgrade(&self) -> Weak<RwLock<Context>> {
        Arc::downgrade(&self.0)
    }
}

/// How a macro call finished.
#[derive(Debug, Clone, PartialEq)]
pub enum MacroOutcome {
    /// The body ran to the end; the value is its rendered text.
    Returned(Value),
    /// The body called `return(value)`.
    EarlyReturn(Value),
}

impl MacroOutcome {
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            MacroOutcome::Returned(value) | MacroOutcome::EarlyReturn(value) => value,
        }
    }
}

/// A callable handle on the macro defined by a [`MacroNode`].
pub struct MacroGenerator {
    macro_node: Arc<MacroNode>,
    context: Option<Weak<RwLock<Context>>>,
    node: Option<Arc<dyn Node>>,
    stack: Option<Arc<MacroStack>>,
    cache: Arc<TemplateCache>,
}

impl MacroGenerator {
    #[must_use]
    pub fn new(macro_node: Arc<MacroNode>) -> Self {
        Self {
            macro_node,
            context: None,
            node: None,
            stack: None,
            cache: Arc::clone(template_cache()),
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: &SharedContext) -> Self {
        self.context = Some(context.downgrade());
        self
    }

    /// The node being compiled; it receives the dependency edge of outermost calls.
    #[must_use]
    pub fn with_node(mut self, node: Arc<dyn Node>) -> Self {
        self.node = Some(node);
        self
    }

    #[must_use]
    pub fn with_stack(mut self, stack: Arc<MacroStack>) -> Self {
        self.stack = Some(stack);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<TemplateCache>) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn macro_node(&self) -> &Arc<MacroNode> {
        &self.macro_node
    }

    /// Call the macro and collapse early returns into the result.
    pub fn call_macro(&self, args: CallArgs) -> Result<Value, Error> {
        self.invoke(args).map(MacroOutcome::into_value)
    }

    pub fn invoke(&self, args: CallArgs) -> Result<MacroOutcome, Error> {
        let ctx = self.context()?;
        let guard = self.track_call();
        let outcome = self.resolve(ctx).and_then(|(_module, callable)| {
            settle(callable.call(args), Some(self.macro_node.as_ref()))
        });
        if let Some(guard) = guard {
            guard.finish()?;
        }
        outcome
    }

    fn context(&self) -> Result<Context, Error> {
        self.context
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|ctx| ctx.read().unwrap_or_else(PoisonError::into_inner).clone())
            .ok_or_else(|| {
                InternalError::ContextUnset {
                    macro_name: self.macro_node.name().to_string(),
                }
                .into()
            })
    }

    fn track_call(&self) -> Option<CallGuard<'_>> {
        let (Some(stack), Some(node)) = (&self.stack, &self.node) else {
            return None;
        };
        let unique_id = self.macro_node.unique_id();
        if stack.depth() == 0 {
            node.add_macro_dependency(unique_id);
        }
        stack.push(unique_id);
        Some(CallGuard {
            stack,
            unique_id,
            armed: true,
        })
    }

    /// The module must outlive the call; its macros only hold it weakly.
    fn resolve(&self, ctx: Context) -> Result<(Module, Value), Error> {
        let owner: Arc<dyn Node> = self.macro_node.clone();
        let template = self.cache.get_node_template(&owner)?;
        let mut module = template
            .make_module(ctx.clone())
            .map_err(|err| translate(&err, Some(self.macro_node.as_ref())))?;
        let name = mangle_macro(self.macro_node.name());
        let callable = module.get(&name).cloned().ok_or_else(|| InternalError::MacroNotFound {
            name,
            template: module.template_name().to_string(),
        })?;
        module.update(ctx);
        Ok((module, callable))
    }
}

impl fmt::Debug for MacroGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MacroGenerator")
            .field("macro", &self.macro_node.unique_id())
            .field("tracked", &self.stack.is_some())
            .finish_non_exhaustive()
    }
}

impl Object for MacroGenerator {
    fn type_name(&self) -> &str {
        "macro"
    }

    fn call(&self, args: CallArgs) -> Result<Value, jinx_templates::Error> {
        self.call_macro(args).map_err(Into::into)
    }
}

/// Pops the call on the way out. Dropping it unfinished (a panic mid-call)
/// still pops, but can only log a mismatch.
struct CallGuard<'a> {
    stack: &'a MacroStack,
    unique_id: &'a str,
    armed: bool,
}

impl CallGuard<'_> {
    fn finish(mut self) -> Result<(), InternalError> {
        self.armed = false;
        self.stack.pop(self.unique_id)
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.stack.pop(self.unique_id) {
                tracing::warn!("{}", err);
            }
        }
    }
}

/// Sort an engine result into a return, an early return, or a compiler error
/// attributed to `macro_node`.
fn settle(
    result: Result<Value, jinx_templates::Error>,
    macro_node: Option<&dyn Node>,
) -> Result<MacroOutcome, Error> {
    let err = match result {
        Ok(value) => return Ok(MacroOutcome::Returned(value)),
        Err(err) => err,
    };
    if let Some(signal) = err.source_ref::<MacroReturn>() {
        return Ok(MacroOutcome::EarlyReturn(signal.value.clone()));
    }
    if let Some(internal) = err.source_ref::<InternalError>() {
        return Err(internal.clone().into());
    }
    if let Some(compilation) = err.source_ref::<CompilationError>() {
        let mut compilation = compilation.clone();
        if let Some(macro_node) = macro_node {
            compilation.push_macro(macro_node);
        }
        return Err(compilation.into());
    }
    Err(translate(&err, macro_node))
}

/// The `return` template function: ends the enclosing macro call with its argument.
#[must_use]
pub fn return_function() -> Value {
    Value::from_function("return", |args: CallArgs| {
        let value = args
            .positional
            .into_iter()
            .next()
            .or_else(|| args.keyword.get("value").cloned())
            .unwrap_or_default();
        Err(macro_return(value))
    })
}

/// Renders the query comment prepended to SQL sent to a connection.
///
/// The template is compiled once, outside the template cache, and must define
/// `query_comment_macro(connection_name, node)`.
#[derive(Debug)]
pub struct QueryCommentGenerator {
    template: Template,
    context: Context,
}

impl QueryCommentGenerator {
    pub fn new(template_str: &str, context: Context) -> Result<Self, Error> {
        let template = get_template(template_str, context.clone(), None, false, false)?;
        Ok(Self { template, context })
    }

    /// Wrap a bare comment template in the macro the generator calls.
    pub fn from_comment(comment: &str, context: Context) -> Result<Self, Error> {
        let template_str = format!(
            "{{%- macro {QUERY_COMMENT_MACRO}(connection_name, node) -%}}\n{comment}\n{{%- endmacro %}}"
        );
        Self::new(&template_str, context)
    }

    pub fn call(&self, connection_name: &str, node: Value) -> Result<String, Error> {
        let mut module = self
            .template
            .make_module(self.context.clone())
            .map_err(|err| translate(&err, None))?;
        let name = mangle_macro(QUERY_COMMENT_MACRO);
        let callable = module.get(&name).cloned().ok_or_else(|| InternalError::MacroNotFound {
            name,
            template: module.template_name().to_string(),
        })?;
        module.update(self.context.clone());

        let args = CallArgs::new(vec![Value::from(connection_name), node]);
        settle(callable.call(args), None)?
            .into_value()
            .to_output()
            .map_err(|err| translate(&err, None))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;

    fn generator(sql: &str, name: &str) -> MacroGenerator {
        let node = Arc::new(MacroNode::new("pkg", name, format!("macros/{name}.sql"), sql));
        MacroGenerator::new(node).with_cache(Arc::new(TemplateCache::new()))
    }

    mod calls {
        use super::*;

        #[test]
        fn test_positional_and_keyword_args() {
            let context = SharedContext::default();
            let greet = generator(
                "{% macro greet(name, punct='!') %}hi {{ name }}{{ punct }}{% endmacro %}",
                "greet",
            )
            .with_context(&context);
            let args = CallArgs::new(vec![Value::from("bob")]).with_kwarg("punct", "?");
            assert_eq!(greet.call_macro(args).unwrap(), Value::from("hi bob?"));
        }

        #[test]
        fn test_context_is_visible_to_macro() {
            let context = SharedContext::new(Context::new());
            context.insert("target", Value::from(json!({"schema": "analytics"})));
            let schema = generator("{% macro schema() %}{{ target.schema }}{% endmacro %}", "schema")
                .with_context(&context);
            assert_eq!(schema.call_macro(CallArgs::default()).unwrap(), Value::from("analytics"));
        }

        #[test]
        fn test_early_return() {
            let context = SharedContext::default();
            context.insert("return", return_function());
            let pick = generator(
                "{% macro pick() %}ignored{{ return([1, 2]) }}{% endmacro %}",
                "pick",
            )
            .with_context(&context);
            let outcome = pick.invoke(CallArgs::default()).unwrap();
            assert_eq!(outcome, MacroOutcome::EarlyReturn(Value::from(vec![1, 2])));
        }

        #[test]
        fn test_as_template_value() {
            let context = SharedContext::default();
            let double = generator("{% macro double(x) %}{{ x * 2 }}{% endmacro %}", "double")
                .with_context(&context);
            context.insert("double", Value::from_object(double));
            let rendered = crate::render::get_rendered(
                "{{ double(21) }}",
                context.snapshot(),
                None,
                false,
                false,
            )
            .unwrap();
            assert_eq!(rendered, Value::from("42"));
        }
    }

    mod failures {
        use super::*;

        #[test]
        fn test_unset_context() {
            let m = generator("{% macro m() %}{% endmacro %}", "m");
            let err = m.call_macro(CallArgs::default()).unwrap_err();
            assert!(matches!(err, Error::Internal(InternalError::ContextUnset { .. })));
        }

        #[test]
        fn test_dropped_context() {
            let context = SharedContext::default();
            let m = generator("{% macro m() %}{% endmacro %}", "m").with_context(&context);
            drop(context);
            assert!(matches!(
                m.call_macro(CallArgs::default()),
                Err(Error::Internal(InternalError::ContextUnset { .. }))
            ));
        }

        #[test]
        fn test_missing_macro() {
            let context = SharedContext::default();
            let m = generator("{% macro other() %}{% endmacro %}", "m").with_context(&context);
            assert!(matches!(
                m.call_macro(CallArgs::default()),
                Err(Error::Internal(InternalError::MacroNotFound { .. }))
            ));
        }

        #[test]
        fn test_runtime_error_names_macro() {
            let context = SharedContext::default();
            let m = generator("{% macro m() %}{{ 1 + 'a' }}{% endmacro %}", "m").with_context(&context);
            let err = m.call_macro(CallArgs::default()).unwrap_err();
            let err = err.as_compilation().unwrap();
            assert_eq!(err.kind(), ErrorKind::Runtime);
            assert_eq!(err.node().unwrap().name, "m");
            assert_eq!(err.node().unwrap().resource_type, "macro");
        }
    }

    mod query_comment {
        use super::*;

        #[test]
        fn test_from_comment() {
            let mut ctx = Context::new();
            ctx.insert("app".to_string(), Value::from("jinx"));
            let generator = QueryCommentGenerator::from_comment(
                "{{ app }} via {{ connection_name }} for {{ node.name }}",
                ctx,
            )
            .unwrap();
            let comment = generator
                .call("main", Value::from(json!({"name": "orders"})))
                .unwrap();
            assert_eq!(comment, "jinx via main for orders");
        }

        #[test]
        fn test_missing_macro_definition() {
            let generator = QueryCommentGenerator::new("just text", Context::new()).unwrap();
            assert!(matches!(
                generator.call("main", Value::None),
                Err(Error::Internal(InternalError::MacroNotFound { .. }))
            ));
        }
    }
}
