use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use jinx_source::LineIndex;
use jinx_source::Span;

use crate::ast::Stmt;
use crate::error::Error;
use crate::eval::ModuleScope;
use crate::eval::Output;
use crate::eval::Program;
use crate::eval::State;
use crate::ext::Extension;
use crate::ext::Extensions;
use crate::parser;
use crate::undefined::LenientUndefined;
use crate::undefined::UndefinedFactory;
use crate::value::Context;
use crate::value::Value;

/// Name given to templates compiled from a string without a file behind them.
pub const DEFAULT_TEMPLATE_NAME: &str = "<template>";

/// How top-level output of a template is collected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Every output expression is converted to text and concatenated.
    #[default]
    Text,
    /// Output expressions are kept as values so the caller can recover
    /// non-string results.
    Native,
}

/// Observes each compiled template.
///
/// `listing` is a readable dump of the compiled body. Returning a name replaces
/// the template's filename in every error raised from it.
pub trait CompileHook: Send + Sync {
    fn on_compile(&self, listing: &str, filename: &str) -> Option<String>;
}

pub struct Environment {
    extensions: Extensions,
    undefined: Arc<dyn UndefinedFactory>,
    output_mode: OutputMode,
    compile_hook: Option<Arc<dyn CompileHook>>,
    globals: Context,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    #[must_use]
    pub fn new() -> Self {
        Self {
            extensions: Extensions::default(),
            undefined: Arc::new(LenientUndefined),
            output_mode: OutputMode::default(),
            compile_hook: None,
            globals: Context::new(),
        }
    }

    pub fn add_extension(&mut self, extension: Arc<dyn Extension>) {
        self.extensions.register(extension);
    }

    pub fn set_undefined(&mut self, factory: Arc<dyn UndefinedFactory>) {
        self.undefined = factory;
    }

    pub fn set_output_mode(&mut self, mode: OutputMode) {
        self.output_mode = mode;
    }

    #[must_use]
    pub fn output_mode(&self) -> OutputMode {
        self.output_mode
    }

    pub fn set_compile_hook(&mut self, hook: Arc<dyn CompileHook>) {
        self.compile_hook = Some(hook);
    }

    pub fn add_global(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.globals.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Build the value for a missing name through the configured factory.
    #[must_use]
    pub fn undefined(&self, name: &str, hint: Option<&str>) -> Value {
        self.undefined.create(name, hint)
    }

    #[must_use]
    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    /// Parse `source` with this environment's extensions.
    pub fn parse(&self, source: &str, name: &str) -> Result<Vec<Stmt>, Error> {
        parser::parse(source, &self.extensions).map_err(|err| {
            let span = err.span().unwrap_or_else(|| Span::new(0, 0));
            err.located(name, span, &LineIndex::from_text(source))
        })
    }

    pub fn compile(
        self: &Arc<Self>,
        source: &str,
        name: &str,
        globals: Context,
    ) -> Result<Template, Error> {
        let body = self.parse(source, name)?;
        let filename = match &self.compile_hook {
            Some(hook) => {
                let listing = format!("{body:#?}");
                hook.on_compile(&listing, name)
                    .unwrap_or_else(|| name.to_string())
            }
            None => name.to_string(),
        };
        tracing::debug!(template = %filename, statements = body.len(), "compiled template");

        Ok(Template {
            env: Arc::clone(self),
            program: Arc::new(Program {
                name: filename,
                body,
                line_index: LineIndex::from_text(source),
            }),
            globals,
        })
    }

    pub fn template_from_str(self: &Arc<Self>, source: &str, globals: Context) -> Result<Template, Error> {
        self.compile(source, DEFAULT_TEMPLATE_NAME, globals)
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("tags", &self.extensions.tags())
            .field("output_mode", &self.output_mode)
            .field("compile_hook", &self.compile_hook.is_some())
            .finish_non_exhaustive()
    }
}

/// A compiled template, ready to be rendered any number of times.
#[derive(Clone)]
pub struct Template {
    env: Arc<Environment>,
    program: Arc<Program>,
    globals: Context,
}

impl Template {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.program.name
    }

    #[must_use]
    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    fn scope(&self, ctx: Context) -> Arc<ModuleScope> {
        let mut vars = self.globals.clone();
        vars.extend(ctx);
        Arc::new(ModuleScope::new(
            Arc::clone(&self.env),
            Arc::clone(&self.program),
            vars,
        ))
    }

    fn execute(&self, scope: &Arc<ModuleScope>, mode: OutputMode) -> Result<Output, Error> {
        let mut out = Output::for_mode(mode);
        State::new(scope, Vec::new()).run(&self.program.body, &mut out)?;
        Ok(out)
    }

    /// Render to text regardless of the environment's output mode.
    pub fn render(&self, ctx: Context) -> Result<String, Error> {
        let scope = self.scope(ctx);
        self.execute(&scope, OutputMode::Text)?.into_text()
    }

    /// Render keeping each top-level output as a separate value.
    ///
    /// In text mode this is a single string fragment.
    pub fn render_fragments(&self, ctx: Context) -> Result<Vec<Value>, Error> {
        let scope = self.scope(ctx);
        Ok(self.execute(&scope, self.env.output_mode)?.into_fragments())
    }

    /// Execute the template and keep what it defined at the top level.
    pub fn make_module(&self, ctx: Context) -> Result<Module, Error> {
        let scope = self.scope(ctx);
        let output = self.execute(&scope, OutputMode::Text)?.into_text()?;
        let namespace = scope.exports();
        Ok(Module {
            scope,
            output,
            namespace,
        })
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("name", &self.program.name)
            .finish_non_exhaustive()
    }
}

/// The result of executing a template as a module: its rendered text and the
/// names it exported. Macros taken from the module stay callable for as long
/// as the module is alive.
pub struct Module {
    scope: Arc<ModuleScope>,
    output: String,
    namespace: IndexMap<String, Value>,
}

impl Module {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.namespace.get(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.namespace.keys().map(String::as_str).collect()
    }

    /// Replace exported names. Macros read the module's own variables, so this
    /// only changes what [`Module::get`] hands out.
    pub fn update(&mut self, ctx: Context) {
        self.namespace.extend(ctx);
    }

    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    #[must_use]
    pub fn template_name(&self) -> &str {
        &self.scope.program.name
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("template", &self.scope.program.name)
            .field("names", &self.names())
            .finish_non_exhaustive()
    }
}
