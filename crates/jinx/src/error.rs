use std::fmt;

use jinx_source::LineCol;
use jinx_source::Span;
use jinx_templates::ErrorKind as EngineErrorKind;
use jinx_templates::Value;
use serde::Serialize;
use thiserror::Error;

use crate::node::Attribution;
use crate::node::Node;

/// What went wrong in a compilation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// Syntax Error
    ///
    /// The template or one of its block tags could not be parsed. Common causes:
    /// - an unterminated `{% macro %}`, `{% docs %}` or `{% materialization %}` block
    /// - an end tag without an opener (`{% endif %}` with no `{% if %}`)
    /// - an unknown materialization argument
    Syntax,

    /// Undefined Reference
    ///
    /// A name that was never defined was used as a concrete value: rendered
    /// into output, tested for truth, iterated or serialized.
    UndefinedReference,

    /// Runtime Error
    ///
    /// Anything that fails while a template or macro executes: wrong argument
    /// counts, type errors in expressions, unsafe attribute access.
    Runtime,
}

impl ErrorKind {
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Syntax => "J100",
            ErrorKind::UndefinedReference => "J200",
            ErrorKind::Runtime => "J300",
        }
    }
}

/// A user-facing compiler error with its attribution chain.
///
/// `node` is the outermost resource the error was attributed to. `stack`
/// lists the macros and nodes it passed through, innermost first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompilationError {
    kind: ErrorKind,
    message: String,
    position: Option<LineCol>,
    span: Option<Span>,
    node: Option<Attribution>,
    stack: Vec<Attribution>,
}

impl CompilationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            position: None,
            span: None,
            node: None,
            stack: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_node(mut self, node: Option<&dyn Node>) -> Self {
        if let Some(node) = node {
            let attribution = node.attribution();
            self.stack = vec![attribution.clone()];
            self.node = Some(attribution);
        }
        self
    }

    #[must_use]
    pub fn at(mut self, position: Option<LineCol>, span: Option<Span>) -> Self {
        self.position = position;
        self.span = span;
        self
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn position(&self) -> Option<LineCol> {
        self.position
    }

    #[must_use]
    pub fn span(&self) -> Option<Span> {
        self.span
    }

    #[must_use]
    pub fn node(&self) -> Option<&Attribution> {
        self.node.as_ref()
    }

    #[must_use]
    pub fn stack(&self) -> &[Attribution] {
        &self.stack
    }

    /// Attribute the error to `node`. The previous owner moves onto the stack.
    pub fn add_node(&mut self, node: &dyn Node) {
        let attribution = node.attribution();
        if self.node.as_ref() == Some(&attribution) {
            return;
        }
        if let Some(previous) = self.node.replace(attribution) {
            if !self.stack.contains(&previous) {
                self.stack.push(previous);
            }
        }
    }

    /// Record that the error passed through the macro `node` on its way out.
    pub fn push_macro(&mut self, node: &dyn Node) {
        self.stack.push(node.attribution());
    }
}

impl fmt::Display for CompilationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Compilation Error")?;
        if let Some(node) = &self.node {
            write!(f, " in {node}")?;
        }

        let mut lines: Vec<String> = self.message.split('\n').map(ToString::to_string).collect();
        if let Some(position) = self.position {
            lines.push(format!("{position}"));
        }
        if self.stack.len() > 1 {
            lines.push(String::new());
            for (index, attribution) in self.stack.iter().enumerate() {
                let label = if index == 0 { "in" } else { "called by" };
                lines.push(format!("> {label} {attribution}"));
            }
        }

        for line in lines {
            if line.is_empty() {
                writeln!(f)?;
            } else {
                write!(f, "\n  {line}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for CompilationError {}

/// Invariant violations inside the engine. Never caused by user input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InternalError {
    #[error("macro stack corrupted: popped {got:?}, expected {expected}")]
    StackCorruption {
        expected: String,
        got: Option<String>,
    },

    #[error("context is unset when calling macro {macro_name}")]
    ContextUnset { macro_name: String },

    #[error("macro {name} is not defined in {template}")]
    MacroNotFound { name: String, template: String },
}

/// The early-return signal a macro raises through `return(value)`.
#[derive(Debug, Clone, Error)]
#[error("return() called outside of a macro")]
pub struct MacroReturn {
    pub value: Value,
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error(transparent)]
    Compilation(#[from] CompilationError),
    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl Error {
    #[must_use]
    pub fn as_compilation(&self) -> Option<&CompilationError> {
        match self {
            Error::Compilation(err) => Some(err),
            Error::Internal(_) => None,
        }
    }
}

/// Core errors cross engine frames as the source of an engine error, so a
/// macro called from inside another template keeps its attribution chain.
impl From<Error> for jinx_templates::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Compilation(err) => {
                let kind = match err.kind() {
                    ErrorKind::UndefinedReference => EngineErrorKind::UndefinedError,
                    ErrorKind::Syntax | ErrorKind::Runtime => EngineErrorKind::Extension,
                };
                jinx_templates::Error::new(kind, err.message().to_string()).with_source(err)
            }
            Error::Internal(err) => {
                jinx_templates::Error::new(EngineErrorKind::Extension, err.to_string()).with_source(err)
            }
        }
    }
}

/// Build the early-return signal as an engine error.
#[must_use]
pub fn macro_return(value: Value) -> jinx_templates::Error {
    jinx_templates::Error::new(EngineErrorKind::Extension, "return")
        .with_source(MacroReturn { value })
}

/// Translate an engine error into the compiler-error domain, attributing it to `node`.
pub(crate) fn translate(err: &jinx_templates::Error, node: Option<&dyn Node>) -> Error {
    if let Some(internal) = err.source_ref::<InternalError>() {
        return Error::Internal(internal.clone());
    }
    if let Some(compilation) = err.source_ref::<CompilationError>() {
        let mut compilation = compilation.clone();
        if let Some(node) = node {
            compilation.add_node(node);
        }
        return Error::Compilation(compilation);
    }

    let kind = match err.kind() {
        EngineErrorKind::SyntaxError => ErrorKind::Syntax,
        EngineErrorKind::UndefinedError => ErrorKind::UndefinedReference,
        _ => ErrorKind::Runtime,
    };
    let message = match err.source_ref::<MacroReturn>() {
        Some(signal) => signal.to_string(),
        None => err.detail().to_string(),
    };
    Error::Compilation(
        CompilationError::new(kind, message)
            .at(err.position(), err.span())
            .with_node(node),
    )
}
