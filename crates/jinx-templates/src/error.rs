use std::fmt;
use std::sync::Arc;

use jinx_source::LineCol;
use jinx_source::LineIndex;
use jinx_source::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed template syntax, raised while lexing or parsing.
    SyntaxError,
    /// An undefined value was used in a way that needs a concrete value.
    UndefinedError,
    /// The sandbox refused access to an attribute or method.
    SecurityError,
    /// An operation was applied to values of the wrong type.
    InvalidOperation,
    /// Any other failure while rendering.
    TemplateRuntime,
    /// An error raised by host code; the original error is the `source`.
    Extension,
}

impl ErrorKind {
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            ErrorKind::SyntaxError => "syntax error",
            ErrorKind::UndefinedError => "undefined value",
            ErrorKind::SecurityError => "security error",
            ErrorKind::InvalidOperation => "invalid operation",
            ErrorKind::TemplateRuntime => "template runtime error",
            ErrorKind::Extension => "extension error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// The one error type of the engine.
///
/// Besides its kind and message an error remembers where it happened (template
/// name, span, line/column) and may carry a `source` error. Host code uses the
/// source to move its own errors, or control signals, through nested template
/// frames untouched; see [`Error::with_source`] and [`Error::source_ref`].
#[derive(Clone)]
pub struct Error {
    repr: Box<ErrorRepr>,
}

#[derive(Clone)]
struct ErrorRepr {
    kind: ErrorKind,
    detail: String,
    name: Option<String>,
    span: Option<Span>,
    position: Option<LineCol>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            repr: Box::new(ErrorRepr {
                kind,
                detail: detail.into(),
                name: None,
                span: None,
                position: None,
                source: None,
            }),
        }
    }

    pub(crate) fn syntax(detail: impl Into<String>, span: Span) -> Self {
        let mut err = Self::new(ErrorKind::SyntaxError, detail);
        err.repr.span = Some(span);
        err
    }

    #[must_use]
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.repr.source = Some(Arc::new(source));
        self
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.repr.kind
    }

    #[must_use]
    pub fn detail(&self) -> &str {
        &self.repr.detail
    }

    /// Name (or debug filename) of the template the error was raised in.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.repr.name.as_deref()
    }

    #[must_use]
    pub fn span(&self) -> Option<Span> {
        self.repr.span
    }

    #[must_use]
    pub fn position(&self) -> Option<LineCol> {
        self.repr.position
    }

    #[must_use]
    pub fn line(&self) -> Option<u32> {
        self.repr.position.map(|pos| pos.line())
    }

    /// Downcast the carried source error, if there is one of type `T`.
    #[must_use]
    pub fn source_ref<T>(&self) -> Option<&T>
    where
        T: std::error::Error + 'static,
    {
        self.repr
            .source
            .as_deref()
            .and_then(|source| source.downcast_ref::<T>())
    }

    /// Attach a location unless one is already known. The innermost location wins.
    #[must_use]
    pub(crate) fn located(mut self, name: &str, span: Span, line_index: &LineIndex) -> Self {
        if self.repr.name.is_none() {
            self.repr.name = Some(name.to_string());
        }
        if self.repr.position.is_none() {
            let span = self.repr.span.unwrap_or(span);
            self.repr.span = Some(span);
            self.repr.position = Some(line_index.to_line_col(span.start_offset()));
        }
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.repr.kind, self.repr.detail)?;
        match (&self.repr.name, self.repr.position) {
            (Some(name), Some(position)) => write!(f, " (in {name}, {position})"),
            (Some(name), None) => write!(f, " (in {name})"),
            (None, Some(position)) => write!(f, " ({position})"),
            (None, None) => Ok(()),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Error");
        debug
            .field("kind", &self.repr.kind)
            .field("detail", &self.repr.detail);
        if let Some(name) = &self.repr.name {
            debug.field("name", name);
        }
        if let Some(position) = &self.repr.position {
            debug.field("position", position);
        }
        if let Some(source) = &self.repr.source {
            debug.field("source", source);
        }
        debug.finish()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.repr
            .source
            .as_deref()
            .map(|source| source as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Carried(u32);

    impl fmt::Display for Carried {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "carried {}", self.0)
        }
    }

    impl std::error::Error for Carried {}

    #[test]
    fn source_survives_clone_and_location() {
        let index = LineIndex::from_text("a\n{{ b }}");
        let err = Error::new(ErrorKind::Extension, "boom")
            .with_source(Carried(7))
            .located("<template>", Span::new(2, 7), &index)
            .clone();

        assert_eq!(err.source_ref::<Carried>().map(|c| c.0), Some(7));
        assert_eq!(err.line(), Some(2));
        assert_eq!(err.name(), Some("<template>"));
    }

    #[test]
    fn innermost_location_wins() {
        let index = LineIndex::from_text("one\ntwo\nthree");
        let err = Error::new(ErrorKind::TemplateRuntime, "inner")
            .located("inner.sql", Span::new(4, 1), &index)
            .located("outer.sql", Span::new(8, 1), &index);
        assert_eq!(err.name(), Some("inner.sql"));
        assert_eq!(err.line(), Some(2));
    }

    #[test]
    fn display_includes_position() {
        let index = LineIndex::from_text("{{ x }}");
        let err = Error::syntax("unexpected '}'", Span::new(3, 1)).located("t", Span::new(0, 0), &index);
        assert_eq!(
            err.to_string(),
            "syntax error: unexpected '}' (in t, line 1, column 4)"
        );
    }
}
