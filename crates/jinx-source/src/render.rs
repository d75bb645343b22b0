use annotate_snippets::AnnotationKind;
use annotate_snippets::Level;
use annotate_snippets::Renderer;
use annotate_snippets::Snippet;

use crate::Span;

/// Severity level for rendered diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

/// A single annotation to render on a source snippet.
///
/// The `primary` flag controls whether it gets `^^^` (primary) or `---` (context)
/// underline treatment.
#[derive(Debug, Clone)]
pub struct DiagnosticAnnotation<'a> {
    pub span: Span,
    pub label: &'a str,
    pub primary: bool,
}

/// A diagnostic ready for rendering.
///
/// Callers extract span, code and message from their own error types and
/// build this struct; the renderer knows nothing about compiler errors.
#[derive(Debug)]
pub struct Diagnostic<'a> {
    pub source: &'a str,
    pub path: &'a str,
    pub code: &'a str,
    pub message: &'a str,
    pub severity: Severity,
    pub annotations: Vec<DiagnosticAnnotation<'a>>,
    pub notes: Vec<&'a str>,
}

impl<'a> Diagnostic<'a> {
    /// Create a diagnostic with a single primary annotation.
    #[must_use]
    pub fn new(
        source: &'a str,
        path: &'a str,
        code: &'a str,
        message: &'a str,
        severity: Severity,
        span: Span,
        label: &'a str,
    ) -> Self {
        Self {
            source,
            path,
            code,
            message,
            severity,
            annotations: vec![DiagnosticAnnotation {
                span,
                label,
                primary: true,
            }],
            notes: Vec::new(),
        }
    }

    #[must_use]
    pub fn annotation(mut self, span: Span, label: &'a str, primary: bool) -> Self {
        self.annotations.push(DiagnosticAnnotation {
            span,
            label,
            primary,
        });
        self
    }

    #[must_use]
    pub fn note(mut self, note: &'a str) -> Self {
        self.notes.push(note);
        self
    }
}

/// Renders diagnostics as formatted text using `annotate-snippets`.
#[derive(Debug)]
pub struct DiagnosticRenderer {
    renderer: Renderer,
}

impl DiagnosticRenderer {
    /// Plain text, no ANSI colors. Use for snapshot tests and logs.
    #[must_use]
    pub fn plain() -> Self {
        Self {
            renderer: Renderer::plain(),
        }
    }

    /// ANSI colored output for terminal display.
    #[must_use]
    pub fn styled() -> Self {
        Self {
            renderer: Renderer::styled(),
        }
    }

    #[must_use]
    pub fn render(&self, diagnostic: &Diagnostic<'_>) -> String {
        let level = match diagnostic.severity {
            Severity::Error => Level::ERROR,
            Severity::Warning => Level::WARNING,
            Severity::Note => Level::NOTE,
        };

        let mut snippet = Snippet::source(diagnostic.source)
            .path(diagnostic.path)
            .line_start(1);

        for ann in &diagnostic.annotations {
            let start = ann.span.start_usize().min(diagnostic.source.len());
            let end = ann.span.end_usize().min(diagnostic.source.len());
            let kind = if ann.primary {
                AnnotationKind::Primary
            } else {
                AnnotationKind::Context
            };
            snippet = snippet.annotation(kind.span(start..end).label(ann.label));
        }

        let mut title = level
            .primary_title(diagnostic.message)
            .id(diagnostic.code)
            .element(snippet);

        for note in &diagnostic.notes {
            title = title.element(Level::NOTE.message(*note));
        }

        let report = &[title];
        self.renderer.render(report).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> DiagnosticRenderer {
        DiagnosticRenderer::plain()
    }

    #[test]
    fn single_line_span() {
        let source = "{% materialization table, bogus=1 %}\n{% endmaterialization %}\n";

        let diag = Diagnostic::new(
            source,
            "macros/table.sql",
            "J100",
            "invalid materialization argument 'bogus'",
            Severity::Error,
            Span::new(26, 5),
            "unknown modifier",
        );
        let output = plain().render(&diag);

        assert!(output.contains("error[J100]"), "should have error header");
        assert!(output.contains("invalid materialization argument 'bogus'"));
        assert!(output.contains("macros/table.sql"), "should have file path");
        assert!(output.contains("{% materialization table"));
        assert!(output.contains("unknown modifier"), "should have label");
        assert!(output.contains("^^^"), "should have underline carets");
    }

    #[test]
    fn two_annotations_different_lines() {
        let source = "{% macro a() %}\n{% docs b %}\n";

        let diag = Diagnostic::new(
            source,
            "macros/nested.sql",
            "J101",
            "nested block tags",
            Severity::Error,
            Span::new(16, 12),
            "docs starts here",
        )
        .annotation(Span::new(0, 15), "macro is still open", false);

        let output = plain().render(&diag);

        assert!(output.contains("docs starts here"));
        assert!(output.contains("macro is still open"));
        assert!(output.contains("{% macro a() %}"));
    }

    #[test]
    fn with_note() {
        let source = "{{ missing_thing }}\n";

        let diag = Diagnostic::new(
            source,
            "models/a.sql",
            "J200",
            "'missing_thing' is undefined",
            Severity::Error,
            Span::new(3, 13),
            "never defined",
        )
        .note("called by model a");

        let output = plain().render(&diag);

        assert!(output.contains("note: called by model a"));
    }

    #[test]
    fn out_of_range_span_is_clamped() {
        let source = "{% docs a %}";
        let diag = Diagnostic::new(
            source,
            "docs.md",
            "J102",
            "unterminated",
            Severity::Error,
            Span::new(0, 500),
            "opened here",
        );
        let output = plain().render(&diag);
        assert!(output.contains("unterminated"));
    }

    #[test]
    fn plain_no_ansi() {
        let source = "{% docs a %}\n";
        let diag = Diagnostic::new(
            source,
            "docs.md",
            "J102",
            "unterminated",
            Severity::Warning,
            Span::new(0, 12),
            "opened here",
        );
        let output = plain().render(&diag);

        assert!(output.contains("warning[J102]"));
        assert!(!output.contains("\x1b["));
    }
}
