//! Compile and render entry points.

use std::sync::Arc;

use jinx_source::Diagnostic;
use jinx_source::DiagnosticRenderer;
use jinx_source::Severity;
use jinx_source::Span;
use jinx_templates::Context;
use jinx_templates::Environment;
use jinx_templates::ErrorKind as EngineErrorKind;
use jinx_templates::OutputMode;
use jinx_templates::Stmt;
use jinx_templates::Template;
use jinx_templates::Value;
use jinx_templates::DEFAULT_TEMPLATE_NAME;

use crate::debug::DebugSourceHook;
use crate::error::translate;
use crate::error::CompilationError;
use crate::error::Error;
use crate::extensions::DoExtension;
use crate::extensions::DocumentationExtension;
use crate::extensions::MacroFuzzExtension;
use crate::extensions::MaterializationExtension;
use crate::native::native_concat;
use crate::node::Node;
use crate::undefined::CaptureUndefined;

fn owner(node: Option<&Arc<dyn Node>>) -> Option<&dyn Node> {
    node.map(|node| &**node)
}

/// Build a sandboxed environment with the macro, materialization, docs and
/// `do` tags installed.
///
/// With `capture_undefined`, missing names become deferred references owned
/// by `node`. With `native`, rendering keeps output values unconverted.
#[must_use]
pub fn get_environment(
    node: Option<&Arc<dyn Node>>,
    capture_undefined: bool,
    native: bool,
) -> Arc<Environment> {
    let mut env = Environment::new();
    env.add_extension(Arc::new(DoExtension));
    env.add_extension(Arc::new(MacroFuzzExtension));
    env.add_extension(Arc::new(MaterializationExtension));
    env.add_extension(Arc::new(DocumentationExtension));
    if capture_undefined {
        env.set_undefined(Arc::new(CaptureUndefined::new(node.cloned())));
    }
    if native {
        env.set_output_mode(OutputMode::Native);
    }
    env.set_compile_hook(Arc::new(DebugSourceHook));
    Arc::new(env)
}

/// Compile `source` with `ctx` as the template's globals.
pub fn get_template(
    source: &str,
    ctx: Context,
    node: Option<&Arc<dyn Node>>,
    capture_undefined: bool,
    native: bool,
) -> Result<Template, Error> {
    let env = get_environment(node, capture_undefined, native);
    env.template_from_str(source, ctx)
        .map_err(|err| translate(&err, owner(node)))
}

pub fn render_template(
    template: &Template,
    ctx: Context,
    node: Option<&Arc<dyn Node>>,
) -> Result<String, Error> {
    template
        .render(ctx)
        .map_err(|err| translate(&err, owner(node)))
}

/// Compile and render in one step.
///
/// Native rendering tries to recover a literal value from the output; text
/// that is not a literal comes back as a string.
pub fn get_rendered(
    source: &str,
    ctx: Context,
    node: Option<&Arc<dyn Node>>,
    capture_undefined: bool,
    native: bool,
) -> Result<Value, Error> {
    let template = get_template(source, ctx, node, capture_undefined, native)?;
    if native {
        template
            .render_fragments(Context::new())
            .and_then(|fragments| native_concat(fragments, true))
            .map_err(|err| translate(&err, owner(node)))
    } else {
        render_template(&template, Context::new(), node).map(Value::from)
    }
}

/// Check that `source` parses with the core's tags installed.
pub fn parse(source: &str) -> Result<Vec<Stmt>, Error> {
    get_environment(None, false, false)
        .parse(source, DEFAULT_TEMPLATE_NAME)
        .map_err(|err| translate(&err, None))
}

/// The engine's undefined error, for host functions that hit a missing value.
#[must_use]
pub fn undefined_error(message: impl Into<String>) -> jinx_templates::Error {
    jinx_templates::Error::new(EngineErrorKind::UndefinedError, message)
}

/// Render `err` against the source it was raised from.
#[must_use]
pub fn to_diagnostic(err: &CompilationError, source: &str, path: &str) -> String {
    let span = err.span().unwrap_or_else(|| Span::new(0, 0));
    let label = match err.position() {
        Some(position) => position.to_string(),
        None => String::new(),
    };
    let notes: Vec<String> = err
        .stack()
        .iter()
        .skip(1)
        .map(|attribution| format!("called by {attribution}"))
        .collect();

    let mut diagnostic = Diagnostic::new(
        source,
        path,
        err.kind().code(),
        err.message(),
        Severity::Error,
        span,
        &label,
    );
    for note in &notes {
        diagnostic = diagnostic.note(note);
    }
    DiagnosticRenderer::plain().render(&diagnostic)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;
    use crate::node::ParsedNode;

    fn context(value: serde_json::Value) -> Context {
        match Value::from(value).as_map() {
            Some(map) => map,
            None => Context::new(),
        }
    }

    fn model() -> Arc<dyn Node> {
        Arc::new(ParsedNode::new("model", "pkg", "orders", "models/orders.sql", ""))
    }

    mod rendering {
        use super::*;

        #[test]
        fn test_text_render() {
            let rendered = get_rendered(
                "select {{ cols | join(', ') }} from {{ table }}",
                context(json!({"cols": ["a", "b"], "table": "t"})),
                None,
                false,
                false,
            )
            .unwrap();
            assert_eq!(rendered, Value::from("select a, b from t"));
        }

        #[test]
        fn test_native_render() {
            let rendered = get_rendered("[1, 2, 3]", Context::new(), None, false, true).unwrap();
            assert_eq!(rendered, Value::from(vec![1, 2, 3]));

            let rendered = get_rendered("{{ n + 1 }}", context(json!({"n": 4})), None, false, true).unwrap();
            assert_eq!(rendered, Value::Int(5));

            let rendered = get_rendered("hello", Context::new(), None, false, true).unwrap();
            assert_eq!(rendered, Value::from("hello"));
        }

        #[test]
        fn test_native_deep_brackets_stay_text() {
            let text = "[".repeat(20_000);
            let rendered = get_rendered(&text, Context::new(), None, false, true).unwrap();
            assert_eq!(rendered, Value::from(text));
        }

        #[test]
        fn test_native_keeps_quotes() {
            let rendered = get_rendered("'quoted'", Context::new(), None, false, true).unwrap();
            assert_eq!(rendered, Value::from("'quoted'"));
        }

        #[test]
        fn test_do_tag() {
            let rendered = get_rendered(
                "{% set xs = [] %}{% do xs.append(1) %}{{ xs }}",
                Context::new(),
                None,
                false,
                false,
            )
            .unwrap();
            assert_eq!(rendered, Value::from("[1]"));
        }

        #[test]
        fn test_render_template_reuses_compiled_template() {
            let template = get_template("{{ x }}", Context::new(), None, false, false).unwrap();
            for x in ["a", "b"] {
                let rendered = render_template(&template, context(json!({"x": x})), None).unwrap();
                assert_eq!(rendered, x);
            }
        }
    }

    mod undefined {
        use super::*;

        #[test]
        fn test_lenient_by_default() {
            let rendered = get_rendered("[{{ missing }}]", Context::new(), None, false, false).unwrap();
            assert_eq!(rendered, Value::from("[]"));
        }

        #[test]
        fn test_captured_reference_fails_when_rendered() {
            let node = model();
            let err = get_rendered("{{ missing }}", Context::new(), Some(&node), true, false).unwrap_err();
            let err = err.as_compilation().unwrap();
            assert_eq!(err.kind(), ErrorKind::UndefinedReference);
            assert!(err.message().contains("missing"));
            assert_eq!(err.node().unwrap().name, "orders");
        }

        #[test]
        fn test_captured_reference_fails_in_expressions() {
            for source in ["{{ missing + 1 }}", "{{ missing == 1 }}", "{{ missing < 1 }}", "{{ 1 - missing }}"] {
                let err = get_rendered(source, Context::new(), Some(&model()), true, false).unwrap_err();
                let err = err.as_compilation().unwrap();
                assert_eq!(err.kind(), ErrorKind::UndefinedReference, "{source}");
                assert!(err.message().contains("missing"), "{source}");
            }
        }

        #[test]
        fn test_captured_reference_passes_through_defined_test() {
            let rendered = get_rendered(
                "{{ 'yes' if missing is defined else 'no' }}",
                Context::new(),
                None,
                true,
                false,
            )
            .unwrap();
            assert_eq!(rendered, Value::from("no"));
        }
    }

    mod errors {
        use super::*;

        #[test]
        fn test_syntax_error_is_attributed() {
            let node = model();
            let err = get_template("{% if x %}", Context::new(), Some(&node), false, false).unwrap_err();
            let err = err.as_compilation().unwrap();
            assert_eq!(err.kind(), ErrorKind::Syntax);
            assert_eq!(err.node().unwrap().resource_type, "model");
        }

        #[test]
        fn test_parse_validates_core_tags() {
            assert!(parse("{% materialization view, default %}{% endmaterialization %}").is_ok());
            let err = parse("{% docs %}{% enddocs %}").unwrap_err();
            assert_eq!(err.as_compilation().unwrap().kind(), ErrorKind::Syntax);
        }

        #[test]
        fn test_oversized_repeat_is_a_runtime_error() {
            for source in ["{{ 'ab' * 9223372036854775807 }}", "{{ [1, 2] * 9223372036854775807 }}"] {
                let err = get_rendered(source, Context::new(), None, false, false).unwrap_err();
                assert_eq!(err.as_compilation().unwrap().kind(), ErrorKind::Runtime, "{source}");
            }
        }

        #[test]
        fn test_deep_expression_nesting_is_a_syntax_error() {
            let source = format!("{{{{ {}1{} }}}}", "(".repeat(20_000), ")".repeat(20_000));
            let err = get_template(&source, Context::new(), None, false, false).unwrap_err();
            assert_eq!(err.as_compilation().unwrap().kind(), ErrorKind::Syntax);
        }

        #[test]
        fn test_undefined_error_kind() {
            assert_eq!(undefined_error("x is undefined").kind(), EngineErrorKind::UndefinedError);
        }

        #[test]
        fn test_diagnostic_rendering() {
            let source = "select 1\n{{ 1 + }}\n";
            let err = get_template(source, Context::new(), None, false, false).unwrap_err();
            let rendered = to_diagnostic(err.as_compilation().unwrap(), source, "models/orders.sql");
            assert!(rendered.contains("error[J100]"));
            assert!(rendered.contains("models/orders.sql"));
        }
    }
}
