use std::sync::Arc;

use jinx_templates::Context;
use jinx_templates::Value;

use crate::error::Error;
use crate::node::Node;
use crate::render::get_rendered;

/// Context key holding the rendered keyword arguments of a schema test.
pub const SCHEMA_TEST_KWARGS_NAME: &str = "_jinx_schema_test_kwargs";

const REFERENCE_FUNCTIONS: &[&str] = &["env_var", "ref", "var", "source", "doc"];

/// Whether `value` is a single call to one of the reference functions, such as
/// `ref('orders')`. The arguments must stay on one line.
#[must_use]
pub fn looks_like_function_call(value: &str) -> bool {
    let rest = value.trim_start();
    let Some(rest) = REFERENCE_FUNCTIONS
        .iter()
        .find_map(|name| rest.strip_prefix(name))
    else {
        return false;
    };
    let Some(args) = rest.trim_start().strip_prefix('(') else {
        return false;
    };
    match args.trim_end().strip_suffix(')') {
        Some(inner) => !inner.is_empty() && !inner.contains('\n'),
        None => false,
    }
}

/// Render every string in the test's keyword arguments natively and store the
/// result in `context` under [`SCHEMA_TEST_KWARGS_NAME`].
///
/// Call-shaped strings are wrapped in `{{ }}` first, so `"ref('x')"` becomes
/// whatever `ref` returns. Other leaves keep their type.
pub fn add_rendered_test_kwargs(
    context: &mut Context,
    node: &Arc<dyn Node>,
    capture_undefined: bool,
) -> Result<(), Error> {
    let kwargs = match node.test_metadata() {
        Some(metadata) => {
            let mut rendered = Context::new();
            for (key, value) in &metadata.kwargs {
                rendered.insert(key.clone(), render_leaf(value, context, node, capture_undefined)?);
            }
            rendered
        }
        None => Context::new(),
    };
    context.insert(SCHEMA_TEST_KWARGS_NAME.to_string(), Value::map(kwargs));
    Ok(())
}

fn render_leaf(
    value: &serde_json::Value,
    context: &Context,
    node: &Arc<dyn Node>,
    capture_undefined: bool,
) -> Result<Value, Error> {
    match value {
        serde_json::Value::String(text) => {
            let source = if looks_like_function_call(text) {
                format!("{{{{ {text} }}}}")
            } else {
                text.clone()
            };
            get_rendered(&source, context.clone(), Some(node), capture_undefined, true)
        }
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| render_leaf(item, context, node, capture_undefined))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::list),
        serde_json::Value::Object(entries) => entries
            .iter()
            .map(|(key, item)| Ok((key.clone(), render_leaf(item, context, node, capture_undefined)?)))
            .collect::<Result<Context, Error>>()
            .map(Value::map),
        other => Ok(Value::from(other.clone())),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::node::ParsedNode;
    use crate::node::TestMetadata;

    fn test_node(kwargs: serde_json::Value) -> Arc<dyn Node> {
        let kwargs = match kwargs {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Arc::new(
            ParsedNode::new("test", "pkg", "not_null_orders_id", "models/schema.yml", "")
                .with_test_metadata(TestMetadata {
                    name: "not_null".to_string(),
                    namespace: None,
                    kwargs,
                }),
        )
    }

    fn rendered_kwargs(context: &Context) -> serde_json::Value {
        serde_json::to_value(&context[SCHEMA_TEST_KWARGS_NAME]).unwrap()
    }

    mod call_shape {
        use super::*;

        #[test]
        fn test_matches_reference_calls() {
            assert!(looks_like_function_call("ref('orders')"));
            assert!(looks_like_function_call("  source('raw', 'orders')  \n"));
            assert!(looks_like_function_call("env_var ('HOME')"));
            assert!(looks_like_function_call("var('x') "));
        }

        #[test]
        fn test_rejects_other_text() {
            assert!(!looks_like_function_call("orders"));
            assert!(!looks_like_function_call("ref()"));
            assert!(!looks_like_function_call("refs('x')"));
            assert!(!looks_like_function_call("ref('x') ~ 'y'"));
            assert!(!looks_like_function_call("ref('x',\n'y')"));
            assert!(!looks_like_function_call("lookup('x')"));
        }
    }

    mod rendering {
        use super::*;

        #[test]
        fn test_call_shaped_values_are_evaluated() {
            let mut context = Context::new();
            context.insert(
                "ref".to_string(),
                Value::from_function("ref", |args| {
                    let name = args.positional.first().cloned().unwrap_or_default();
                    Ok(Value::from(format!("analytics.{}", name.to_output()?)))
                }),
            );
            let node = test_node(json!({"a": "ref('x')", "b": 5}));
            add_rendered_test_kwargs(&mut context, &node, false).unwrap();
            assert_eq!(rendered_kwargs(&context), json!({"a": "analytics.x", "b": 5}));
        }

        #[test]
        fn test_nested_leaves_render_natively() {
            let mut context = Context::new();
            context.insert("n".to_string(), Value::Int(3));
            let node = test_node(json!({
                "values": ["1", "{{ n }}", "abc", true],
                "config": {"severity": "warn", "limit": "10"}
            }));
            add_rendered_test_kwargs(&mut context, &node, false).unwrap();
            assert_eq!(
                rendered_kwargs(&context),
                json!({
                    "values": [1, 3, "abc", true],
                    "config": {"severity": "warn", "limit": 10}
                })
            );
        }

        #[test]
        fn test_node_without_metadata() {
            let mut context = Context::new();
            let node: Arc<dyn Node> =
                Arc::new(ParsedNode::new("model", "pkg", "orders", "models/orders.sql", ""));
            add_rendered_test_kwargs(&mut context, &node, false).unwrap();
            assert_eq!(rendered_kwargs(&context), json!({}));
        }

        #[test]
        fn test_captured_undefined_fails_when_concatenated() {
            let mut context = Context::new();
            let node = test_node(json!({"model": "prefix_{{ missing }}"}));
            let err = add_rendered_test_kwargs(&mut context, &node, true).unwrap_err();
            assert!(err.as_compilation().is_some());
            assert!(!context.contains_key(SCHEMA_TEST_KWARGS_NAME));
        }
    }
}
